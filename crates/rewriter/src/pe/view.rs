//! Bounds-checked access to a raw PE image.
//!
//! Every structure the parser dereferences goes through this view, which
//! maps RVAs to file offsets via the section table and refuses any read
//! that leaves the backing buffer. Errors always name the offending RVA.

use anyhow::{bail, Context, Result};

use crate::address::{FileOffset, RelativeAddress};

/// One row of the section table, in the raw on-disk units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionRow {
    pub name: String,
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub characteristics: u32,
}

impl SectionRow {
    pub fn contains_rva(&self, rva: u32) -> bool {
        rva >= self.virtual_address
            && rva < self.virtual_address + self.virtual_size.max(self.size_of_raw_data)
    }
}

pub struct ImageView<'a> {
    data: &'a [u8],
    sections: Vec<SectionRow>,
}

impl<'a> ImageView<'a> {
    pub fn new(data: &'a [u8], sections: Vec<SectionRow>) -> Self {
        Self { data, sections }
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn sections(&self) -> &[SectionRow] {
        &self.sections
    }

    pub fn section_containing(&self, rva: RelativeAddress) -> Option<(usize, &SectionRow)> {
        self.sections
            .iter()
            .enumerate()
            .find(|(_, s)| s.contains_rva(rva.value()))
    }

    /// RVA to file offset. RVAs inside a section's virtual tail (past the
    /// raw data) have no file backing and are rejected.
    pub fn rva_to_offset(&self, rva: RelativeAddress) -> Result<FileOffset> {
        // Header region maps one to one.
        if let Some(first) = self.sections.first() {
            if rva.value() < first.virtual_address {
                return Ok(FileOffset(rva.value()));
            }
        }
        let (_, section) = self
            .section_containing(rva)
            .with_context(|| format!("no section maps rva {rva}"))?;
        let delta = rva.value() - section.virtual_address;
        if delta >= section.size_of_raw_data {
            bail!("rva {rva} lies in the uninitialized tail of {}", section.name);
        }
        Ok(FileOffset(section.pointer_to_raw_data + delta))
    }

    pub fn slice_at_offset(&self, offset: FileOffset, len: usize) -> Result<&'a [u8]> {
        let start = offset.value() as usize;
        let end = start
            .checked_add(len)
            .with_context(|| format!("length overflow reading at {offset}"))?;
        if end > self.data.len() {
            bail!("read of {len:#x} bytes at {offset} leaves the image");
        }
        Ok(&self.data[start..end])
    }

    pub fn slice_at_rva(&self, rva: RelativeAddress, len: usize) -> Result<&'a [u8]> {
        let offset = self.rva_to_offset(rva)?;
        self.slice_at_offset(offset, len)
            .with_context(|| format!("while reading {len:#x} bytes at rva {rva}"))
    }

    pub fn u8_at(&self, rva: RelativeAddress) -> Result<u8> {
        Ok(self.slice_at_rva(rva, 1)?[0])
    }

    pub fn u16_at(&self, rva: RelativeAddress) -> Result<u16> {
        Ok(u16::from_le_bytes(self.slice_at_rva(rva, 2)?.try_into().unwrap()))
    }

    pub fn u32_at(&self, rva: RelativeAddress) -> Result<u32> {
        Ok(u32::from_le_bytes(self.slice_at_rva(rva, 4)?.try_into().unwrap()))
    }

    pub fn u16_at_offset(&self, offset: FileOffset) -> Result<u16> {
        Ok(u16::from_le_bytes(self.slice_at_offset(offset, 2)?.try_into().unwrap()))
    }

    pub fn u32_at_offset(&self, offset: FileOffset) -> Result<u32> {
        Ok(u32::from_le_bytes(self.slice_at_offset(offset, 4)?.try_into().unwrap()))
    }

    /// NUL-terminated ASCII string at `rva`, capped at 4 KiB.
    pub fn cstr_at(&self, rva: RelativeAddress) -> Result<String> {
        const CAP: usize = 0x1000;
        let offset = self.rva_to_offset(rva)?;
        let start = offset.value() as usize;
        let rest = self
            .data
            .get(start..)
            .with_context(|| format!("string at rva {rva} starts past the image"))?;
        let window = &rest[..rest.len().min(CAP)];
        let nul = window
            .iter()
            .position(|&b| b == 0)
            .with_context(|| format!("unterminated string at rva {rva}"))?;
        Ok(String::from_utf8_lossy(&window[..nul]).into_owned())
    }

    /// Byte length of the NUL-terminated string at `rva`, including the NUL.
    pub fn cstr_len_at(&self, rva: RelativeAddress) -> Result<u32> {
        Ok(self.cstr_at(rva)?.len() as u32 + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (Vec<u8>, Vec<SectionRow>) {
        let mut data = vec![0u8; 0x600];
        // .text raw at 0x200, rva 0x1000
        data[0x200] = 0xaa;
        data[0x203] = 0xbb;
        data[0x210..0x215].copy_from_slice(b"name\0");
        let sections = vec![SectionRow {
            name: ".text".into(),
            virtual_size: 0x800,
            virtual_address: 0x1000,
            size_of_raw_data: 0x400,
            pointer_to_raw_data: 0x200,
            characteristics: 0x6000_0020,
        }];
        (data, sections)
    }

    #[test]
    fn rva_mapping() {
        let (data, sections) = fixture();
        let view = ImageView::new(&data, sections);
        assert_eq!(view.rva_to_offset(RelativeAddress(0x1000)).unwrap(), FileOffset(0x200));
        assert_eq!(view.u8_at(RelativeAddress(0x1000)).unwrap(), 0xaa);
        assert_eq!(view.u8_at(RelativeAddress(0x1003)).unwrap(), 0xbb);
    }

    #[test]
    fn header_region_maps_identity() {
        let (data, sections) = fixture();
        let view = ImageView::new(&data, sections);
        assert_eq!(view.rva_to_offset(RelativeAddress(0x40)).unwrap(), FileOffset(0x40));
    }

    #[test]
    fn uninitialized_tail_rejected() {
        let (data, sections) = fixture();
        let view = ImageView::new(&data, sections);
        assert!(view.rva_to_offset(RelativeAddress(0x1500)).is_err());
    }

    #[test]
    fn unmapped_rva_rejected() {
        let (data, sections) = fixture();
        let view = ImageView::new(&data, sections);
        assert!(view.rva_to_offset(RelativeAddress(0x9000)).is_err());
    }

    #[test]
    fn out_of_image_read_rejected() {
        let (data, sections) = fixture();
        let view = ImageView::new(&data, sections);
        assert!(view.slice_at_rva(RelativeAddress(0x13f0), 0x20).is_err());
    }

    #[test]
    fn string_behind_a_lying_section_header_is_an_error() {
        // The section table claims raw data far past the end of the file.
        let data = vec![0u8; 0x600];
        let sections = vec![SectionRow {
            name: ".rdata".into(),
            virtual_size: 0x400,
            virtual_address: 0x1000,
            size_of_raw_data: 0x400,
            pointer_to_raw_data: 0x1_0000,
            characteristics: 0x4000_0040,
        }];
        let view = ImageView::new(&data, sections);
        assert!(view.cstr_at(RelativeAddress(0x1000)).is_err());
    }

    #[test]
    fn strings() {
        let (data, sections) = fixture();
        let view = ImageView::new(&data, sections);
        assert_eq!(view.cstr_at(RelativeAddress(0x1010)).unwrap(), "name");
        assert_eq!(view.cstr_len_at(RelativeAddress(0x1010)).unwrap(), 5);
    }
}
