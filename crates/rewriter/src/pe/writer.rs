//! Lowers a laid-out block graph to a byte-accurate PE32 image.
//!
//! The writer patches every reference into a virtual copy of the image,
//! regenerates `.reloc`, synthesizes DOS/NT/section headers, then emits
//! file-aligned section data with zero gap fill. Displacement overflow on
//! any reference is an error: the transform that produced the reference is
//! buggy, and silently truncating would corrupt the output.

use anyhow::{bail, Context, Result};
use common::align_up;
use tracing::info;

use crate::block_graph::{BlockGraph, ReferenceType};
use crate::pe::layout::ImageLayout;
use crate::pe::{
    DIR_BASERELOC, IMAGE_NT_OPTIONAL_HDR32_MAGIC, IMAGE_SCN_CNT_CODE,
    IMAGE_SCN_CNT_INITIALIZED_DATA, IMAGE_SCN_CNT_UNINITIALIZED_DATA, IMAGE_SCN_MEM_DISCARDABLE,
    IMAGE_SCN_MEM_READ, NUM_DATA_DIRECTORIES, OPTIONAL_HEADER_SIZE_PE32, SECTION_HEADER_SIZE,
};

const DOS_HEADER: [u8; 0x40] = {
    let mut h = [0u8; 0x40];
    h[0] = b'M';
    h[1] = b'Z';
    h[0x3c] = 0x40; // e_lfanew
    h
};

struct SectionRecord {
    name: String,
    virtual_address: u32,
    virtual_size: u32,
    raw_offset: u32,
    raw_size: u32,
    characteristics: u32,
}

pub fn write_image(graph: &BlockGraph, layout: &ImageLayout) -> Result<Vec<u8>> {
    layout.check(graph)?;
    let info = &layout.header_info;

    // Regenerated relocations land in their own trailing section.
    let fixups = super::relocs::collect_fixups(graph, layout);
    let reloc_data = super::relocs::build_reloc_data(&fixups);
    let reloc_extent = if reloc_data.is_empty() {
        None
    } else {
        let start = layout.size_of_image();
        Some((start, reloc_data.len() as u32))
    };

    // Section bookkeeping, including the synthetic .reloc.
    let mut records: Vec<SectionRecord> = Vec::new();
    let mut raw_cursor = align_up(
        header_bytes_len(layout.extents.len() as u32 + reloc_extent.is_some() as u32),
        info.file_alignment,
    );
    if raw_cursor > info.size_of_headers {
        bail!(
            "section table needs {raw_cursor:#x} bytes of headers but only {:#x} are reserved",
            info.size_of_headers
        );
    }
    raw_cursor = info.size_of_headers;

    for extent in &layout.extents {
        let section = graph
            .section(extent.section)
            .context("layout names a missing section")?;
        let raw_size = align_up(extent.data_size, info.file_alignment);
        records.push(SectionRecord {
            name: section.name.clone(),
            virtual_address: extent.start.value(),
            virtual_size: extent.virtual_size.max(1),
            raw_offset: raw_cursor,
            raw_size,
            characteristics: section.characteristics,
        });
        raw_cursor += raw_size;
    }
    if let Some((start, size)) = reloc_extent {
        let raw_size = align_up(size, info.file_alignment);
        records.push(SectionRecord {
            name: ".reloc".into(),
            virtual_address: start,
            virtual_size: size,
            raw_offset: raw_cursor,
            raw_size,
            characteristics: IMAGE_SCN_CNT_INITIALIZED_DATA
                | IMAGE_SCN_MEM_READ
                | IMAGE_SCN_MEM_DISCARDABLE,
        });
    }

    let size_of_image = match reloc_extent {
        Some((start, size)) => align_up(start + size, info.section_alignment),
        None => layout.size_of_image(),
    };

    // Materialize the virtual image and patch references into it.
    let mut image = vec![0u8; size_of_image as usize];
    for (range, &id) in layout.placements.iter() {
        let block = graph.block(id).context("placement names a missing block")?;
        let start = range.start().value() as usize;
        image[start..start + block.data().len()].copy_from_slice(block.data());
    }
    encode_references(graph, layout, &records, &mut image)?;
    if let Some((start, _)) = reloc_extent {
        image[start as usize..start as usize + reloc_data.len()].copy_from_slice(&reloc_data);
    }

    // Assemble the file.
    let mut file = vec![0u8; info.size_of_headers as usize];
    file[..0x40].copy_from_slice(&DOS_HEADER);
    let nt = build_nt_headers(layout, &records, reloc_extent, size_of_image)?;
    if 0x40 + nt.len() > info.size_of_headers as usize {
        bail!("headers overflow SizeOfHeaders");
    }
    file[0x40..0x40 + nt.len()].copy_from_slice(&nt);

    for r in &records {
        let va = r.virtual_address as usize;
        let data_len = (r.raw_size as usize).min(image.len() - va);
        let mut chunk = image[va..va + data_len].to_vec();
        chunk.resize(r.raw_size as usize, 0);
        debug_assert_eq!(file.len(), r.raw_offset as usize);
        file.extend_from_slice(&chunk);
    }

    info!(
        "wrote image: {} sections, {} relocation fixups, {:#x} bytes",
        records.len(),
        fixups.len(),
        file.len()
    );
    Ok(file)
}

fn header_bytes_len(num_sections: u32) -> u32 {
    0x40 + 4 + 20 + OPTIONAL_HEADER_SIZE_PE32 as u32 + num_sections * SECTION_HEADER_SIZE
}

fn rva_to_file_offset(records: &[SectionRecord], rva: u32) -> Result<u32> {
    for r in records {
        if rva >= r.virtual_address && rva < r.virtual_address + r.virtual_size {
            let delta = rva - r.virtual_address;
            if delta >= r.raw_size {
                bail!("rva {rva:#x} has no file backing in section {}", r.name);
            }
            return Ok(r.raw_offset + delta);
        }
    }
    bail!("rva {rva:#x} maps to no section");
}

fn encode_references(
    graph: &BlockGraph,
    layout: &ImageLayout,
    records: &[SectionRecord],
    image: &mut [u8],
) -> Result<()> {
    for block in graph.blocks() {
        let base = match layout.address_of(block.id()) {
            Some(a) => a.value(),
            None => continue,
        };
        for (offset, reference) in block.references() {
            let target_base = layout
                .address_of(reference.target)
                .with_context(|| {
                    format!(
                        "reference {}+{offset:#x} targets unplaced block {}",
                        block.id(),
                        reference.target
                    )
                })?
                .value();
            let target = target_base as i64 + reference.target_offset as i64;
            let site = base + offset;

            let value: i64 = match reference.kind {
                ReferenceType::PcRelative => target - (site as i64 + reference.size as i64),
                ReferenceType::Absolute => layout.header_info.image_base as i64 + target,
                ReferenceType::Relative => target,
                ReferenceType::FileOffset => rva_to_file_offset(records, target as u32)
                    .with_context(|| {
                        format!("file-offset reference at {}+{offset:#x}", block.id())
                    })? as i64,
            };

            if !reference.displacement_fits(value) {
                bail!(
                    "reference {}+{offset:#x} -> {}+{:#x}: value {value:#x} does not fit {} byte(s)",
                    block.id(),
                    reference.target,
                    reference.target_offset,
                    reference.size
                );
            }

            let site = site as usize;
            match reference.size {
                1 => image[site] = value as u8,
                2 => image[site..site + 2].copy_from_slice(&(value as u16).to_le_bytes()),
                4 => image[site..site + 4].copy_from_slice(&(value as u32).to_le_bytes()),
                n => bail!("unsupported reference size {n}"),
            }
        }
    }
    Ok(())
}

fn build_nt_headers(
    layout: &ImageLayout,
    records: &[SectionRecord],
    reloc_extent: Option<(u32, u32)>,
    size_of_image: u32,
) -> Result<Vec<u8>> {
    let info = &layout.header_info;
    let mut out = Vec::with_capacity(header_bytes_len(records.len() as u32) as usize - 0x40);

    // Signature + COFF header.
    out.extend_from_slice(b"PE\0\0");
    out.extend_from_slice(&info.machine.to_le_bytes());
    out.extend_from_slice(&(records.len() as u16).to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // TimeDateStamp
    out.extend_from_slice(&0u32.to_le_bytes()); // PointerToSymbolTable
    out.extend_from_slice(&0u32.to_le_bytes()); // NumberOfSymbols
    out.extend_from_slice(&OPTIONAL_HEADER_SIZE_PE32.to_le_bytes());
    out.extend_from_slice(&info.characteristics.to_le_bytes());

    // Derived size classes.
    let mut size_of_code = 0u32;
    let mut size_of_init = 0u32;
    let mut size_of_uninit = 0u32;
    let mut base_of_code = u32::MAX;
    let mut base_of_data = u32::MAX;
    for r in records {
        if r.characteristics & IMAGE_SCN_CNT_CODE != 0 {
            size_of_code += r.raw_size;
            base_of_code = base_of_code.min(r.virtual_address);
        }
        if r.characteristics & IMAGE_SCN_CNT_INITIALIZED_DATA != 0 {
            size_of_init += r.raw_size;
            base_of_data = base_of_data.min(r.virtual_address);
        }
        if r.characteristics & IMAGE_SCN_CNT_UNINITIALIZED_DATA != 0 {
            size_of_uninit += r.virtual_size;
        }
    }
    let entry_rva = match info.entry_point {
        Some(e) => layout
            .resolve(e)
            .context("entry point targets an unplaced block")?
            .value(),
        None => 0,
    };

    // Optional header, PE32.
    out.extend_from_slice(&IMAGE_NT_OPTIONAL_HDR32_MAGIC.to_le_bytes());
    out.push(0); // MajorLinkerVersion
    out.push(0);
    out.extend_from_slice(&size_of_code.to_le_bytes());
    out.extend_from_slice(&size_of_init.to_le_bytes());
    out.extend_from_slice(&size_of_uninit.to_le_bytes());
    out.extend_from_slice(&entry_rva.to_le_bytes());
    out.extend_from_slice(&(if base_of_code == u32::MAX { 0 } else { base_of_code }).to_le_bytes());
    out.extend_from_slice(&(if base_of_data == u32::MAX { 0 } else { base_of_data }).to_le_bytes());
    out.extend_from_slice(&info.image_base.to_le_bytes());
    out.extend_from_slice(&info.section_alignment.to_le_bytes());
    out.extend_from_slice(&info.file_alignment.to_le_bytes());
    out.extend_from_slice(&info.major_os_version.to_le_bytes());
    out.extend_from_slice(&info.minor_os_version.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes()); // MajorImageVersion
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&info.major_subsystem_version.to_le_bytes());
    out.extend_from_slice(&info.minor_subsystem_version.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // Win32VersionValue
    out.extend_from_slice(&size_of_image.to_le_bytes());
    out.extend_from_slice(&info.size_of_headers.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // CheckSum, fixed up externally
    out.extend_from_slice(&info.subsystem.to_le_bytes());
    out.extend_from_slice(&info.dll_characteristics.to_le_bytes());
    out.extend_from_slice(&info.size_of_stack_reserve.to_le_bytes());
    out.extend_from_slice(&info.size_of_stack_commit.to_le_bytes());
    out.extend_from_slice(&info.size_of_heap_reserve.to_le_bytes());
    out.extend_from_slice(&info.size_of_heap_commit.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // LoaderFlags
    out.extend_from_slice(&(NUM_DATA_DIRECTORIES as u32).to_le_bytes());

    for i in 0..NUM_DATA_DIRECTORIES {
        let (rva, size) = if i == DIR_BASERELOC {
            reloc_extent.unwrap_or((0, 0))
        } else {
            match info.data_directories[i] {
                Some(entry) => {
                    let rva = layout
                        .resolve(entry.location)
                        .with_context(|| format!("directory {i} targets an unplaced block"))?
                        .value();
                    (rva, entry.size)
                }
                None => (0, 0),
            }
        };
        out.extend_from_slice(&rva.to_le_bytes());
        out.extend_from_slice(&size.to_le_bytes());
    }

    // Section table.
    for r in records {
        let mut name = [0u8; 8];
        let bytes = r.name.as_bytes();
        name[..bytes.len().min(8)].copy_from_slice(&bytes[..bytes.len().min(8)]);
        out.extend_from_slice(&name);
        out.extend_from_slice(&r.virtual_size.to_le_bytes());
        out.extend_from_slice(&r.virtual_address.to_le_bytes());
        out.extend_from_slice(&r.raw_size.to_le_bytes());
        out.extend_from_slice(&r.raw_offset.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // PointerToRelocations
        out.extend_from_slice(&0u32.to_le_bytes()); // PointerToLinenumbers
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&r.characteristics.to_le_bytes());
    }

    Ok(out)
}
