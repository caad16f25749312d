//! Flat binary serialization of a block graph.
//!
//! Blocks travel by id and references by id + offset, never by pointer, so
//! a deserialized graph is structurally identical to the original. The
//! referrer index is not stored; it is rebuilt from the forward references
//! on load.

use anyhow::{bail, Context, Result};

use crate::address::RelativeAddress;
use crate::block_graph::{
    Block, BlockAttributes, BlockGraph, BlockId, BlockType, Label, LabelAttributes, Reference,
    ReferenceType, Section,
};

const MAGIC: &[u8; 4] = b"BGPH";
const VERSION: u16 = 1;

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            bail!("truncated graph stream at offset {:#x}", self.pos);
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).context("non-utf8 string in graph stream")
    }
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_string(out: &mut Vec<u8>, s: &str) {
    put_u32(out, s.len() as u32);
    out.extend_from_slice(s.as_bytes());
}

impl BlockGraph {
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        put_u16(&mut out, VERSION);

        put_u32(&mut out, self.section_count() as u32);
        for section in self.sections() {
            put_u32(&mut out, section.id);
            put_string(&mut out, &section.name);
            put_u32(&mut out, section.characteristics);
        }

        put_u32(&mut out, self.block_count() as u32);
        for block in self.blocks() {
            put_u32(&mut out, block.id.0);
            out.push(block.block_type.to_u8());
            put_u32(&mut out, block.size);
            put_u32(&mut out, block.alignment);
            put_string(&mut out, &block.name);
            put_u16(&mut out, block.attributes.0);

            match block.section {
                Some(s) => {
                    out.push(1);
                    put_u32(&mut out, s);
                }
                None => out.push(0),
            }
            match block.original_address {
                Some(a) => {
                    out.push(1);
                    put_u32(&mut out, a.value());
                }
                None => out.push(0),
            }

            put_u32(&mut out, block.data.len() as u32);
            out.extend_from_slice(&block.data);

            put_u32(&mut out, block.references.len() as u32);
            for (offset, r) in &block.references {
                put_u32(&mut out, *offset);
                out.push(r.kind.to_u8());
                out.push(r.size);
                put_u32(&mut out, r.target.0);
                put_u32(&mut out, r.target_offset);
            }

            put_u32(&mut out, block.labels.len() as u32);
            for (offset, label) in &block.labels {
                put_u32(&mut out, *offset);
                put_string(&mut out, &label.name);
                out.push(label.attributes.0);
            }
        }
        out
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut c = Cursor::new(data);
        if c.take(4)? != MAGIC {
            bail!("bad graph magic");
        }
        let version = c.u16()?;
        if version != VERSION {
            bail!("unsupported graph version {version}");
        }

        let mut graph = BlockGraph::new();

        let section_count = c.u32()?;
        for _ in 0..section_count {
            let id = c.u32()?;
            let name = c.string()?;
            let characteristics = c.u32()?;
            graph.insert_section_raw(Section {
                id,
                name,
                characteristics,
            });
        }

        let block_count = c.u32()?;
        let mut pending_refs: Vec<(BlockId, u32, Reference)> = Vec::new();
        for _ in 0..block_count {
            let id = BlockId(c.u32()?);
            let block_type =
                BlockType::from_u8(c.u8()?).context("bad block type in graph stream")?;
            let size = c.u32()?;
            let alignment = c.u32()?;
            let name = c.string()?;
            let attributes = BlockAttributes(c.u16()?);

            let section = if c.u8()? == 1 { Some(c.u32()?) } else { None };
            let original_address = if c.u8()? == 1 {
                Some(RelativeAddress(c.u32()?))
            } else {
                None
            };

            let data_len = c.u32()? as usize;
            let bytes = c.take(data_len)?.to_vec();
            if data_len as u64 > size as u64 {
                bail!("block {id}: data length {data_len:#x} exceeds size {size:#x}");
            }

            let mut block = Block::new(id, block_type, size, name);
            block.alignment = alignment;
            block.attributes = attributes;
            block.section = section;
            block.original_address = original_address;
            block.data = bytes;

            let ref_count = c.u32()?;
            for _ in 0..ref_count {
                let offset = c.u32()?;
                let kind =
                    ReferenceType::from_u8(c.u8()?).context("bad reference type in stream")?;
                let rsize = c.u8()?;
                let target = BlockId(c.u32()?);
                let target_offset = c.u32()?;
                pending_refs.push((id, offset, Reference::new(kind, rsize, target, target_offset)));
            }

            let label_count = c.u32()?;
            for _ in 0..label_count {
                let offset = c.u32()?;
                let lname = c.string()?;
                let lattr = LabelAttributes(c.u8()?);
                block.labels.insert(
                    offset,
                    Label {
                        name: lname,
                        attributes: lattr,
                    },
                );
            }

            graph.insert_raw(block);
        }

        // Rewire through set_reference so the referrer index comes back.
        for (src, offset, reference) in pending_refs {
            graph.set_reference(src, offset, reference)?;
        }

        graph.check_consistency()?;
        Ok(graph)
    }
}
