//! Address assignment for a block graph.
//!
//! Sections get virtual addresses in id order at the section alignment;
//! within a section, blocks are placed in id order, each rounded up to its
//! own alignment. The result is the immutable input of the writer.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use tracing::debug;

use crate::address::{AddressRange, RelativeAddress};
use crate::address_space::AddressSpace;
use crate::block_graph::{BlockGraph, BlockId, SectionId};
use crate::pe::{BlockRef, HeaderInfo};

/// Where one section landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionExtent {
    pub section: SectionId,
    pub start: RelativeAddress,
    /// Bytes occupied at run-time.
    pub virtual_size: u32,
    /// Bytes of real (initialized) data; the file raw size derives from it.
    pub data_size: u32,
}

pub struct ImageLayout {
    pub header_info: HeaderInfo,
    pub placements: AddressSpace<RelativeAddress, BlockId>,
    pub extents: Vec<SectionExtent>,
    addresses: HashMap<BlockId, RelativeAddress>,
}

impl ImageLayout {
    /// Lays out every sectioned block of `graph`. Sectionless blocks
    /// (header structures) are intentionally not placed; the writer
    /// synthesizes headers itself.
    pub fn build(graph: &BlockGraph, header_info: &HeaderInfo) -> Result<ImageLayout> {
        let mut layout = ImageLayout {
            header_info: header_info.clone(),
            placements: AddressSpace::new(),
            extents: Vec::new(),
            addresses: HashMap::new(),
        };
        let section_alignment = header_info.section_alignment;

        let mut cursor =
            RelativeAddress(header_info.size_of_headers).align_up(section_alignment);

        let sections: Vec<SectionId> = graph.sections().map(|s| s.id).collect();
        for section in sections {
            let start = cursor.align_up(section_alignment);
            let mut end = start;
            let mut data_end = start;

            for id in graph.blocks_in_section(section) {
                let block = graph.block(id).context("section index out of sync")?;
                let addr = end.align_up(block.alignment());
                let range = AddressRange::new(addr, block.size())
                    .with_context(|| format!("block {id} has degenerate size"))?;
                layout
                    .placements
                    .insert(range, id)
                    .map_err(|_| anyhow::anyhow!("block {id} overlaps at {addr}"))?;
                layout.addresses.insert(id, addr);
                end = addr + block.size();
                if !block.data().is_empty() {
                    data_end = addr + block.data().len() as u32;
                }
            }

            if end == start {
                debug!("section {section} is empty, keeping a zero extent");
            }
            layout.extents.push(SectionExtent {
                section,
                start,
                virtual_size: end.value() - start.value(),
                data_size: data_end.value().saturating_sub(start.value()),
            });
            cursor = end;
        }
        Ok(layout)
    }

    pub fn address_of(&self, id: BlockId) -> Option<RelativeAddress> {
        self.addresses.get(&id).copied()
    }

    pub fn resolve(&self, r: BlockRef) -> Option<RelativeAddress> {
        Some(self.address_of(r.block)? + r.offset)
    }

    /// End of the last placed section, aligned up to the section alignment.
    pub fn size_of_image(&self) -> u32 {
        self.extents
            .iter()
            .map(|e| {
                common::align_up(
                    e.start.value() + e.virtual_size,
                    self.header_info.section_alignment,
                )
            })
            .max()
            .unwrap_or(self.header_info.section_alignment)
    }

    /// Fails when any two placed blocks intersect; the address space makes
    /// this impossible by construction, so this is a debugging aid.
    pub fn check(&self, graph: &BlockGraph) -> Result<()> {
        for (range, &id) in self.placements.iter() {
            let block = graph
                .block(id)
                .with_context(|| format!("placed block {id} missing from graph"))?;
            if block.size() != range.size() {
                bail!("block {id} placed with stale size");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_graph::BlockType;

    #[test]
    fn blocks_respect_alignment_and_order() {
        let mut g = BlockGraph::new();
        let text = g.add_section(".text", 0x6000_0020);
        let a = g.add_block(BlockType::Code, 0x11, "a");
        let b = g.add_block(BlockType::Code, 0x8, "b");
        g.block_mut(a).unwrap().set_section(text);
        g.block_mut(b).unwrap().set_section(text);
        g.block_mut(b).unwrap().set_alignment(0x10);

        let layout = ImageLayout::build(&g, &HeaderInfo::default()).unwrap();
        let at = layout.address_of(a).unwrap();
        let bt = layout.address_of(b).unwrap();
        assert_eq!(at, RelativeAddress(0x1000));
        assert_eq!(bt, RelativeAddress(0x1020)); // 0x1011 rounded to 0x10
        layout.check(&g).unwrap();
    }

    #[test]
    fn sections_start_on_section_alignment() {
        let mut g = BlockGraph::new();
        let s1 = g.add_section(".text", 0x6000_0020);
        let s2 = g.add_section(".data", 0xc000_0040);
        let a = g.add_block(BlockType::Code, 0x10, "a");
        let b = g.add_block(BlockType::Data, 0x10, "b");
        g.block_mut(a).unwrap().set_section(s1);
        g.block_mut(b).unwrap().set_section(s2);

        let layout = ImageLayout::build(&g, &HeaderInfo::default()).unwrap();
        assert_eq!(layout.extents[0].start, RelativeAddress(0x1000));
        assert_eq!(layout.extents[1].start, RelativeAddress(0x2000));
        assert_eq!(layout.size_of_image(), 0x3000);
    }

    #[test]
    fn data_size_ignores_zero_tail() {
        let mut g = BlockGraph::new();
        let s = g.add_section(".data", 0xc000_0040);
        let a = g.add_block(BlockType::Data, 0x100, "a");
        g.block_mut(a).unwrap().set_section(s);
        g.block_mut(a).unwrap().set_data(vec![1, 2, 3, 4]);

        let layout = ImageLayout::build(&g, &HeaderInfo::default()).unwrap();
        assert_eq!(layout.extents[0].virtual_size, 0x100);
        assert_eq!(layout.extents[0].data_size, 4);
    }
}
