//! `.reloc` regeneration from the graph's absolute references.
//!
//! Fixup sites are grouped by 4 KiB page; each page block carries an
//! 8-byte header and 16-bit entries with the type in the high nibble
//! (`HIGHLOW` = 3). Odd entry counts are padded with an `ABSOLUTE` entry
//! so page blocks stay 4-byte aligned.

use std::collections::BTreeMap;

use crate::block_graph::{BlockGraph, ReferenceType};
use crate::pe::ImageLayout;

const PAGE_SIZE: u32 = 0x1000;
const IMAGE_REL_BASED_HIGHLOW: u16 = 3;

/// RVAs of every absolute-reference site under the given layout, sorted.
pub fn collect_fixups(graph: &BlockGraph, layout: &ImageLayout) -> Vec<u32> {
    let mut sites = Vec::new();
    for block in graph.blocks() {
        let base = match layout.address_of(block.id()) {
            Some(a) => a,
            None => continue, // headers and other unplaced blocks
        };
        for (offset, reference) in block.references() {
            if reference.kind == ReferenceType::Absolute {
                sites.push(base.value() + offset);
            }
        }
    }
    sites.sort_unstable();
    sites
}

/// Serializes the fixup list into `.reloc` section content.
pub fn build_reloc_data(sites: &[u32]) -> Vec<u8> {
    let mut pages: BTreeMap<u32, Vec<u16>> = BTreeMap::new();
    for &site in sites {
        let page = site & !(PAGE_SIZE - 1);
        let entry = (IMAGE_REL_BASED_HIGHLOW << 12) | (site & (PAGE_SIZE - 1)) as u16;
        pages.entry(page).or_default().push(entry);
    }

    let mut out = Vec::new();
    for (page, mut entries) in pages {
        entries.sort_unstable();
        if entries.len() % 2 != 0 {
            entries.push(0); // IMAGE_REL_BASED_ABSOLUTE padding
        }
        let block_size = 8 + entries.len() as u32 * 2;
        out.extend_from_slice(&page.to_le_bytes());
        out.extend_from_slice(&block_size.to_le_bytes());
        for e in entries {
            out.extend_from_slice(&e.to_le_bytes());
        }
    }
    out
}
