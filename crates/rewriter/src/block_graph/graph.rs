use std::collections::BTreeMap;

use anyhow::{bail, Result};
use tracing::debug;

use crate::address::RelativeAddress;
use crate::block_graph::{Block, BlockId, BlockType, Reference};

pub type SectionId = u32;

/// A named, attributed address range the image layout will materialize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub id: SectionId,
    pub name: String,
    pub characteristics: u32,
}

/// Owner of all blocks and sections. All reference mutation goes through
/// here so the forward map and the reverse referrer index never diverge.
#[derive(Debug, Default)]
pub struct BlockGraph {
    next_block_id: u32,
    next_section_id: SectionId,
    blocks: BTreeMap<BlockId, Block>,
    sections: BTreeMap<SectionId, Section>,
    /// Explicit within-section layout orders set by reordering transforms.
    section_orders: BTreeMap<SectionId, Vec<BlockId>>,
}

impl BlockGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_section(&mut self, name: &str, characteristics: u32) -> SectionId {
        let id = self.next_section_id;
        self.next_section_id += 1;
        self.sections.insert(
            id,
            Section {
                id,
                name: name.to_string(),
                characteristics,
            },
        );
        id
    }

    pub fn section(&self, id: SectionId) -> Option<&Section> {
        self.sections.get(&id)
    }

    pub fn section_mut(&mut self, id: SectionId) -> Option<&mut Section> {
        self.sections.get_mut(&id)
    }

    pub fn sections(&self) -> impl Iterator<Item = &Section> {
        self.sections.values()
    }

    pub fn section_count(&self) -> usize {
        self.sections.len()
    }

    pub fn add_block(&mut self, block_type: BlockType, size: u32, name: &str) -> BlockId {
        let id = BlockId(self.next_block_id);
        self.next_block_id += 1;
        self.blocks
            .insert(id, Block::new(id, block_type, size, name.to_string()));
        debug!("added block {} '{}' ({} bytes)", id, name, size);
        id
    }

    /// Removes a block. Fails while any other block still references it;
    /// dangling referrers are graph corruption, not a recoverable state.
    /// Self-references (a jump table pointing back into its own block) die
    /// with the block and do not count.
    pub fn remove_block(&mut self, id: BlockId) -> Result<()> {
        let block = match self.blocks.get(&id) {
            Some(b) => b,
            None => bail!("remove_block: no such block {id}"),
        };
        let external = block.referrers.iter().filter(|&&(rb, _)| rb != id).count();
        if external > 0 {
            bail!(
                "remove_block: block {id} '{}' still has {external} referrer(s)",
                block.name(),
            );
        }
        // Drop this block's own outgoing references first so its targets
        // forget about it.
        let offsets: Vec<u32> = self.blocks[&id].references.keys().copied().collect();
        for offset in offsets {
            self.remove_reference(id, offset)?;
        }
        self.blocks.remove(&id);
        Ok(())
    }

    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.blocks.get(&id)
    }

    pub fn block_mut(&mut self, id: BlockId) -> Option<&mut Block> {
        self.blocks.get_mut(&id)
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.values()
    }

    pub fn block_ids(&self) -> Vec<BlockId> {
        self.blocks.keys().copied().collect()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Installs (or replaces) the reference at `offset` inside `source`.
    /// Both endpoints are updated atomically.
    pub fn set_reference(&mut self, source: BlockId, offset: u32, reference: Reference) -> Result<()> {
        {
            let src = self
                .blocks
                .get(&source)
                .ok_or_else(|| anyhow::anyhow!("set_reference: no source block {source}"))?;
            if offset.saturating_add(reference.size as u32) > src.size {
                bail!(
                    "set_reference: offset {offset:#x}+{} exceeds block {source} size {:#x}",
                    reference.size,
                    src.size
                );
            }
        }
        if !self.blocks.contains_key(&reference.target) {
            bail!("set_reference: no target block {}", reference.target);
        }

        // Replacing an existing reference unhooks the old target first.
        if let Some(old) = self.blocks.get(&source).and_then(|b| b.references.get(&offset)).copied() {
            if let Some(t) = self.blocks.get_mut(&old.target) {
                t.referrers.remove(&(source, offset));
            }
        }

        self.blocks
            .get_mut(&reference.target)
            .expect("target checked above")
            .referrers
            .insert((source, offset));
        self.blocks
            .get_mut(&source)
            .expect("source checked above")
            .references
            .insert(offset, reference);
        Ok(())
    }

    pub fn remove_reference(&mut self, source: BlockId, offset: u32) -> Result<()> {
        let reference = match self.blocks.get_mut(&source) {
            Some(b) => b.references.remove(&offset),
            None => bail!("remove_reference: no source block {source}"),
        };
        let reference = match reference {
            Some(r) => r,
            None => bail!("remove_reference: no reference at {source}+{offset:#x}"),
        };
        if let Some(target) = self.blocks.get_mut(&reference.target) {
            target.referrers.remove(&(source, offset));
        }
        Ok(())
    }

    /// Redirects every referrer of `from` (optionally only those whose
    /// target offset falls in `[offset_lo, offset_hi)`) to `to`, preserving
    /// reference kind and size and shifting target offsets by `delta`.
    pub fn transfer_referrers(
        &mut self,
        from: BlockId,
        to: BlockId,
        offset_lo: u32,
        offset_hi: u32,
        delta: i64,
    ) -> Result<usize> {
        let referrers: Vec<(BlockId, u32)> = self
            .blocks
            .get(&from)
            .map(|b| b.referrers.iter().copied().collect())
            .unwrap_or_default();

        let mut moved = 0;
        for (src, src_off) in referrers {
            let reference = match self.blocks.get(&src).and_then(|b| b.references.get(&src_off)) {
                Some(r) => *r,
                None => bail!("referrer index out of sync at {src}+{src_off:#x}"),
            };
            if reference.target != from
                || reference.target_offset < offset_lo
                || reference.target_offset >= offset_hi
            {
                continue;
            }
            let new_offset = (reference.target_offset as i64 + delta) as u32;
            self.set_reference(
                src,
                src_off,
                Reference::new(reference.kind, reference.size, to, new_offset),
            )?;
            moved += 1;
        }
        Ok(moved)
    }

    /// Splits `id` at `split_offset`: the original keeps the head, a fresh
    /// block takes the tail. References and labels move with their bytes,
    /// and external referrers pointing past the split are redirected.
    pub fn split_block(&mut self, id: BlockId, split_offset: u32) -> Result<BlockId> {
        let (head_type, total_size, name, section, attrs, orig_addr) = {
            let b = self
                .blocks
                .get(&id)
                .ok_or_else(|| anyhow::anyhow!("split_block: no such block {id}"))?;
            (
                b.block_type,
                b.size,
                b.name.clone(),
                b.section,
                b.attributes,
                b.original_address,
            )
        };
        if split_offset == 0 || split_offset >= total_size {
            bail!("split_block: offset {split_offset:#x} outside (0, {total_size:#x})");
        }

        let tail_size = total_size - split_offset;
        let tail_id = self.add_block(head_type, tail_size, &format!("{name}+{split_offset:#x}"));
        {
            let tail = self.blocks.get_mut(&tail_id).expect("just added");
            tail.attributes = attrs;
            if let Some(s) = section {
                tail.section = Some(s);
            }
            if let Some(a) = orig_addr {
                tail.original_address = Some(a + split_offset);
            }
        }

        // Move the tail bytes.
        let (tail_data, moved_refs, moved_labels) = {
            let head = self.blocks.get_mut(&id).expect("checked above");
            let tail_data = if (head.data.len() as u32) > split_offset {
                head.data.split_off(split_offset as usize)
            } else {
                Vec::new()
            };
            head.size = split_offset;

            let moved_refs: Vec<(u32, Reference)> = head
                .references
                .iter()
                .filter(|(&o, _)| o >= split_offset)
                .map(|(&o, r)| (o, *r))
                .collect();
            for (o, _) in &moved_refs {
                head.references.remove(o);
            }

            let moved_labels: Vec<(u32, crate::block_graph::Label)> = head
                .labels
                .iter()
                .filter(|(&o, _)| o >= split_offset)
                .map(|(&o, l)| (o, l.clone()))
                .collect();
            for (o, _) in &moved_labels {
                head.labels.remove(o);
            }
            (tail_data, moved_refs, moved_labels)
        };

        {
            let tail = self.blocks.get_mut(&tail_id).expect("just added");
            tail.data = tail_data;
            for (o, l) in moved_labels {
                tail.labels.insert(o - split_offset, l);
            }
        }
        // Outgoing references in the tail keep their targets; only the
        // source bookkeeping moves.
        for (o, r) in moved_refs {
            if let Some(t) = self.blocks.get_mut(&r.target) {
                t.referrers.remove(&(id, o));
            }
            self.set_reference(tail_id, o - split_offset, r)?;
        }

        // Incoming references into the tail half are redirected.
        self.transfer_referrers(id, tail_id, split_offset, total_size, -(split_offset as i64))?;
        Ok(tail_id)
    }

    /// Verifies the two-sided reference invariant across the whole graph.
    pub fn check_consistency(&self) -> Result<()> {
        for block in self.blocks.values() {
            for (offset, reference) in &block.references {
                let target = self
                    .blocks
                    .get(&reference.target)
                    .ok_or_else(|| anyhow::anyhow!("{}+{offset:#x} targets missing block", block.id))?;
                if !target.referrers.contains(&(block.id, *offset)) {
                    bail!(
                        "reference {}+{offset:#x} -> {} not mirrored in referrers",
                        block.id,
                        reference.target
                    );
                }
            }
            for &(src, src_off) in &block.referrers {
                let ok = self
                    .blocks
                    .get(&src)
                    .and_then(|b| b.references.get(&src_off))
                    .map(|r| r.target == block.id)
                    .unwrap_or(false);
                if !ok {
                    bail!("stale referrer ({src}, {src_off:#x}) on {}", block.id);
                }
            }
        }
        Ok(())
    }

    /// Blocks of `id`'s section, in layout order: the explicit order when a
    /// transform has set one (stale entries dropped, newcomers appended in
    /// id order), id order otherwise.
    pub fn blocks_in_section(&self, section: SectionId) -> Vec<BlockId> {
        let mut ids: Vec<BlockId> = self
            .blocks
            .values()
            .filter(|b| b.section == Some(section))
            .map(|b| b.id)
            .collect();
        if let Some(order) = self.section_orders.get(&section) {
            let mut ordered: Vec<BlockId> =
                order.iter().copied().filter(|id| ids.contains(id)).collect();
            ids.retain(|id| !ordered.contains(id));
            ordered.extend(ids);
            return ordered;
        }
        ids
    }

    /// Pins the layout order of a section's blocks.
    pub fn set_section_order(&mut self, section: SectionId, order: Vec<BlockId>) {
        self.section_orders.insert(section, order);
    }

    /// Finds the block whose original address range covers `addr`.
    pub fn block_at_original_address(&self, addr: RelativeAddress) -> Option<(BlockId, u32)> {
        self.blocks.values().find_map(|b| {
            let start = b.original_address?;
            let offset = addr.checked_sub(start)?;
            (offset < b.size).then_some((b.id, offset))
        })
    }

    pub(crate) fn insert_raw(&mut self, block: Block) {
        self.next_block_id = self.next_block_id.max(block.id.0 + 1);
        self.blocks.insert(block.id, block);
    }

    pub(crate) fn insert_section_raw(&mut self, section: Section) {
        self.next_section_id = self.next_section_id.max(section.id + 1);
        self.sections.insert(section.id, section);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_graph::{LabelAttributes, ReferenceType};

    fn graph_with_pair() -> (BlockGraph, BlockId, BlockId) {
        let mut g = BlockGraph::new();
        let a = g.add_block(BlockType::Code, 0x20, "a");
        let b = g.add_block(BlockType::Code, 0x10, "b");
        g.block_mut(a).unwrap().set_data(vec![0x90; 0x20]);
        g.set_reference(a, 4, Reference::new(ReferenceType::PcRelative, 4, b, 0))
            .unwrap();
        (g, a, b)
    }

    #[test]
    fn references_are_mirrored() {
        let (g, a, b) = graph_with_pair();
        assert!(g.block(b).unwrap().referrers().any(|&r| r == (a, 4)));
        g.check_consistency().unwrap();
    }

    #[test]
    fn remove_block_rejects_live_referrers() {
        let (mut g, a, b) = graph_with_pair();
        assert!(g.remove_block(b).is_err());
        g.remove_reference(a, 4).unwrap();
        assert!(g.remove_block(b).is_ok());
        g.check_consistency().unwrap();
    }

    #[test]
    fn self_referencing_block_can_be_removed() {
        let mut g = BlockGraph::new();
        let a = g.add_block(BlockType::Code, 0x20, "a");
        let b = g.add_block(BlockType::Data, 8, "b");
        // A jump table inside the block references its own body.
        g.set_reference(a, 2, Reference::new(ReferenceType::Absolute, 4, a, 0x10))
            .unwrap();
        g.set_reference(a, 8, Reference::new(ReferenceType::Absolute, 4, b, 0))
            .unwrap();
        g.remove_block(a).unwrap();
        assert!(!g.block(b).unwrap().has_referrers());
        g.check_consistency().unwrap();
    }

    #[test]
    fn removing_source_releases_target() {
        let (mut g, a, b) = graph_with_pair();
        g.remove_block(a).unwrap();
        assert!(!g.block(b).unwrap().has_referrers());
    }

    #[test]
    fn replacing_reference_unhooks_old_target() {
        let (mut g, a, b) = graph_with_pair();
        let c = g.add_block(BlockType::Data, 8, "c");
        g.set_reference(a, 4, Reference::new(ReferenceType::Absolute, 4, c, 2))
            .unwrap();
        assert!(!g.block(b).unwrap().has_referrers());
        assert!(g.block(c).unwrap().has_referrers());
        g.check_consistency().unwrap();
    }

    #[test]
    fn reference_past_block_end_rejected() {
        let (mut g, a, b) = graph_with_pair();
        assert!(g
            .set_reference(a, 0x1d, Reference::new(ReferenceType::Absolute, 4, b, 0))
            .is_err());
    }

    #[test]
    fn split_moves_bytes_refs_labels_and_referrers() {
        let mut g = BlockGraph::new();
        let victim = g.add_block(BlockType::Code, 0x10, "victim");
        let tgt = g.add_block(BlockType::Data, 4, "tgt");
        let caller = g.add_block(BlockType::Code, 8, "caller");

        let data: Vec<u8> = (0u8..0x10).collect();
        g.block_mut(victim).unwrap().set_data(data);
        g.block_mut(victim)
            .unwrap()
            .set_label(0xc, "late", LabelAttributes::CODE);
        g.set_reference(victim, 0xa, Reference::new(ReferenceType::Absolute, 4, tgt, 0))
            .unwrap();
        // caller points into the future tail half
        g.set_reference(caller, 0, Reference::new(ReferenceType::PcRelative, 4, victim, 0xc))
            .unwrap();

        let tail = g.split_block(victim, 8).unwrap();
        g.check_consistency().unwrap();

        assert_eq!(g.block(victim).unwrap().size(), 8);
        assert_eq!(g.block(victim).unwrap().data(), &(0u8..8).collect::<Vec<_>>()[..]);
        assert_eq!(g.block(tail).unwrap().size(), 8);
        assert_eq!(g.block(tail).unwrap().data(), &(8u8..0x10).collect::<Vec<_>>()[..]);

        // The absolute ref moved to the tail at offset 2.
        assert!(g.block(tail).unwrap().reference_at(2).is_some());
        assert!(g.block(victim).unwrap().reference_at(0xa).is_none());

        // The label moved and rebased.
        assert!(g.block(tail).unwrap().label_at(4).is_some());

        // The caller now points at the tail.
        let r = *g.block(caller).unwrap().reference_at(0).unwrap();
        assert_eq!(r.target, tail);
        assert_eq!(r.target_offset, 4);
    }

    #[test]
    fn split_preserves_original_address() {
        let mut g = BlockGraph::new();
        let b = g.add_block(BlockType::Code, 0x10, "b");
        g.block_mut(b)
            .unwrap()
            .set_original_address(crate::RelativeAddress(0x1000));
        let tail = g.split_block(b, 4).unwrap();
        assert_eq!(
            g.block(tail).unwrap().original_address(),
            Some(crate::RelativeAddress(0x1004))
        );
    }
}
