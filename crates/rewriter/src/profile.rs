//! Frequency data and the profiles derived from it.
//!
//! A [`FrequencyMap`] is the raw sparse counter matrix keyed by original
//! address and column. [`ApplicationProfile`] scores whole blocks from it;
//! [`SubGraphProfile`] scores the basic blocks of one decomposition and
//! stamps arc counts onto the successors for the reorderer. Profiles are
//! consumed read-only; after a transform changes the graph the caller
//! re-derives them.

use std::collections::{BTreeMap, HashMap};

use tracing::warn;

use crate::address::RelativeAddress;
use crate::basic_block::{BasicBlock, BasicBlockSubGraph};
use crate::block_graph::{BlockGraph, BlockId};

/// Counter columns, by convention of the frequency data producers.
pub const COLUMN_ENTRY: u8 = 0;
pub const COLUMN_TAKEN: u8 = 1;
pub const COLUMN_MISPREDICT: u8 = 2;

/// Sparse `(original address, column) -> count`.
#[derive(Debug, Default, Clone)]
pub struct FrequencyMap {
    counts: BTreeMap<(u32, u8), u64>,
}

impl FrequencyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, addr: RelativeAddress, column: u8, count: u64) {
        *self.counts.entry((addr.value(), column)).or_insert(0) += count;
    }

    pub fn count(&self, addr: RelativeAddress, column: u8) -> u64 {
        self.counts
            .get(&(addr.value(), column))
            .copied()
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Sum of one column over `[start, start+len)`.
    pub fn column_sum(&self, start: RelativeAddress, len: u32, column: u8) -> u64 {
        self.counts
            .range((start.value(), 0)..(start.value().saturating_add(len), 0))
            .filter(|(&(_, c), _)| c == column)
            .map(|(_, &v)| v)
            .sum()
    }

    pub fn entries(&self) -> impl Iterator<Item = (RelativeAddress, u8, u64)> + '_ {
        self.counts
            .iter()
            .map(|(&(a, c), &v)| (RelativeAddress(a), c, v))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BlockScore {
    pub entry_count: u64,
    /// Sum of entry counts across every address inside the block.
    pub temperature: u64,
    /// Rank in `[0, 1]` by temperature among all scored blocks.
    pub percentile: f64,
}

/// Whole-image profile: one score per block with a known original address.
#[derive(Debug, Default)]
pub struct ApplicationProfile {
    frequencies: FrequencyMap,
    scores: HashMap<BlockId, BlockScore>,
    unknown_addresses: usize,
}

impl ApplicationProfile {
    pub fn import(frequencies: FrequencyMap) -> Self {
        Self {
            frequencies,
            scores: HashMap::new(),
            unknown_addresses: 0,
        }
    }

    pub fn frequencies(&self) -> &FrequencyMap {
        &self.frequencies
    }

    /// Scores every addressable block, then assigns percentiles. Frequency
    /// entries that land in no block are counted and reported once, never
    /// fatal.
    pub fn compute(&mut self, graph: &BlockGraph) {
        self.scores.clear();
        self.unknown_addresses = 0;
        for (addr, column, _) in self.frequencies.entries() {
            if column == COLUMN_ENTRY && graph.block_at_original_address(addr).is_none() {
                self.unknown_addresses += 1;
            }
        }
        if self.unknown_addresses > 0 {
            warn!(
                "{} frequency entries fall outside every block and were skipped",
                self.unknown_addresses
            );
        }

        for block in graph.blocks() {
            let Some(start) = block.original_address() else { continue };
            let score = BlockScore {
                entry_count: self.frequencies.count(start, COLUMN_ENTRY),
                temperature: self
                    .frequencies
                    .column_sum(start, block.size(), COLUMN_ENTRY),
                percentile: 0.0,
            };
            self.scores.insert(block.id(), score);
        }

        let mut by_heat: Vec<(BlockId, u64)> = self
            .scores
            .iter()
            .map(|(&id, s)| (id, s.temperature))
            .collect();
        by_heat.sort_by_key(|&(id, t)| (t, id));
        let n = by_heat.len();
        for (rank, (id, _)) in by_heat.into_iter().enumerate() {
            if let Some(score) = self.scores.get_mut(&id) {
                score.percentile = if n > 1 {
                    rank as f64 / (n - 1) as f64
                } else {
                    1.0
                };
            }
        }
    }

    pub fn score(&self, id: BlockId) -> Option<&BlockScore> {
        self.scores.get(&id)
    }

    pub fn unknown_addresses(&self) -> usize {
        self.unknown_addresses
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BasicBlockScore {
    pub entry_count: u64,
    /// Branch mispredicts over entries, zero when unprofiled.
    pub mispredict_ratio: f64,
}

/// Per-decomposition profile, derived on demand from the frequency data
/// and the original addresses of the block's basic blocks.
#[derive(Debug, Default)]
pub struct SubGraphProfile {
    scores: HashMap<u32, BasicBlockScore>,
}

impl SubGraphProfile {
    /// Scores `subgraph` and stamps arc counts onto its successors: the
    /// taken column feeds conditional edges, entries minus taken feed the
    /// fallthrough.
    pub fn compute(
        frequencies: &FrequencyMap,
        graph: &BlockGraph,
        subgraph: &mut BasicBlockSubGraph,
    ) -> Self {
        let mut profile = SubGraphProfile::default();
        let Some(base) = graph
            .block(subgraph.original)
            .and_then(|b| b.original_address())
        else {
            return profile;
        };

        for bb in subgraph.basic_blocks.iter_mut() {
            let BasicBlock::Code(code) = bb else { continue };
            let addr = base + code.offset;
            let entry_count = frequencies.count(addr, COLUMN_ENTRY);
            let taken = frequencies.count(addr, COLUMN_TAKEN);
            let mispredicts = frequencies.count(addr, COLUMN_MISPREDICT);
            profile.scores.insert(
                code.offset,
                BasicBlockScore {
                    entry_count,
                    mispredict_ratio: if entry_count > 0 {
                        mispredicts as f64 / entry_count as f64
                    } else {
                        0.0
                    },
                },
            );
            for successor in code.successors.iter_mut() {
                successor.count = match successor.kind {
                    crate::basic_block::SuccessorKind::Conditional => taken,
                    crate::basic_block::SuccessorKind::Fallthrough => {
                        entry_count.saturating_sub(taken)
                    }
                    crate::basic_block::SuccessorKind::Unconditional => entry_count,
                };
            }
        }
        profile
    }

    pub fn score(&self, leader_offset: u32) -> Option<&BasicBlockScore> {
        self.scores.get(&leader_offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_graph::BlockType;

    #[test]
    fn temperatures_and_percentiles() {
        let mut g = BlockGraph::new();
        let hot = g.add_block(BlockType::Code, 0x10, "hot");
        let cold = g.add_block(BlockType::Code, 0x10, "cold");
        g.block_mut(hot).unwrap().set_original_address(RelativeAddress(0x1000));
        g.block_mut(cold).unwrap().set_original_address(RelativeAddress(0x2000));

        let mut f = FrequencyMap::new();
        f.add(RelativeAddress(0x1000), COLUMN_ENTRY, 90);
        f.add(RelativeAddress(0x1008), COLUMN_ENTRY, 10);
        f.add(RelativeAddress(0x2000), COLUMN_ENTRY, 1);

        let mut profile = ApplicationProfile::import(f);
        profile.compute(&g);
        let h = profile.score(hot).unwrap();
        let c = profile.score(cold).unwrap();
        assert_eq!(h.entry_count, 90);
        assert_eq!(h.temperature, 100);
        assert_eq!(c.temperature, 1);
        assert!(h.percentile > c.percentile);
    }

    #[test]
    fn unknown_addresses_are_skipped_not_fatal() {
        let g = BlockGraph::new();
        let mut f = FrequencyMap::new();
        f.add(RelativeAddress(0xdead), COLUMN_ENTRY, 5);
        let mut profile = ApplicationProfile::import(f);
        profile.compute(&g);
        assert_eq!(profile.unknown_addresses(), 1);
    }

    #[test]
    fn subgraph_arcs_from_taken_counts() {
        use crate::basic_block::decompose;

        let mut g = BlockGraph::new();
        let section = g.add_section(".text", 0x6000_0020);
        // cmp eax,0; jz +1; inc eax; ret
        let bytes = [0x83, 0xf8, 0x00, 0x74, 0x01, 0x40, 0xc3];
        let id = g.add_block(BlockType::Code, bytes.len() as u32, "f");
        {
            let b = g.block_mut(id).unwrap();
            b.set_data(bytes.to_vec());
            b.set_section(section);
            b.set_original_address(RelativeAddress(0x1000));
        }

        let mut f = FrequencyMap::new();
        f.add(RelativeAddress(0x1000), COLUMN_ENTRY, 100);
        f.add(RelativeAddress(0x1000), COLUMN_TAKEN, 75);

        let mut subgraph = decompose(&g, id).unwrap();
        let profile = SubGraphProfile::compute(&f, &g, &mut subgraph);
        assert_eq!(profile.score(0).unwrap().entry_count, 100);
        let head = subgraph.basic_blocks[subgraph.basic_block_at(0).unwrap()]
            .as_code()
            .unwrap();
        let cond = head
            .successor_of_kind(crate::basic_block::SuccessorKind::Conditional)
            .unwrap();
        let fall = head
            .successor_of_kind(crate::basic_block::SuccessorKind::Fallthrough)
            .unwrap();
        assert_eq!(cond.count, 75);
        assert_eq!(fall.count, 25);
    }
}
