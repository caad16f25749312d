//! The chained basic-block pipeline.
//!
//! Iterates the call graph so callees are rewritten before their callers,
//! decomposes each eligible block once, runs every sub-graph transform over
//! it, and rebuilds only when something changed.

use std::collections::HashSet;

use anyhow::Result;
use tracing::{info, warn};

use crate::basic_block::{self, BasicBlockSubGraph};
use crate::block_graph::{BlockGraph, BlockId, BlockType};

use super::{Transform, TransformContext};

/// A rewrite over one decomposed block. Returns whether it changed the
/// subgraph; unchanged subgraphs are not rebuilt.
pub trait SubGraphTransform {
    fn name(&self) -> &'static str;

    fn transform(
        &mut self,
        graph: &BlockGraph,
        subgraph: &mut BasicBlockSubGraph,
    ) -> Result<bool>;
}

#[derive(Default)]
pub struct ChainTransform {
    transforms: Vec<Box<dyn SubGraphTransform>>,
    pub blocks_transformed: usize,
    pub blocks_skipped: usize,
    /// Blocks the policy allowed but the decoder could not decompose.
    pub blocks_failed: usize,
}

impl ChainTransform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(mut self, transform: Box<dyn SubGraphTransform>) -> Self {
        self.transforms.push(transform);
        self
    }

    /// Callees-first ordering: post-order DFS over caller-to-callee edges,
    /// cycles broken at the first revisit.
    fn callees_first(graph: &BlockGraph) -> Vec<BlockId> {
        let code: Vec<BlockId> = graph
            .blocks()
            .filter(|b| matches!(b.block_type(), BlockType::Code | BlockType::BasicCode))
            .map(|b| b.id())
            .collect();
        let mut order = Vec::with_capacity(code.len());
        let mut visited: HashSet<BlockId> = HashSet::new();
        for &root in &code {
            if visited.contains(&root) {
                continue;
            }
            // (block, next child index) DFS without recursion.
            let mut stack: Vec<(BlockId, Vec<BlockId>, usize)> = Vec::new();
            visited.insert(root);
            stack.push((root, callees_of(graph, root), 0));
            while let Some((id, children, cursor)) = stack.last_mut() {
                if let Some(&child) = children.get(*cursor) {
                    *cursor += 1;
                    if visited.insert(child) {
                        stack.push((child, callees_of(graph, child), 0));
                    }
                } else {
                    order.push(*id);
                    stack.pop();
                }
            }
        }
        order
    }
}

fn callees_of(graph: &BlockGraph, id: BlockId) -> Vec<BlockId> {
    let block = match graph.block(id) {
        Some(b) => b,
        None => return Vec::new(),
    };
    block
        .references()
        .filter(|(_, r)| r.target != id)
        .filter(|(_, r)| {
            graph
                .block(r.target)
                .map(|t| matches!(t.block_type(), BlockType::Code | BlockType::BasicCode))
                .unwrap_or(false)
        })
        .map(|(_, r)| r.target)
        .collect()
}

impl Transform for ChainTransform {
    fn name(&self) -> &'static str {
        "basic-block-chain"
    }

    fn transform(&mut self, graph: &mut BlockGraph, context: &TransformContext) -> Result<()> {
        let order = Self::callees_first(graph);
        for id in order {
            // Earlier rebuilds may have consumed this id.
            let block = match graph.block(id) {
                Some(b) => b,
                None => continue,
            };
            if !context.block_is_rewritable(block) {
                self.blocks_skipped += 1;
                continue;
            }
            let mut subgraph = match basic_block::decompose(graph, id) {
                Ok(s) => s,
                Err(e) => {
                    warn!("cannot decompose {id}: {e:#}");
                    self.blocks_failed += 1;
                    continue;
                }
            };
            let mut changed = false;
            for t in &mut self.transforms {
                changed |= t.transform(graph, &mut subgraph)?;
            }
            if changed {
                basic_block::build(graph, &subgraph)?;
                self.blocks_transformed += 1;
            }
        }
        info!(
            "{}: {} block(s) rewritten, {} skipped, {} failed to decompose",
            self.name(),
            self.blocks_transformed,
            self.blocks_skipped,
            self.blocks_failed
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_graph::{
        BlockAttributes, BlockGraph, BlockId, BlockType, Reference, ReferenceType,
    };
    use crate::transforms::{InlineTransform, TransformContext};

    fn add_code(g: &mut BlockGraph, section: u32, name: &str, bytes: &[u8]) -> BlockId {
        let id = g.add_block(BlockType::Code, bytes.len() as u32, name);
        let b = g.block_mut(id).unwrap();
        b.set_data(bytes.to_vec());
        b.set_section(section);
        id
    }

    fn caller_callee() -> (BlockGraph, BlockId, BlockId) {
        let mut g = BlockGraph::new();
        let section = g.add_section(".text", 0x6000_0020);
        // mov eax, 0x2a; ret
        let callee = add_code(&mut g, section, "callee", &[0xb8, 0x2a, 0, 0, 0, 0xc3]);
        // call callee; ret
        let caller = add_code(&mut g, section, "caller", &[0xe8, 0, 0, 0, 0, 0xc3]);
        g.set_reference(
            caller,
            1,
            Reference::new(ReferenceType::PcRelative, 4, callee, 0),
        )
        .unwrap();
        (g, caller, callee)
    }

    #[test]
    fn callees_come_before_callers() {
        let (g, caller, callee) = caller_callee();
        let order = ChainTransform::callees_first(&g);
        let pos = |id| order.iter().position(|&b| b == id).unwrap();
        assert!(pos(callee) < pos(caller));
    }

    #[test]
    fn only_changed_blocks_are_rebuilt() {
        let (mut g, caller, _) = caller_callee();
        let mut chain = ChainTransform::new().append(Box::new(InlineTransform::new()));
        chain
            .transform(&mut g, &TransformContext::default())
            .unwrap();
        // The callee decomposed clean but had nothing to inline; only the
        // caller was rebuilt.
        assert_eq!(chain.blocks_transformed, 1);
        assert_eq!(chain.blocks_skipped, 0);
        assert!(g.block(caller).is_none());
        let rebuilt = g
            .blocks()
            .find(|b| b.name().contains("caller"))
            .expect("rebuilt caller");
        assert_eq!(rebuilt.data(), &[0xb8, 0x2a, 0, 0, 0, 0xc3]);
    }

    #[test]
    fn decode_failures_are_counted_apart_from_policy_skips() {
        let mut g = BlockGraph::new();
        let section = g.add_section(".text", 0x6000_0020);
        // A truncated call: one opcode byte, no displacement.
        let torn = add_code(&mut g, section, "torn", &[0xe8]);
        let mut chain = ChainTransform::new().append(Box::new(InlineTransform::new()));
        chain
            .transform(&mut g, &TransformContext::default())
            .unwrap();
        assert_eq!(chain.blocks_failed, 1);
        assert_eq!(chain.blocks_skipped, 0);
        assert!(g.block(torn).is_some());
    }

    #[test]
    fn policy_rejections_are_counted() {
        let (mut g, caller, _) = caller_callee();
        g.block_mut(caller)
            .unwrap()
            .set_attributes(BlockAttributes::HAS_EXCEPTION_HANDLING);
        let mut chain = ChainTransform::new().append(Box::new(InlineTransform::new()));
        chain
            .transform(&mut g, &TransformContext::default())
            .unwrap();
        assert_eq!(chain.blocks_transformed, 0);
        assert_eq!(chain.blocks_skipped, 1);
        assert!(g.block(caller).is_some());
    }
}
