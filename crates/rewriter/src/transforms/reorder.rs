//! Profile-guided basic-block reordering.
//!
//! The control flow of a decomposed block is reduced to a structural tree
//! (sequence, if-then, if-then-else, self-loop, while). Irreducible graphs
//! are left alone. The tree is flattened hot-successor-first using the arc
//! counts carried on the successors, conditional branches are inverted
//! where that makes the hot edge the fallthrough, and the new order is
//! kept only when its fallthrough cost is strictly below the original's.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use tracing::debug;

use crate::basic_block::{BasicBlockSubGraph, SuccessorKind, SuccessorTarget};
use crate::block_graph::BlockGraph;

use super::chain::SubGraphTransform;

#[derive(Default)]
pub struct ReorderTransform {
    pub blocks_reordered: usize,
}

impl ReorderTransform {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SubGraphTransform for ReorderTransform {
    fn name(&self) -> &'static str {
        "reorderer"
    }

    fn transform(
        &mut self,
        _graph: &BlockGraph,
        subgraph: &mut BasicBlockSubGraph,
    ) -> Result<bool> {
        let mut changed = false;
        for d in 0..subgraph.descriptions.len() {
            changed |= reorder_description(subgraph, d, &mut self.blocks_reordered)?;
        }
        Ok(changed)
    }
}

fn reorder_description(
    subgraph: &mut BasicBlockSubGraph,
    desc_index: usize,
    reordered: &mut usize,
) -> Result<bool> {
    let order = subgraph.descriptions[desc_index].basic_blocks.clone();
    let code: Vec<usize> = order
        .iter()
        .copied()
        .filter(|&i| subgraph.basic_blocks[i].as_code().is_some())
        .collect();
    if code.len() < 2 {
        return Ok(false);
    }
    let leaders: BTreeMap<u32, usize> = code
        .iter()
        .map(|&i| (subgraph.basic_blocks[i].offset(), i))
        .collect();

    let Some(tree) = structure(subgraph, &code, &leaders) else {
        debug!("{}: irreducible flow, leaving order alone", subgraph.original);
        return Ok(false);
    };
    let mut new_code = Vec::with_capacity(code.len());
    tree.flatten(&mut new_code);
    if new_code.len() != code.len() {
        // A node escaped the tree; do not touch the block.
        return Ok(false);
    }

    let old_cost = layout_cost(subgraph, &code, &leaders);
    let new_cost = layout_cost(subgraph, &new_code, &leaders);
    if new_cost >= old_cost {
        return Ok(false);
    }
    debug!(
        "{}: reordering {} basic blocks, cost {} -> {}",
        subgraph.original,
        code.len(),
        old_cost,
        new_cost
    );

    invert_for_fallthrough(subgraph, &new_code, &leaders);
    let data: Vec<usize> = order
        .iter()
        .copied()
        .filter(|&i| subgraph.basic_blocks[i].as_code().is_none())
        .collect();
    let mut full = new_code;
    full.extend(data);
    subgraph.descriptions[desc_index].basic_blocks = full;
    *reordered += 1;
    Ok(true)
}

/// Fallthrough cost: every successor arc that does not land on the next
/// block in the order pays its count. A conditional branch taken to the
/// next block is treated as free.
fn layout_cost(
    subgraph: &BasicBlockSubGraph,
    order: &[usize],
    leaders: &BTreeMap<u32, usize>,
) -> u64 {
    let mut cost = 0u64;
    for (pos, &index) in order.iter().enumerate() {
        let Some(code) = subgraph.basic_blocks[index].as_code() else { continue };
        let next = order.get(pos + 1).copied();
        for s in &code.successors {
            let lands_next = match s.target {
                SuccessorTarget::Local(t) => leaders.get(&t).copied() == next,
                SuccessorTarget::External { .. } => false,
            };
            if !lands_next {
                cost += s.count;
            }
        }
    }
    cost
}

/// Swaps conditional/fallthrough edges (negating the branch) wherever the
/// conditional target is the next block in the new order and the
/// fallthrough target is not.
fn invert_for_fallthrough(
    subgraph: &mut BasicBlockSubGraph,
    order: &[usize],
    leaders: &BTreeMap<u32, usize>,
) {
    for (pos, &index) in order.iter().enumerate() {
        let next = order.get(pos + 1).copied();
        let Some(code) = subgraph.basic_blocks[index].as_code_mut() else { continue };
        let [a, b] = &mut code.successors[..] else { continue };
        let (cond, fall) = match (a.kind, b.kind) {
            (SuccessorKind::Conditional, SuccessorKind::Fallthrough) => (a, b),
            (SuccessorKind::Fallthrough, SuccessorKind::Conditional) => (b, a),
            _ => continue,
        };
        let cond_next = matches!(cond.target, SuccessorTarget::Local(t) if leaders.get(&t).copied() == next);
        let fall_next = matches!(fall.target, SuccessorTarget::Local(t) if leaders.get(&t).copied() == next);
        if cond_next && !fall_next {
            if let Some(branch) = cond.instruction.as_mut() {
                branch.negate_condition_code();
                std::mem::swap(&mut cond.target, &mut fall.target);
                std::mem::swap(&mut cond.count, &mut fall.count);
            }
        }
    }
}

/// A node of the structural tree, carrying the arc weight used when the
/// flattener must choose which child to emit first.
enum Node {
    Basic(usize),
    Sequence(Vec<Node>),
    IfThen {
        cond: Box<Node>,
        then: Box<Node>,
    },
    IfThenElse {
        cond: Box<Node>,
        then: Box<Node>,
        then_weight: u64,
        els: Box<Node>,
        else_weight: u64,
    },
    SelfLoop(Box<Node>),
    While {
        cond: Box<Node>,
        body: Box<Node>,
    },
}

impl Node {
    fn flatten(&self, out: &mut Vec<usize>) {
        match self {
            Node::Basic(i) => out.push(*i),
            Node::Sequence(nodes) => nodes.iter().for_each(|n| n.flatten(out)),
            Node::IfThen { cond, then } => {
                cond.flatten(out);
                then.flatten(out);
            }
            Node::IfThenElse {
                cond,
                then,
                then_weight,
                els,
                else_weight,
            } => {
                cond.flatten(out);
                if else_weight > then_weight {
                    els.flatten(out);
                    then.flatten(out);
                } else {
                    then.flatten(out);
                    els.flatten(out);
                }
            }
            Node::SelfLoop(body) => body.flatten(out),
            Node::While { cond, body } => {
                cond.flatten(out);
                body.flatten(out);
            }
        }
    }
}

/// Reduces the local control-flow graph to a single structural node, or
/// `None` when no rule applies anymore (irreducible flow).
fn structure(
    subgraph: &BasicBlockSubGraph,
    code: &[usize],
    leaders: &BTreeMap<u32, usize>,
) -> Option<Node> {
    let entry = code[0];
    let mut nodes: BTreeMap<usize, Node> = code.iter().map(|&i| (i, Node::Basic(i))).collect();
    let mut succs: BTreeMap<usize, BTreeMap<usize, u64>> = BTreeMap::new();
    let mut preds: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
    for &i in code {
        succs.entry(i).or_default();
        preds.entry(i).or_default();
    }
    for &i in code {
        let bb = subgraph.basic_blocks[i].as_code()?;
        for s in &bb.successors {
            if let SuccessorTarget::Local(t) = s.target {
                if let Some(&j) = leaders.get(&t) {
                    *succs.get_mut(&i).unwrap().entry(j).or_insert(0) += s.count.max(1);
                    preds.get_mut(&j).unwrap().insert(i);
                }
            }
        }
    }

    while nodes.len() > 1 {
        if !reduce_once(entry, &mut nodes, &mut succs, &mut preds) {
            return None;
        }
    }
    // A lone node may still carry a self edge.
    let (&last, _) = nodes.iter().next()?;
    if succs.get(&last).map(|s| s.contains_key(&last)).unwrap_or(false) {
        let body = nodes.remove(&last)?;
        return Some(Node::SelfLoop(Box::new(body)));
    }
    nodes.remove(&last)
}

fn reduce_once(
    entry: usize,
    nodes: &mut BTreeMap<usize, Node>,
    succs: &mut BTreeMap<usize, BTreeMap<usize, u64>>,
    preds: &mut BTreeMap<usize, BTreeSet<usize>>,
) -> bool {
    let ids: Vec<usize> = nodes.keys().copied().collect();
    for &a in &ids {
        // Self-loop collapse.
        if succs[&a].len() == 1 && succs[&a].contains_key(&a) {
            succs.get_mut(&a).unwrap().remove(&a);
            preds.get_mut(&a).unwrap().remove(&a);
            let body = nodes.remove(&a).unwrap();
            nodes.insert(a, Node::SelfLoop(Box::new(body)));
            return true;
        }

        // Sequence: `a -> b` where b has no other way in.
        if succs[&a].len() == 1 {
            let b = *succs[&a].keys().next().unwrap();
            if b != a && b != entry && preds[&b].len() == 1 && !succs[&b].contains_key(&a) {
                merge_sequence(a, b, nodes, succs, preds);
                return true;
            }
        }

        if succs[&a].len() != 2 {
            continue;
        }
        let mut it = succs[&a].iter();
        let (&b, &wb) = it.next().unwrap();
        let (&c, &wc) = it.next().unwrap();
        if b == a || c == a {
            continue;
        }
        let arm_b = b != entry && preds[&b].len() == 1;
        let arm_c = c != entry && preds[&c].len() == 1;

        // If-then-else: both arms are pure branch bodies with the same
        // (at most one) join, which is a fourth node or an exit.
        if arm_b && arm_c && succs[&b] == succs[&c] && succs[&b].len() <= 1 {
            let join = succs[&b].keys().next().copied();
            if join != Some(a) && join != Some(b) && join != Some(c) {
                let cond = nodes.remove(&a).unwrap();
                let t = nodes.remove(&b).unwrap();
                let e = nodes.remove(&c).unwrap();
                nodes.insert(
                    a,
                    Node::IfThenElse {
                        cond: Box::new(cond),
                        then: Box::new(t),
                        then_weight: wb,
                        els: Box::new(e),
                        else_weight: wc,
                    },
                );
                remove_node_edges(b, succs, preds);
                remove_node_edges(c, succs, preds);
                let a_succs = succs.get_mut(&a).unwrap();
                a_succs.clear();
                if let Some(j) = join {
                    a_succs.insert(j, wb + wc);
                    preds.get_mut(&j).unwrap().insert(a);
                }
                return true;
            }
        }

        for (then, other, is_arm) in [(b, c, arm_b), (c, b, arm_c)] {
            if !is_arm {
                continue;
            }
            let then_succs = succs[&then].clone();
            // While: the branch body loops straight back to the head.
            if then_succs.len() == 1 && then_succs.contains_key(&a) {
                let body = nodes.remove(&then).unwrap();
                let cond = nodes.remove(&a).unwrap();
                nodes.insert(
                    a,
                    Node::While {
                        cond: Box::new(cond),
                        body: Box::new(body),
                    },
                );
                remove_node_edges(then, succs, preds);
                succs.get_mut(&a).unwrap().remove(&then);
                preds.get_mut(&a).unwrap().remove(&then);
                return true;
            }
            // If-then: the branch body rejoins at the other successor.
            if then_succs.len() <= 1 && then_succs.keys().all(|&k| k == other) {
                let cond = nodes.remove(&a).unwrap();
                let t = nodes.remove(&then).unwrap();
                nodes.insert(
                    a,
                    Node::IfThen {
                        cond: Box::new(cond),
                        then: Box::new(t),
                    },
                );
                remove_node_edges(then, succs, preds);
                succs.get_mut(&a).unwrap().remove(&then);
                preds.get_mut(&a).unwrap().remove(&then);
                return true;
            }
        }
    }
    false
}

fn merge_sequence(
    a: usize,
    b: usize,
    nodes: &mut BTreeMap<usize, Node>,
    succs: &mut BTreeMap<usize, BTreeMap<usize, u64>>,
    preds: &mut BTreeMap<usize, BTreeSet<usize>>,
) {
    let head = nodes.remove(&a).unwrap();
    let tail = nodes.remove(&b).unwrap();
    let merged = match head {
        Node::Sequence(mut v) => {
            v.push(tail);
            Node::Sequence(v)
        }
        other => Node::Sequence(vec![other, tail]),
    };
    nodes.insert(a, merged);

    let b_succs = succs.remove(&b).unwrap_or_default();
    preds.remove(&b);
    for (&t, _) in &b_succs {
        let p = preds.get_mut(&t).unwrap();
        p.remove(&b);
        p.insert(a);
    }
    *succs.get_mut(&a).unwrap() = b_succs;
}

fn remove_node_edges(
    n: usize,
    succs: &mut BTreeMap<usize, BTreeMap<usize, u64>>,
    preds: &mut BTreeMap<usize, BTreeSet<usize>>,
) {
    if let Some(out) = succs.remove(&n) {
        for (&t, _) in &out {
            if let Some(p) = preds.get_mut(&t) {
                p.remove(&n);
            }
        }
    }
    preds.remove(&n);
}
