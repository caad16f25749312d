//! Lifting a code block into basic blocks.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{bail, Context, Result};
use iced_x86::{Decoder, DecoderOptions, FlowControl, Instruction};
use tracing::trace;

use crate::block_graph::{
    BlockGraph, BlockId, LabelAttributes, Reference, ReferenceType,
};

use super::{
    BasicBlock, BasicBlockSubGraph, BasicCodeBlock, BasicDataBlock, BlockDescription,
    CodeInstruction, Successor, SuccessorKind, SuccessorTarget,
};

/// Decomposes `id` into a [`BasicBlockSubGraph`] with a single description
/// reproducing the original layout order.
pub fn decompose(graph: &BlockGraph, id: BlockId) -> Result<BasicBlockSubGraph> {
    let block = graph.block(id).with_context(|| format!("no block {id}"))?;
    let bytes = block
        .read_bytes(0, block.size() as usize)
        .context("block data exceeds its size")?;

    // Data runs come from DATA labels and extend to the next label or the
    // block end. Everything else is code.
    let data_runs = data_runs(block.labels(), block.size());

    // First decode pass over the code runs: instruction boundaries and the
    // local branch targets that induce leaders.
    let mut boundaries: BTreeMap<u32, Instruction> = BTreeMap::new();
    let mut leaders: BTreeSet<u32> = BTreeSet::new();
    leaders.insert(0);
    let mut run_start = 0u32;
    for &(data_start, data_end) in &data_runs {
        decode_run(&bytes, run_start, data_start, &mut boundaries, &mut leaders)?;
        leaders.insert(data_start);
        leaders.insert(data_end);
        run_start = data_end;
    }
    decode_run(&bytes, run_start, block.size(), &mut boundaries, &mut leaders)?;

    // Labels and incoming references also start basic blocks.
    for (offset, label) in block.labels() {
        if label.attributes.contains(LabelAttributes::CODE) {
            leaders.insert(offset);
        }
    }
    for &(rb, roff) in block.referrers() {
        let r = graph
            .block(rb)
            .and_then(|b| b.reference_at(roff))
            .context("referrer index out of sync")?;
        leaders.insert(r.target_offset);
    }
    for (_, r) in block.references() {
        if r.target == id {
            leaders.insert(r.target_offset);
        }
    }
    leaders.retain(|&o| o < block.size());
    for &leader in &leaders {
        if !boundaries.contains_key(&leader) && !in_data(&data_runs, leader) {
            bail!("leader {leader:#x} in {id} is not an instruction boundary");
        }
    }

    // Bucket the block's own references by containing instruction or data
    // run; the builder re-bases them when positions change.
    let mut insn_refs: BTreeMap<u32, Vec<(u32, Reference)>> = BTreeMap::new();
    let mut data_refs: BTreeMap<u32, Vec<(u32, Reference)>> = BTreeMap::new();
    for (offset, r) in block.references() {
        if let Some(&(start, _)) = data_runs.iter().find(|&&(s, e)| offset >= s && offset < e) {
            data_refs.entry(start).or_default().push((offset - start, *r));
            continue;
        }
        let (&insn_off, insn) = boundaries
            .range(..=offset)
            .next_back()
            .context("reference before first instruction")?;
        if offset >= insn_off + insn.len() as u32 {
            bail!("reference at {offset:#x} in {id} falls between instructions");
        }
        insn_refs.entry(insn_off).or_default().push((offset - insn_off, *r));
    }

    // Carve basic blocks at the leaders.
    let mut basic_blocks = Vec::new();
    let cuts: Vec<u32> = leaders.iter().copied().collect();
    for (i, &start) in cuts.iter().enumerate() {
        let end = cuts.get(i + 1).copied().unwrap_or(block.size());
        if start == end {
            continue;
        }
        if let Some(&(ds, de)) = data_runs.iter().find(|&&(s, _)| s == start) {
            debug_assert!(de <= end);
            basic_blocks.push(BasicBlock::Data(BasicDataBlock {
                offset: start,
                data: bytes[start as usize..de as usize].to_vec(),
                references: data_refs.remove(&start).unwrap_or_default(),
            }));
            continue;
        }
        basic_blocks.push(carve_code_block(
            id,
            start,
            end,
            &boundaries,
            &mut insn_refs,
            block.size(),
        )?);
    }

    trace!(
        "decomposed {id} into {} basic blocks ({} leaders)",
        basic_blocks.len(),
        leaders.len()
    );

    let description = BlockDescription {
        name: block.name().to_string(),
        block_type: block.block_type(),
        alignment: block.alignment(),
        attributes: block.attributes(),
        basic_blocks: (0..basic_blocks.len()).collect(),
    };
    Ok(BasicBlockSubGraph {
        original: id,
        section: block.section(),
        basic_blocks,
        descriptions: vec![description],
        labels: block.labels().map(|(o, l)| (o, l.clone())).collect(),
    })
}

fn data_runs<'a>(
    labels: impl Iterator<Item = (u32, &'a crate::block_graph::Label)>,
    size: u32,
) -> Vec<(u32, u32)> {
    let labels: Vec<(u32, LabelAttributes)> = labels.map(|(o, l)| (o, l.attributes)).collect();
    let mut runs = Vec::new();
    for (i, &(offset, attrs)) in labels.iter().enumerate() {
        if attrs.contains(LabelAttributes::DATA) && !attrs.contains(LabelAttributes::CODE) {
            let end = labels.get(i + 1).map(|&(o, _)| o).unwrap_or(size);
            runs.push((offset, end));
        }
    }
    runs
}

fn in_data(runs: &[(u32, u32)], offset: u32) -> bool {
    runs.iter().any(|&(s, e)| offset >= s && offset < e)
}

fn decode_run(
    bytes: &[u8],
    start: u32,
    end: u32,
    boundaries: &mut BTreeMap<u32, Instruction>,
    leaders: &mut BTreeSet<u32>,
) -> Result<()> {
    if start >= end {
        return Ok(());
    }
    let mut decoder = Decoder::with_ip(
        32,
        &bytes[start as usize..end as usize],
        start as u64,
        DecoderOptions::NONE,
    );
    let mut instruction = Instruction::default();
    while decoder.can_decode() {
        decoder.decode_out(&mut instruction);
        if instruction.is_invalid() {
            bail!("undecodable byte at offset {:#x}", instruction.ip());
        }
        let offset = instruction.ip() as u32;
        let next = offset + instruction.len() as u32;
        match instruction.flow_control() {
            FlowControl::UnconditionalBranch | FlowControl::ConditionalBranch => {
                let target = instruction.near_branch_target() as u32;
                if (target as usize) < bytes.len() {
                    leaders.insert(target);
                }
                leaders.insert(next);
            }
            FlowControl::Return | FlowControl::IndirectBranch => {
                leaders.insert(next);
            }
            _ => {}
        }
        boundaries.insert(offset, instruction);
    }
    Ok(())
}

fn carve_code_block(
    id: BlockId,
    start: u32,
    end: u32,
    boundaries: &BTreeMap<u32, Instruction>,
    insn_refs: &mut BTreeMap<u32, Vec<(u32, Reference)>>,
    block_size: u32,
) -> Result<BasicBlock> {
    let mut instructions: Vec<CodeInstruction> = Vec::new();
    for (&offset, insn) in boundaries.range(start..end) {
        instructions.push(CodeInstruction {
            offset: Some(offset),
            instruction: *insn,
            references: insn_refs.remove(&offset).unwrap_or_default(),
        });
    }
    let last = instructions
        .last()
        .with_context(|| format!("empty code run at {start:#x} in {id}"))?;
    let last_end = last.offset.unwrap() + last.instruction.len() as u32;

    let mut successors = Vec::new();
    match last.instruction.flow_control() {
        FlowControl::UnconditionalBranch => {
            let branch = instructions.pop().unwrap();
            successors.push(Successor {
                kind: SuccessorKind::Unconditional,
                target: branch_target(id, &branch, block_size)?,
                instruction: Some(branch.instruction),
                count: 0,
            });
        }
        FlowControl::ConditionalBranch => {
            if last_end >= block_size {
                bail!("conditional branch at the end of {id} has no fallthrough");
            }
            let branch = instructions.pop().unwrap();
            successors.push(Successor {
                kind: SuccessorKind::Conditional,
                target: branch_target(id, &branch, block_size)?,
                instruction: Some(branch.instruction),
                count: 0,
            });
            successors.push(Successor {
                kind: SuccessorKind::Fallthrough,
                target: SuccessorTarget::Local(last_end),
                instruction: None,
                count: 0,
            });
        }
        FlowControl::Return | FlowControl::IndirectBranch => {}
        _ => {
            // Straight-line flow into the next leader.
            if last_end < block_size {
                successors.push(Successor {
                    kind: SuccessorKind::Fallthrough,
                    target: SuccessorTarget::Local(last_end),
                    instruction: None,
                    count: 0,
                });
            }
        }
    }

    Ok(BasicBlock::Code(BasicCodeBlock {
        offset: start,
        instructions,
        successors,
    }))
}

/// Resolves a direct branch: a graph reference on the displacement wins
/// (the edge leaves the block); otherwise the decoded target must land
/// inside the block.
fn branch_target(id: BlockId, branch: &CodeInstruction, block_size: u32) -> Result<SuccessorTarget> {
    if let Some((_, r)) = branch.references.first() {
        if r.kind == ReferenceType::PcRelative && r.target != id {
            return Ok(SuccessorTarget::External {
                block: r.target,
                offset: r.target_offset,
            });
        }
        if r.target == id {
            return Ok(SuccessorTarget::Local(r.target_offset));
        }
    }
    let target = branch.instruction.near_branch_target() as u32;
    if target >= block_size {
        bail!(
            "branch at {:#x} in {id} targets {target:#x}, outside the block",
            branch.offset.unwrap_or(0)
        );
    }
    Ok(SuccessorTarget::Local(target))
}
