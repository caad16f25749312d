//! Lowering a subgraph back into graph blocks.
//!
//! Each description re-encodes its code blocks as one instruction stream
//! (data runs are appended after the code), then the original block's
//! referrers are rewired to the rebuilt locations and the original block
//! is removed. Branches between basic blocks of one description resolve to
//! plain displacements; edges leaving the description become graph
//! references the writer patches at layout time.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use iced_x86::{
    BlockEncoder, BlockEncoderOptions, Code, Instruction, InstructionBlock,
};
use tracing::trace;

use crate::block_graph::{
    BlockAttributes, BlockGraph, BlockId, Reference, ReferenceType,
};

use super::{BasicBlock, BasicBlockSubGraph, BlockDescription, SuccessorKind, SuccessorTarget};

/// Synthetic-instruction ips start here so they can never collide with a
/// basic-block leader tag (leaders are offsets inside a single block).
const SYNTH_IP_BASE: u64 = 0x1000_0000;

/// Where a rebuilt reference lives in the new payload.
enum RefSite {
    /// Anchored to an encoded instruction, measured back from its last
    /// byte; immune to length changes ahead of the displacement.
    Instruction { stream_index: usize, from_end: u32 },
    /// A fixed payload offset (data runs).
    Payload { offset: u32 },
}

struct PendingRef {
    site: RefSite,
    reference: Reference,
}

struct BuiltDescription {
    block: BlockId,
    code_len: u32,
    /// Stream index -> (offset, length) in the encoded code buffer.
    stream_offsets: Vec<u32>,
    stream_lengths: Vec<u32>,
    pending: Vec<PendingRef>,
    /// Original instruction offset -> stream index.
    insn_map: BTreeMap<u32, usize>,
    /// Leader offset -> stream index of the first emitted instruction.
    leader_map: BTreeMap<u32, usize>,
    /// Data-run original offset -> (length, offset in the data tail).
    data_map: BTreeMap<u32, (u32, u32)>,
}

impl BuiltDescription {
    fn site_offset(&self, site: &RefSite) -> Result<u32> {
        match *site {
            RefSite::Instruction { stream_index, from_end } => {
                let end = self.stream_offsets[stream_index] + self.stream_lengths[stream_index];
                end.checked_sub(from_end)
                    .context("reference does not fit its rebuilt instruction")
            }
            RefSite::Payload { offset } => Ok(offset),
        }
    }

    fn lookup(&self, offset: u32) -> Option<u32> {
        if let Some(&idx) = self.insn_map.get(&offset) {
            return Some(self.stream_offsets[idx]);
        }
        if let Some((&start, &(len, new_start))) = self.data_map.range(..=offset).next_back() {
            if offset < start + len {
                return Some(self.code_len + new_start + (offset - start));
            }
        }
        self.leader_map
            .get(&offset)
            .map(|&idx| self.stream_offsets[idx])
    }
}

/// Lowers `subgraph` into the graph, one fresh block per description, and
/// removes the original block. Returns the new block ids in description
/// order.
pub fn build(graph: &mut BlockGraph, subgraph: &BasicBlockSubGraph) -> Result<Vec<BlockId>> {
    let original = subgraph.original;
    let original_address = graph
        .block(original)
        .with_context(|| format!("no block {original}"))?
        .original_address();

    let mut built = Vec::new();
    for description in &subgraph.descriptions {
        built.push(assemble_description(graph, subgraph, description)?);
    }
    if let (Some(first), Some(addr)) = (built.first(), original_address) {
        graph.block_mut(first.block).unwrap().set_original_address(addr);
    }

    // Old offset -> (new block, new offset), across all descriptions.
    let remap = |offset: u32| -> Result<(BlockId, u32)> {
        for b in &built {
            if let Some(new_offset) = b.lookup(offset) {
                return Ok((b.block, new_offset));
            }
        }
        bail!("offset {offset:#x} of {original} has no rebuilt location")
    };

    // References carried by the rebuilt instructions and data runs.
    let mut to_set: Vec<(BlockId, u32, Reference)> = Vec::new();
    for b in &built {
        for p in &b.pending {
            let offset = b.site_offset(&p.site)?;
            let mut r = p.reference;
            if r.target == original {
                let (nb, noff) = remap(r.target_offset)?;
                r.target = nb;
                r.target_offset = noff;
            }
            to_set.push((b.block, offset, r));
        }
    }
    for (rb, roff, r) in to_set {
        graph
            .set_reference(rb, roff, r)
            .with_context(|| format!("rebuilding reference {rb}+{roff:#x}"))?;
    }

    // Transplant labels; end-of-block labels land past the last payload byte.
    for (&offset, label) in &subgraph.labels {
        if let Ok((nb, noff)) = remap(offset) {
            graph
                .block_mut(nb)
                .unwrap()
                .set_label(noff, label.name.clone(), label.attributes);
        } else if let Some(b) = built.last() {
            let block = graph.block_mut(b.block).unwrap();
            let end = block.size();
            block.set_label(end, label.name.clone(), label.attributes);
        }
    }

    // Rewire everything that pointed at the original block.
    let referrers: Vec<(BlockId, u32)> = graph
        .block(original)
        .unwrap()
        .referrers()
        .copied()
        .collect();
    for (rb, roff) in referrers {
        if rb == original {
            continue; // dies with the original block
        }
        let mut r = *graph
            .block(rb)
            .and_then(|b| b.reference_at(roff))
            .context("referrer index out of sync")?;
        let (nb, noff) = remap(r.target_offset)?;
        r.target = nb;
        r.target_offset = noff;
        graph.set_reference(rb, roff, r)?;
    }

    graph.remove_block(original)?;
    trace!("rebuilt {original} into {} block(s)", built.len());
    Ok(built.iter().map(|b| b.block).collect())
}

fn assemble_description(
    graph: &mut BlockGraph,
    subgraph: &BasicBlockSubGraph,
    description: &BlockDescription,
) -> Result<BuiltDescription> {
    // Data runs must trail the code so one encode covers all branches.
    let first_data = description
        .basic_blocks
        .iter()
        .position(|&i| matches!(subgraph.basic_blocks[i], BasicBlock::Data(_)));
    if let Some(split) = first_data {
        if description.basic_blocks[split..]
            .iter()
            .any(|&i| matches!(subgraph.basic_blocks[i], BasicBlock::Code(_)))
        {
            bail!("description '{}' interleaves code and data", description.name);
        }
    }
    let split = first_data.unwrap_or(description.basic_blocks.len());
    let (code_order, data_order) = description.basic_blocks.split_at(split);

    let mut instrs: Vec<Instruction> = Vec::new();
    let mut pending: Vec<PendingRef> = Vec::new();
    let mut insn_map: BTreeMap<u32, usize> = BTreeMap::new();
    let mut leader_map: BTreeMap<u32, usize> = BTreeMap::new();
    let mut synth_ip = SYNTH_IP_BASE;

    for (pos, &index) in code_order.iter().enumerate() {
        let bb = subgraph.basic_blocks[index]
            .as_code()
            .expect("split checked above");
        let stream_start = instrs.len();

        for (j, ci) in bb.instructions.iter().enumerate() {
            let mut insn = ci.instruction;
            // The leader tag doubles as the branch-target label.
            let ip = if j == 0 {
                bb.offset as u64
            } else {
                ci.offset.map(u64::from).unwrap_or_else(|| {
                    synth_ip += 0x10;
                    synth_ip
                })
            };
            insn.set_ip(ip);
            let idx = instrs.len();
            if let Some(old) = ci.offset {
                insn_map.insert(old, idx);
            }
            for &(rel, r) in &ci.references {
                pending.push(PendingRef {
                    site: RefSite::Instruction {
                        stream_index: idx,
                        from_end: ci.instruction.len() as u32 - rel,
                    },
                    reference: r,
                });
            }
            instrs.push(insn);
        }

        let next_leader = code_order
            .get(pos + 1)
            .map(|&i| subgraph.basic_blocks[i].offset());
        for successor in &bb.successors {
            let leader_tag = (instrs.len() == stream_start).then_some(bb.offset);
            match (successor.kind, &successor.instruction) {
                (SuccessorKind::Fallthrough, None) => {
                    if let SuccessorTarget::Local(t) = successor.target {
                        if Some(t) == next_leader {
                            continue; // free fallthrough
                        }
                    }
                    let jmp = Instruction::with_branch(Code::Jmp_rel32_32, 0)?;
                    push_branch(&mut instrs, &mut pending, jmp, 4, &successor.target, &mut synth_ip, leader_tag);
                }
                (_, Some(branch)) => {
                    let disp_size = if branch.len() <= 2 { 1 } else { 4 };
                    push_branch(
                        &mut instrs,
                        &mut pending,
                        *branch,
                        disp_size,
                        &successor.target,
                        &mut synth_ip,
                        leader_tag,
                    );
                }
                (kind, None) => {
                    bail!("{kind:?} successor without a branch instruction");
                }
            }
        }
        // A block that emitted nothing aliases its leader to the next
        // emitted instruction so incoming edges still resolve.
        if instrs.len() == stream_start {
            leader_map.insert(bb.offset, instrs.len());
        } else {
            leader_map.insert(bb.offset, stream_start);
        }
    }
    leader_map.retain(|_, idx| *idx < instrs.len());

    let encoded = BlockEncoder::encode(
        32,
        InstructionBlock::new(&instrs, 0),
        BlockEncoderOptions::RETURN_NEW_INSTRUCTION_OFFSETS,
    )
    .map_err(|e| anyhow::anyhow!("re-encoding '{}': {e}", description.name))?;
    let code = encoded.code_buffer;
    let stream_offsets = encoded.new_instruction_offsets;
    let mut stream_lengths = vec![0u32; instrs.len()];
    for i in 0..instrs.len() {
        let end = stream_offsets
            .get(i + 1)
            .copied()
            .unwrap_or(code.len() as u32);
        stream_lengths[i] = end - stream_offsets[i];
    }

    let code_len = code.len() as u32;
    let mut data = Vec::new();
    let mut data_map = BTreeMap::new();
    for &index in data_order {
        let db = match &subgraph.basic_blocks[index] {
            BasicBlock::Data(db) => db,
            BasicBlock::Code(_) => unreachable!("split checked above"),
        };
        let new_start = data.len() as u32;
        data_map.insert(db.offset, (db.data.len() as u32, new_start));
        for &(rel, r) in &db.references {
            pending.push(PendingRef {
                site: RefSite::Payload {
                    offset: code_len + new_start + rel,
                },
                reference: r,
            });
        }
        data.extend_from_slice(&db.data);
    }

    let size = code_len + data.len() as u32;
    if size == 0 {
        bail!("description '{}' lowered to zero bytes", description.name);
    }
    let block = graph.add_block(description.block_type, size, &description.name);
    {
        let b = graph.block_mut(block).unwrap();
        let mut payload = code;
        payload.extend_from_slice(&data);
        b.set_data(payload);
        b.set_alignment(description.alignment);
        b.set_attributes(description.attributes | BlockAttributes::TOOL_BUILT);
        if let Some(section) = subgraph.section {
            b.set_section(section);
        }
    }

    Ok(BuiltDescription {
        block,
        code_len,
        stream_offsets,
        stream_lengths,
        pending,
        insn_map,
        leader_map,
        data_map,
    })
}

fn push_branch(
    instrs: &mut Vec<Instruction>,
    pending: &mut Vec<PendingRef>,
    mut branch: Instruction,
    disp_size: u8,
    target: &SuccessorTarget,
    synth_ip: &mut u64,
    leader_tag: Option<u32>,
) {
    let ip = match leader_tag {
        Some(tag) => tag as u64,
        None => {
            *synth_ip += 0x10;
            *synth_ip
        }
    };
    branch.set_ip(ip);
    match *target {
        SuccessorTarget::Local(t) => {
            branch.set_near_branch64(t as u64);
        }
        SuccessorTarget::External { block, offset } => {
            // Keep the displacement tiny so the encoder never widens the
            // form; the writer patches the real value through the graph
            // reference.
            branch.set_near_branch64(ip + branch.len() as u64);
            pending.push(PendingRef {
                site: RefSite::Instruction {
                    stream_index: instrs.len(),
                    from_end: disp_size as u32,
                },
                reference: Reference::new(ReferenceType::PcRelative, disp_size, block, offset),
            });
        }
    }
    instrs.push(branch);
}

#[cfg(test)]
mod tests {
    use super::super::decompose;
    use super::*;
    use crate::block_graph::BlockType;

    fn code_block(graph: &mut BlockGraph, bytes: &[u8]) -> BlockId {
        let section = graph.add_section(".text", 0x6000_0020);
        let id = graph.add_block(BlockType::Code, bytes.len() as u32, "f");
        let b = graph.block_mut(id).unwrap();
        b.set_data(bytes.to_vec());
        b.set_section(section);
        id
    }

    #[test]
    fn rebuild_is_byte_identical() {
        // push ebp; mov ebp,esp; xor eax,eax; test eax,eax; jz +2;
        // inc eax; pop ebp; ret
        let bytes = [
            0x55, 0x8b, 0xec, 0x33, 0xc0, 0x85, 0xc0, 0x74, 0x01, 0x40, 0x5d, 0xc3,
        ];
        let mut g = BlockGraph::new();
        let id = code_block(&mut g, &bytes);

        let subgraph = decompose(&g, id).unwrap();
        assert!(subgraph.code_block_count() >= 3);
        let built = build(&mut g, &subgraph).unwrap();
        assert_eq!(built.len(), 1);
        assert_eq!(g.block(built[0]).unwrap().data(), &bytes);
        g.check_consistency().unwrap();
    }

    #[test]
    fn external_referrers_are_rewired() {
        let bytes = [0x33, 0xc0, 0xc3]; // xor eax,eax; ret
        let mut g = BlockGraph::new();
        let id = code_block(&mut g, &bytes);

        let caller = g.add_block(BlockType::Code, 0x10, "caller");
        g.block_mut(caller).unwrap().set_data(vec![0x90; 0x10]);
        g.set_reference(caller, 1, Reference::new(ReferenceType::PcRelative, 4, id, 0))
            .unwrap();

        let subgraph = decompose(&g, id).unwrap();
        let built = build(&mut g, &subgraph).unwrap();
        let r = g.block(caller).unwrap().reference_at(1).copied().unwrap();
        assert_eq!(r.target, built[0]);
        assert_eq!(r.target_offset, 0);
        assert!(g.block(id).is_none());
        g.check_consistency().unwrap();
    }

    #[test]
    fn jump_table_data_survives_after_code() {
        // jmp [table]; table of two entries. The indirect jump keeps its
        // absolute reference into the table.
        let mut bytes = vec![0xff, 0x25, 0, 0, 0, 0, 0xc3];
        let table_off = bytes.len() as u32;
        bytes.extend_from_slice(&[0x11, 0x11, 0x11, 0x11, 0x22, 0x22, 0x22, 0x22]);

        let mut g = BlockGraph::new();
        let id = code_block(&mut g, &bytes);
        {
            let b = g.block_mut(id).unwrap();
            b.set_label(table_off, "jt", crate::block_graph::LabelAttributes::DATA | crate::block_graph::LabelAttributes::JUMP_TABLE);
        }
        g.set_reference(id, 2, Reference::new(ReferenceType::Absolute, 4, id, table_off))
            .unwrap();

        let subgraph = decompose(&g, id).unwrap();
        let built = build(&mut g, &subgraph).unwrap();
        let b = g.block(built[0]).unwrap();
        assert_eq!(b.data(), &bytes[..]);
        let r = b.reference_at(2).copied().unwrap();
        assert_eq!(r.target, built[0]);
        assert_eq!(r.target_offset, table_off);
        g.check_consistency().unwrap();
    }
}
