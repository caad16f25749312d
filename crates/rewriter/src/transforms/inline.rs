//! Trivial-callee inlining.
//!
//! A call site is replaced by its callee's body when the callee is a
//! single-basic-block, returning function with a bounded instruction
//! count and no stack juggling beyond a matching `ret N`. Trampolines
//! (a lone `jmp target`) are chased one step; a trampoline to itself is
//! left alone.

use anyhow::Result;
use iced_x86::{Code, FlowControl, Instruction, MemoryOperand, Mnemonic, OpKind, Register};
use tracing::debug;

use crate::basic_block::{
    self, BasicBlockSubGraph, CodeInstruction, SuccessorKind, SuccessorTarget,
};
use crate::block_graph::{BlockGraph, BlockId, ReferenceType};

use super::chain::SubGraphTransform;

const MAX_INLINE_INSTRUCTIONS: usize = 8;

#[derive(Default)]
pub struct InlineTransform {
    pub calls_inlined: usize,
}

impl InlineTransform {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SubGraphTransform for InlineTransform {
    fn name(&self) -> &'static str {
        "inliner"
    }

    fn transform(
        &mut self,
        graph: &BlockGraph,
        subgraph: &mut BasicBlockSubGraph,
    ) -> Result<bool> {
        let mut changed = false;
        for bb in subgraph.basic_blocks.iter_mut() {
            let Some(code) = bb.as_code_mut() else { continue };
            let mut i = 0;
            while i < code.instructions.len() {
                let site = &code.instructions[i];
                if let Some(body) = inlinable_body(graph, subgraph.original, site) {
                    debug!(
                        "inlining {} instruction(s) into {} at call site {i}",
                        body.len(),
                        subgraph.original
                    );
                    code.instructions.splice(i..i + 1, body);
                    self.calls_inlined += 1;
                    changed = true;
                    // Re-scan from the spliced position; the body never
                    // contains another call, so this cannot loop.
                }
                i += 1;
            }
        }
        Ok(changed)
    }
}

/// The callee body to splice over a direct call site, or `None` when the
/// site or its callee does not qualify.
fn inlinable_body(
    graph: &BlockGraph,
    caller: BlockId,
    site: &CodeInstruction,
) -> Option<Vec<CodeInstruction>> {
    if site.instruction.flow_control() != FlowControl::Call {
        return None;
    }
    let (_, r) = site.references.first()?;
    if r.kind != ReferenceType::PcRelative || r.target_offset != 0 || r.target == caller {
        return None;
    }
    let callee = resolve_trampoline(graph, r.target)?;
    if callee == caller {
        return None;
    }
    callee_body(graph, callee)
}

/// Follows a lone `jmp target` one step. A trampoline to itself stays as
/// it is.
fn resolve_trampoline(graph: &BlockGraph, id: BlockId) -> Option<BlockId> {
    let subgraph = decompose_quietly(graph, id)?;
    if subgraph.basic_blocks.len() != 1 {
        return Some(id);
    }
    let code = subgraph.basic_blocks[0].as_code()?;
    if !code.instructions.is_empty() {
        return Some(id);
    }
    match code.successor_of_kind(SuccessorKind::Unconditional)?.target {
        SuccessorTarget::External { block, offset: 0 } if block != id => Some(block),
        _ => None,
    }
}

fn callee_body(graph: &BlockGraph, id: BlockId) -> Option<Vec<CodeInstruction>> {
    let subgraph = decompose_quietly(graph, id)?;
    if subgraph.basic_blocks.len() != 1 {
        return None;
    }
    let code = subgraph.basic_blocks[0].as_code()?;
    if !code.successors.is_empty()
        || code.instructions.is_empty()
        || code.instructions.len() > MAX_INLINE_INSTRUCTIONS + 1
    {
        return None;
    }
    let (ret, body) = code.instructions.split_last()?;
    if ret.instruction.flow_control() != FlowControl::Return
        || ret.instruction.mnemonic() != Mnemonic::Ret
    {
        return None;
    }
    if body.iter().any(touches_stack) {
        return None;
    }

    let mut out: Vec<CodeInstruction> = body
        .iter()
        .map(|ci| CodeInstruction {
            // Offsets belong to the callee's address space; spliced copies
            // are synthesized as far as the builder is concerned.
            offset: None,
            instruction: ci.instruction,
            references: ci.references.clone(),
        })
        .collect();

    // `ret` vanishes with the call; `ret N` still owes the caller its
    // argument cleanup.
    if ret.instruction.op_count() == 1 {
        let n = ret.instruction.immediate16() as i64;
        let lea = Instruction::with2(
            Code::Lea_r32_m,
            Register::ESP,
            MemoryOperand::with_base_displ(Register::ESP, n),
        )
        .ok()?;
        out.push(CodeInstruction::new(lea));
    }
    Some(out)
}

fn decompose_quietly(graph: &BlockGraph, id: BlockId) -> Option<BasicBlockSubGraph> {
    let block = graph.block(id)?;
    if block.attributes().contains(crate::block_graph::BlockAttributes::HAS_EXCEPTION_HANDLING) {
        return None;
    }
    basic_block::decompose(graph, id).ok()
}

fn touches_stack(ci: &CodeInstruction) -> bool {
    let insn = &ci.instruction;
    if matches!(
        insn.mnemonic(),
        Mnemonic::Push | Mnemonic::Pop | Mnemonic::Enter | Mnemonic::Leave | Mnemonic::Call
    ) {
        return true;
    }
    for i in 0..insn.op_count() {
        match insn.op_kind(i) {
            OpKind::Register if insn.op_register(i) == Register::ESP => return true,
            OpKind::Memory if insn.memory_base() == Register::ESP => return true,
            _ => {}
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic_block::{build, decompose};
    use crate::block_graph::{BlockGraph, BlockType, Reference};

    fn add_code(g: &mut BlockGraph, section: u32, name: &str, bytes: &[u8]) -> BlockId {
        let id = g.add_block(BlockType::Code, bytes.len() as u32, name);
        let b = g.block_mut(id).unwrap();
        b.set_data(bytes.to_vec());
        b.set_section(section);
        id
    }

    #[test]
    fn trivial_callee_is_inlined() {
        let mut g = BlockGraph::new();
        let section = g.add_section(".text", 0x6000_0020);
        // mov eax, 0x2a; ret
        let callee = add_code(&mut g, section, "callee", &[0xb8, 0x2a, 0, 0, 0, 0xc3]);
        // call callee; ret
        let caller = add_code(&mut g, section, "caller", &[0xe8, 0, 0, 0, 0, 0xc3]);
        g.set_reference(caller, 1, Reference::new(ReferenceType::PcRelative, 4, callee, 0))
            .unwrap();

        let mut subgraph = decompose(&g, caller).unwrap();
        let mut t = InlineTransform::new();
        assert!(t.transform(&g, &mut subgraph).unwrap());
        let built = build(&mut g, &subgraph).unwrap();

        let rebuilt = g.block(built[0]).unwrap();
        assert_eq!(rebuilt.data(), &[0xb8, 0x2a, 0, 0, 0, 0xc3]);
        assert!(rebuilt.references().next().is_none());
        assert_eq!(t.calls_inlined, 1);
    }

    #[test]
    fn ret_n_becomes_stack_cleanup() {
        let mut g = BlockGraph::new();
        let section = g.add_section(".text", 0x6000_0020);
        // mov eax, 0x2a; ret 8
        let callee = add_code(&mut g, section, "callee", &[0xb8, 0x2a, 0, 0, 0, 0xc2, 0x08, 0]);
        let caller = add_code(&mut g, section, "caller", &[0xe8, 0, 0, 0, 0, 0xc3]);
        g.set_reference(caller, 1, Reference::new(ReferenceType::PcRelative, 4, callee, 0))
            .unwrap();

        let mut subgraph = decompose(&g, caller).unwrap();
        assert!(InlineTransform::new().transform(&g, &mut subgraph).unwrap());
        let built = build(&mut g, &subgraph).unwrap();
        // mov eax,0x2a; lea esp,[esp+8]; ret
        assert_eq!(
            g.block(built[0]).unwrap().data(),
            &[0xb8, 0x2a, 0, 0, 0, 0x8d, 0x64, 0x24, 0x08, 0xc3]
        );
    }

    #[test]
    fn trampoline_is_chased_one_step() {
        let mut g = BlockGraph::new();
        let section = g.add_section(".text", 0x6000_0020);
        let real = add_code(&mut g, section, "real", &[0x33, 0xc0, 0xc3]);
        let tramp = add_code(&mut g, section, "tramp", &[0xe9, 0, 0, 0, 0]);
        g.set_reference(tramp, 1, Reference::new(ReferenceType::PcRelative, 4, real, 0))
            .unwrap();
        let caller = add_code(&mut g, section, "caller", &[0xe8, 0, 0, 0, 0, 0xc3]);
        g.set_reference(caller, 1, Reference::new(ReferenceType::PcRelative, 4, tramp, 0))
            .unwrap();

        let mut subgraph = decompose(&g, caller).unwrap();
        assert!(InlineTransform::new().transform(&g, &mut subgraph).unwrap());
        let built = build(&mut g, &subgraph).unwrap();
        assert_eq!(g.block(built[0]).unwrap().data(), &[0x33, 0xc0, 0xc3]);
    }

    #[test]
    fn large_callee_is_left_alone() {
        let mut g = BlockGraph::new();
        let section = g.add_section(".text", 0x6000_0020);
        // Nine movs and a ret: one over the limit.
        let mut bytes = Vec::new();
        for i in 0..9u8 {
            bytes.extend_from_slice(&[0xb8, i, 0, 0, 0]);
        }
        bytes.push(0xc3);
        let callee = add_code(&mut g, section, "callee", &bytes);
        let caller = add_code(&mut g, section, "caller", &[0xe8, 0, 0, 0, 0, 0xc3]);
        g.set_reference(caller, 1, Reference::new(ReferenceType::PcRelative, 4, callee, 0))
            .unwrap();

        let mut subgraph = decompose(&g, caller).unwrap();
        assert!(!InlineTransform::new().transform(&g, &mut subgraph).unwrap());
    }
}
