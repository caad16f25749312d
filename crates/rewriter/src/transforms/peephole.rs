//! Peephole rewrites over decomposed blocks.
//!
//! Three rules run to a fixed point per basic block: empty prolog/epilog
//! elision, identity-move removal, and dead-store elimination over a
//! register liveness scan that treats every call as clobbering all 32-bit
//! general-purpose registers. Blocks that juggle the stack pointer or use
//! 8-bit subregisters are left alone by the liveness rule; partial-register
//! aliasing is not worth modeling there.

use anyhow::Result;
use iced_x86::{
    FlowControl, Instruction, InstructionInfoFactory, Mnemonic, OpAccess, OpKind, Register,
};
use tracing::debug;

use crate::basic_block::{BasicBlockSubGraph, BasicCodeBlock};
use crate::block_graph::BlockGraph;

use super::chain::SubGraphTransform;

#[derive(Default)]
pub struct PeepholeTransform {
    pub instructions_removed: usize,
}

impl PeepholeTransform {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SubGraphTransform for PeepholeTransform {
    fn name(&self) -> &'static str {
        "peephole"
    }

    fn transform(
        &mut self,
        _graph: &BlockGraph,
        subgraph: &mut BasicBlockSubGraph,
    ) -> Result<bool> {
        let mut removed = 0;
        for bb in subgraph.basic_blocks.iter_mut() {
            let Some(code) = bb.as_code_mut() else { continue };
            loop {
                let pass = elide_empty_frame(code)
                    + remove_identity_moves(code)
                    + remove_dead_stores(code);
                removed += pass;
                if pass == 0 {
                    break;
                }
            }
        }
        if removed > 0 {
            debug!("peephole removed {removed} instruction(s) from {}", subgraph.original);
            self.instructions_removed += removed;
        }
        Ok(removed > 0)
    }
}

fn is_push_of(insn: &Instruction, reg: Register) -> bool {
    insn.mnemonic() == Mnemonic::Push
        && insn.op0_kind() == OpKind::Register
        && insn.op0_register() == reg
}

fn is_pop_of(insn: &Instruction, reg: Register) -> bool {
    insn.mnemonic() == Mnemonic::Pop
        && insn.op0_kind() == OpKind::Register
        && insn.op0_register() == reg
}

fn is_reg_to_reg_mov(insn: &Instruction, dst: Register, src: Register) -> bool {
    insn.mnemonic() == Mnemonic::Mov
        && insn.op0_kind() == OpKind::Register
        && insn.op1_kind() == OpKind::Register
        && insn.op0_register() == dst
        && insn.op1_register() == src
}

/// `push ebp; mov ebp,esp; pop ebp` with nothing in between is a frame
/// that frames nothing.
fn elide_empty_frame(code: &mut BasicCodeBlock) -> usize {
    let insns = &code.instructions;
    let mut kill: Option<usize> = None;
    for i in 0..insns.len().saturating_sub(2) {
        if is_push_of(&insns[i].instruction, Register::EBP)
            && is_reg_to_reg_mov(&insns[i + 1].instruction, Register::EBP, Register::ESP)
            && is_pop_of(&insns[i + 2].instruction, Register::EBP)
        {
            kill = Some(i);
            break;
        }
    }
    match kill {
        Some(i) => {
            code.instructions.drain(i..i + 3);
            3
        }
        None => 0,
    }
}

fn remove_identity_moves(code: &mut BasicCodeBlock) -> usize {
    let before = code.instructions.len();
    code.instructions.retain(|ci| {
        let insn = &ci.instruction;
        !(insn.mnemonic() == Mnemonic::Mov
            && insn.op0_kind() == OpKind::Register
            && insn.op1_kind() == OpKind::Register
            && insn.op0_register() == insn.op1_register())
    });
    before - code.instructions.len()
}

/// A `mov r32, ...` whose destination is overwritten before any read, with
/// calls counting as an overwrite of every GPR. Conservative at the block
/// end: everything is live there.
fn remove_dead_stores(code: &mut BasicCodeBlock) -> usize {
    if !liveness_applies(code) {
        return 0;
    }
    let mut factory = InstructionInfoFactory::new();
    let mut kill: Option<usize> = None;
    'outer: for i in 0..code.instructions.len() {
        let insn = &code.instructions[i].instruction;
        if !is_removable_store(insn) {
            continue;
        }
        let dst = insn.op0_register();
        for follower in &code.instructions[i + 1..] {
            let f = &follower.instruction;
            if f.flow_control() == FlowControl::Call {
                kill = Some(i);
                break 'outer;
            }
            let mut read = false;
            let mut overwritten = false;
            for ur in factory.info(f).used_registers() {
                if ur.register().full_register32() != dst {
                    continue;
                }
                match ur.access() {
                    OpAccess::Read | OpAccess::ReadWrite | OpAccess::CondRead
                    | OpAccess::ReadCondWrite => read = true,
                    OpAccess::Write if ur.register() == dst => overwritten = true,
                    _ => {}
                }
            }
            if read {
                break;
            }
            if overwritten {
                kill = Some(i);
                break 'outer;
            }
        }
    }
    match kill {
        Some(i) => {
            code.instructions.remove(i);
            1
        }
        None => 0,
    }
}

fn is_removable_store(insn: &Instruction) -> bool {
    if insn.mnemonic() != Mnemonic::Mov || insn.op0_kind() != OpKind::Register {
        return false;
    }
    let dst = insn.op0_register();
    if dst.size() != 4 || dst == Register::ESP || dst == Register::EBP {
        return false;
    }
    // Memory sources may fault; only registers and immediates are safe to
    // drop.
    matches!(
        insn.op1_kind(),
        OpKind::Register | OpKind::Immediate32 | OpKind::Immediate8to32
    )
}

fn liveness_applies(code: &BasicCodeBlock) -> bool {
    code.instructions.iter().all(|ci| {
        let insn = &ci.instruction;
        if matches!(
            insn.mnemonic(),
            Mnemonic::Push | Mnemonic::Pop | Mnemonic::Enter | Mnemonic::Leave
        ) {
            return false;
        }
        for i in 0..insn.op_count() {
            if insn.op_kind(i) == OpKind::Register {
                let reg = insn.op_register(i);
                if reg == Register::ESP || reg.size() == 1 {
                    return false;
                }
            }
        }
        true
    })
}
