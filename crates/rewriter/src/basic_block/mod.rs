//! Basic-block decomposition of code blocks.
//!
//! [`decompose`] lifts one code block into a [`BasicBlockSubGraph`]:
//! straight-line instruction runs with typed successors, plus opaque data
//! runs (jump tables). Transforms mutate the subgraph; [`build`] lowers it
//! back into fresh graph blocks and rewires every referrer of the original.

mod build;
mod decompose;

pub use build::build;
pub use decompose::decompose;

use std::collections::BTreeMap;

use iced_x86::Instruction;

use crate::block_graph::{
    BlockAttributes, BlockId, BlockType, Label, Reference, SectionId,
};

/// How control reaches a successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuccessorKind {
    /// Taken edge of a conditional branch.
    Conditional,
    /// Not-taken edge of a conditional branch, or plain straight-line flow.
    Fallthrough,
    /// An explicit `jmp`.
    Unconditional,
}

/// Where a successor edge lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuccessorTarget {
    /// An offset inside the decomposed block, resolved against basic-block
    /// leaders at build time.
    Local(u32),
    /// A location in some other graph block.
    External { block: BlockId, offset: u32 },
}

#[derive(Debug, Clone)]
pub struct Successor {
    pub kind: SuccessorKind,
    pub target: SuccessorTarget,
    /// The branch instruction this edge came from. Fallthroughs have none;
    /// the builder synthesizes a `jmp` when the layout demands one.
    pub instruction: Option<Instruction>,
    /// Arc count from the sub-graph profile; zero when unprofiled.
    pub count: u64,
}

/// One decoded instruction plus the graph references its bytes carry.
/// Reference offsets are relative to the instruction start so they survive
/// re-encoding at a new position.
#[derive(Debug, Clone)]
pub struct CodeInstruction {
    /// Offset in the original block; `None` for synthesized instructions.
    pub offset: Option<u32>,
    pub instruction: Instruction,
    pub references: Vec<(u32, Reference)>,
}

impl CodeInstruction {
    pub fn new(instruction: Instruction) -> Self {
        Self {
            offset: None,
            instruction,
            references: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BasicCodeBlock {
    /// Leader offset in the original block.
    pub offset: u32,
    pub instructions: Vec<CodeInstruction>,
    pub successors: Vec<Successor>,
}

impl BasicCodeBlock {
    /// Sum of current instruction encodings, branch instructions included.
    pub fn instruction_bytes(&self) -> u32 {
        let body: usize = self.instructions.iter().map(|i| i.instruction.len()).sum();
        let branches: usize = self
            .successors
            .iter()
            .filter_map(|s| s.instruction.as_ref().map(|i| i.len()))
            .sum();
        (body + branches) as u32
    }

    pub fn successor_of_kind(&self, kind: SuccessorKind) -> Option<&Successor> {
        self.successors.iter().find(|s| s.kind == kind)
    }
}

/// An opaque byte run inside a code block, typically a jump table.
#[derive(Debug, Clone)]
pub struct BasicDataBlock {
    pub offset: u32,
    pub data: Vec<u8>,
    pub references: Vec<(u32, Reference)>,
}

#[derive(Debug, Clone)]
pub enum BasicBlock {
    Code(BasicCodeBlock),
    Data(BasicDataBlock),
}

impl BasicBlock {
    pub fn offset(&self) -> u32 {
        match self {
            BasicBlock::Code(b) => b.offset,
            BasicBlock::Data(b) => b.offset,
        }
    }

    pub fn as_code(&self) -> Option<&BasicCodeBlock> {
        match self {
            BasicBlock::Code(b) => Some(b),
            BasicBlock::Data(_) => None,
        }
    }

    pub fn as_code_mut(&mut self) -> Option<&mut BasicCodeBlock> {
        match self {
            BasicBlock::Code(b) => Some(b),
            BasicBlock::Data(_) => None,
        }
    }
}

/// An ordered run of basic blocks that lowers to one fresh graph block.
/// A transform may split one input block into several output blocks by
/// adding descriptions.
#[derive(Debug, Clone)]
pub struct BlockDescription {
    pub name: String,
    pub block_type: BlockType,
    pub alignment: u32,
    pub attributes: BlockAttributes,
    /// Indices into [`BasicBlockSubGraph::basic_blocks`].
    pub basic_blocks: Vec<usize>,
}

/// The decomposition of one code block.
#[derive(Debug, Clone)]
pub struct BasicBlockSubGraph {
    pub original: BlockId,
    pub section: Option<SectionId>,
    pub basic_blocks: Vec<BasicBlock>,
    pub descriptions: Vec<BlockDescription>,
    /// Labels of the original block, keyed by original offset; transplanted
    /// onto the built blocks.
    pub labels: BTreeMap<u32, Label>,
}

impl BasicBlockSubGraph {
    /// Index of the basic block whose leader is `offset`.
    pub fn basic_block_at(&self, offset: u32) -> Option<usize> {
        self.basic_blocks.iter().position(|b| b.offset() == offset)
    }

    pub fn code_block_count(&self) -> usize {
        self.basic_blocks
            .iter()
            .filter(|b| b.as_code().is_some())
            .count()
    }
}
