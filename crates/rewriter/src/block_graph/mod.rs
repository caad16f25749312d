//! The block graph: the unit-of-relocation intermediate representation.
//!
//! A [`Block`] is a contiguous byte run with typed outgoing [`Reference`]s;
//! the graph owns every block by id and keeps the reverse referrer index
//! consistent with the forward references at all times. Transforms mutate
//! the graph through its API only, never through raw pointers, which is what
//! makes splitting, merging and cloning blocks safe under aliasing.

mod block;
mod graph;
mod serialize;

pub use block::{Block, BlockAttributes, Label, LabelAttributes};
pub use graph::{BlockGraph, Section, SectionId};

use crate::address::RelativeAddress;

/// Stable, process-local handle for a block. Never reused within one graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub u32);

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "B{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockType {
    Code,
    Data,
    ReadOnlyData,
    /// Straight-line code produced by basic-block decomposition.
    BasicCode,
    /// Opaque data (jump tables and the like) inside a decomposed block.
    BasicData,
}

impl BlockType {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            BlockType::Code => 0,
            BlockType::Data => 1,
            BlockType::ReadOnlyData => 2,
            BlockType::BasicCode => 3,
            BlockType::BasicData => 4,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => BlockType::Code,
            1 => BlockType::Data,
            2 => BlockType::ReadOnlyData,
            3 => BlockType::BasicCode,
            4 => BlockType::BasicData,
            _ => return None,
        })
    }
}

/// How the writer encodes a reference at its source offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceType {
    /// `target - (source + size)`; the usual call/jmp displacement.
    PcRelative,
    /// `image_base + target`; participates in `.reloc` generation.
    Absolute,
    /// The bare RVA of the target.
    Relative,
    /// The file offset of the target per the section table.
    FileOffset,
}

impl ReferenceType {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            ReferenceType::PcRelative => 0,
            ReferenceType::Absolute => 1,
            ReferenceType::Relative => 2,
            ReferenceType::FileOffset => 3,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => ReferenceType::PcRelative,
            1 => ReferenceType::Absolute,
            2 => ReferenceType::Relative,
            3 => ReferenceType::FileOffset,
            _ => return None,
        })
    }
}

/// A typed, sized edge to `(block, offset)`.
///
/// The size constrains the reachable displacement: a 1-byte pc-relative
/// reference cannot survive arbitrary relayout, and the writer refuses to
/// encode any displacement that does not fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reference {
    pub kind: ReferenceType,
    pub size: u8,
    pub target: BlockId,
    pub target_offset: u32,
}

impl Reference {
    pub fn new(kind: ReferenceType, size: u8, target: BlockId, target_offset: u32) -> Self {
        debug_assert!(matches!(size, 1 | 2 | 4));
        Self {
            kind,
            size,
            target,
            target_offset,
        }
    }

    /// Whether the encoded value fits `size` bytes.
    pub fn displacement_fits(&self, value: i64) -> bool {
        match self.size {
            1 => i8::try_from(value).is_ok(),
            2 => i16::try_from(value).is_ok(),
            4 => i32::try_from(value).is_ok() || u32::try_from(value).is_ok(),
            _ => false,
        }
    }
}

/// Identifies one end of a reference: a block plus a byte offset inside it.
pub type Referrer = (BlockId, u32);

/// Convenience alias used by the parser when it records pending targets.
pub type Target = (RelativeAddress, u32);
