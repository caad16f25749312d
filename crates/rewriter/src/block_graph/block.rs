use std::collections::{BTreeMap, BTreeSet};

use crate::address::RelativeAddress;
use crate::block_graph::{BlockId, BlockType, Reference, Referrer};

/// Attribute bitset carried by every block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockAttributes(pub u16);

impl BlockAttributes {
    /// Control never falls out of the end of this block.
    pub const NON_RETURNING: Self = Self(1 << 0);
    /// Bytes between recognized structures; discovered, not declared.
    pub const GAP: Self = Self(1 << 1);
    /// Produced directly by the PE parser.
    pub const PE_PARSED: Self = Self(1 << 2);
    /// Contributes bytes to a section on disk.
    pub const SECTION_CONTRIB: Self = Self(1 << 3);
    /// Inter-structure padding.
    pub const PADDING: Self = Self(1 << 4);
    /// Reachable only through absolute references.
    pub const ORPHANED: Self = Self(1 << 5);
    /// Synthesized by this toolchain rather than parsed from the input.
    pub const TOOL_BUILT: Self = Self(1 << 6);
    /// Carries SEH state; most transforms must leave it alone.
    pub const HAS_EXCEPTION_HANDLING: Self = Self(1 << 7);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn set(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn clear(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for BlockAttributes {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Attributes on a label: what the offset means to the disassembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LabelAttributes(pub u8);

impl LabelAttributes {
    pub const CODE: Self = Self(1 << 0);
    pub const DATA: Self = Self(1 << 1);
    pub const JUMP_TABLE: Self = Self(1 << 2);
    pub const CASE_TABLE: Self = Self(1 << 3);
    pub const CALL_TARGET: Self = Self(1 << 4);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for LabelAttributes {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A named, attributed offset inside a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
    pub name: String,
    pub attributes: LabelAttributes,
}

/// The unit of relocation.
///
/// `size` is the virtual footprint; the owned `data` may be shorter, in
/// which case the loader zero-fills the tail. The `references` map holds
/// outgoing edges keyed by source offset; `referrers` is the reverse index
/// maintained by [`crate::BlockGraph`], never mutated directly.
#[derive(Debug, Clone)]
pub struct Block {
    pub(crate) id: BlockId,
    pub(crate) block_type: BlockType,
    pub(crate) size: u32,
    pub(crate) data: Vec<u8>,
    pub(crate) alignment: u32,
    pub(crate) name: String,
    pub(crate) section: Option<u32>,
    pub(crate) attributes: BlockAttributes,
    pub(crate) original_address: Option<RelativeAddress>,
    pub(crate) references: BTreeMap<u32, Reference>,
    pub(crate) referrers: BTreeSet<Referrer>,
    pub(crate) labels: BTreeMap<u32, Label>,
}

impl Block {
    pub(crate) fn new(id: BlockId, block_type: BlockType, size: u32, name: String) -> Self {
        debug_assert!(size > 0);
        Self {
            id,
            block_type,
            size,
            data: Vec::new(),
            alignment: 1,
            name,
            section: None,
            attributes: BlockAttributes::default(),
            original_address: None,
            references: BTreeMap::new(),
            referrers: BTreeSet::new(),
            labels: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn block_type(&self) -> BlockType {
        self.block_type
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Replaces the owned bytes. `data.len()` must not exceed `size`.
    pub fn set_data(&mut self, data: Vec<u8>) {
        debug_assert!(data.len() as u64 <= self.size as u64);
        self.data = data;
    }

    /// Grows or shrinks the virtual size. Shrinking below the data length
    /// or below an existing reference/label offset is a caller bug.
    pub fn set_size(&mut self, size: u32) {
        debug_assert!(size as usize >= self.data.len());
        debug_assert!(self.references.keys().all(|&o| o < size));
        debug_assert!(self.labels.keys().all(|&o| o <= size));
        self.size = size;
    }

    pub fn alignment(&self) -> u32 {
        self.alignment
    }

    pub fn set_alignment(&mut self, alignment: u32) {
        debug_assert!(alignment.is_power_of_two());
        self.alignment = alignment;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn section(&self) -> Option<u32> {
        self.section
    }

    pub fn set_section(&mut self, section: u32) {
        self.section = Some(section);
    }

    pub fn attributes(&self) -> BlockAttributes {
        self.attributes
    }

    pub fn set_attributes(&mut self, attributes: BlockAttributes) {
        self.attributes.set(attributes);
    }

    pub fn original_address(&self) -> Option<RelativeAddress> {
        self.original_address
    }

    pub fn set_original_address(&mut self, addr: RelativeAddress) {
        self.original_address = Some(addr);
    }

    pub fn references(&self) -> impl Iterator<Item = (u32, &Reference)> {
        self.references.iter().map(|(&o, r)| (o, r))
    }

    pub fn reference_at(&self, offset: u32) -> Option<&Reference> {
        self.references.get(&offset)
    }

    pub fn referrers(&self) -> impl Iterator<Item = &Referrer> {
        self.referrers.iter()
    }

    pub fn has_referrers(&self) -> bool {
        !self.referrers.is_empty()
    }

    pub fn labels(&self) -> impl Iterator<Item = (u32, &Label)> {
        self.labels.iter().map(|(&o, l)| (o, l))
    }

    pub fn label_at(&self, offset: u32) -> Option<&Label> {
        self.labels.get(&offset)
    }

    /// Sets a label. Offsets may lie anywhere in `[0, size]`; the end offset
    /// is legal and marks the byte just past the block.
    pub fn set_label(
        &mut self,
        offset: u32,
        name: impl Into<String>,
        attributes: LabelAttributes,
    ) -> bool {
        if offset > self.size {
            return false;
        }
        self.labels.insert(
            offset,
            Label {
                name: name.into(),
                attributes,
            },
        );
        true
    }

    pub fn remove_label(&mut self, offset: u32) -> Option<Label> {
        self.labels.remove(&offset)
    }

    /// Reads `len` bytes at `offset` from the owned data, treating the
    /// implicit zero tail as readable.
    pub fn read_bytes(&self, offset: u32, len: usize) -> Option<Vec<u8>> {
        let end = offset.checked_add(len as u32)?;
        if end > self.size {
            return None;
        }
        let mut out = vec![0u8; len];
        let data_len = self.data.len() as u32;
        if offset < data_len {
            let copy_end = end.min(data_len);
            let n = (copy_end - offset) as usize;
            out[..n].copy_from_slice(&self.data[offset as usize..copy_end as usize]);
        }
        Some(out)
    }
}
