//! Graph transforms.
//!
//! A [`Transform`] mutates the block graph between parse and layout. Every
//! transform consults the [`TransformPolicy`] before touching a block and
//! honors the optional [`RangeFilter`] of off-limits original addresses.

pub mod chain;
pub mod inline;
pub mod instrument;
pub mod peephole;
pub mod reorder;
pub mod shuffle;

pub use chain::ChainTransform;
pub use inline::InlineTransform;
pub use instrument::{InstrumentTransform, DEFAULT_AGENT_DLL};
pub use peephole::PeepholeTransform;
pub use reorder::ReorderTransform;
pub use shuffle::ShuffleTransform;

use anyhow::Result;

use crate::address::{AddressRange, RelativeAddress};
use crate::block_graph::{Block, BlockAttributes, BlockGraph, BlockType, Reference, ReferenceType};

pub trait Transform {
    fn name(&self) -> &'static str;

    fn transform(&mut self, graph: &mut BlockGraph, context: &TransformContext) -> Result<()>;
}

/// Policy shared by the pipeline and the filter, threaded through every
/// transform invocation.
pub struct TransformContext {
    pub policy: Box<dyn TransformPolicy>,
    pub filter: Option<RangeFilter>,
}

impl Default for TransformContext {
    fn default() -> Self {
        Self {
            policy: Box::new(DefaultPolicy),
            filter: None,
        }
    }
}

impl TransformContext {
    /// Whether `block` may be decomposed and rewritten at all: the policy
    /// must agree and the block must lie outside every filtered range.
    pub fn block_is_rewritable(&self, block: &Block) -> bool {
        if !self.policy.safe_to_decompose(block) {
            return false;
        }
        match (&self.filter, block.original_address()) {
            (Some(filter), Some(addr)) => !filter.is_filtered(addr, block.size()),
            (Some(_), None) => true, // synthesized blocks carry no address
            (None, _) => true,
        }
    }
}

/// Answers the two questions every transform must ask before rewriting.
pub trait TransformPolicy {
    /// Is this block safe to basic-block-decompose?
    fn safe_to_decompose(&self, block: &Block) -> bool;

    /// Does this reference genuinely have call semantics, i.e. a return
    /// address on top of the stack at entry, so it may be redirected
    /// through a thunk?
    fn reference_is_safe_to_redirect(&self, referrer: &Block, reference: &Reference) -> bool;
}

/// The stock policy: rewrite well-formed parsed or rebuilt code, redirect
/// 4-byte code-to-code edges.
pub struct DefaultPolicy;

impl TransformPolicy for DefaultPolicy {
    fn safe_to_decompose(&self, block: &Block) -> bool {
        if !matches!(block.block_type(), BlockType::Code | BlockType::BasicCode) {
            return false;
        }
        let attrs = block.attributes();
        if attrs.contains(BlockAttributes::GAP)
            || attrs.contains(BlockAttributes::ORPHANED)
            || attrs.contains(BlockAttributes::PADDING)
            || attrs.contains(BlockAttributes::HAS_EXCEPTION_HANDLING)
        {
            return false;
        }
        block.data().len() == block.size() as usize && block.size() > 0
    }

    fn reference_is_safe_to_redirect(&self, referrer: &Block, reference: &Reference) -> bool {
        matches!(referrer.block_type(), BlockType::Code | BlockType::BasicCode)
            && reference.size == 4
            && matches!(
                reference.kind,
                ReferenceType::PcRelative | ReferenceType::Absolute
            )
    }
}

/// A set of original-address ranges a transform must not touch.
#[derive(Debug, Default, Clone)]
pub struct RangeFilter {
    ranges: Vec<AddressRange<RelativeAddress>>,
}

impl RangeFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&mut self, range: AddressRange<RelativeAddress>) {
        self.ranges.push(range);
    }

    /// True when `[addr, addr+size)` intersects any marked range.
    pub fn is_filtered(&self, addr: RelativeAddress, size: u32) -> bool {
        let probe = match AddressRange::new(addr, size.max(1)) {
            Some(r) => r,
            None => return false,
        };
        self.ranges.iter().any(|r| r.intersects(&probe))
    }
}
