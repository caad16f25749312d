//! Static PE rewriting: an address-space-aware block graph, a decomposing
//! PE parser, layout and writer stages that lower the graph back to a valid
//! image, and the transform pipeline that mutates the graph in between.
//!
//! The flow through this crate is:
//!
//! `PE bytes -> pe::parser -> BlockGraph -> transforms -> pe::layout ->
//! pe::writer -> new PE bytes`

pub mod address;
pub mod address_space;
pub mod basic_block;
pub mod block_graph;
pub mod pdb;
pub mod pe;
pub mod profile;
pub mod transforms;

pub use address::{AbsoluteAddress, AddressRange, FileOffset, RelativeAddress};
pub use address_space::AddressSpace;
pub use block_graph::{Block, BlockGraph, BlockId, BlockType, Reference, ReferenceType};
