//! PE decomposition and re-synthesis.
//!
//! [`parser`] carves an in-memory image into a [`crate::BlockGraph`];
//! [`layout`] assigns final addresses; [`writer`] lowers the laid-out graph
//! back to bytes, regenerating `.reloc` from the graph's absolute
//! references on the way ([`relocs`]).

pub mod layout;
pub mod parser;
pub mod relocs;
pub mod view;
pub mod writer;

pub use layout::ImageLayout;
pub use parser::{ExportInfo, ParsedImage, PeParser};

use crate::block_graph::BlockId;

pub const DOS_HEADER_SIZE: u32 = 0x40;
pub const SECTION_HEADER_SIZE: u32 = 0x28;
pub const OPTIONAL_HEADER_SIZE_PE32: u16 = 0xe0;
pub const NUM_DATA_DIRECTORIES: usize = 16;

pub const IMAGE_FILE_MACHINE_I386: u16 = 0x014c;
pub const IMAGE_NT_OPTIONAL_HDR32_MAGIC: u16 = 0x010b;

pub const IMAGE_SCN_CNT_CODE: u32 = 0x0000_0020;
pub const IMAGE_SCN_CNT_INITIALIZED_DATA: u32 = 0x0000_0040;
pub const IMAGE_SCN_CNT_UNINITIALIZED_DATA: u32 = 0x0000_0080;
pub const IMAGE_SCN_MEM_DISCARDABLE: u32 = 0x0200_0000;
pub const IMAGE_SCN_MEM_EXECUTE: u32 = 0x2000_0000;
pub const IMAGE_SCN_MEM_READ: u32 = 0x4000_0000;
pub const IMAGE_SCN_MEM_WRITE: u32 = 0x8000_0000;

pub const IMAGE_DLLCHARACTERISTICS_DYNAMIC_BASE: u16 = 0x0040;
pub const IMAGE_DLLCHARACTERISTICS_NX_COMPAT: u16 = 0x0100;

pub const DIR_EXPORT: usize = 0;
pub const DIR_IMPORT: usize = 1;
pub const DIR_RESOURCE: usize = 2;
pub const DIR_EXCEPTION: usize = 3;
pub const DIR_SECURITY: usize = 4;
pub const DIR_BASERELOC: usize = 5;
pub const DIR_DEBUG: usize = 6;
pub const DIR_ARCHITECTURE: usize = 7;
pub const DIR_GLOBALPTR: usize = 8;
pub const DIR_TLS: usize = 9;
pub const DIR_LOAD_CONFIG: usize = 10;
pub const DIR_BOUND_IMPORT: usize = 11;
pub const DIR_IAT: usize = 12;
pub const DIR_DELAY_IMPORT: usize = 13;
pub const DIR_COM_DESCRIPTOR: usize = 14;

pub const DEFAULT_IMAGE_BASE: u32 = 0x1000_0000;
pub const DEFAULT_SECTION_ALIGNMENT: u32 = 0x1000;
pub const DEFAULT_FILE_ALIGNMENT: u32 = 0x200;

/// A graph location: block plus byte offset inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRef {
    pub block: BlockId,
    pub offset: u32,
}

/// One data-directory slot as carried through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub location: BlockRef,
    pub size: u32,
}

/// The optional-header fields the writer needs to reproduce, independent of
/// where any block ends up.
#[derive(Debug, Clone)]
pub struct HeaderInfo {
    pub machine: u16,
    pub characteristics: u16,
    pub image_base: u32,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub subsystem: u16,
    pub dll_characteristics: u16,
    pub size_of_headers: u32,
    pub size_of_stack_reserve: u32,
    pub size_of_stack_commit: u32,
    pub size_of_heap_reserve: u32,
    pub size_of_heap_commit: u32,
    pub major_os_version: u16,
    pub minor_os_version: u16,
    pub major_subsystem_version: u16,
    pub minor_subsystem_version: u16,
    pub entry_point: Option<BlockRef>,
    pub data_directories: [Option<DirectoryEntry>; NUM_DATA_DIRECTORIES],
}

impl Default for HeaderInfo {
    fn default() -> Self {
        Self {
            machine: IMAGE_FILE_MACHINE_I386,
            characteristics: 0x2102, // EXECUTABLE | 32BIT | DLL
            image_base: DEFAULT_IMAGE_BASE,
            section_alignment: DEFAULT_SECTION_ALIGNMENT,
            file_alignment: DEFAULT_FILE_ALIGNMENT,
            subsystem: 2, // WINDOWS_GUI
            dll_characteristics: IMAGE_DLLCHARACTERISTICS_DYNAMIC_BASE
                | IMAGE_DLLCHARACTERISTICS_NX_COMPAT,
            size_of_headers: 0x400,
            size_of_stack_reserve: 0x10_0000,
            size_of_stack_commit: 0x1000,
            size_of_heap_reserve: 0x10_0000,
            size_of_heap_commit: 0x1000,
            major_os_version: 5,
            minor_os_version: 1,
            major_subsystem_version: 5,
            minor_subsystem_version: 1,
            entry_point: None,
            data_directories: [None; NUM_DATA_DIRECTORIES],
        }
    }
}
