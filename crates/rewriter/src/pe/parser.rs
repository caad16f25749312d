//! Decomposes a PE image into a block graph.
//!
//! The sweep is two-pass: fixed structures (DOS header, stub, NT headers)
//! are carved top-down first, then each data directory is walked and its
//! leaf structures chunked into their own blocks with typed references.
//! References whose targets have not been chunked yet are queued and
//! resolved after the per-section gap sweep guarantees full coverage.
//! The base-relocation table is consumed into `Absolute` references rather
//! than kept as bytes; the writer regenerates `.reloc` from the graph.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use goblin::pe::PE;
use tracing::{debug, info, warn};

use crate::address::{AddressRange, RelativeAddress, RelativeRange};
use crate::address_space::AddressSpace;
use crate::block_graph::{
    BlockAttributes, BlockGraph, BlockId, BlockType, LabelAttributes, Reference, ReferenceType,
};
use crate::pe::view::{ImageView, SectionRow};
use crate::pe::{
    BlockRef, DirectoryEntry, HeaderInfo, DIR_BASERELOC, DIR_DEBUG, DIR_EXPORT, DIR_IMPORT,
    DOS_HEADER_SIZE, IMAGE_FILE_MACHINE_I386, IMAGE_SCN_CNT_CODE, NUM_DATA_DIRECTORIES,
    SECTION_HEADER_SIZE,
};

/// One export as seen in the export directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportInfo {
    pub ordinal: u16,
    pub name: Option<String>,
    pub rva: Option<RelativeAddress>,
    pub forwarder: Option<String>,
}

/// Blocks produced for the fixed image structures.
#[derive(Debug, Clone)]
pub struct PeHeaderBlocks {
    pub dos_header: BlockId,
    pub dos_stub: Option<BlockId>,
    pub nt_headers: BlockId,
    pub directories: [Option<BlockId>; NUM_DATA_DIRECTORIES],
}

/// GUID + age lifted from the CodeView debug record, if present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugId {
    pub guid: [u8; 16],
    pub age: u32,
}

pub struct ParsedImage {
    pub graph: BlockGraph,
    pub header: PeHeaderBlocks,
    pub header_info: HeaderInfo,
    pub exports: Vec<ExportInfo>,
    pub debug_id: Option<DebugId>,
}

/// A reference discovered before its target range was chunked.
struct PendingReference {
    source: BlockId,
    offset: u32,
    kind: ReferenceType,
    size: u8,
    target_rva: RelativeAddress,
}

pub struct PeParser<'a> {
    view: ImageView<'a>,
    graph: BlockGraph,
    carved: AddressSpace<RelativeAddress, BlockId>,
    /// Graph section per PE section index; `None` for the relocation
    /// section, which is consumed rather than carried through.
    section_ids: Vec<Option<u32>>,
    /// Shared leaf blocks (strings, hint-name entries) by RVA.
    leaves: HashMap<u32, BlockId>,
    pending: Vec<PendingReference>,
    header_info: HeaderInfo,
    dirs: [(u32, u32); NUM_DATA_DIRECTORIES],
}

impl<'a> PeParser<'a> {
    pub fn parse(data: &'a [u8]) -> Result<ParsedImage> {
        let pe = PE::parse(data).context("not a valid PE image")?;
        if pe.is_64 {
            bail!("only 32-bit x86 images are supported");
        }
        if pe.header.coff_header.machine != IMAGE_FILE_MACHINE_I386 {
            bail!(
                "unsupported machine {:#x}, expected i386",
                pe.header.coff_header.machine
            );
        }
        let optional = pe
            .header
            .optional_header
            .context("image has no optional header")?;

        let sections: Vec<SectionRow> = pe
            .sections
            .iter()
            .map(|s| SectionRow {
                name: String::from_utf8_lossy(&s.name)
                    .trim_end_matches('\0')
                    .to_string(),
                virtual_size: s.virtual_size,
                virtual_address: s.virtual_address,
                size_of_raw_data: s.size_of_raw_data,
                pointer_to_raw_data: s.pointer_to_raw_data,
                characteristics: s.characteristics,
            })
            .collect();

        let mut dirs = [(0u32, 0u32); NUM_DATA_DIRECTORIES];
        for (i, slot) in dirs.iter_mut().enumerate() {
            if let Some(d) = optional.data_directories.data_directories[i] {
                *slot = (d.1.virtual_address, d.1.size);
            }
        }

        let win = &optional.windows_fields;
        let header_info = HeaderInfo {
            machine: pe.header.coff_header.machine,
            characteristics: pe.header.coff_header.characteristics,
            image_base: win.image_base as u32,
            section_alignment: win.section_alignment,
            file_alignment: win.file_alignment,
            subsystem: win.subsystem,
            dll_characteristics: win.dll_characteristics,
            size_of_headers: win.size_of_headers,
            size_of_stack_reserve: win.size_of_stack_reserve as u32,
            size_of_stack_commit: win.size_of_stack_commit as u32,
            size_of_heap_reserve: win.size_of_heap_reserve as u32,
            size_of_heap_commit: win.size_of_heap_commit as u32,
            major_os_version: win.major_operating_system_version,
            minor_os_version: win.minor_operating_system_version,
            major_subsystem_version: win.major_subsystem_version,
            minor_subsystem_version: win.minor_subsystem_version,
            entry_point: None,
            data_directories: [None; NUM_DATA_DIRECTORIES],
        };

        let mut parser = PeParser {
            view: ImageView::new(data, sections),
            graph: BlockGraph::new(),
            carved: AddressSpace::new(),
            section_ids: Vec::new(),
            leaves: HashMap::new(),
            pending: Vec::new(),
            header_info,
            dirs,
        };

        let entry_rva = optional.standard_fields.address_of_entry_point as u32;
        parser.run(entry_rva)
    }

    fn run(mut self, entry_rva: u32) -> Result<ParsedImage> {
        let header = self.carve_headers()?;
        self.register_sections();

        let exports = self.walk_exports()?;
        self.walk_imports()?;
        let debug_id = self.walk_debug()?;
        self.walk_resources()?;
        self.walk_tls()?;
        self.carve_opaque_directories()?;

        self.carve_section_gaps()?;
        self.consume_relocations()?;
        self.resolve_pending()?;
        self.mark_orphans(entry_rva, &exports);

        // Entry point and directory slots, now that everything is carved.
        if entry_rva != 0 {
            self.header_info.entry_point = Some(
                self.locate(RelativeAddress(entry_rva))
                    .with_context(|| format!("entry point {entry_rva:#x} maps to no block"))?,
            );
        }
        let mut directories = [None; NUM_DATA_DIRECTORIES];
        for i in 0..NUM_DATA_DIRECTORIES {
            let (rva, size) = self.dirs[i];
            if rva == 0 || size == 0 || i == DIR_BASERELOC {
                continue;
            }
            match self.locate(RelativeAddress(rva)) {
                Some(location) => {
                    self.header_info.data_directories[i] = Some(DirectoryEntry { location, size });
                    directories[i] = Some(location.block);
                }
                None => warn!("directory {i} at {rva:#x} maps to no block"),
            }
        }

        self.graph.check_consistency()?;
        info!(
            "parsed image into {} blocks across {} sections",
            self.graph.block_count(),
            self.graph.section_count()
        );

        Ok(ParsedImage {
            header: PeHeaderBlocks {
                directories,
                ..header
            },
            graph: self.graph,
            header_info: self.header_info,
            exports,
            debug_id,
        })
    }

    // ---- carving primitives ----

    fn carve(
        &mut self,
        rva: RelativeAddress,
        size: u32,
        block_type: BlockType,
        name: &str,
    ) -> Result<BlockId> {
        let range = AddressRange::new(rva, size)
            .with_context(|| format!("degenerate range at {rva} for '{name}'"))?;
        if let Some((existing, &id)) = self.carved.find_containing(&range) {
            // Re-carving the same range is idempotent; anything else is an
            // overlap error.
            if existing == &range {
                return Ok(id);
            }
            bail!("'{name}' at {range} overlaps existing block {id} at {existing}");
        }
        if self.carved.find_first_intersecting(&range).is_some() {
            bail!("'{name}' at {range} straddles an existing block boundary");
        }

        // Copy the initialized bytes. A block may straddle the end of its
        // section's raw data, in which case only the backed prefix is real.
        let bytes = match self.view.slice_at_rva(rva, size as usize) {
            Ok(b) => b.to_vec(),
            Err(_) => {
                let backed = self
                    .view
                    .section_containing(rva)
                    .map(|(_, s)| {
                        let raw_end = s.virtual_address + s.size_of_raw_data;
                        raw_end.saturating_sub(rva.value()).min(size)
                    })
                    .unwrap_or(0);
                if backed > 0 {
                    self.view.slice_at_rva(rva, backed as usize)?.to_vec()
                } else {
                    Vec::new()
                }
            }
        };
        let section_index = self.view.section_containing(rva).map(|(i, _)| i);

        let id = self.graph.add_block(block_type, size, name);
        let block = self.graph.block_mut(id).expect("just added");
        block.set_original_address(rva);
        block.set_attributes(BlockAttributes::PE_PARSED);
        block.set_data(bytes);
        if let Some(sid) = section_index.and_then(|i| self.section_ids.get(i).copied().flatten()) {
            block.set_section(sid);
            block.set_attributes(BlockAttributes::SECTION_CONTRIB);
        }

        self.carved
            .insert(range, id)
            .map_err(|_| anyhow::anyhow!("carve race at {range}"))?;
        Ok(id)
    }

    /// Block + offset for an already-carved RVA.
    fn locate(&self, rva: RelativeAddress) -> Option<BlockRef> {
        let probe = AddressRange::new(rva, 1)?;
        let (range, &block) = self.carved.find_containing(&probe)?;
        Some(BlockRef {
            block,
            offset: rva.value() - range.start().value(),
        })
    }

    fn defer_reference(
        &mut self,
        source: BlockId,
        offset: u32,
        kind: ReferenceType,
        size: u8,
        target_rva: RelativeAddress,
    ) {
        self.pending.push(PendingReference {
            source,
            offset,
            kind,
            size,
            target_rva,
        });
    }

    fn resolve_pending(&mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.pending);
        for p in pending {
            let target = match self.locate(p.target_rva) {
                Some(t) => t,
                None => {
                    warn!(
                        "dropping reference from {}+{:#x}: target {} is outside every block",
                        p.source, p.offset, p.target_rva
                    );
                    continue;
                }
            };
            self.graph.set_reference(
                p.source,
                p.offset,
                Reference::new(p.kind, p.size, target.block, target.offset),
            )?;
        }
        Ok(())
    }

    // ---- fixed structures ----

    fn carve_headers(&mut self) -> Result<PeHeaderBlocks> {
        let e_lfanew = self
            .view
            .u32_at(RelativeAddress(0x3c))
            .context("truncated DOS header")?;
        if e_lfanew < DOS_HEADER_SIZE || e_lfanew as usize >= self.view.data().len() {
            bail!("implausible e_lfanew {e_lfanew:#x}");
        }

        let dos_header = self.carve(
            RelativeAddress::ZERO,
            DOS_HEADER_SIZE,
            BlockType::Data,
            "!dos-header",
        )?;
        let dos_stub = if e_lfanew > DOS_HEADER_SIZE {
            Some(self.carve(
                RelativeAddress(DOS_HEADER_SIZE),
                e_lfanew - DOS_HEADER_SIZE,
                BlockType::Data,
                "!dos-stub",
            )?)
        } else {
            None
        };

        let opt_size = self.view.u16_at(RelativeAddress(e_lfanew + 20))? as u32;
        let num_sections = self.view.u16_at(RelativeAddress(e_lfanew + 6))? as u32;
        let nt_size = 4 + 20 + opt_size + num_sections * SECTION_HEADER_SIZE;
        let nt_headers = self.carve(
            RelativeAddress(e_lfanew),
            nt_size,
            BlockType::Data,
            "!nt-headers",
        )?;

        // e_lfanew itself is a file-offset reference to the NT headers.
        self.graph.set_reference(
            dos_header,
            0x3c,
            Reference::new(ReferenceType::FileOffset, 4, nt_headers, 0),
        )?;

        Ok(PeHeaderBlocks {
            dos_header,
            dos_stub,
            nt_headers,
            directories: [None; NUM_DATA_DIRECTORIES],
        })
    }

    fn register_sections(&mut self) {
        let (reloc_rva, reloc_size) = self.dirs[DIR_BASERELOC];
        for row in self.view.sections().to_vec() {
            let holds_relocs = reloc_size > 0
                && reloc_rva >= row.virtual_address
                && reloc_rva < row.virtual_address + row.virtual_size.max(row.size_of_raw_data);
            if holds_relocs {
                debug!("dropping section '{}'; relocations are regenerated", row.name);
                self.section_ids.push(None);
                continue;
            }
            let id = self.graph.add_section(&row.name, row.characteristics);
            self.section_ids.push(Some(id));
            debug!(
                "section {} '{}' va {:#x} vsize {:#x}",
                id, row.name, row.virtual_address, row.virtual_size
            );
        }
    }

    // ---- exports ----

    fn walk_exports(&mut self) -> Result<Vec<ExportInfo>> {
        let (dir_rva, dir_size) = self.dirs[DIR_EXPORT];
        if dir_rva == 0 || dir_size == 0 {
            return Ok(Vec::new());
        }
        let base = RelativeAddress(dir_rva);
        let dir = self.carve(base, 40, BlockType::Data, "!export-directory")?;

        let ordinal_base = self.view.u32_at(base + 16)?;
        let num_functions = self.view.u32_at(base + 20)?;
        let num_names = self.view.u32_at(base + 24)?;
        let addr_table_rva = self.view.u32_at(base + 28)?;
        let name_table_rva = self.view.u32_at(base + 32)?;
        let ord_table_rva = self.view.u32_at(base + 36)?;
        let dll_name_rva = self.view.u32_at(base + 12)?;

        if dll_name_rva != 0 {
            let name_block = self.carve_string(RelativeAddress(dll_name_rva), "!export-dll-name")?;
            self.graph.set_reference(
                dir,
                12,
                Reference::new(ReferenceType::Relative, 4, name_block, 0),
            )?;
        }

        if num_functions == 0 {
            return Ok(Vec::new());
        }
        let addr_table = self.carve(
            RelativeAddress(addr_table_rva),
            num_functions * 4,
            BlockType::Data,
            "!export-address-table",
        )?;
        self.graph.set_reference(
            dir,
            28,
            Reference::new(ReferenceType::Relative, 4, addr_table, 0),
        )?;

        let name_table = if num_names > 0 {
            let nt = self.carve(
                RelativeAddress(name_table_rva),
                num_names * 4,
                BlockType::Data,
                "!export-name-table",
            )?;
            let ot = self.carve(
                RelativeAddress(ord_table_rva),
                num_names * 2,
                BlockType::Data,
                "!export-ordinal-table",
            )?;
            self.graph
                .set_reference(dir, 32, Reference::new(ReferenceType::Relative, 4, nt, 0))?;
            self.graph
                .set_reference(dir, 36, Reference::new(ReferenceType::Relative, 4, ot, 0))?;
            Some(nt)
        } else {
            None
        };

        // Name -> ordinal-index mapping.
        let mut names_by_index: HashMap<u32, String> = HashMap::new();
        for i in 0..num_names {
            let name_rva = self
                .view
                .u32_at(RelativeAddress(name_table_rva + i * 4))?;
            let ordinal_index = self
                .view
                .u16_at(RelativeAddress(ord_table_rva + i * 2))? as u32;
            let name = self.view.cstr_at(RelativeAddress(name_rva))?;
            let name_block = self.carve_string(RelativeAddress(name_rva), "!export-name")?;
            if let Some(nt) = name_table {
                self.graph.set_reference(
                    nt,
                    i * 4,
                    Reference::new(ReferenceType::Relative, 4, name_block, 0),
                )?;
            }
            names_by_index.insert(ordinal_index, name);
        }

        // Address table entries: zero (skipped ordinal), forwarder (points
        // back into the directory range), or a real function RVA.
        let mut exports = Vec::new();
        for i in 0..num_functions {
            let entry_off = i * 4;
            let fn_rva = self
                .view
                .u32_at(RelativeAddress(addr_table_rva + entry_off))?;
            if fn_rva == 0 {
                continue;
            }
            let ordinal = (ordinal_base + i) as u16;
            let name = names_by_index.get(&i).cloned();
            if fn_rva >= dir_rva && fn_rva < dir_rva + dir_size {
                let forwarder = self.view.cstr_at(RelativeAddress(fn_rva))?;
                let fwd_block = self.carve_string(RelativeAddress(fn_rva), "!export-forwarder")?;
                self.graph.set_reference(
                    addr_table,
                    entry_off,
                    Reference::new(ReferenceType::Relative, 4, fwd_block, 0),
                )?;
                exports.push(ExportInfo {
                    ordinal,
                    name,
                    rva: None,
                    forwarder: Some(forwarder),
                });
            } else {
                self.defer_reference(
                    addr_table,
                    entry_off,
                    ReferenceType::Relative,
                    4,
                    RelativeAddress(fn_rva),
                );
                exports.push(ExportInfo {
                    ordinal,
                    name,
                    rva: Some(RelativeAddress(fn_rva)),
                    forwarder: None,
                });
            }
        }
        debug!("{} exports chunked", exports.len());
        Ok(exports)
    }

    fn carve_string(&mut self, rva: RelativeAddress, name: &str) -> Result<BlockId> {
        if let Some(&id) = self.leaves.get(&rva.value()) {
            return Ok(id);
        }
        let len = self.view.cstr_len_at(rva)?;
        let text = self.view.cstr_at(rva)?;
        let id = self.carve(rva, len, BlockType::Data, &format!("{name}:{text}"))?;
        self.leaves.insert(rva.value(), id);
        Ok(id)
    }

    // ---- imports ----

    fn walk_imports(&mut self) -> Result<()> {
        let (dir_rva, dir_size) = self.dirs[DIR_IMPORT];
        if dir_rva == 0 || dir_size == 0 {
            return Ok(());
        }

        // Count descriptors up to the all-zero terminator.
        let mut count = 0u32;
        loop {
            let base = RelativeAddress(dir_rva + count * 20);
            let name_rva = self.view.u32_at(base + 12)?;
            let first_thunk = self.view.u32_at(base + 16)?;
            if name_rva == 0 && first_thunk == 0 {
                break;
            }
            count += 1;
        }

        let table = self.carve(
            RelativeAddress(dir_rva),
            (count + 1) * 20,
            BlockType::Data,
            "!import-descriptors",
        )?;

        for i in 0..count {
            let desc_off = i * 20;
            let base = RelativeAddress(dir_rva + desc_off);
            let int_rva = self.view.u32_at(base)?;
            let name_rva = self.view.u32_at(base + 12)?;
            let iat_rva = self.view.u32_at(base + 16)?;

            let dll = self.view.cstr_at(RelativeAddress(name_rva))?;
            let name_block = self.carve_string(RelativeAddress(name_rva), "!import-dll-name")?;
            self.graph.set_reference(
                table,
                desc_off + 12,
                Reference::new(ReferenceType::Relative, 4, name_block, 0),
            )?;

            for (field_off, thunk_rva, label) in [(0u32, int_rva, "int"), (16u32, iat_rva, "iat")] {
                if thunk_rva == 0 {
                    continue;
                }
                let thunks = self.walk_thunk_array(RelativeAddress(thunk_rva), &dll, label)?;
                self.graph.set_reference(
                    table,
                    desc_off + field_off,
                    Reference::new(ReferenceType::Relative, 4, thunks, 0),
                )?;
            }
        }
        debug!("{count} import descriptors chunked");
        Ok(())
    }

    fn walk_thunk_array(
        &mut self,
        rva: RelativeAddress,
        dll: &str,
        label: &str,
    ) -> Result<BlockId> {
        if let Some(&id) = self.leaves.get(&rva.value()) {
            // INT and IAT may alias in bound images.
            return Ok(id);
        }
        let mut count = 0u32;
        loop {
            if self.view.u32_at(rva + count * 4)? == 0 {
                break;
            }
            count += 1;
        }
        let array = self.carve(
            rva,
            (count + 1) * 4,
            BlockType::Data,
            &format!("!{label}:{dll}"),
        )?;
        self.leaves.insert(rva.value(), array);

        for i in 0..count {
            let raw = self.view.u32_at(rva + i * 4)?;
            if raw & 0x8000_0000 != 0 {
                continue; // import by ordinal, no leaf structure
            }
            let entry = self.carve_hint_name(RelativeAddress(raw))?;
            self.graph.set_reference(
                array,
                i * 4,
                Reference::new(ReferenceType::Relative, 4, entry, 0),
            )?;
        }
        Ok(array)
    }

    fn carve_hint_name(&mut self, rva: RelativeAddress) -> Result<BlockId> {
        if let Some(&id) = self.leaves.get(&rva.value()) {
            return Ok(id);
        }
        let name = self.view.cstr_at(rva + 2)?;
        let size = 2 + name.len() as u32 + 1;
        let id = self.carve(rva, size, BlockType::Data, &format!("!hint-name:{name}"))?;
        self.leaves.insert(rva.value(), id);
        Ok(id)
    }

    // ---- debug directory ----

    fn walk_debug(&mut self) -> Result<Option<DebugId>> {
        let (dir_rva, dir_size) = self.dirs[DIR_DEBUG];
        if dir_rva == 0 || dir_size == 0 {
            return Ok(None);
        }
        const DESC_SIZE: u32 = 28;
        const TYPE_CODEVIEW: u32 = 2;
        let count = dir_size / DESC_SIZE;
        let table = self.carve(
            RelativeAddress(dir_rva),
            count * DESC_SIZE,
            BlockType::Data,
            "!debug-directory",
        )?;

        let mut debug_id = None;
        for i in 0..count {
            let base = RelativeAddress(dir_rva + i * DESC_SIZE);
            let kind = self.view.u32_at(base + 12)?;
            let data_size = self.view.u32_at(base + 16)?;
            let data_rva = self.view.u32_at(base + 20)?;
            if data_rva == 0 || data_size == 0 {
                continue;
            }
            let blob = self.carve(
                RelativeAddress(data_rva),
                data_size,
                BlockType::Data,
                "!debug-data",
            )?;
            self.graph.set_reference(
                table,
                i * DESC_SIZE + 20,
                Reference::new(ReferenceType::Relative, 4, blob, 0),
            )?;

            if kind == TYPE_CODEVIEW && data_size >= 24 {
                let bytes = self.view.slice_at_rva(RelativeAddress(data_rva), 24)?;
                if &bytes[0..4] == b"RSDS" {
                    let mut guid = [0u8; 16];
                    guid.copy_from_slice(&bytes[4..20]);
                    let age = u32::from_le_bytes(bytes[20..24].try_into().unwrap());
                    debug_id = Some(DebugId { guid, age });
                }
            }
        }
        Ok(debug_id)
    }

    // ---- resources ----

    /// Walks the resource directory tree. The whole directory range stays
    /// one block (entry offsets inside it are relative to its start, so it
    /// must move as a unit), but every data entry's RVA field gets a typed
    /// reference so relayout keeps the pointers honest.
    fn walk_resources(&mut self) -> Result<()> {
        let (dir_rva, dir_size) = self.dirs[super::DIR_RESOURCE];
        if dir_rva == 0 || dir_size == 0 {
            return Ok(());
        }
        const DIR_HEADER_SIZE: u32 = 16;
        const ENTRY_SIZE: u32 = 8;
        const SUBDIR_BIT: u32 = 0x8000_0000;

        let block = self.carve(
            RelativeAddress(dir_rva),
            dir_size,
            BlockType::Data,
            "!resources",
        )?;

        let mut stack = vec![0u32];
        let mut seen = std::collections::HashSet::new();
        let mut data_entries = 0usize;
        while let Some(dir_off) = stack.pop() {
            if !seen.insert(dir_off) {
                bail!("resource directory at +{dir_off:#x} loops back on itself");
            }
            let base = RelativeAddress(dir_rva + dir_off);
            let count =
                self.view.u16_at(base + 12)? as u32 + self.view.u16_at(base + 14)? as u32;
            if dir_off + DIR_HEADER_SIZE + count * ENTRY_SIZE > dir_size {
                bail!("resource directory at +{dir_off:#x} overflows the directory range");
            }
            for i in 0..count {
                let entry = dir_off + DIR_HEADER_SIZE + i * ENTRY_SIZE;
                let payload = self.view.u32_at(RelativeAddress(dir_rva + entry + 4))?;
                if payload & SUBDIR_BIT != 0 {
                    stack.push(payload & !SUBDIR_BIT);
                    continue;
                }
                // IMAGE_RESOURCE_DATA_ENTRY: the first field is an RVA.
                if payload + 16 > dir_size {
                    bail!("resource data entry at +{payload:#x} overflows the directory range");
                }
                let data_rva = self.view.u32_at(RelativeAddress(dir_rva + payload))?;
                if data_rva != 0 {
                    self.defer_reference(
                        block,
                        payload,
                        ReferenceType::Relative,
                        4,
                        RelativeAddress(data_rva),
                    );
                }
                data_entries += 1;
            }
        }
        debug!(
            "resource tree: {} directories, {data_entries} data entries",
            seen.len()
        );
        Ok(())
    }

    // ---- thread-local storage ----

    /// Chunks the TLS directory: the raw-data template, the index slot and
    /// the callback array each become their own block, with absolute
    /// references from the directory's VA fields.
    fn walk_tls(&mut self) -> Result<()> {
        let (dir_rva, dir_size) = self.dirs[super::DIR_TLS];
        if dir_rva == 0 || dir_size == 0 {
            return Ok(());
        }
        const TLS_DIR_SIZE: u32 = 24;
        const MAX_CALLBACKS: u32 = 0x1000;
        let base = RelativeAddress(dir_rva);
        let table = self.carve(base, TLS_DIR_SIZE, BlockType::Data, "!tls-directory")?;

        let image_base = self.header_info.image_base;
        let to_rva = |va: u32| va.checked_sub(image_base);

        let start_va = self.view.u32_at(base)?;
        let end_va = self.view.u32_at(base + 4)?;
        let index_va = self.view.u32_at(base + 8)?;
        let callbacks_va = self.view.u32_at(base + 12)?;

        if let (Some(start), Some(end)) = (to_rva(start_va), to_rva(end_va)) {
            if end > start {
                let data = self.carve(
                    RelativeAddress(start),
                    end - start,
                    BlockType::Data,
                    "!tls-data",
                )?;
                self.graph.set_reference(
                    table,
                    0,
                    Reference::new(ReferenceType::Absolute, 4, data, 0),
                )?;
                // One past the template's last byte.
                self.graph.set_reference(
                    table,
                    4,
                    Reference::new(ReferenceType::Absolute, 4, data, end - start),
                )?;
            }
        }
        if let Some(index) = to_rva(index_va) {
            self.defer_reference(table, 8, ReferenceType::Absolute, 4, RelativeAddress(index));
        }
        if let Some(callbacks) = to_rva(callbacks_va) {
            let mut count = 0u32;
            while self.view.u32_at(RelativeAddress(callbacks + count * 4))? != 0 {
                count += 1;
                if count > MAX_CALLBACKS {
                    bail!("unterminated TLS callback array at {callbacks:#x}");
                }
            }
            let array = self.carve(
                RelativeAddress(callbacks),
                (count + 1) * 4,
                BlockType::Data,
                "!tls-callbacks",
            )?;
            self.graph.set_reference(
                table,
                12,
                Reference::new(ReferenceType::Absolute, 4, array, 0),
            )?;
            for i in 0..count {
                let va = self.view.u32_at(RelativeAddress(callbacks + i * 4))?;
                if let Some(rva) = to_rva(va) {
                    self.defer_reference(
                        array,
                        i * 4,
                        ReferenceType::Absolute,
                        4,
                        RelativeAddress(rva),
                    );
                }
            }
        }
        Ok(())
    }

    // ---- the rest of the directories ----

    fn carve_opaque_directories(&mut self) -> Result<()> {
        const NAMES: [&str; NUM_DATA_DIRECTORIES] = [
            "!export", "!import", "!resources", "!exception", "!security", "!reloc", "!debug",
            "!architecture", "!globalptr", "!tls", "!load-config", "!bound-import", "!iat",
            "!delay-import", "!com-descriptor", "!reserved",
        ];
        for i in 0..NUM_DATA_DIRECTORIES {
            let (rva, size) = self.dirs[i];
            if rva == 0 || size == 0 {
                continue;
            }
            // Already chunked in detail, consumed, or (for the certificate
            // table) not RVA-addressed at all.
            if matches!(
                i,
                DIR_EXPORT
                    | DIR_IMPORT
                    | DIR_DEBUG
                    | DIR_BASERELOC
                    | super::DIR_SECURITY
                    | super::DIR_RESOURCE
                    | super::DIR_TLS
            ) {
                continue;
            }
            let range = match AddressRange::new(RelativeAddress(rva), size) {
                Some(r) => r,
                None => continue,
            };
            if self.carved.find_first_intersecting(&range).is_some() {
                // The IAT usually overlaps blocks the import walk made.
                continue;
            }
            self.carve(RelativeAddress(rva), size, BlockType::Data, NAMES[i])?;
        }
        Ok(())
    }

    // ---- gaps ----

    fn carve_section_gaps(&mut self) -> Result<()> {
        for (index, row) in self.view.sections().to_vec().into_iter().enumerate() {
            if self.section_ids.get(index).copied().flatten().is_none() {
                continue;
            }
            let body_size = row.virtual_size.max(row.size_of_raw_data);
            if body_size == 0 {
                continue;
            }
            let section_range =
                match AddressRange::new(RelativeAddress(row.virtual_address), body_size) {
                    Some(r) => r,
                    None => continue,
                };
            let block_type = if row.characteristics & IMAGE_SCN_CNT_CODE != 0 {
                BlockType::Code
            } else if row.characteristics & super::IMAGE_SCN_MEM_WRITE != 0 {
                BlockType::Data
            } else {
                BlockType::ReadOnlyData
            };

            let mut cursor = section_range.start().value();
            let carved: Vec<RelativeRange> = self
                .carved
                .intersecting(&section_range)
                .map(|(r, _)| *r)
                .collect();
            let mut gaps: Vec<RelativeRange> = Vec::new();
            for r in carved {
                if r.start().value() > cursor {
                    gaps.push(
                        AddressRange::new(RelativeAddress(cursor), r.start().value() - cursor)
                            .expect("non-empty by construction"),
                    );
                }
                cursor = cursor.max(r.end().value());
            }
            if cursor < section_range.end().value() {
                gaps.push(
                    AddressRange::new(RelativeAddress(cursor), section_range.end().value() - cursor)
                        .expect("non-empty by construction"),
                );
            }

            for gap in gaps {
                let at_section_start = gap.start().value() == row.virtual_address;
                let name = if at_section_start {
                    row.name.clone()
                } else {
                    format!("{}+{:#x}", row.name, gap.start().value() - row.virtual_address)
                };
                let id = self.carve(gap.start(), gap.size(), block_type, &name)?;
                if !at_section_start {
                    self.graph
                        .block_mut(id)
                        .expect("just carved")
                        .set_attributes(BlockAttributes::GAP);
                }
            }
        }
        Ok(())
    }

    // ---- relocations ----

    /// Consumes `.reloc` into `Absolute` references on the blocks that
    /// contain each fixup site.
    fn consume_relocations(&mut self) -> Result<()> {
        let (dir_rva, dir_size) = self.dirs[DIR_BASERELOC];
        if dir_rva == 0 || dir_size == 0 {
            return Ok(());
        }
        let image_base = self.header_info.image_base;
        let mut cursor = 0u32;
        let mut fixups = 0usize;
        while cursor + 8 <= dir_size {
            let page_rva = self.view.u32_at(RelativeAddress(dir_rva + cursor))?;
            let block_size = self.view.u32_at(RelativeAddress(dir_rva + cursor + 4))?;
            if block_size < 8 || cursor + block_size > dir_size {
                bail!(
                    "malformed relocation page at {:#x} (block size {block_size:#x})",
                    dir_rva + cursor
                );
            }
            let entry_count = (block_size - 8) / 2;
            for i in 0..entry_count {
                let entry = self
                    .view
                    .u16_at(RelativeAddress(dir_rva + cursor + 8 + i * 2))?;
                let kind = entry >> 12;
                if kind == 0 {
                    continue; // alignment padding
                }
                if kind != 3 {
                    warn!("unsupported relocation type {kind} ignored");
                    continue;
                }
                let site = RelativeAddress(page_rva + (entry & 0x0fff) as u32);
                let value = self
                    .view
                    .u32_at(site)
                    .with_context(|| format!("relocation site {site} unreadable"))?;
                let target_rva = match value.checked_sub(image_base) {
                    Some(t) => RelativeAddress(t),
                    None => {
                        warn!("relocation at {site} holds {value:#x}, below the image base");
                        continue;
                    }
                };
                let source = self
                    .locate(site)
                    .with_context(|| format!("relocation site {site} maps to no block"))?;
                // Directory walks may have typed this site already; their
                // references carry exact target offsets (one-past-the-end
                // pointers included) that a raw VA lookup cannot recover.
                if self
                    .graph
                    .block(source.block)
                    .and_then(|b| b.reference_at(source.offset))
                    .is_some()
                {
                    continue;
                }
                self.defer_reference(
                    source.block,
                    source.offset,
                    ReferenceType::Absolute,
                    4,
                    target_rva,
                );
                fixups += 1;
            }
            cursor += block_size;
        }
        debug!("{fixups} relocation fixups converted to absolute references");
        Ok(())
    }

    // ---- orphan sweep ----

    /// Code blocks reachable only through absolute references get tagged;
    /// entry point and export targets are roots.
    fn mark_orphans(&mut self, entry_rva: u32, exports: &[ExportInfo]) {
        let mut roots: Vec<BlockId> = Vec::new();
        if entry_rva != 0 {
            if let Some(r) = self.locate(RelativeAddress(entry_rva)) {
                roots.push(r.block);
            }
        }
        for e in exports {
            if let Some(rva) = e.rva {
                if let Some(r) = self.locate(rva) {
                    roots.push(r.block);
                }
            }
        }

        let ids = self.graph.block_ids();
        for id in ids {
            let block = match self.graph.block(id) {
                Some(b) => b,
                None => continue,
            };
            if block.block_type() != BlockType::Code || roots.contains(&id) {
                continue;
            }
            let has_direct = block
                .referrers()
                .any(|&(src, off)| {
                    self.graph
                        .block(src)
                        .and_then(|b| b.reference_at(off))
                        .map(|r| r.kind != ReferenceType::Absolute)
                        .unwrap_or(false)
                });
            if !has_direct && block.has_referrers() {
                let block = self.graph.block_mut(id).expect("exists");
                block.set_attributes(BlockAttributes::ORPHANED | BlockAttributes::GAP);
            }
        }

        // Export targets are call targets by definition.
        for e in exports {
            if let (Some(rva), Some(name)) = (e.rva, e.name.as_ref()) {
                if let Some(r) = self.locate(rva) {
                    if let Some(block) = self.graph.block_mut(r.block) {
                        block.set_label(
                            r.offset,
                            name.clone(),
                            LabelAttributes::CODE | LabelAttributes::CALL_TARGET,
                        );
                    }
                }
            }
        }
    }
}
