//! Entry-hook injection.
//!
//! Every callable code block gets an 11-byte thunk, `push <original>` then
//! `jmp [iat_slot]`, in a fresh `.thunks` section; call sites the policy
//! clears are rewired to the thunk. The agent DLL is appended to the import
//! table so the loader resolves the hook before any instrumented code can
//! run, and the image entry point is routed through the DllMain variant of
//! the hook so the agent observes `DLL_PROCESS_ATTACH` first.

use anyhow::{bail, Context, Result};
use tracing::{debug, info};

use crate::block_graph::{
    BlockAttributes, BlockGraph, BlockId, BlockType, Reference, ReferenceType,
};
use crate::pe::{BlockRef, DirectoryEntry};

use super::{Transform, TransformContext};

pub const DEFAULT_AGENT_DLL: &str = "calltrace_agent.dll";
pub const ENTER_HOOK: &str = "_enter_hook";
pub const DLLMAIN_ENTER_HOOK: &str = "_dllmain_enter_hook";

const THUNK_SIZE: u32 = 11;
const IMPORT_DESCRIPTOR_SIZE: u32 = 20;

pub struct InstrumentTransform {
    agent_dll: String,
    /// The image entry point before instrumentation, if any.
    entry_point: Option<BlockRef>,
    /// The import directory the parser located, if the image has one.
    import_directory: Option<DirectoryEntry>,
    /// Entry point after instrumentation; the driver stamps it into the
    /// header info.
    pub thunked_entry_point: Option<BlockRef>,
    /// Replacement import directory; likewise for the driver.
    pub new_import_directory: Option<DirectoryEntry>,
    pub thunks_created: usize,
    pub references_redirected: usize,
}

impl InstrumentTransform {
    pub fn new(agent_dll: impl Into<String>) -> Self {
        Self {
            agent_dll: agent_dll.into(),
            entry_point: None,
            import_directory: None,
            thunked_entry_point: None,
            new_import_directory: None,
            thunks_created: 0,
            references_redirected: 0,
        }
    }

    pub fn with_entry_point(mut self, entry: Option<BlockRef>) -> Self {
        self.entry_point = entry;
        self
    }

    pub fn with_import_directory(mut self, directory: Option<DirectoryEntry>) -> Self {
        self.import_directory = directory;
        self
    }
}

struct AgentImport {
    /// IAT block; slot 0 resolves the plain hook, slot 4 the DllMain one.
    iat: BlockId,
}

impl Transform for InstrumentTransform {
    fn name(&self) -> &'static str {
        "instrumenter"
    }

    fn transform(&mut self, graph: &mut BlockGraph, context: &TransformContext) -> Result<()> {
        let agent = self.append_agent_import(graph)?;
        let thunk_section = graph.add_section(".thunks", 0x6000_0020);

        // Snapshot before thunks start appearing.
        let candidates: Vec<BlockId> = graph
            .blocks()
            .filter(|b| matches!(b.block_type(), BlockType::Code | BlockType::BasicCode))
            .filter(|b| !b.attributes().contains(BlockAttributes::TOOL_BUILT))
            .filter(|b| {
                !b.attributes().contains(BlockAttributes::GAP)
                    && !b.attributes().contains(BlockAttributes::PADDING)
            })
            .map(|b| b.id())
            .collect();

        for id in candidates {
            let block = graph.block(id).expect("snapshotted id");
            if let (Some(filter), Some(addr)) = (&context.filter, block.original_address()) {
                if filter.is_filtered(addr, block.size()) {
                    continue;
                }
            }
            // Callable: at least one incoming edge with call semantics.
            let call_sites: Vec<(BlockId, u32)> = block
                .referrers()
                .filter(|&&(rb, roff)| {
                    let Some(referrer) = graph.block(rb) else { return false };
                    if referrer.attributes().contains(BlockAttributes::TOOL_BUILT) {
                        return false;
                    }
                    let Some(r) = referrer.reference_at(roff) else { return false };
                    r.target_offset == 0
                        && context.policy.reference_is_safe_to_redirect(referrer, r)
                })
                .copied()
                .collect();
            if call_sites.is_empty() {
                continue;
            }

            let thunk = self.add_thunk(graph, thunk_section, BlockRef { block: id, offset: 0 }, &agent, false)?;
            for (rb, roff) in call_sites {
                let mut r = *graph.block(rb).unwrap().reference_at(roff).unwrap();
                r.target = thunk;
                r.target_offset = 0;
                graph.set_reference(rb, roff, r)?;
                self.references_redirected += 1;
            }
            debug!("thunked {id} through {thunk}");
        }

        if let Some(entry) = self.entry_point {
            let thunk = self.add_thunk(graph, thunk_section, entry, &agent, true)?;
            self.thunked_entry_point = Some(BlockRef { block: thunk, offset: 0 });
        }

        info!(
            "{}: {} thunk(s), {} call site(s) redirected",
            self.name(),
            self.thunks_created,
            self.references_redirected
        );
        Ok(())
    }
}

impl InstrumentTransform {
    /// `push <target>; jmp [iat_slot]`.
    fn add_thunk(
        &mut self,
        graph: &mut BlockGraph,
        section: u32,
        target: BlockRef,
        agent: &AgentImport,
        dllmain: bool,
    ) -> Result<BlockId> {
        let name = format!(
            "{}_thunk",
            graph
                .block(target.block)
                .context("thunk target vanished")?
                .name()
        );
        let thunk = graph.add_block(BlockType::Code, THUNK_SIZE, &name);
        {
            let b = graph.block_mut(thunk).unwrap();
            let mut data = vec![0u8; THUNK_SIZE as usize];
            data[0] = 0x68; // push imm32
            data[5] = 0xff; // jmp dword ptr [mem]
            data[6] = 0x25;
            b.set_data(data);
            b.set_section(section);
            b.set_attributes(BlockAttributes::TOOL_BUILT);
        }
        graph.set_reference(
            thunk,
            1,
            Reference::new(ReferenceType::Absolute, 4, target.block, target.offset),
        )?;
        let slot = if dllmain { 4 } else { 0 };
        graph.set_reference(
            thunk,
            7,
            Reference::new(ReferenceType::Absolute, 4, agent.iat, slot),
        )?;
        self.thunks_created += 1;
        Ok(thunk)
    }

    /// Builds the agent's INT/IAT/hint-name/name blocks in a fresh data
    /// section and replaces the import descriptor table with one that has
    /// the agent appended.
    fn append_agent_import(&mut self, graph: &mut BlockGraph) -> Result<AgentImport> {
        let section = graph.add_section(".imports", 0xc000_0040);

        let hint1 = add_hint_name(graph, section, ENTER_HOOK);
        let hint2 = add_hint_name(graph, section, DLLMAIN_ENTER_HOOK);
        let dll_name = {
            let mut bytes = self.agent_dll.as_bytes().to_vec();
            bytes.push(0);
            if bytes.len() % 2 != 0 {
                bytes.push(0);
            }
            let id = graph.add_block(BlockType::Data, bytes.len() as u32, "agent_dll_name");
            let b = graph.block_mut(id).unwrap();
            b.set_data(bytes);
            b.set_section(section);
            b.set_attributes(BlockAttributes::TOOL_BUILT);
            id
        };

        let int = add_thunk_array(graph, section, "agent_int", &[hint1, hint2])?;
        let iat = add_thunk_array(graph, section, "agent_iat", &[hint1, hint2])?;

        // New descriptor table: the old descriptors minus their terminator,
        // the agent's descriptor, a fresh terminator.
        let (old_data, old_refs, old_block) = match self.import_directory {
            Some(dir) => {
                let block = graph
                    .block(dir.location.block)
                    .context("import directory names a missing block")?;
                if block.size() < IMPORT_DESCRIPTOR_SIZE {
                    bail!("import descriptor table is too small");
                }
                let keep = block.size() - IMPORT_DESCRIPTOR_SIZE;
                let data = block
                    .read_bytes(0, keep as usize)
                    .context("import descriptor table has no data")?;
                let refs: Vec<(u32, Reference)> = block
                    .references()
                    .filter(|&(o, _)| o < keep)
                    .map(|(o, r)| (o, *r))
                    .collect();
                (data, refs, Some(dir.location.block))
            }
            None => (Vec::new(), Vec::new(), None),
        };

        let agent_offset = old_data.len() as u32;
        let total = agent_offset + 2 * IMPORT_DESCRIPTOR_SIZE;
        let table = graph.add_block(BlockType::Data, total, "import_descriptors");
        {
            let b = graph.block_mut(table).unwrap();
            let mut data = old_data;
            data.resize(total as usize, 0);
            b.set_data(data);
            b.set_section(section);
            b.set_attributes(BlockAttributes::TOOL_BUILT);
        }
        for (offset, r) in old_refs {
            graph.set_reference(table, offset, r)?;
        }
        // OriginalFirstThunk, Name, FirstThunk of the agent descriptor.
        graph.set_reference(
            table,
            agent_offset,
            Reference::new(ReferenceType::Relative, 4, int, 0),
        )?;
        graph.set_reference(
            table,
            agent_offset + 12,
            Reference::new(ReferenceType::Relative, 4, dll_name, 0),
        )?;
        graph.set_reference(
            table,
            agent_offset + 16,
            Reference::new(ReferenceType::Relative, 4, iat, 0),
        )?;

        if let Some(old) = old_block {
            graph
                .remove_block(old)
                .context("old import descriptor table still referenced")?;
        }
        self.new_import_directory = Some(DirectoryEntry {
            location: BlockRef { block: table, offset: 0 },
            size: total,
        });
        Ok(AgentImport { iat })
    }
}

fn add_hint_name(graph: &mut BlockGraph, section: u32, symbol: &str) -> BlockId {
    let mut bytes = vec![0u8, 0u8]; // hint
    bytes.extend_from_slice(symbol.as_bytes());
    bytes.push(0);
    if bytes.len() % 2 != 0 {
        bytes.push(0);
    }
    let id = graph.add_block(BlockType::Data, bytes.len() as u32, &format!("hint_{symbol}"));
    let b = graph.block_mut(id).unwrap();
    b.set_data(bytes);
    b.set_section(section);
    b.set_attributes(BlockAttributes::TOOL_BUILT);
    id
}

/// A null-terminated array of by-name import entries.
fn add_thunk_array(
    graph: &mut BlockGraph,
    section: u32,
    name: &str,
    hints: &[BlockId],
) -> Result<BlockId> {
    let size = (hints.len() as u32 + 1) * 4;
    let id = graph.add_block(BlockType::Data, size, name);
    {
        let b = graph.block_mut(id).unwrap();
        b.set_data(vec![0u8; size as usize]);
        b.set_section(section);
        b.set_attributes(BlockAttributes::TOOL_BUILT);
    }
    for (i, &hint) in hints.iter().enumerate() {
        graph.set_reference(
            id,
            i as u32 * 4,
            Reference::new(ReferenceType::Relative, 4, hint, 0),
        )?;
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transforms::TransformContext;

    fn two_function_graph() -> (BlockGraph, BlockId, BlockId) {
        let mut g = BlockGraph::new();
        let section = g.add_section(".text", 0x6000_0020);
        let callee = g.add_block(BlockType::Code, 3, "f");
        {
            let b = g.block_mut(callee).unwrap();
            b.set_data(vec![0x33, 0xc0, 0xc3]);
            b.set_section(section);
        }
        let caller = g.add_block(BlockType::Code, 6, "main");
        {
            let b = g.block_mut(caller).unwrap();
            b.set_data(vec![0xe8, 0, 0, 0, 0, 0xc3]);
            b.set_section(section);
        }
        g.set_reference(caller, 1, Reference::new(ReferenceType::PcRelative, 4, callee, 0))
            .unwrap();
        (g, callee, caller)
    }

    #[test]
    fn call_sites_are_rewired_through_thunks() {
        let (mut g, callee, caller) = two_function_graph();
        let mut t = InstrumentTransform::new(DEFAULT_AGENT_DLL);
        t.transform(&mut g, &TransformContext::default()).unwrap();

        let r = *g.block(caller).unwrap().reference_at(1).unwrap();
        assert_ne!(r.target, callee);
        let thunk = g.block(r.target).unwrap();
        assert!(thunk.attributes().contains(BlockAttributes::TOOL_BUILT));
        assert_eq!(thunk.data()[0], 0x68);
        assert_eq!(&thunk.data()[5..7], &[0xff, 0x25]);
        // The thunk pushes the original callee.
        assert_eq!(thunk.reference_at(1).unwrap().target, callee);
        assert_eq!(t.references_redirected, 1);
        g.check_consistency().unwrap();
    }

    #[test]
    fn entry_point_gets_the_dllmain_hook() {
        let (mut g, callee, _) = two_function_graph();
        let mut t = InstrumentTransform::new(DEFAULT_AGENT_DLL)
            .with_entry_point(Some(BlockRef { block: callee, offset: 0 }));
        t.transform(&mut g, &TransformContext::default()).unwrap();

        let entry = t.thunked_entry_point.unwrap();
        let thunk = g.block(entry.block).unwrap();
        // DllMain variant: the jmp reads IAT slot 4.
        assert_eq!(thunk.reference_at(7).unwrap().target_offset, 4);
    }

    #[test]
    fn agent_import_is_appended() {
        let (mut g, _, _) = two_function_graph();
        let mut t = InstrumentTransform::new(DEFAULT_AGENT_DLL);
        t.transform(&mut g, &TransformContext::default()).unwrap();

        let dir = t.new_import_directory.unwrap();
        // One descriptor plus the terminator.
        assert_eq!(dir.size, 40);
        let table = g.block(dir.location.block).unwrap();
        assert!(table.reference_at(0).is_some()); // INT
        assert!(table.reference_at(12).is_some()); // dll name
        assert!(table.reference_at(16).is_some()); // IAT
        g.check_consistency().unwrap();
    }
}
