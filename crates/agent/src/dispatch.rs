//! The hook dispatcher.
//!
//! The assembly thunks below every instrumented call site funnel into this
//! module: entry events become `Enter` records or `BatchEnter` slots, exit
//! events unwind the shadow stack, and module attach notifications announce
//! every loaded module once. The dispatcher lazily opens the collector
//! session on the first event in the process and goes quiet forever if an
//! optional session cannot be opened. System error state is saved and
//! restored around every hook body so instrumented code cannot observe the
//! agent.

use std::cell::Cell;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use trace::record::{ModuleInfo, Record, RecordType, PREFIX_SIZE};
use trace::segment::SEGMENT_HEADER_SIZE;

use crate::env_config::RpcConfig;
use crate::segment::TraceFileSegment;
use crate::session::{
    CollectorChannel, Session, FLAG_BATCH_ENTER, FLAG_ENTER_EXIT,
};
use crate::shadow_stack::{ShadowStack, ShadowStackEntry};
use crate::thunk_arena::{PageRegistry, Thunk, ThunkArena};

/// The on-stack state the entry thunk hands over: the pushed function
/// address, the return address slot, and the frame location. The dispatcher
/// may rewrite `return_address` to swizzle the return through a thunk.
#[derive(Debug, Clone, Copy)]
pub struct EntryFrame {
    pub function: u32,
    pub return_address: u32,
    pub frame_ptr: u32,
}

/// A module the host process loaded, as enumerated from the OS.
#[derive(Debug, Clone)]
pub struct ModuleEvent {
    pub info: ModuleInfo,
    pub name: String,
    pub exe_path: String,
}

/// Cycle counter, captured as early as possible on entry.
pub fn read_timestamp_counter() -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        return unsafe { core::arch::x86_64::_rdtsc() };
    }
    #[cfg(target_arch = "x86")]
    {
        return unsafe { core::arch::x86::_rdtsc() };
    }
    #[allow(unreachable_code)]
    {
        use std::sync::atomic::{AtomicU64, Ordering};
        static FALLBACK: AtomicU64 = AtomicU64::new(1);
        FALLBACK.fetch_add(1, Ordering::Relaxed)
    }
}

thread_local! {
    static LAST_ERROR: Cell<u32> = const { Cell::new(0) };
}

/// Thread-wide system error slot, the moral equivalent of `GetLastError`.
pub fn last_error() -> u32 {
    LAST_ERROR.with(|e| e.get())
}

pub fn set_last_error(value: u32) {
    LAST_ERROR.with(|e| e.set(value));
}

/// Saves the error slot on construction and restores it on drop, so hook
/// bodies leave no trace in the host's error state.
struct LastErrorScope(u32);

impl LastErrorScope {
    fn save() -> LastErrorScope {
        LastErrorScope(last_error())
    }
}

impl Drop for LastErrorScope {
    fn drop(&mut self) {
        set_last_error(self.0);
    }
}

/// Everything one traced thread owns outright. Reached through a
/// thread-local slot in the deployed agent; handed around explicitly here
/// and in tests.
pub struct ThreadState {
    thread_id: u32,
    segment: Option<TraceFileSegment>,
    shadow: ShadowStack,
    thunks: ThunkArena,
    /// Buffer offset of the currently open `BatchEnter` record, if any.
    batch: Option<usize>,
}

impl ThreadState {
    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    pub fn shadow_depth(&self) -> usize {
        self.shadow.depth()
    }

    /// Committed records of the current segment, for inspection.
    pub fn segment(&self) -> Option<&TraceFileSegment> {
        self.segment.as_ref()
    }
}

pub struct Agent {
    session: Mutex<Session>,
    page_registry: Arc<PageRegistry>,
    reported_modules: Mutex<HashSet<u32>>,
    live_threads: Mutex<HashSet<u32>>,
}

impl Agent {
    pub fn new(channel: Arc<dyn CollectorChannel>, config: &RpcConfig) -> Agent {
        debug!("agent targeting endpoint {}", config.endpoint);
        Agent {
            session: Mutex::new(Session::new(channel, config.session_mandatory)),
            page_registry: PageRegistry::new(),
            reported_modules: Mutex::new(HashSet::new()),
            live_threads: Mutex::new(HashSet::new()),
        }
    }

    pub fn page_registry(&self) -> Arc<PageRegistry> {
        self.page_registry.clone()
    }

    /// Lazily builds the state for a thread entering its first hook.
    pub fn new_thread_state(&self, thread_id: u32) -> ThreadState {
        self.live_threads.lock().unwrap().insert(thread_id);
        ThreadState {
            thread_id,
            segment: None,
            shadow: ShadowStack::new(),
            thunks: ThunkArena::new(self.page_registry.clone()),
            batch: None,
        }
    }

    /// Entry hook body. May rewrite `frame.return_address` when exit
    /// tracing is on.
    pub fn on_enter(&self, state: &mut ThreadState, frame: &mut EntryFrame) -> Result<()> {
        let _errors = LastErrorScope::save();
        let cycles = read_timestamp_counter();
        let Some(flags) = self.ensure_session(state)? else {
            return Ok(());
        };

        if flags & FLAG_ENTER_EXIT != 0 {
            self.emit(
                state,
                &Record::Enter {
                    return_address: frame.return_address,
                    function: frame.function,
                },
                cycles,
            )?;
            let thunk = state.thunks.acquire(Thunk {
                return_address: frame.return_address,
                function: frame.function,
                entry_cycles: cycles,
            });
            state.shadow.push(ShadowStackEntry {
                frame_ptr: frame.frame_ptr,
                return_address: frame.return_address,
                function: frame.function,
                entry_cycles: cycles,
            });
            frame.return_address = thunk;
        } else if flags & FLAG_BATCH_ENTER != 0 {
            self.batch_enter(state, frame, cycles)?;
        }
        Ok(())
    }

    /// Exit hook body: resolves the real return address, reclaims thunks
    /// and emits the `Exit` record. Returns the address to resume at.
    pub fn on_exit(&self, state: &mut ThreadState, stack_ptr: u32) -> Result<u32> {
        let _errors = LastErrorScope::save();
        let cycles = read_timestamp_counter();
        let entry = state
            .shadow
            .exit_at(stack_ptr)
            .context("exit hook with an empty shadow stack")?;
        // Thunks are reclaimed in stack order down to the surviving depth;
        // orphaned and tail-call thunks go back with the matched one.
        while state.thunks.depth() > state.shadow.depth() {
            state.thunks.release_top()?;
        }
        self.emit(
            state,
            &Record::Exit {
                return_address: entry.return_address,
                function: entry.function,
            },
            cycles,
        )?;
        Ok(entry.return_address)
    }

    /// Announces every not-yet-reported module with a `ProcessAttach`
    /// record.
    pub fn on_module_attach(&self, state: &mut ThreadState, modules: &[ModuleEvent]) -> Result<()> {
        let _errors = LastErrorScope::save();
        let cycles = read_timestamp_counter();
        if self.ensure_session(state)?.is_none() {
            return Ok(());
        }
        for module in modules {
            if !self.reported_modules.lock().unwrap().insert(module.info.base) {
                continue;
            }
            self.emit(
                state,
                &Record::ProcessAttach {
                    module: module.info,
                    module_name: module.name.clone(),
                    exe_path: module.exe_path.clone(),
                },
                cycles,
            )?;
        }
        Ok(())
    }

    /// A dying thread hands its buffer back without replacement.
    pub fn on_thread_detach(&self, state: &mut ThreadState) -> Result<()> {
        self.live_threads.lock().unwrap().remove(&state.thread_id);
        state.batch = None;
        if let Some(segment) = state.segment.take() {
            self.session.lock().unwrap().return_buffer(segment.detach())?;
        }
        Ok(())
    }

    /// Emits `ProcessDetach`, flushes the calling thread and closes the
    /// session.
    pub fn on_process_detach(&self, state: &mut ThreadState) -> Result<()> {
        if self.ensure_session(state)?.is_some() {
            let cycles = read_timestamp_counter();
            self.emit(state, &Record::ProcessDetach, cycles)?;
        }
        self.on_thread_detach(state)?;
        let stragglers = self.live_threads.lock().unwrap().len();
        if stragglers > 0 {
            warn!("{stragglers} thread(s) still live at process detach");
        }
        self.session.lock().unwrap().close()
    }

    /// Opens the session on first use and makes sure the thread has a
    /// segment. `None` means tracing is disabled.
    fn ensure_session(&self, state: &mut ThreadState) -> Result<Option<u32>> {
        let mut session = self.session.lock().unwrap();
        if let Some(buffer) = session.ensure_open()? {
            state.segment = Some(TraceFileSegment::new(state.thread_id, buffer)?);
        }
        let Some(flags) = session.flags() else {
            return Ok(None);
        };
        if state.segment.is_none() {
            let Some(buffer) = session.allocate()? else {
                return Ok(None);
            };
            state.segment = Some(TraceFileSegment::new(state.thread_id, buffer)?);
        }
        Ok(Some(flags))
    }

    /// Swaps the thread's full segment for a fresh one. Oversized records
    /// return the full buffer and request a large one instead.
    fn exchange_segment(&self, state: &mut ThreadState, min_payload: usize) -> Result<bool> {
        let Some(segment) = state.segment.take() else {
            return Ok(false);
        };
        state.batch = None;
        let full = segment.detach();
        let needed = (SEGMENT_HEADER_SIZE + PREFIX_SIZE + min_payload) as u32;
        let mut session = self.session.lock().unwrap();
        let fresh = if needed > full.size() {
            session.return_buffer(full)?;
            session.allocate_large(needed)?
        } else {
            session.exchange(full)?
        };
        match fresh {
            Some(buffer) => {
                state.segment = Some(TraceFileSegment::new(state.thread_id, buffer)?);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Appends one standalone record, exchanging the segment when full.
    fn emit(&self, state: &mut ThreadState, record: &Record, cycles: u64) -> Result<()> {
        let payload = record.encode_payload();
        let fits = state
            .segment
            .as_ref()
            .is_some_and(|s| s.can_allocate(payload.len()));
        if !fits && !self.exchange_segment(state, payload.len())? {
            return Ok(());
        }
        let segment = state.segment.as_mut().context("no segment after exchange")?;
        segment.allocate(record.record_type(), &payload, cycles)?;
        Ok(())
    }

    /// Adds one `(return address, function)` pair to the open batch,
    /// starting a new `BatchEnter` record as needed.
    fn batch_enter(&self, state: &mut ThreadState, frame: &EntryFrame, cycles: u64) -> Result<()> {
        let mut pair = [0u8; 8];
        pair[0..4].copy_from_slice(&frame.return_address.to_le_bytes());
        pair[4..8].copy_from_slice(&frame.function.to_le_bytes());

        if let (Some(offset), Some(segment)) = (state.batch, state.segment.as_mut()) {
            if segment.can_extend(pair.len()) {
                // Pair bytes first, count last; a torn write leaves a
                // shorter but valid batch.
                return segment.extend_record(offset, &pair, 4);
            }
        }

        let head = Record::BatchEnter {
            thread_id: state.thread_id,
            calls: vec![],
        }
        .encode_payload();
        let fits = state
            .segment
            .as_ref()
            .is_some_and(|s| s.can_allocate(head.len() + pair.len()));
        if !fits && !self.exchange_segment(state, head.len() + pair.len())? {
            return Ok(());
        }
        let segment = state.segment.as_mut().context("no segment after exchange")?;
        let offset = segment.allocate(RecordType::BatchEnter, &head, cycles)?;
        segment.extend_record(offset, &pair, 4)?;
        state.batch = Some(offset);
        Ok(())
    }
}
