//! The buffer service.
//!
//! Implements the agent-facing channel: sessions own a pool of buffers
//! carved from large shared slabs, `ExchangeBuffer` drains the full segment
//! and recycles the memory in one step, and everything drained accumulates
//! into a per-session trace file.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use tracing::{debug, info};

use agent::session::{Buffer, CollectorChannel, SessionHandle};
use trace::header::TraceFileHeader;
use trace::segment::{SegmentHeader, TraceFileWriter, SEGMENT_HEADER_SIZE};

pub const DEFAULT_BUFFER_SIZE: u32 = 2 * 1024 * 1024;
/// Buffers carved from one slab before a new slab (new handle) is opened.
pub const BUFFERS_PER_SLAB: u32 = 16;

struct SessionState {
    /// Slab currently being carved: handle and next free offset.
    slab: u32,
    slab_cursor: u32,
    /// Recycled `(handle, offset, memory)` triples, reissued before any new
    /// carving.
    free: Vec<(u32, u32, Vec<u8>)>,
    /// Drained segments, arrival order.
    segments: Vec<Vec<u8>>,
    closed: bool,
}

struct ServiceState {
    next_session: u32,
    next_slab: u32,
    sessions: HashMap<u32, SessionState>,
}

pub struct CollectorService {
    buffer_size: u32,
    flags: u32,
    inner: Mutex<ServiceState>,
}

impl CollectorService {
    /// `flags` is the session flag mask handed to every client at
    /// `CreateSession`.
    pub fn new(buffer_size: u32, flags: u32) -> CollectorService {
        CollectorService {
            buffer_size,
            flags,
            inner: Mutex::new(ServiceState {
                next_session: 1,
                next_slab: 1,
                sessions: HashMap::new(),
            }),
        }
    }

    /// Number of drained segments held for `session`.
    pub fn segment_count(&self, session: SessionHandle) -> usize {
        self.inner
            .lock()
            .unwrap()
            .sessions
            .get(&session.0)
            .map_or(0, |s| s.segments.len())
    }

    /// Assembles the trace file for one session from everything drained so
    /// far.
    pub fn take_trace(&self, session: SessionHandle, header: &TraceFileHeader) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();
        let state = inner
            .sessions
            .get_mut(&session.0)
            .with_context(|| format!("no session {}", session.0))?;
        let mut writer = TraceFileWriter::new(header);
        for segment in state.segments.drain(..) {
            let Some(header) = SegmentHeader::parse(&segment) else {
                continue;
            };
            writer.append_segment(header.thread_id, &segment[SEGMENT_HEADER_SIZE..]);
        }
        Ok(writer.into_bytes())
    }

    fn drain(state: &mut SessionState, data: &[u8]) {
        let Some(header) = SegmentHeader::parse(data) else {
            return;
        };
        if header.segment_length == 0 {
            return;
        }
        let end = (SEGMENT_HEADER_SIZE + header.segment_length as usize).min(data.len());
        state.segments.push(data[..end].to_vec());
        debug!(
            "drained segment: thread {} holding {} bytes",
            header.thread_id, header.segment_length
        );
    }

    fn issue(&self, state: &mut SessionState, next_slab: &mut u32) -> Buffer {
        if let Some((handle, offset, mut data)) = state.free.pop() {
            data.iter_mut().for_each(|b| *b = 0);
            return Buffer {
                handle,
                offset,
                data,
            };
        }
        if state.slab_cursor >= BUFFERS_PER_SLAB * self.buffer_size {
            state.slab = *next_slab;
            *next_slab += 1;
            state.slab_cursor = 0;
        }
        let offset = state.slab_cursor;
        state.slab_cursor += self.buffer_size;
        Buffer {
            handle: state.slab,
            offset,
            data: vec![0; self.buffer_size as usize],
        }
    }
}

impl CollectorChannel for CollectorService {
    fn create_session(&self) -> Result<(SessionHandle, Buffer, u32)> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_session;
        inner.next_session += 1;
        let slab = inner.next_slab;
        inner.next_slab += 1;
        let mut state = SessionState {
            slab,
            slab_cursor: 0,
            free: Vec::new(),
            segments: Vec::new(),
            closed: false,
        };
        let mut next_slab = inner.next_slab;
        let buffer = self.issue(&mut state, &mut next_slab);
        inner.next_slab = next_slab;
        inner.sessions.insert(id, state);
        info!("session {id} created, flags {:#x}", self.flags);
        Ok((SessionHandle(id), buffer, self.flags))
    }

    fn allocate_buffer(&self, session: SessionHandle) -> Result<Buffer> {
        let mut inner = self.inner.lock().unwrap();
        let mut next_slab = inner.next_slab;
        let state = open_session(&mut inner.sessions, session)?;
        let buffer = self.issue(state, &mut next_slab);
        inner.next_slab = next_slab;
        Ok(buffer)
    }

    fn allocate_large_buffer(&self, session: SessionHandle, min_size: u32) -> Result<Buffer> {
        let mut inner = self.inner.lock().unwrap();
        open_session(&mut inner.sessions, session)?;
        // Large buffers get a slab of their own and are never pooled.
        let handle = inner.next_slab;
        inner.next_slab += 1;
        let size = min_size.max(self.buffer_size);
        Ok(Buffer {
            handle,
            offset: 0,
            data: vec![0; size as usize],
        })
    }

    fn exchange_buffer(&self, session: SessionHandle, full: Buffer) -> Result<Buffer> {
        let mut inner = self.inner.lock().unwrap();
        let mut next_slab = inner.next_slab;
        let state = open_session(&mut inner.sessions, session)?;
        Self::drain(state, &full.data);
        state.free.push((full.handle, full.offset, full.data));
        let buffer = self.issue(state, &mut next_slab);
        inner.next_slab = next_slab;
        Ok(buffer)
    }

    fn return_buffer(&self, session: SessionHandle, buffer: Buffer) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let state = open_session(&mut inner.sessions, session)?;
        Self::drain(state, &buffer.data);
        state.free.push((buffer.handle, buffer.offset, buffer.data));
        Ok(())
    }

    fn close_session(&self, session: SessionHandle) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let state = open_session(&mut inner.sessions, session)?;
        state.closed = true;
        info!("session {} closed", session.0);
        Ok(())
    }
}

fn open_session(
    sessions: &mut HashMap<u32, SessionState>,
    session: SessionHandle,
) -> Result<&mut SessionState> {
    let state = sessions
        .get_mut(&session.0)
        .with_context(|| format!("no session {}", session.0))?;
    if state.closed {
        bail!("session {} is closed", session.0);
    }
    Ok(state)
}
