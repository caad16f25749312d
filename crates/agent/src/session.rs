//! The collector session.
//!
//! All traffic to the collector goes through the five methods of
//! [`CollectorChannel`]. Buffers move by value: the collector hands out a
//! `(handle, offset, bytes)` view of one of its slabs and receives it back
//! on exchange or return. A handle is "mapped" the first time it is seen
//! and the mapping is validated on every later sighting.
//!
//! Session failures follow one policy everywhere: when the configuration
//! marks the session mandatory the error propagates (the host process is
//! expected to abort); otherwise the session flips to a sticky disabled
//! state and every later request becomes a no-op.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Error, Result};
use tracing::{debug, warn};

/// Opaque collector-side session identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub u32);

/// Session flag: record entries only, batched per thread.
pub const FLAG_BATCH_ENTER: u32 = 0x0001;
/// Session flag: record matched enter/exit pairs.
pub const FLAG_ENTER_EXIT: u32 = 0x0002;

/// One collector-issued buffer: the identity triple plus the bytes it maps
/// to. `offset` locates the buffer inside the slab named by `handle`.
#[derive(Debug)]
pub struct Buffer {
    pub handle: u32,
    pub offset: u32,
    pub data: Vec<u8>,
}

impl Buffer {
    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }
}

/// The five-method request/reply surface the collector exposes. All calls
/// are synchronous and may block.
pub trait CollectorChannel: Send + Sync {
    /// Opens a session. Returns the handle, the first buffer and the flag
    /// bitmask the collector chose for this client.
    fn create_session(&self) -> Result<(SessionHandle, Buffer, u32)>;

    fn allocate_buffer(&self, session: SessionHandle) -> Result<Buffer>;

    /// Allocates a buffer of at least `min_size` bytes for records that do
    /// not fit a default buffer.
    fn allocate_large_buffer(&self, session: SessionHandle, min_size: u32) -> Result<Buffer>;

    /// Hands `full` to the collector for draining and returns a fresh
    /// buffer in one round trip.
    fn exchange_buffer(&self, session: SessionHandle, full: Buffer) -> Result<Buffer>;

    /// Returns a buffer without replacement, e.g. at thread exit.
    fn return_buffer(&self, session: SessionHandle, buffer: Buffer) -> Result<()>;

    fn close_session(&self, session: SessionHandle) -> Result<()>;
}

enum State {
    Closed,
    Open { handle: SessionHandle, flags: u32 },
    Disabled,
}

pub struct Session {
    channel: Arc<dyn CollectorChannel>,
    mandatory: bool,
    state: State,
    /// handle -> slab extent seen at first mapping. Handles are mapped at
    /// most once per process; later buffers on the same handle must fit the
    /// recorded extent.
    mappings: HashMap<u32, u32>,
}

impl Session {
    pub fn new(channel: Arc<dyn CollectorChannel>, mandatory: bool) -> Session {
        Session {
            channel,
            mandatory,
            state: State::Closed,
            mappings: HashMap::new(),
        }
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self.state, State::Disabled)
    }

    /// Flags chosen by the collector, once open.
    pub fn flags(&self) -> Option<u32> {
        match self.state {
            State::Open { flags, .. } => Some(flags),
            _ => None,
        }
    }

    /// Opens the session if it is still closed. Returns the first buffer
    /// when this call performed the open, `None` when the session was
    /// already open or is disabled.
    pub fn ensure_open(&mut self) -> Result<Option<Buffer>> {
        match self.state {
            State::Closed => {}
            State::Open { .. } | State::Disabled => return Ok(None),
        }
        match self.channel.create_session() {
            Ok((handle, buffer, flags)) => {
                debug!("session {} open, flags {flags:#x}", handle.0);
                self.state = State::Open { handle, flags };
                self.note_mapping(&buffer)?;
                Ok(Some(buffer))
            }
            Err(err) => self.fail(err.context("CreateSession failed")),
        }
    }

    pub fn allocate(&mut self) -> Result<Option<Buffer>> {
        let Some(handle) = self.open_handle() else {
            return Ok(None);
        };
        match self.channel.allocate_buffer(handle) {
            Ok(buffer) => {
                self.note_mapping(&buffer)?;
                Ok(Some(buffer))
            }
            Err(err) => self.fail(err.context("AllocateBuffer failed")),
        }
    }

    pub fn allocate_large(&mut self, min_size: u32) -> Result<Option<Buffer>> {
        let Some(handle) = self.open_handle() else {
            return Ok(None);
        };
        match self.channel.allocate_large_buffer(handle, min_size) {
            Ok(buffer) => {
                self.note_mapping(&buffer)?;
                Ok(Some(buffer))
            }
            Err(err) => self.fail(err.context("AllocateLargeBuffer failed")),
        }
    }

    /// Swaps a full buffer for a fresh one. The full buffer is dropped when
    /// the session is disabled.
    pub fn exchange(&mut self, full: Buffer) -> Result<Option<Buffer>> {
        let Some(handle) = self.open_handle() else {
            return Ok(None);
        };
        match self.channel.exchange_buffer(handle, full) {
            Ok(buffer) => {
                self.note_mapping(&buffer)?;
                Ok(Some(buffer))
            }
            Err(err) => self.fail(err.context("ExchangeBuffer failed")),
        }
    }

    pub fn return_buffer(&mut self, buffer: Buffer) -> Result<()> {
        let Some(handle) = self.open_handle() else {
            return Ok(());
        };
        match self.channel.return_buffer(handle, buffer) {
            Ok(()) => Ok(()),
            Err(err) => self.fail(err.context("ReturnBuffer failed")).map(|_: Option<()>| ()),
        }
    }

    pub fn close(&mut self) -> Result<()> {
        if let State::Open { handle, .. } = self.state {
            self.state = State::Closed;
            self.channel.close_session(handle)?;
        }
        Ok(())
    }

    fn open_handle(&self) -> Option<SessionHandle> {
        match self.state {
            State::Open { handle, .. } => Some(handle),
            _ => None,
        }
    }

    fn note_mapping(&mut self, buffer: &Buffer) -> Result<()> {
        let end = buffer.offset + buffer.size();
        match self.mappings.get_mut(&buffer.handle) {
            None => {
                debug!("mapping slab handle {} ({} bytes in view)", buffer.handle, end);
                self.mappings.insert(buffer.handle, end);
            }
            Some(extent) => {
                // Already mapped; just grow the known extent.
                *extent = (*extent).max(end);
            }
        }
        Ok(())
    }

    /// Mandatory sessions propagate the failure; optional ones go quiet.
    fn fail<T>(&mut self, err: Error) -> Result<Option<T>> {
        if self.mandatory {
            bail!(err.context("collector session is mandatory"));
        }
        warn!("disabling tracing: {err:#}");
        self.state = State::Disabled;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyChannel {
        fail_create: bool,
        allocations: AtomicU32,
    }

    impl CollectorChannel for FlakyChannel {
        fn create_session(&self) -> Result<(SessionHandle, Buffer, u32)> {
            if self.fail_create {
                bail!("endpoint not listening");
            }
            Ok((
                SessionHandle(1),
                Buffer {
                    handle: 10,
                    offset: 0,
                    data: vec![0; 256],
                },
                FLAG_BATCH_ENTER,
            ))
        }

        fn allocate_buffer(&self, _session: SessionHandle) -> Result<Buffer> {
            let n = self.allocations.fetch_add(1, Ordering::SeqCst);
            Ok(Buffer {
                handle: 10,
                offset: 256 * (n + 1),
                data: vec![0; 256],
            })
        }

        fn allocate_large_buffer(&self, _session: SessionHandle, min_size: u32) -> Result<Buffer> {
            Ok(Buffer {
                handle: 11,
                offset: 0,
                data: vec![0; min_size as usize],
            })
        }

        fn exchange_buffer(&self, session: SessionHandle, _full: Buffer) -> Result<Buffer> {
            self.allocate_buffer(session)
        }

        fn return_buffer(&self, _session: SessionHandle, _buffer: Buffer) -> Result<()> {
            Ok(())
        }

        fn close_session(&self, _session: SessionHandle) -> Result<()> {
            Ok(())
        }
    }

    fn channel(fail_create: bool) -> Arc<FlakyChannel> {
        Arc::new(FlakyChannel {
            fail_create,
            allocations: AtomicU32::new(0),
        })
    }

    #[test]
    fn open_yields_first_buffer_once() {
        let mut session = Session::new(channel(false), false);
        let first = session.ensure_open().unwrap();
        assert!(first.is_some());
        assert_eq!(session.flags(), Some(FLAG_BATCH_ENTER));
        assert!(session.ensure_open().unwrap().is_none());
    }

    #[test]
    fn optional_session_goes_sticky_disabled() {
        let mut session = Session::new(channel(true), false);
        assert!(session.ensure_open().unwrap().is_none());
        assert!(session.is_disabled());
        // Every later request is a quiet no-op.
        assert!(session.allocate().unwrap().is_none());
        assert!(session
            .exchange(Buffer {
                handle: 0,
                offset: 0,
                data: vec![],
            })
            .unwrap()
            .is_none());
    }

    #[test]
    fn mandatory_session_propagates_the_failure() {
        let mut session = Session::new(channel(true), true);
        assert!(session.ensure_open().is_err());
    }

    #[test]
    fn slab_handle_is_mapped_once() {
        let mut session = Session::new(channel(false), false);
        session.ensure_open().unwrap();
        session.allocate().unwrap();
        session.allocate().unwrap();
        // Two buffers on slab 10 share one mapping entry.
        assert_eq!(session.mappings.len(), 1);
        assert!(session.mappings[&10] >= 512);
    }
}
