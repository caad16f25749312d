//! The in-process tracing agent.
//!
//! Loaded into an instrumented binary, the agent services entry and exit
//! hooks: it batches call events into per-thread segments, keeps a shadow
//! stack so exit tracing can swizzle return addresses safely, and swaps full
//! buffers with the collector over a narrow request/reply channel. Each
//! thread owns its segment, shadow stack and thunk arena outright; the only
//! shared state is the session, the module set and the thunk-page registry,
//! each behind its own short-lived lock.

pub mod dispatch;
pub mod env_config;
pub mod segment;
pub mod session;
pub mod shadow_stack;
pub mod thunk_arena;

pub use dispatch::{Agent, EntryFrame, ModuleEvent, ThreadState};
pub use env_config::RpcConfig;
pub use segment::TraceFileSegment;
pub use session::{Buffer, CollectorChannel, Session, SessionHandle};
pub use shadow_stack::{ShadowStack, ShadowStackEntry};
pub use thunk_arena::{PageRegistry, ThunkArena};
