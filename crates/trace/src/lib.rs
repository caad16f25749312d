//! The call-trace wire format.
//!
//! Everything the agent writes and the collector reads is a stream of
//! prefix-tagged records, grouped into per-thread segments, preceded by a
//! trace-file header. All numeric fields are little-endian; this crate owns
//! the exact byte layouts so the writer and reader sides cannot drift.

pub mod header;
pub mod record;
pub mod segment;

pub use header::{ClockInfo, ClockReference, CpuInfo, MemoryInfo, OsInfo, TraceFileHeader};
pub use record::{
    InvocationInfo, ModuleInfo, Record, RecordPrefix, RecordType, PREFIX_SIZE, TRACE_VERSION_HI,
    TRACE_VERSION_LO,
};
pub use segment::{SegmentHeader, SegmentRecords, TraceFileReader, TraceFileWriter, SEGMENT_HEADER_SIZE};

/// Trace files are laid out in blocks of this size: the header is padded to
/// a block boundary and every segment starts on one.
pub const TRACE_BLOCK_SIZE: u32 = 1024;
