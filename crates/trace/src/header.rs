//! The trace-file header.
//!
//! One of these opens every trace file. The fixed part stamps the writing
//! process and its host machine; the clock-info triple lets consumers convert
//! per-record TSC timestamps to wall-clock time; the variable blob carries
//! the instrumented-module path, the command line and the environment block.

use anyhow::{bail, Context, Result};

use crate::record::Cursor;
use crate::TRACE_BLOCK_SIZE;

/// Exactly these four bytes open every trace file.
pub const TRACE_MAGIC: [u8; 4] = *b"SZGY";

pub const SERVER_VERSION_HI: u16 = 1;
pub const SERVER_VERSION_LO: u16 = 0;

/// Fixed-size part of the header, before the blob.
const FIXED_SIZE: usize = 116;

/// OS stamp of the machine the trace was written on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OsInfo {
    pub version_major: u32,
    pub version_minor: u32,
    pub build_number: u32,
    pub platform_id: u32,
}

/// CPU stamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuInfo {
    pub architecture: u16,
    pub level: u16,
    pub revision: u16,
    pub processor_count: u16,
}

/// Memory status at trace start, megabyte granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryInfo {
    pub load_percent: u32,
    pub total_physical_mb: u32,
    pub available_physical_mb: u32,
}

/// A matched `(wall clock, ticks, tsc)` observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClockReference {
    pub file_time: u64,
    pub ticks: u64,
    pub tsc: u64,
}

/// Frequencies plus one matched reading of all three clocks. TSC timestamps
/// in records are converted to wall clock by extrapolating from the
/// reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClockInfo {
    pub tick_frequency: u64,
    pub tsc_frequency: u64,
    pub reference: ClockReference,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TraceFileHeader {
    pub process_id: u32,
    pub module_base: u32,
    pub module_size: u32,
    pub module_checksum: u32,
    pub module_timestamp: u32,
    pub os: OsInfo,
    pub cpu: CpuInfo,
    pub memory: MemoryInfo,
    pub clock: ClockInfo,
    pub module_path: String,
    pub command_line: String,
    pub environment: Vec<String>,
}

impl TraceFileHeader {
    /// Serializes the header, padded out to a whole number of trace blocks.
    pub fn encode(&self) -> Vec<u8> {
        let blob = self.encode_blob();
        let header_size = (FIXED_SIZE + blob.len()) as u32;

        let mut out = Vec::with_capacity(header_size as usize);
        out.extend_from_slice(&TRACE_MAGIC);
        out.extend_from_slice(&SERVER_VERSION_HI.to_le_bytes());
        out.extend_from_slice(&SERVER_VERSION_LO.to_le_bytes());
        out.extend_from_slice(&header_size.to_le_bytes());
        out.extend_from_slice(&TRACE_BLOCK_SIZE.to_le_bytes());
        out.extend_from_slice(&self.process_id.to_le_bytes());
        out.extend_from_slice(&self.module_base.to_le_bytes());
        out.extend_from_slice(&self.module_size.to_le_bytes());
        out.extend_from_slice(&self.module_checksum.to_le_bytes());
        out.extend_from_slice(&self.module_timestamp.to_le_bytes());
        out.extend_from_slice(&self.os.version_major.to_le_bytes());
        out.extend_from_slice(&self.os.version_minor.to_le_bytes());
        out.extend_from_slice(&self.os.build_number.to_le_bytes());
        out.extend_from_slice(&self.os.platform_id.to_le_bytes());
        out.extend_from_slice(&self.cpu.architecture.to_le_bytes());
        out.extend_from_slice(&self.cpu.level.to_le_bytes());
        out.extend_from_slice(&self.cpu.revision.to_le_bytes());
        out.extend_from_slice(&self.cpu.processor_count.to_le_bytes());
        out.extend_from_slice(&self.memory.load_percent.to_le_bytes());
        out.extend_from_slice(&self.memory.total_physical_mb.to_le_bytes());
        out.extend_from_slice(&self.memory.available_physical_mb.to_le_bytes());
        out.extend_from_slice(&self.clock.tick_frequency.to_le_bytes());
        out.extend_from_slice(&self.clock.tsc_frequency.to_le_bytes());
        out.extend_from_slice(&self.clock.reference.file_time.to_le_bytes());
        out.extend_from_slice(&self.clock.reference.ticks.to_le_bytes());
        out.extend_from_slice(&self.clock.reference.tsc.to_le_bytes());
        out.extend_from_slice(&(blob.len() as u32).to_le_bytes());
        debug_assert_eq!(out.len(), FIXED_SIZE);
        out.extend_from_slice(&blob);

        let padded = common::align_up(out.len() as u32, TRACE_BLOCK_SIZE) as usize;
        out.resize(padded, 0);
        out
    }

    /// Parses a header from the start of a trace file. Returns the header
    /// and the file offset of the first segment.
    pub fn parse(data: &[u8]) -> Result<(TraceFileHeader, usize)> {
        if data.len() < FIXED_SIZE {
            bail!("trace file too short for a header");
        }
        if data[0..4] != TRACE_MAGIC {
            bail!("bad trace magic {:02x?}", &data[0..4]);
        }
        let mut cursor = Cursor::new(&data[4..]);
        let version_hi = cursor.u16()?;
        let version_lo = cursor.u16()?;
        if version_hi != SERVER_VERSION_HI {
            bail!("unsupported trace version {version_hi}.{version_lo}");
        }
        let header_size = cursor.u32()? as usize;
        let block_size = cursor.u32()?;
        if block_size != TRACE_BLOCK_SIZE {
            bail!("unsupported trace block size {block_size}");
        }
        let mut header = TraceFileHeader {
            process_id: cursor.u32()?,
            module_base: cursor.u32()?,
            module_size: cursor.u32()?,
            module_checksum: cursor.u32()?,
            module_timestamp: cursor.u32()?,
            os: OsInfo {
                version_major: cursor.u32()?,
                version_minor: cursor.u32()?,
                build_number: cursor.u32()?,
                platform_id: cursor.u32()?,
            },
            cpu: CpuInfo {
                architecture: cursor.u16()?,
                level: cursor.u16()?,
                revision: cursor.u16()?,
                processor_count: cursor.u16()?,
            },
            memory: MemoryInfo {
                load_percent: cursor.u32()?,
                total_physical_mb: cursor.u32()?,
                available_physical_mb: cursor.u32()?,
            },
            clock: ClockInfo {
                tick_frequency: cursor.u64()?,
                tsc_frequency: cursor.u64()?,
                reference: ClockReference {
                    file_time: cursor.u64()?,
                    ticks: cursor.u64()?,
                    tsc: cursor.u64()?,
                },
            },
            ..TraceFileHeader::default()
        };
        let blob_len = cursor.u32()? as usize;
        if FIXED_SIZE + blob_len != header_size {
            bail!("header size {header_size} disagrees with blob length {blob_len}");
        }
        let blob = data
            .get(FIXED_SIZE..FIXED_SIZE + blob_len)
            .context("trace header blob truncated")?;
        header.decode_blob(blob)?;

        let first_segment = common::align_up(header_size as u32, TRACE_BLOCK_SIZE) as usize;
        Ok((header, first_segment))
    }

    /// module path NUL, command line NUL, environment strings each NUL, the
    /// whole environment terminated by one extra NUL.
    fn encode_blob(&self) -> Vec<u8> {
        let mut blob = Vec::new();
        blob.extend_from_slice(self.module_path.as_bytes());
        blob.push(0);
        blob.extend_from_slice(self.command_line.as_bytes());
        blob.push(0);
        for entry in &self.environment {
            blob.extend_from_slice(entry.as_bytes());
            blob.push(0);
        }
        blob.push(0);
        blob
    }

    fn decode_blob(&mut self, blob: &[u8]) -> Result<()> {
        let mut cursor = Cursor::new(blob);
        self.module_path = cursor.cstr()?;
        self.command_line = cursor.cstr()?;
        self.environment.clear();
        loop {
            let entry = cursor.cstr().context("environment block unterminated")?;
            if entry.is_empty() {
                break;
            }
            self.environment.push(entry);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TraceFileHeader {
        TraceFileHeader {
            process_id: 1234,
            module_base: 0x1000_0000,
            module_size: 0x0002_0000,
            module_checksum: 0xcafe_f00d,
            module_timestamp: 0x5f5e_1000,
            os: OsInfo {
                version_major: 10,
                version_minor: 0,
                build_number: 19045,
                platform_id: 2,
            },
            cpu: CpuInfo {
                architecture: 0,
                level: 6,
                revision: 0x9702,
                processor_count: 8,
            },
            memory: MemoryInfo {
                load_percent: 40,
                total_physical_mb: 16384,
                available_physical_mb: 9000,
            },
            clock: ClockInfo {
                tick_frequency: 10_000_000,
                tsc_frequency: 3_000_000_000,
                reference: ClockReference {
                    file_time: 0x01d9_0000_0000_0000,
                    ticks: 555,
                    tsc: 777,
                },
            },
            module_path: "C:\\app\\target.dll".into(),
            command_line: "host.exe --run".into(),
            environment: vec!["PATH=C:\\bin".into(), "TMP=C:\\tmp".into()],
        }
    }

    #[test]
    fn header_round_trips_and_is_block_padded() {
        let header = sample();
        let bytes = header.encode();
        assert_eq!(bytes.len() % TRACE_BLOCK_SIZE as usize, 0);
        assert_eq!(&bytes[0..4], b"SZGY");
        let (back, first_segment) = TraceFileHeader::parse(&bytes).unwrap();
        assert_eq!(back, header);
        assert_eq!(first_segment, bytes.len());
    }

    #[test]
    fn empty_environment_round_trips() {
        let mut header = sample();
        header.environment.clear();
        let bytes = header.encode();
        let (back, _) = TraceFileHeader::parse(&bytes).unwrap();
        assert!(back.environment.is_empty());
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let mut bytes = sample().encode();
        bytes[0] = b'X';
        assert!(TraceFileHeader::parse(&bytes).is_err());
    }
}
