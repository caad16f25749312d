//! Segments and whole-file framing.
//!
//! A segment is one thread's record stream: an 8-byte segment header, the
//! records, then padding out to the next block boundary. Readers must cope
//! with segments whose tail was never committed (the writing thread died
//! mid-record), so iteration stops at the first record whose size is zero or
//! reaches past `segment_length`.

use anyhow::Result;
use tracing::debug;

use crate::header::TraceFileHeader;
use crate::record::{RecordPrefix, PREFIX_SIZE};
use crate::TRACE_BLOCK_SIZE;

pub const SEGMENT_HEADER_SIZE: usize = 8;

/// Thread id plus the committed length of the record stream that follows.
/// `segment_length` covers the records only, not this header or the padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentHeader {
    pub thread_id: u32,
    pub segment_length: u32,
}

impl SegmentHeader {
    pub fn parse(bytes: &[u8]) -> Option<SegmentHeader> {
        let bytes = bytes.get(..SEGMENT_HEADER_SIZE)?;
        Some(SegmentHeader {
            thread_id: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            segment_length: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
        })
    }

    pub fn write_into(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.thread_id.to_le_bytes());
        out[4..8].copy_from_slice(&self.segment_length.to_le_bytes());
    }
}

/// Iterates the records of one segment, yielding each prefix and its payload
/// bytes. Stops silently at torn tails.
pub struct SegmentRecords<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SegmentRecords<'a> {
    /// `data` is the record stream only, `segment_length` bytes of it.
    pub fn new(data: &'a [u8]) -> SegmentRecords<'a> {
        SegmentRecords { data, pos: 0 }
    }
}

impl<'a> Iterator for SegmentRecords<'a> {
    type Item = (RecordPrefix, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let rest = self.data.get(self.pos..)?;
        if rest.len() < PREFIX_SIZE {
            return None;
        }
        let prefix = RecordPrefix::parse(rest).ok()?;
        let size = prefix.size as usize;
        // The prefix size is written last; zero or overrun means the record
        // was never committed.
        if size < PREFIX_SIZE || size > rest.len() {
            return None;
        }
        let payload = &rest[PREFIX_SIZE..size];
        self.pos += size;
        Some((prefix, payload))
    }
}

/// Streams a trace file into memory: header first, then block-aligned
/// segments.
pub struct TraceFileWriter {
    bytes: Vec<u8>,
}

impl TraceFileWriter {
    pub fn new(header: &TraceFileHeader) -> TraceFileWriter {
        TraceFileWriter {
            bytes: header.encode(),
        }
    }

    /// Appends one segment. `records` is the already-encoded record stream.
    pub fn append_segment(&mut self, thread_id: u32, records: &[u8]) {
        let header = SegmentHeader {
            thread_id,
            segment_length: records.len() as u32,
        };
        let start = self.bytes.len();
        self.bytes
            .resize(start + SEGMENT_HEADER_SIZE + records.len(), 0);
        header.write_into(&mut self.bytes[start..]);
        self.bytes[start + SEGMENT_HEADER_SIZE..].copy_from_slice(records);
        let padded = common::align_up(self.bytes.len() as u32, TRACE_BLOCK_SIZE) as usize;
        self.bytes.resize(padded, 0);
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Reader over a complete (or torn) trace file held in memory.
pub struct TraceFileReader<'a> {
    pub header: TraceFileHeader,
    data: &'a [u8],
    first_segment: usize,
}

impl<'a> TraceFileReader<'a> {
    pub fn parse(data: &'a [u8]) -> Result<TraceFileReader<'a>> {
        let (header, first_segment) = TraceFileHeader::parse(data)?;
        debug!(
            "trace file: process {} module {:#x}, segments start at {:#x}",
            header.process_id, header.module_base, first_segment
        );
        Ok(TraceFileReader {
            header,
            data,
            first_segment,
        })
    }

    pub fn segments(&self) -> SegmentIter<'a> {
        SegmentIter {
            data: self.data,
            pos: self.first_segment,
        }
    }
}

pub struct SegmentIter<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for SegmentIter<'a> {
    type Item = (SegmentHeader, SegmentRecords<'a>);

    fn next(&mut self) -> Option<Self::Item> {
        let header = SegmentHeader::parse(self.data.get(self.pos..)?)?;
        // All-zero padding at the end of the file is not a segment.
        if header.thread_id == 0 && header.segment_length == 0 {
            return None;
        }
        let records_start = self.pos + SEGMENT_HEADER_SIZE;
        let records_end = (records_start + header.segment_length as usize).min(self.data.len());
        let records = SegmentRecords::new(&self.data[records_start..records_end]);
        self.pos = common::align_up(records_end as u32, TRACE_BLOCK_SIZE) as usize;
        Some((header, records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Record, RecordType};

    fn enter(i: u32) -> Record {
        Record::Enter {
            return_address: 0x1000 + i,
            function: 0x2000 + i,
        }
    }

    #[test]
    fn exact_record_count_and_length() {
        let mut stream = Vec::new();
        let n = 5;
        for i in 0..n {
            stream.extend_from_slice(&enter(i).encode(i as u64));
        }
        let mut writer = TraceFileWriter::new(&TraceFileHeader::default());
        writer.append_segment(77, &stream);
        let bytes = writer.into_bytes();

        let reader = TraceFileReader::parse(&bytes).unwrap();
        let (header, records) = reader.segments().next().unwrap();
        assert_eq!(header.thread_id, 77);
        let records: Vec<_> = records.collect();
        assert_eq!(records.len(), n as usize);
        let total: u32 = records.iter().map(|(p, _)| p.size).sum();
        assert_eq!(header.segment_length, total);
        for (i, (prefix, payload)) in records.iter().enumerate() {
            assert_eq!(prefix.record_type, RecordType::Enter as u16);
            let record = Record::decode(prefix, payload).unwrap();
            assert_eq!(record, enter(i as u32));
        }
    }

    #[test]
    fn torn_tail_stops_iteration() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&enter(0).encode(0));
        let good = stream.len();
        // A reservation whose prefix size was never committed.
        stream.extend_from_slice(&[0u8; PREFIX_SIZE + 8]);

        let mut segment = vec![0u8; SEGMENT_HEADER_SIZE];
        SegmentHeader {
            thread_id: 1,
            segment_length: stream.len() as u32,
        }
        .write_into(&mut segment);
        segment.extend_from_slice(&stream);

        let records: Vec<_> = SegmentRecords::new(&segment[SEGMENT_HEADER_SIZE..]).collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0.size as usize, good);
    }

    #[test]
    fn oversized_record_stops_iteration() {
        let mut bytes = enter(0).encode(0);
        // Claim more bytes than the segment holds.
        bytes[8..12].copy_from_slice(&0x4000u32.to_le_bytes());
        assert_eq!(SegmentRecords::new(&bytes).count(), 0);
    }

    #[test]
    fn multiple_segments_are_block_aligned() {
        let mut writer = TraceFileWriter::new(&TraceFileHeader::default());
        writer.append_segment(1, &enter(1).encode(0));
        writer.append_segment(2, &enter(2).encode(0));
        let bytes = writer.into_bytes();
        assert_eq!(bytes.len() % TRACE_BLOCK_SIZE as usize, 0);

        let reader = TraceFileReader::parse(&bytes).unwrap();
        let ids: Vec<u32> = reader.segments().map(|(h, _)| h.thread_id).collect();
        assert_eq!(ids, vec![1, 2]);
    }
}
