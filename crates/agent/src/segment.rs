//! The per-thread segment allocator.
//!
//! One of these sits on every traced thread's hot path. It owns the current
//! collector buffer and carves records out of it front to back. Commit
//! ordering matters: a thread can die between any two stores, and the
//! collector must then see either no record or a whole one. Payload bytes
//! land first, the prefix second, the segment header's committed length
//! last; enclosure counts (batch records) are bumped after the bytes they
//! cover are in place.

use anyhow::{bail, Result};

use trace::record::{RecordPrefix, RecordType, PREFIX_SIZE};
use trace::segment::{SegmentHeader, SegmentRecords, SEGMENT_HEADER_SIZE};

use crate::session::Buffer;

pub struct TraceFileSegment {
    thread_id: u32,
    buffer: Buffer,
    /// Next free byte, measured from the start of the buffer.
    write: usize,
}

impl TraceFileSegment {
    /// Takes ownership of a collector buffer and stamps an empty segment
    /// header into it.
    pub fn new(thread_id: u32, mut buffer: Buffer) -> Result<TraceFileSegment> {
        if buffer.data.len() < SEGMENT_HEADER_SIZE + PREFIX_SIZE {
            bail!(
                "buffer of {} bytes is too small for a segment",
                buffer.data.len()
            );
        }
        SegmentHeader {
            thread_id,
            segment_length: 0,
        }
        .write_into(&mut buffer.data);
        Ok(TraceFileSegment {
            thread_id,
            buffer,
            write: SEGMENT_HEADER_SIZE,
        })
    }

    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    /// True iff a record with `payload_len` payload bytes still fits.
    pub fn can_allocate(&self, payload_len: usize) -> bool {
        self.write + PREFIX_SIZE + payload_len <= self.buffer.data.len()
    }

    /// True iff the tail record can grow by `extra` bytes.
    pub fn can_extend(&self, extra: usize) -> bool {
        self.write + extra <= self.buffer.data.len()
    }

    /// Bytes in use, segment header included.
    pub fn used_bytes(&self) -> usize {
        self.write
    }

    pub fn header(&self) -> SegmentHeader {
        SegmentHeader::parse(&self.buffer.data).unwrap_or_default()
    }

    /// Appends one record and commits it. Returns the record's offset
    /// within the buffer, which stays valid until the segment is detached.
    pub fn allocate(
        &mut self,
        record_type: RecordType,
        payload: &[u8],
        timestamp: u64,
    ) -> Result<usize> {
        if !self.can_allocate(payload.len()) {
            bail!(
                "record of {} payload bytes does not fit ({} free)",
                payload.len(),
                self.buffer.data.len() - self.write
            );
        }
        let record_offset = self.write;
        let size = PREFIX_SIZE + payload.len();

        // Payload first.
        self.buffer.data[record_offset + PREFIX_SIZE..record_offset + size]
            .copy_from_slice(payload);
        // Prefix second; its size field is what makes the record visible.
        let prefix = RecordPrefix::new(record_type, payload.len(), timestamp);
        prefix.write_into(&mut self.buffer.data[record_offset..record_offset + PREFIX_SIZE]);
        // Committed length last.
        self.write += size;
        self.commit_length();
        Ok(record_offset)
    }

    /// Grows the record at `record_offset` by `extra` bytes and bumps the
    /// u32 enclosure counter at `count_offset` into its payload. The record
    /// must be the most recently allocated one.
    pub fn extend_record(
        &mut self,
        record_offset: usize,
        extra: &[u8],
        count_offset: usize,
    ) -> Result<()> {
        let prefix_bytes = &self.buffer.data[record_offset..record_offset + PREFIX_SIZE];
        let prefix = RecordPrefix::parse(prefix_bytes)?;
        if record_offset + prefix.size as usize != self.write {
            bail!("only the last record in a segment can grow");
        }
        if self.write + extra.len() > self.buffer.data.len() {
            bail!("segment is full");
        }

        // New bytes first.
        self.buffer.data[self.write..self.write + extra.len()].copy_from_slice(extra);
        // Then the record size, then the committed length, then the count;
        // a reader racing a dead writer sees a consistent enclosure at
        // every step.
        let new_size = prefix.size + extra.len() as u32;
        self.buffer.data[record_offset + 8..record_offset + 12]
            .copy_from_slice(&new_size.to_le_bytes());
        self.write += extra.len();
        self.commit_length();
        let count_at = record_offset + PREFIX_SIZE + count_offset;
        let count = u32::from_le_bytes(self.buffer.data[count_at..count_at + 4].try_into().unwrap());
        self.buffer.data[count_at..count_at + 4].copy_from_slice(&(count + 1).to_le_bytes());
        Ok(())
    }

    /// Iterates the committed records, for inspection.
    pub fn records(&self) -> SegmentRecords<'_> {
        SegmentRecords::new(&self.buffer.data[SEGMENT_HEADER_SIZE..self.write])
    }

    /// Releases the buffer, e.g. for `ExchangeBuffer` or `ReturnBuffer`.
    pub fn detach(self) -> Buffer {
        self.buffer
    }

    fn commit_length(&mut self) {
        let length = (self.write - SEGMENT_HEADER_SIZE) as u32;
        self.buffer.data[4..8].copy_from_slice(&length.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trace::record::Record;

    fn buffer(size: usize) -> Buffer {
        Buffer {
            handle: 1,
            offset: 0,
            data: vec![0; size],
        }
    }

    fn enter(i: u32) -> Record {
        Record::Enter {
            return_address: 0x1000 + i,
            function: 0x2000 + i,
        }
    }

    #[test]
    fn exactly_n_records_after_n_allocations() {
        let mut segment = TraceFileSegment::new(9, buffer(512)).unwrap();
        let n = 6;
        for i in 0..n {
            let payload = enter(i).encode_payload();
            assert!(segment.can_allocate(payload.len()));
            segment.allocate(RecordType::Enter, &payload, i as u64).unwrap();
        }
        let records: Vec<_> = segment.records().collect();
        assert_eq!(records.len(), n as usize);
        let total: u32 = records.iter().map(|(p, _)| p.size).sum();
        assert_eq!(segment.header().segment_length, total);
        assert_eq!(segment.used_bytes(), total as usize + SEGMENT_HEADER_SIZE);
        for (i, (prefix, payload)) in records.iter().enumerate() {
            assert_eq!(Record::decode(prefix, payload).unwrap(), enter(i as u32));
        }
    }

    #[test]
    fn can_allocate_is_exact_at_the_boundary() {
        let size = SEGMENT_HEADER_SIZE + 2 * (PREFIX_SIZE + 8);
        let mut segment = TraceFileSegment::new(1, buffer(size)).unwrap();
        assert!(segment.can_allocate(8));
        segment
            .allocate(RecordType::Enter, &enter(0).encode_payload(), 0)
            .unwrap();
        assert!(segment.can_allocate(8));
        segment
            .allocate(RecordType::Enter, &enter(1).encode_payload(), 0)
            .unwrap();
        assert!(!segment.can_allocate(8));
        assert!(!segment.can_allocate(0));
        assert!(segment
            .allocate(RecordType::Enter, &enter(2).encode_payload(), 0)
            .is_err());
    }

    #[test]
    fn batch_record_grows_in_place() {
        let mut segment = TraceFileSegment::new(3, buffer(512)).unwrap();
        let batch = Record::BatchEnter {
            thread_id: 3,
            calls: vec![],
        };
        let offset = segment
            .allocate(RecordType::BatchEnter, &batch.encode_payload(), 0)
            .unwrap();
        for i in 0..3u32 {
            let mut pair = Vec::new();
            pair.extend_from_slice(&(0x1000 + i).to_le_bytes());
            pair.extend_from_slice(&(0x2000 + i).to_le_bytes());
            // The count field sits after the thread id.
            segment.extend_record(offset, &pair, 4).unwrap();
        }
        let records: Vec<_> = segment.records().collect();
        assert_eq!(records.len(), 1);
        let (prefix, payload) = &records[0];
        assert_eq!(prefix.size as usize, PREFIX_SIZE + 8 + 3 * 8);
        match Record::decode(prefix, payload).unwrap() {
            Record::BatchEnter { thread_id, calls } => {
                assert_eq!(thread_id, 3);
                assert_eq!(
                    calls,
                    vec![(0x1000, 0x2000), (0x1001, 0x2001), (0x1002, 0x2002)]
                );
            }
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[test]
    fn only_the_tail_record_can_grow() {
        let mut segment = TraceFileSegment::new(1, buffer(512)).unwrap();
        let batch = Record::BatchEnter {
            thread_id: 1,
            calls: vec![],
        };
        let first = segment
            .allocate(RecordType::BatchEnter, &batch.encode_payload(), 0)
            .unwrap();
        segment
            .allocate(RecordType::Enter, &enter(0).encode_payload(), 0)
            .unwrap();
        assert!(segment.extend_record(first, &[0; 8], 4).is_err());
    }

    #[test]
    fn undersized_buffer_is_rejected() {
        assert!(TraceFileSegment::new(1, buffer(4)).is_err());
    }
}
