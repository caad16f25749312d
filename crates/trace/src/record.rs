//! Record prefix and the record types layered on it.

use anyhow::{bail, Context, Result};

/// Fixed prefix in front of every record: u64 timestamp, u32 size, u16 type,
/// two version bytes.
pub const PREFIX_SIZE: usize = 16;

pub const TRACE_VERSION_HI: u8 = 1;
pub const TRACE_VERSION_LO: u8 = 0;

/// Type codes carried in the prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum RecordType {
    ProcessAttach = 1,
    ProcessDetach = 2,
    ThreadName = 3,
    BatchEnter = 4,
    Enter = 5,
    Exit = 6,
    BatchInvocation = 7,
    DynamicSymbol = 8,
    IndexedFrequency = 9,
    SampleData = 10,
}

impl RecordType {
    pub fn from_u16(value: u16) -> Option<RecordType> {
        Some(match value {
            1 => RecordType::ProcessAttach,
            2 => RecordType::ProcessDetach,
            3 => RecordType::ThreadName,
            4 => RecordType::BatchEnter,
            5 => RecordType::Enter,
            6 => RecordType::Exit,
            7 => RecordType::BatchInvocation,
            8 => RecordType::DynamicSymbol,
            9 => RecordType::IndexedFrequency,
            10 => RecordType::SampleData,
            _ => return None,
        })
    }
}

/// The 16-byte record prefix. `size` covers the whole record, prefix
/// included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordPrefix {
    pub timestamp: u64,
    pub size: u32,
    pub record_type: u16,
    pub version: (u8, u8),
}

impl RecordPrefix {
    pub fn new(record_type: RecordType, payload_len: usize, timestamp: u64) -> RecordPrefix {
        RecordPrefix {
            timestamp,
            size: (PREFIX_SIZE + payload_len) as u32,
            record_type: record_type as u16,
            version: (TRACE_VERSION_HI, TRACE_VERSION_LO),
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<RecordPrefix> {
        if bytes.len() < PREFIX_SIZE {
            bail!("record prefix truncated ({} bytes)", bytes.len());
        }
        Ok(RecordPrefix {
            timestamp: u64::from_le_bytes(bytes[0..8].try_into().unwrap()),
            size: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
            record_type: u16::from_le_bytes(bytes[12..14].try_into().unwrap()),
            version: (bytes[14], bytes[15]),
        })
    }

    pub fn write_into(&self, out: &mut [u8]) {
        out[0..8].copy_from_slice(&self.timestamp.to_le_bytes());
        out[8..12].copy_from_slice(&self.size.to_le_bytes());
        out[12..14].copy_from_slice(&self.record_type.to_le_bytes());
        out[14] = self.version.0;
        out[15] = self.version.1;
    }
}

/// Identity of an instrumented module: the key under which frequency and
/// sample data is filed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModuleInfo {
    pub base: u32,
    pub size: u32,
    pub checksum: u32,
    pub timestamp: u32,
}

impl ModuleInfo {
    pub const ENCODED_SIZE: usize = 16;

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.base.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&self.checksum.to_le_bytes());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
    }

    fn decode(cursor: &mut Cursor<'_>) -> Result<ModuleInfo> {
        Ok(ModuleInfo {
            base: cursor.u32()?,
            size: cursor.u32()?,
            checksum: cursor.u32()?,
            timestamp: cursor.u32()?,
        })
    }
}

/// One row of a `BatchInvocation` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvocationInfo {
    pub caller: u32,
    pub function: u32,
    pub calls: u32,
    pub flags: u32,
    pub cycles_min: u64,
    pub cycles_max: u64,
    pub cycles_sum: u64,
}

impl InvocationInfo {
    pub const ENCODED_SIZE: usize = 40;
}

/// A decoded record. Encoding always yields the canonical layout; decoding
/// accepts exactly that layout and reports anything else as corruption.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    ProcessAttach {
        module: ModuleInfo,
        module_name: String,
        exe_path: String,
    },
    ProcessDetach,
    ThreadName(String),
    BatchEnter {
        thread_id: u32,
        /// `(return address, function)` per call, in program order.
        calls: Vec<(u32, u32)>,
    },
    Enter {
        return_address: u32,
        function: u32,
    },
    Exit {
        return_address: u32,
        function: u32,
    },
    BatchInvocation(Vec<InvocationInfo>),
    DynamicSymbol {
        symbol_id: u32,
        name: String,
    },
    IndexedFrequency {
        module: ModuleInfo,
        /// 1, 2 or 4 bytes per counter.
        frequency_size: u8,
        num_entries: u32,
        /// Raw counter bytes, `num_entries * frequency_size` of them.
        data: Vec<u8>,
    },
    SampleData {
        module: ModuleInfo,
        bucket_start: u32,
        bucket_size: u32,
        sampling_start: u64,
        sampling_end: u64,
        sampling_interval: u64,
        buckets: Vec<u32>,
    },
}

impl Record {
    pub fn record_type(&self) -> RecordType {
        match self {
            Record::ProcessAttach { .. } => RecordType::ProcessAttach,
            Record::ProcessDetach => RecordType::ProcessDetach,
            Record::ThreadName(_) => RecordType::ThreadName,
            Record::BatchEnter { .. } => RecordType::BatchEnter,
            Record::Enter { .. } => RecordType::Enter,
            Record::Exit { .. } => RecordType::Exit,
            Record::BatchInvocation(_) => RecordType::BatchInvocation,
            Record::DynamicSymbol { .. } => RecordType::DynamicSymbol,
            Record::IndexedFrequency { .. } => RecordType::IndexedFrequency,
            Record::SampleData { .. } => RecordType::SampleData,
        }
    }

    /// Serializes the payload without the prefix.
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Record::ProcessAttach {
                module,
                module_name,
                exe_path,
            } => {
                module.encode_into(&mut out);
                push_cstr(&mut out, module_name);
                push_cstr(&mut out, exe_path);
            }
            Record::ProcessDetach => {}
            Record::ThreadName(name) => push_cstr(&mut out, name),
            Record::BatchEnter { thread_id, calls } => {
                out.extend_from_slice(&thread_id.to_le_bytes());
                out.extend_from_slice(&(calls.len() as u32).to_le_bytes());
                for &(return_address, function) in calls {
                    out.extend_from_slice(&return_address.to_le_bytes());
                    out.extend_from_slice(&function.to_le_bytes());
                }
            }
            Record::Enter {
                return_address,
                function,
            }
            | Record::Exit {
                return_address,
                function,
            } => {
                out.extend_from_slice(&return_address.to_le_bytes());
                out.extend_from_slice(&function.to_le_bytes());
            }
            Record::BatchInvocation(entries) => {
                out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
                for e in entries {
                    out.extend_from_slice(&e.caller.to_le_bytes());
                    out.extend_from_slice(&e.function.to_le_bytes());
                    out.extend_from_slice(&e.calls.to_le_bytes());
                    out.extend_from_slice(&e.flags.to_le_bytes());
                    out.extend_from_slice(&e.cycles_min.to_le_bytes());
                    out.extend_from_slice(&e.cycles_max.to_le_bytes());
                    out.extend_from_slice(&e.cycles_sum.to_le_bytes());
                }
            }
            Record::DynamicSymbol { symbol_id, name } => {
                out.extend_from_slice(&symbol_id.to_le_bytes());
                push_cstr(&mut out, name);
            }
            Record::IndexedFrequency {
                module,
                frequency_size,
                num_entries,
                data,
            } => {
                module.encode_into(&mut out);
                out.extend_from_slice(&num_entries.to_le_bytes());
                out.push(*frequency_size);
                out.extend_from_slice(&[0u8; 3]);
                out.extend_from_slice(data);
            }
            Record::SampleData {
                module,
                bucket_start,
                bucket_size,
                sampling_start,
                sampling_end,
                sampling_interval,
                buckets,
            } => {
                module.encode_into(&mut out);
                out.extend_from_slice(&bucket_start.to_le_bytes());
                out.extend_from_slice(&bucket_size.to_le_bytes());
                out.extend_from_slice(&(buckets.len() as u32).to_le_bytes());
                out.extend_from_slice(&sampling_start.to_le_bytes());
                out.extend_from_slice(&sampling_end.to_le_bytes());
                out.extend_from_slice(&sampling_interval.to_le_bytes());
                for bucket in buckets {
                    out.extend_from_slice(&bucket.to_le_bytes());
                }
            }
        }
        out
    }

    /// Serializes the whole record, prefix first.
    pub fn encode(&self, timestamp: u64) -> Vec<u8> {
        let payload = self.encode_payload();
        let prefix = RecordPrefix::new(self.record_type(), payload.len(), timestamp);
        let mut out = vec![0u8; PREFIX_SIZE];
        prefix.write_into(&mut out);
        out.extend_from_slice(&payload);
        out
    }

    /// Decodes the payload bytes of a record whose prefix has already been
    /// read.
    pub fn decode(prefix: &RecordPrefix, payload: &[u8]) -> Result<Record> {
        let record_type = RecordType::from_u16(prefix.record_type)
            .with_context(|| format!("unknown record type {}", prefix.record_type))?;
        let mut cursor = Cursor::new(payload);
        let record = match record_type {
            RecordType::ProcessAttach => Record::ProcessAttach {
                module: ModuleInfo::decode(&mut cursor)?,
                module_name: cursor.cstr()?,
                exe_path: cursor.cstr()?,
            },
            RecordType::ProcessDetach => Record::ProcessDetach,
            RecordType::ThreadName => Record::ThreadName(cursor.cstr()?),
            RecordType::BatchEnter => {
                let thread_id = cursor.u32()?;
                let count = cursor.u32()? as usize;
                // Reserve only what the payload can actually hold; the
                // element reads fail on a lying count.
                let mut calls = Vec::with_capacity(count.min(cursor.remaining() / 8));
                for _ in 0..count {
                    calls.push((cursor.u32()?, cursor.u32()?));
                }
                Record::BatchEnter { thread_id, calls }
            }
            RecordType::Enter => Record::Enter {
                return_address: cursor.u32()?,
                function: cursor.u32()?,
            },
            RecordType::Exit => Record::Exit {
                return_address: cursor.u32()?,
                function: cursor.u32()?,
            },
            RecordType::BatchInvocation => {
                let count = cursor.u32()? as usize;
                let mut entries =
                    Vec::with_capacity(count.min(cursor.remaining() / InvocationInfo::ENCODED_SIZE));
                for _ in 0..count {
                    entries.push(InvocationInfo {
                        caller: cursor.u32()?,
                        function: cursor.u32()?,
                        calls: cursor.u32()?,
                        flags: cursor.u32()?,
                        cycles_min: cursor.u64()?,
                        cycles_max: cursor.u64()?,
                        cycles_sum: cursor.u64()?,
                    });
                }
                Record::BatchInvocation(entries)
            }
            RecordType::DynamicSymbol => Record::DynamicSymbol {
                symbol_id: cursor.u32()?,
                name: cursor.cstr()?,
            },
            RecordType::IndexedFrequency => {
                let module = ModuleInfo::decode(&mut cursor)?;
                let num_entries = cursor.u32()?;
                let frequency_size = cursor.u8()?;
                cursor.skip(3)?;
                if !matches!(frequency_size, 1 | 2 | 4) {
                    bail!("bad frequency size {frequency_size}");
                }
                let data = cursor
                    .bytes(num_entries as usize * frequency_size as usize)?
                    .to_vec();
                Record::IndexedFrequency {
                    module,
                    frequency_size,
                    num_entries,
                    data,
                }
            }
            RecordType::SampleData => {
                let module = ModuleInfo::decode(&mut cursor)?;
                let bucket_start = cursor.u32()?;
                let bucket_size = cursor.u32()?;
                let bucket_count = cursor.u32()? as usize;
                let sampling_start = cursor.u64()?;
                let sampling_end = cursor.u64()?;
                let sampling_interval = cursor.u64()?;
                let mut buckets = Vec::with_capacity(bucket_count.min(cursor.remaining() / 4));
                for _ in 0..bucket_count {
                    buckets.push(cursor.u32()?);
                }
                Record::SampleData {
                    module,
                    bucket_start,
                    bucket_size,
                    sampling_start,
                    sampling_end,
                    sampling_interval,
                    buckets,
                }
            }
        };
        Ok(record)
    }
}

fn push_cstr(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}

pub(crate) struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Cursor<'a> {
        Cursor { data, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub(crate) fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let slice = self
            .data
            .get(self.pos..self.pos + n)
            .with_context(|| format!("record payload truncated at offset {}", self.pos))?;
        self.pos += n;
        Ok(slice)
    }

    pub(crate) fn skip(&mut self, n: usize) -> Result<()> {
        self.bytes(n).map(|_| ())
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.bytes(2)?.try_into().unwrap()))
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    pub(crate) fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.bytes(8)?.try_into().unwrap()))
    }

    /// NUL-terminated UTF-8.
    pub(crate) fn cstr(&mut self) -> Result<String> {
        let rest = &self.data[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .with_context(|| format!("unterminated string at offset {}", self.pos))?;
        let s = std::str::from_utf8(&rest[..nul]).context("string is not UTF-8")?;
        self.pos += nul + 1;
        Ok(s.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_is_sixteen_bytes() {
        let prefix = RecordPrefix::new(RecordType::Enter, 8, 0x1122_3344_5566_7788);
        let mut bytes = [0u8; PREFIX_SIZE];
        prefix.write_into(&mut bytes);
        assert_eq!(&bytes[0..8], &0x1122_3344_5566_7788u64.to_le_bytes());
        assert_eq!(&bytes[8..12], &24u32.to_le_bytes());
        assert_eq!(&bytes[12..14], &5u16.to_le_bytes());
        assert_eq!(bytes[14], TRACE_VERSION_HI);
        assert_eq!(bytes[15], TRACE_VERSION_LO);
        assert_eq!(RecordPrefix::parse(&bytes).unwrap(), prefix);
    }

    #[test]
    fn batch_enter_size_counts_prefix_and_pairs() {
        let record = Record::BatchEnter {
            thread_id: 42,
            calls: vec![(0x1000, 0x2000), (0x1004, 0x3000), (0x1008, 0x4000)],
        };
        let bytes = record.encode(7);
        // prefix + (thread id, count) + three 8-byte pairs
        assert_eq!(bytes.len(), PREFIX_SIZE + 8 + 3 * 8);
        let prefix = RecordPrefix::parse(&bytes).unwrap();
        assert_eq!(prefix.size as usize, bytes.len());
        let back = Record::decode(&prefix, &bytes[PREFIX_SIZE..]).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn process_attach_strings_round_trip() {
        let record = Record::ProcessAttach {
            module: ModuleInfo {
                base: 0x1000_0000,
                size: 0x8000,
                checksum: 0xdead_beef,
                timestamp: 0x5f00_0000,
            },
            module_name: "target.dll".into(),
            exe_path: "C:\\app\\host.exe".into(),
        };
        let bytes = record.encode(1);
        let prefix = RecordPrefix::parse(&bytes).unwrap();
        let back = Record::decode(&prefix, &bytes[PREFIX_SIZE..]).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn invocation_rows_round_trip() {
        let record = Record::BatchInvocation(vec![InvocationInfo {
            caller: 1,
            function: 2,
            calls: 100,
            flags: 0,
            cycles_min: 10,
            cycles_max: 900,
            cycles_sum: 5_000,
        }]);
        let bytes = record.encode(0);
        let prefix = RecordPrefix::parse(&bytes).unwrap();
        assert_eq!(
            prefix.size as usize,
            PREFIX_SIZE + 4 + InvocationInfo::ENCODED_SIZE
        );
        assert_eq!(Record::decode(&prefix, &bytes[PREFIX_SIZE..]).unwrap(), record);
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let record = Record::Enter {
            return_address: 0x10,
            function: 0x20,
        };
        let bytes = record.encode(0);
        let prefix = RecordPrefix::parse(&bytes).unwrap();
        assert!(Record::decode(&prefix, &bytes[PREFIX_SIZE..PREFIX_SIZE + 4]).is_err());
    }

    #[test]
    fn lying_counts_fail_without_reserving_for_them() {
        // A count field of u32::MAX backed by an empty payload must error
        // out of the element reads, not allocate up front.
        let mut payload = Vec::new();
        payload.extend_from_slice(&7u32.to_le_bytes()); // thread id
        payload.extend_from_slice(&u32::MAX.to_le_bytes());
        let prefix = RecordPrefix::new(RecordType::BatchEnter, payload.len(), 0);
        assert!(Record::decode(&prefix, &payload).is_err());

        let payload = u32::MAX.to_le_bytes();
        let prefix = RecordPrefix::new(RecordType::BatchInvocation, payload.len(), 0);
        assert!(Record::decode(&prefix, &payload).is_err());
    }

    #[test]
    fn unknown_type_is_rejected() {
        let prefix = RecordPrefix {
            timestamp: 0,
            size: PREFIX_SIZE as u32,
            record_type: 0x7fff,
            version: (TRACE_VERSION_HI, TRACE_VERSION_LO),
        };
        assert!(Record::decode(&prefix, &[]).is_err());
    }

    #[test]
    fn frequency_data_length_is_validated() {
        let record = Record::IndexedFrequency {
            module: ModuleInfo::default(),
            frequency_size: 2,
            num_entries: 3,
            data: vec![1, 0, 2, 0, 3, 0],
        };
        let bytes = record.encode(0);
        let prefix = RecordPrefix::parse(&bytes).unwrap();
        assert_eq!(Record::decode(&prefix, &bytes[PREFIX_SIZE..]).unwrap(), record);
        // Chopping the counter bytes makes the decode fail.
        assert!(Record::decode(&prefix, &bytes[PREFIX_SIZE..bytes.len() - 2]).is_err());
    }
}
