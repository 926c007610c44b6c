#![forbid(unsafe_code)]

//! Reader for the HotSpot perf-data (`hsperfdata`) memory layout.
//!
//! A perf-data file starts with a fixed prologue followed by a table of
//! variable-length entries. Each entry names one counter and points at its
//! data. The magic number is always big-endian; every other field uses the
//! byte order recorded in the prologue.

use crate::error::Error;
use std::collections::HashMap;

pub const MAGIC: u32 = 0xCAFE_C0C0;
pub const PROLOGUE_LEN: usize = 32;
pub const ENTRY_HEADER_LEN: usize = 20;

const BYTE_ORDER_BIG: u8 = 0;
const BYTE_ORDER_LITTLE: u8 = 1;
const SUPPORTED_MAJOR: u8 = 2;

const TYPE_LONG: u8 = b'J';
const TYPE_BYTE: u8 = b'B';

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PerfValue {
    Long(i64),
    Text(String),
}

impl PerfValue {
    pub fn as_long(&self) -> Option<i64> {
        match self {
            PerfValue::Long(v) => Some(*v),
            PerfValue::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            PerfValue::Text(s) => Some(s),
            PerfValue::Long(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prologue {
    pub big_endian: bool,
    pub major: u8,
    pub minor: u8,
    pub accessible: bool,
    pub used: i32,
    pub entry_offset: i32,
    pub num_entries: i32,
}

#[derive(Debug, Clone, Default)]
pub struct PerfCounters {
    values: HashMap<String, PerfValue>,
}

impl PerfCounters {
    pub fn get(&self, name: &str) -> Option<&PerfValue> {
        self.values.get(name)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(PerfValue::as_text)
    }

    pub fn long(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(PerfValue::as_long)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    big_endian: bool,
}

impl Reader<'_> {
    fn slice(&self, offset: usize, len: usize) -> Result<&[u8], Error> {
        offset
            .checked_add(len)
            .and_then(|end| self.buf.get(offset..end))
            .ok_or_else(|| {
                Error::PerfData(format!(
                    "read of {len} bytes at offset {offset} exceeds buffer of {} bytes",
                    self.buf.len()
                ))
            })
    }

    fn u8(&self, offset: usize) -> Result<u8, Error> {
        Ok(self.slice(offset, 1)?[0])
    }

    fn i32(&self, offset: usize) -> Result<i32, Error> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.slice(offset, 4)?);
        Ok(if self.big_endian {
            i32::from_be_bytes(raw)
        } else {
            i32::from_le_bytes(raw)
        })
    }

    fn i64(&self, offset: usize) -> Result<i64, Error> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.slice(offset, 8)?);
        Ok(if self.big_endian {
            i64::from_be_bytes(raw)
        } else {
            i64::from_le_bytes(raw)
        })
    }

    /// Offsets stored in the file are signed; negative ones are corrupt.
    fn offset(&self, at: usize) -> Result<usize, Error> {
        let raw = self.i32(at)?;
        usize::try_from(raw).map_err(|_| Error::PerfData(format!("negative offset {raw} at {at}")))
    }
}

pub fn parse_prologue(buf: &[u8]) -> Result<Prologue, Error> {
    if buf.len() < PROLOGUE_LEN {
        return Err(Error::PerfData(format!(
            "buffer of {} bytes is shorter than the prologue",
            buf.len()
        )));
    }
    let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if magic != MAGIC {
        return Err(Error::PerfData(format!("bad magic {magic:#010x}")));
    }
    let big_endian = match buf[4] {
        BYTE_ORDER_BIG => true,
        BYTE_ORDER_LITTLE => false,
        other => return Err(Error::PerfData(format!("unknown byte order {other}"))),
    };
    let reader = Reader { buf, big_endian };
    let major = reader.u8(5)?;
    if major != SUPPORTED_MAJOR {
        return Err(Error::PerfData(format!("unsupported major version {major}")));
    }
    Ok(Prologue {
        big_endian,
        major,
        minor: reader.u8(6)?,
        accessible: reader.u8(7)? != 0,
        used: reader.i32(8)?,
        entry_offset: reader.i32(24)?,
        num_entries: reader.i32(28)?,
    })
}

/// Decode every long and string counter in `buf`. Counters of other types
/// (e.g. long arrays) are skipped.
pub fn parse(buf: &[u8]) -> Result<PerfCounters, Error> {
    let prologue = parse_prologue(buf)?;
    let reader = Reader {
        buf,
        big_endian: prologue.big_endian,
    };

    let num_entries = usize::try_from(prologue.num_entries)
        .map_err(|_| Error::PerfData(format!("negative entry count {}", prologue.num_entries)))?;
    let mut cursor = usize::try_from(prologue.entry_offset).map_err(|_| {
        Error::PerfData(format!("negative entry offset {}", prologue.entry_offset))
    })?;

    let mut values = HashMap::with_capacity(num_entries);
    for _ in 0..num_entries {
        let entry_len = reader.offset(cursor)?;
        if entry_len < ENTRY_HEADER_LEN {
            return Err(Error::PerfData(format!(
                "entry at {cursor} has length {entry_len}"
            )));
        }
        // The whole entry must be inside the buffer before fields are trusted.
        reader.slice(cursor, entry_len)?;

        let name_offset = reader.offset(cursor + 4)?;
        let vector_len = reader.offset(cursor + 8)?;
        let data_type = reader.u8(cursor + 12)?;
        let data_offset = reader.offset(cursor + 16)?;

        let name_start = cursor + name_offset;
        let name_end = cursor + data_offset.min(entry_len);
        let name = read_c_string(reader.slice(name_start, name_end.saturating_sub(name_start))?);

        let data_start = cursor + data_offset;
        let value = match (data_type, vector_len) {
            (TYPE_LONG, 0) => Some(PerfValue::Long(reader.i64(data_start)?)),
            (TYPE_BYTE, len) if len > 0 => {
                Some(PerfValue::Text(read_c_string(reader.slice(data_start, len)?)))
            }
            _ => None,
        };
        if let Some(value) = value {
            values.insert(name, value);
        }
        cursor += entry_len;
    }

    Ok(PerfCounters { values })
}

fn read_c_string(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}


#[cfg(test)]
mod tests {
    use super::fixture::{Counter, encode};
    use super::*;
    use proptest::prelude::*;

    fn sample(big_endian: bool) -> Vec<u8> {
        encode(
            &[
                Counter::Text("sun.rt.javaCommand", "com.example.Main --port 8080"),
                Counter::Long("sun.rt.createVmBeginTime", 1_700_000_000_123),
                Counter::Text("java.property.java.version", "21.0.2"),
            ],
            big_endian,
        )
    }

    #[test]
    fn decodes_both_byte_orders() {
        for big_endian in [false, true] {
            let counters = parse(&sample(big_endian)).unwrap();
            assert_eq!(counters.len(), 3);
            assert_eq!(
                counters.text("sun.rt.javaCommand"),
                Some("com.example.Main --port 8080")
            );
            assert_eq!(
                counters.long("sun.rt.createVmBeginTime"),
                Some(1_700_000_000_123)
            );
            assert_eq!(counters.text("java.property.java.version"), Some("21.0.2"));
            assert_eq!(counters.long("java.property.java.version"), None);
        }
    }

    #[test]
    fn prologue_fields() {
        let prologue = parse_prologue(&sample(true)).unwrap();
        assert!(prologue.big_endian);
        assert_eq!(prologue.major, 2);
        assert!(prologue.accessible);
        assert_eq!(prologue.num_entries, 3);
        assert_eq!(prologue.entry_offset, PROLOGUE_LEN as i32);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = sample(false);
        buf[0] = 0;
        assert!(matches!(parse(&buf), Err(Error::PerfData(_))));
    }

    #[test]
    fn rejects_unknown_major_version() {
        let mut buf = sample(false);
        buf[5] = 1;
        assert!(matches!(parse(&buf), Err(Error::PerfData(_))));
    }

    #[test]
    fn truncated_entry_table_is_an_error() {
        let buf = sample(false);
        let truncated = &buf[..buf.len() - 9];
        assert!(matches!(parse(truncated), Err(Error::PerfData(_))));
        assert!(matches!(parse(&buf[..10]), Err(Error::PerfData(_))));
    }

    proptest! {
        #[test]
        fn arbitrary_bytes_never_panic(tail in prop::collection::vec(any::<u8>(), 0..256)) {
            let mut buf = sample(false)[..PROLOGUE_LEN].to_vec();
            buf.extend_from_slice(&tail);
            let _ = parse(&buf);
        }

        #[test]
        fn corrupted_buffers_never_panic(
            index in 0usize..200,
            byte in any::<u8>(),
        ) {
            let mut buf = sample(true);
            let index = index % buf.len();
            buf[index] = byte;
            let _ = parse(&buf);
        }
    }
}
