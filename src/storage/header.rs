//! # Store Header
//!
//! A small checksummed ASCII record written twice, in blocks 0 and 1, as
//! one contiguous buffer. It names the newest chunk at the time it was
//! last rewritten; recovery treats it as a hint and independently probes
//! the trailing footer and the chunk `next` chain for anything newer.
//!
//! Keys: `H` (layout major, always 2), `blockSize`, `format`,
//! `formatRead` (only when it differs from `format`), `created`
//! (absolute ms), and - once at least one chunk exists - `chunk`, `block`
//! and `version` of the newest chunk, plus the `fletcher` checksum.
//!
//! Two copies survive a torn write of either block; the parser picks the
//! copy with the highest version whose referenced chunk verifies.

use crate::encoding::{encode_record, parse_record, read_hex_u32, read_hex_u64, FieldMap};
use crate::error::{Result, StoreError};

use super::{BLOCK_SIZE, FORMAT_WRITE};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreHeader {
    /// Layout major; anything but 2 is unreadable.
    pub h: u32,
    pub block_size: u32,
    /// Format needed to write the file.
    pub format: u32,
    /// Format needed to read the file (≤ `format`).
    pub format_read: u32,
    /// Store creation time, absolute ms.
    pub created: u64,
    /// Newest chunk at last header write: id, first block, version.
    pub chunk: u32,
    pub block: u64,
    pub version: u64,
}

impl StoreHeader {
    pub fn new(created: u64) -> Self {
        Self {
            h: 2,
            block_size: BLOCK_SIZE as u32,
            format: FORMAT_WRITE,
            format_read: FORMAT_WRITE,
            created,
            chunk: 0,
            block: 0,
            version: 0,
        }
    }

    /// Encodes both header copies into one `2 * BLOCK_SIZE` buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut fields = vec![
            ("H", format!("{:x}", self.h)),
            ("blockSize", format!("{:x}", self.block_size)),
            ("format", format!("{:x}", self.format)),
        ];
        if self.format_read != self.format {
            fields.push(("formatRead", format!("{:x}", self.format_read)));
        }
        fields.push(("created", format!("{:x}", self.created)));
        if self.version != 0 {
            fields.push(("chunk", format!("{:x}", self.chunk)));
            fields.push(("block", format!("{:x}", self.block)));
            fields.push(("version", format!("{:x}", self.version)));
        }
        let record = encode_record(&fields);

        let mut out = vec![0u8; 2 * BLOCK_SIZE];
        out[..record.len()].copy_from_slice(&record);
        out[BLOCK_SIZE..BLOCK_SIZE + record.len()].copy_from_slice(&record);
        out
    }

    fn from_field_map(map: &FieldMap) -> Result<Self> {
        let h = read_hex_u32(map, "H")?;
        if h != 2 {
            return Err(StoreError::unsupported(format!("unknown header layout {h}")));
        }
        let block_size = read_hex_u32(map, "blockSize")?;
        if block_size != BLOCK_SIZE as u32 {
            return Err(StoreError::unsupported(format!(
                "block size {block_size} is not supported"
            )));
        }
        let format = read_hex_u32(map, "format")?;
        let format_read = match map.get("formatRead") {
            Some(v) => crate::encoding::parse_hex_u32(v)?,
            None => format,
        };
        Ok(Self {
            h,
            block_size,
            format,
            format_read,
            created: read_hex_u64(map, "created")?,
            chunk: match map.get("chunk") {
                Some(v) => crate::encoding::parse_hex_u32(v)?,
                None => 0,
            },
            block: match map.get("block") {
                Some(v) => crate::encoding::parse_hex_u64(v)?,
                None => 0,
            },
            version: match map.get("version") {
                Some(v) => crate::encoding::parse_hex_u64(v)?,
                None => 0,
            },
        })
    }

    /// Parses one header copy out of a block.
    pub fn decode_copy(block: &[u8]) -> Result<Self> {
        Self::from_field_map(&parse_record(block)?)
    }
}
