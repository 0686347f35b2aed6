//! # Encoding Helpers
//!
//! Shared low-level encodings:
//!
//! - `fletcher`: the Fletcher-32 checksum used by every ASCII record on
//!   disk (store header, chunk header, chunk footer)
//! - `record`: comma-separated `key:value` ASCII records with hex-encoded
//!   integers, optional quoting, and a trailing checksum field
//! - `pagepos`: packing of `(chunk id, offset, length class, type)` into
//!   the opaque 64-bit page position
//!
//! Keeping the on-disk metadata human-readable is deliberate: a hex dump
//! of the first blocks of a damaged file is enough to see which chunk the
//! header points at.

mod fletcher;
mod pagepos;
mod record;

pub use fletcher::fletcher32;
pub use pagepos::{
    chunk_id, encode_pos, max_length, offset, page_type, pos_is_saved, MAX_CHUNK_ID,
    PAGE_TYPE_LEAF, PAGE_TYPE_NODE,
};
pub use record::{
    encode_fields, encode_record, parse_fields, parse_record, read_hex_u32, read_hex_u64,
    FieldMap,
};

use crate::error::{Result, StoreError};

/// Parses a hex string (no prefix) into a `u64`.
pub fn parse_hex_u64(s: &str) -> Result<u64> {
    u64::from_str_radix(s, 16)
        .map_err(|_| StoreError::corrupt(format!("invalid hex value: {s:?}")))
}

/// Parses a hex string (no prefix) into a `u32`.
pub fn parse_hex_u32(s: &str) -> Result<u32> {
    u32::from_str_radix(s, 16)
        .map_err(|_| StoreError::corrupt(format!("invalid hex value: {s:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_parse_roundtrip() {
        assert_eq!(parse_hex_u64("ff").unwrap(), 255);
        assert_eq!(parse_hex_u64(&format!("{:x}", u64::MAX)).unwrap(), u64::MAX);
        assert!(parse_hex_u64("not hex").is_err());
    }
}
