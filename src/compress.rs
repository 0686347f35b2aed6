//! # Page Compression
//!
//! One capability, two variants: the `compress` config selects no
//! compression (0), a fast codec (1) or a high-ratio codec (2) at store
//! construction. Both variants are zstd at different levels; the fast
//! level is close to free on the commit path, the high level trades CPU
//! for space.
//!
//! Compression applies to page bodies only (never to headers, footers or
//! the store header) and only when it actually shrinks the body; an
//! incompressible page is stored raw with the compressed flag clear.
//! Decompression never needs the config: the flag and expanded length in
//! the page header are sufficient, so a file written with compression can
//! be read by a store opened without it.

use crate::error::{Result, StoreError};

pub trait Compressor: Send + Sync {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;
    fn decompress(&self, data: &[u8], expanded_len: usize) -> Result<Vec<u8>>;
}

/// zstd at level 1.
pub struct ZstdFast;

/// zstd at level 19.
pub struct ZstdHigh;

fn compress_at(data: &[u8], level: i32) -> Result<Vec<u8>> {
    zstd::bulk::compress(data, level)
        .map_err(|e| StoreError::internal(format!("compression failed: {e}")))
}

fn decompress_into(data: &[u8], expanded_len: usize) -> Result<Vec<u8>> {
    let out = zstd::bulk::decompress(data, expanded_len)
        .map_err(|e| StoreError::corrupt(format!("page decompression failed: {e}")))?;
    if out.len() != expanded_len {
        return Err(StoreError::corrupt(format!(
            "page expanded to {} bytes, header says {}",
            out.len(),
            expanded_len
        )));
    }
    Ok(out)
}

impl Compressor for ZstdFast {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        compress_at(data, 1)
    }

    fn decompress(&self, data: &[u8], expanded_len: usize) -> Result<Vec<u8>> {
        decompress_into(data, expanded_len)
    }
}

impl Compressor for ZstdHigh {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        compress_at(data, 19)
    }

    fn decompress(&self, data: &[u8], expanded_len: usize) -> Result<Vec<u8>> {
        decompress_into(data, expanded_len)
    }
}

/// Maps the `compress` config value to a codec.
pub fn for_level(level: u8) -> Option<&'static dyn Compressor> {
    match level {
        1 => Some(&ZstdFast),
        2 => Some(&ZstdHigh),
        _ => None,
    }
}

/// Decompressor for pages read back from disk; the level no longer
/// matters, any variant can expand any body.
pub fn reader() -> &'static dyn Compressor {
    &ZstdFast
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_roundtrip() {
        let data = b"key:value,key:value,key:value,key:value".repeat(20);

        let packed = ZstdFast.compress(&data).unwrap();
        assert!(packed.len() < data.len());

        let expanded = ZstdFast.decompress(&packed, data.len()).unwrap();
        assert_eq!(expanded, data);
    }

    #[test]
    fn high_output_readable_by_fast_variant() {
        let data = vec![42u8; 8192];

        let packed = ZstdHigh.compress(&data).unwrap();
        let expanded = ZstdFast.decompress(&packed, data.len()).unwrap();

        assert_eq!(expanded, data);
    }

    #[test]
    fn wrong_expanded_length_is_corrupt() {
        let packed = ZstdFast.compress(&[7u8; 100]).unwrap();

        let err = ZstdFast.decompress(&packed, 50).unwrap_err();

        assert_eq!(err.kind(), crate::error::ErrorKind::Corrupt);
    }

    #[test]
    fn level_zero_disables_compression() {
        assert!(for_level(0).is_none());
        assert!(for_level(1).is_some());
        assert!(for_level(2).is_some());
    }
}
