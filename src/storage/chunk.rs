//! # Chunk Descriptors
//!
//! A chunk is one atomically written batch of pages. Its descriptor exists
//! in three serialized forms:
//!
//! - the `chunk.{hex id}` value in the meta map (plain record)
//! - the on-disk chunk header at the chunk's first bytes (checksummed
//!   record, space-padded so the final patch never grows it)
//! - the fixed 128-byte footer at the chunk's last bytes (checksummed
//!   record restating id, block and version)
//!
//! During a commit the descriptor is created with sentinel maxima (the
//! widest hex encodings its fields can have), serialized once to size the
//! header, then patched in place when block, length and meta root are
//! known. Recovery verifies header/footer pairs and treats any mismatch as
//! "no chunk here".
//!
//! Only `unused` and the live counters change after a chunk is written;
//! everything else is immutable.

use crate::encoding::{
    encode_fields, encode_record, parse_fields, parse_record, read_hex_u32, read_hex_u64, FieldMap,
};
use crate::error::{Result, StoreError};

pub use crate::encoding::MAX_CHUNK_ID;

/// Fixed length of the chunk footer.
pub const CHUNK_FOOTER_LENGTH: usize = 128;

/// Upper bound on the chunk header length; recovery reads this much when
/// probing a block for a header.
pub const CHUNK_MAX_HEADER_LENGTH: usize = 1024;

/// `block` value of a chunk that was allocated but never written.
pub const UNSTORED_BLOCK: u64 = u64::MAX;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub id: u32,
    /// First block of the chunk on disk.
    pub block: u64,
    /// Length in blocks.
    pub len: u32,
    /// Pages written into this chunk.
    pub page_count: u32,
    /// Pages still referenced; may dip below zero transiently.
    pub page_count_live: i64,
    /// Sum of the length-class bounds of all pages.
    pub max_len: u64,
    /// Live share of `max_len`; may dip below zero transiently.
    pub max_len_live: i64,
    /// Store version this chunk was written at.
    pub version: u64,
    /// Creation time, ms since store creation.
    pub time: u64,
    /// When the chunk was first seen unreferenced (ms since store
    /// creation), or 0 while live.
    pub unused: u64,
    /// Position of the metadata root written into this chunk.
    pub meta_root_pos: u64,
    /// Predicted block of the next chunk, 0 when appending.
    pub next: u64,
    /// Highest map id at write time.
    pub map_id: u32,
}

impl Chunk {
    /// New descriptor with sentinel maxima; every field is patched before
    /// the chunk reaches disk.
    pub fn new(id: u32) -> Self {
        Self {
            id,
            block: UNSTORED_BLOCK,
            len: u32::MAX,
            page_count: u32::MAX,
            page_count_live: i64::MAX,
            max_len: u64::MAX,
            max_len_live: i64::MAX,
            version: 0,
            time: 0,
            unused: 0,
            meta_root_pos: u64::MAX,
            next: u64::MAX,
            map_id: 0,
        }
    }

    /// The meta-map key of this chunk, `chunk.{hex id}`.
    pub fn meta_key(id: u32) -> String {
        format!("chunk.{id:x}")
    }

    /// Live bytes over total bytes, in percent. A chunk with no live pages
    /// reports 0; anything live reports at least 1.
    pub fn fill_rate(&self) -> u8 {
        if self.max_len_live <= 0 || self.max_len == 0 {
            0
        } else if self.max_len_live as u64 >= self.max_len {
            100
        } else {
            (100 * self.max_len_live as u64 / self.max_len).max(1) as u8
        }
    }

    pub fn is_stored(&self) -> bool {
        self.block != UNSTORED_BLOCK
    }

    fn fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("chunk", format!("{:x}", self.id)),
            ("block", format!("{:x}", self.block)),
            ("len", format!("{:x}", self.len)),
            ("pages", format!("{:x}", self.page_count)),
            ("pagesLive", format!("{:x}", self.page_count_live as u64)),
            ("max", format!("{:x}", self.max_len)),
            ("maxLive", format!("{:x}", self.max_len_live as u64)),
            ("metaRoot", format!("{:x}", self.meta_root_pos)),
            ("next", format!("{:x}", self.next)),
            ("version", format!("{:x}", self.version)),
            ("time", format!("{:x}", self.time)),
            ("mapId", format!("{:x}", self.map_id)),
            ("unused", format!("{:x}", self.unused)),
        ]
    }

    fn from_field_map(map: &FieldMap) -> Result<Self> {
        Ok(Self {
            id: read_hex_u32(map, "chunk")?,
            block: read_hex_u64(map, "block")?,
            len: read_hex_u32(map, "len")?,
            page_count: read_hex_u32(map, "pages")?,
            page_count_live: read_hex_u64(map, "pagesLive")? as i64,
            max_len: read_hex_u64(map, "max")?,
            max_len_live: read_hex_u64(map, "maxLive")? as i64,
            meta_root_pos: read_hex_u64(map, "metaRoot")?,
            next: read_hex_u64(map, "next")?,
            version: read_hex_u64(map, "version")?,
            time: read_hex_u64(map, "time")?,
            map_id: read_hex_u32(map, "mapId")?,
            unused: match map.get("unused") {
                Some(v) => crate::encoding::parse_hex_u64(v)?,
                None => 0,
            },
        })
    }

    /// Serializes for storage as a meta-map value.
    pub fn to_meta_value(&self) -> String {
        encode_fields(&self.fields())
    }

    /// Parses a meta-map value.
    pub fn from_meta_value(s: &str) -> Result<Self> {
        Self::from_field_map(&parse_fields(s)?)
    }

    /// Every on-disk header occupies exactly this many bytes: the length
    /// of a header whose fields all take their widest encoding. A fixed
    /// region lets both the commit patch and chunk relocation rewrite a
    /// header in place.
    pub fn header_region_length() -> usize {
        static LEN: std::sync::OnceLock<usize> = std::sync::OnceLock::new();
        *LEN.get_or_init(|| {
            let mut widest = Chunk::new(MAX_CHUNK_ID);
            widest.version = u64::MAX;
            widest.time = u64::MAX;
            widest.unused = u64::MAX;
            widest.map_id = u32::MAX;
            encode_record(&widest.fields()).len()
        })
    }

    /// Serializes the on-disk chunk header. With a nonzero `min_len` the
    /// result is padded to exactly that many bytes; callers pass
    /// [`Chunk::header_region_length`].
    pub fn header_bytes(&self, min_len: usize) -> Result<Vec<u8>> {
        let mut bytes = encode_record(&self.fields());
        if min_len != 0 {
            if bytes.len() > min_len {
                return Err(StoreError::internal(format!(
                    "chunk {} header grew from {} to {} bytes",
                    self.id,
                    min_len,
                    bytes.len()
                )));
            }
            bytes.resize(min_len, b' ');
        }
        Ok(bytes)
    }

    /// Parses an on-disk chunk header. `block` is where the probe read
    /// from; a header naming a different block is stale data.
    pub fn parse_header(bytes: &[u8], block: u64) -> Result<Self> {
        let chunk = Self::from_field_map(&parse_record(bytes)?)?;
        if chunk.block != block {
            return Err(StoreError::corrupt(format!(
                "chunk {} header at block {} names block {}",
                chunk.id, block, chunk.block
            )));
        }
        if chunk.len == 0 || chunk.block == UNSTORED_BLOCK {
            return Err(StoreError::corrupt(format!("chunk {} has impossible extent", chunk.id)));
        }
        Ok(chunk)
    }

    /// Serializes the fixed-length footer.
    pub fn footer_bytes(&self) -> Vec<u8> {
        let mut bytes = encode_record(&[
            ("chunk", format!("{:x}", self.id)),
            ("block", format!("{:x}", self.block)),
            ("version", format!("{:x}", self.version)),
        ]);
        debug_assert!(bytes.len() <= CHUNK_FOOTER_LENGTH);
        bytes.resize(CHUNK_FOOTER_LENGTH, 0);
        bytes
    }

    /// Parses a footer into `(id, block, version)`.
    pub fn parse_footer(bytes: &[u8]) -> Result<(u32, u64, u64)> {
        let map = parse_record(bytes)?;
        Ok((
            read_hex_u32(&map, "chunk")?,
            read_hex_u64(&map, "block")?,
            read_hex_u64(&map, "version")?,
        ))
    }
}

/// Pending live-space reduction for one chunk, accumulated off the commit
/// path and applied to the descriptor during the next commit.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChunkDelta {
    pub pages: i64,
    pub max_len: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Chunk {
        let mut c = Chunk::new(0x2a);
        c.block = 17;
        c.len = 3;
        c.page_count = 12;
        c.page_count_live = 9;
        c.max_len = 9000;
        c.max_len_live = 7000;
        c.version = 5;
        c.time = 1234;
        c.meta_root_pos = 0xdead_beef;
        c.next = 20;
        c.map_id = 4;
        c
    }

    #[test]
    fn meta_value_roundtrip() {
        let c = sample();

        let parsed = Chunk::from_meta_value(&c.to_meta_value()).unwrap();

        assert_eq!(parsed, c);
    }

    #[test]
    fn unused_stamp_roundtrips() {
        let mut c = sample();
        c.unused = 99;

        let parsed = Chunk::from_meta_value(&c.to_meta_value()).unwrap();

        assert_eq!(parsed.unused, 99);
    }

    #[test]
    fn header_region_fits_any_chunk() {
        let region = Chunk::header_region_length();
        assert!(region <= CHUNK_MAX_HEADER_LENGTH);

        let mut c = sample();
        c.block = u64::MAX - 1;
        c.unused = u64::MAX - 1;
        let bytes = c.header_bytes(region).unwrap();
        assert_eq!(bytes.len(), region);
    }

    #[test]
    fn negative_live_counters_roundtrip() {
        let mut c = sample();
        c.page_count_live = -3;
        c.max_len_live = -4096;

        let parsed = Chunk::from_meta_value(&c.to_meta_value()).unwrap();

        assert_eq!(parsed.page_count_live, -3);
        assert_eq!(parsed.max_len_live, -4096);
    }

    #[test]
    fn padded_header_parses_back() {
        let final_header = sample().header_bytes(Chunk::header_region_length()).unwrap();

        let parsed = Chunk::parse_header(&final_header, 17).unwrap();

        assert_eq!(parsed.id, 0x2a);
        assert_eq!(parsed.len, 3);
    }

    #[test]
    fn header_probe_rejects_stale_block() {
        let c = sample();
        let bytes = c.header_bytes(0).unwrap();

        // a header copied (or left over) at the wrong block is not a chunk
        assert!(Chunk::parse_header(&bytes, 99).is_err());
        assert!(Chunk::parse_header(&bytes, 17).is_ok());
    }

    #[test]
    fn footer_is_fixed_length_and_roundtrips() {
        let c = sample();
        let bytes = c.footer_bytes();

        assert_eq!(bytes.len(), CHUNK_FOOTER_LENGTH);
        assert_eq!(Chunk::parse_footer(&bytes).unwrap(), (0x2a, 17, 5));
    }

    #[test]
    fn fill_rate_clamps() {
        let mut c = sample();
        assert!(c.fill_rate() >= 1);

        c.max_len_live = 0;
        assert_eq!(c.fill_rate(), 0);

        c.max_len_live = c.max_len as i64 + 10;
        assert_eq!(c.fill_rate(), 100);

        c.max_len_live = 1;
        assert_eq!(c.fill_rate(), 1);
    }
}
