//! # Copy-on-Write Pages
//!
//! A page is an immutable B-tree node: a leaf holds keys and values, an
//! interior node holds separator keys and child references. Mutations
//! never touch an existing page; they build replacements along the root
//! path, so every historical root keeps describing a consistent tree for
//! as long as its chunks survive.
//!
//! The only mutable bit of a page is its position: zero while the page
//! lives purely in memory, set exactly once when the commit pipeline
//! serializes it into a chunk. Sharing is by `Arc`; a page referenced from
//! three root versions is one allocation.
//!
//! ## Disk layout
//!
//! ```text
//! +--------------------+-------------------------------------+
//! | PageDiskHeader 16B | body (optionally zstd-compressed)   |
//! +--------------------+-------------------------------------+
//!
//! node body:  (pos u64, count u64) x (key_count + 1), then keys
//! leaf body:  keys, then values          key/value = len u32, bytes
//! compressed: expanded_len u32, zstd frame
//! ```
//!
//! The header's `check` field is a CRC-32 of the stored body truncated to
//! 16 bits; a failed check is reported as corruption, not as a missing
//! page, because by the time a position resolves to bytes the chunk header
//! and footer have already verified.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crc::{Crc, CRC_32_ISCSI};
use smallvec::SmallVec;
use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::compress::Compressor;
use crate::encoding::{encode_pos, page_type, PAGE_TYPE_LEAF, PAGE_TYPE_NODE};
use crate::error::{Result, StoreError};
use crate::storage::{Chunk, WriteBuffer};

pub const PAGE_DISK_HEADER_SIZE: usize = 16;

const FLAG_NODE: u8 = 0b01;
const FLAG_COMPRESSED: u8 = 0b10;

/// Compressing only pays off past this body size.
const MIN_COMPRESS_LEN: usize = 64;

const CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct PageDiskHeader {
    length: U32,
    check: U16,
    map_id: U32,
    key_count: U16,
    flags: u8,
    _reserved: [u8; 3],
}

const _: () = assert!(std::mem::size_of::<PageDiskHeader>() == PAGE_DISK_HEADER_SIZE);

impl PageDiskHeader {
    zerocopy_getters! {
        length: u32,
        check: u16,
        map_id: u32,
        key_count: u16,
    }

    fn new(length: u32, check: u16, map_id: u32, key_count: u16, flags: u8) -> Self {
        Self {
            length: U32::new(length),
            check: U16::new(check),
            map_id: U32::new(map_id),
            key_count: U16::new(key_count),
            flags,
            _reserved: [0; 3],
        }
    }
}

/// Reference to one child of an interior page.
#[derive(Debug, Clone)]
pub struct ChildRef {
    pos: u64,
    page: Option<Arc<Page>>,
    count: u64,
}

impl ChildRef {
    pub fn from_page(page: Arc<Page>) -> Self {
        Self {
            pos: page.pos(),
            count: page.total_count(),
            page: Some(page),
        }
    }

    pub fn from_pos(pos: u64, count: u64) -> Self {
        Self { pos, page: None, count }
    }

    /// Current position: a loaded page may have been assigned one since
    /// this reference was built.
    pub fn current_pos(&self) -> u64 {
        match &self.page {
            Some(p) => {
                let pos = p.pos();
                if pos != 0 {
                    pos
                } else {
                    self.pos
                }
            }
            None => self.pos,
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn loaded(&self) -> Option<&Arc<Page>> {
        self.page.as_ref()
    }
}

#[derive(Debug)]
pub enum PageContent {
    Leaf { values: Vec<Vec<u8>> },
    Node { children: Vec<ChildRef> },
}

#[derive(Debug)]
pub struct Page {
    map_id: u32,
    pos: AtomicU64,
    keys: Vec<Vec<u8>>,
    content: PageContent,
    memory: u32,
}

impl Page {
    pub fn new_leaf(map_id: u32, keys: Vec<Vec<u8>>, values: Vec<Vec<u8>>) -> Arc<Page> {
        debug_assert_eq!(keys.len(), values.len());
        let memory = leaf_memory(&keys, &values);
        Arc::new(Page {
            map_id,
            pos: AtomicU64::new(0),
            keys,
            content: PageContent::Leaf { values },
            memory,
        })
    }

    pub fn new_node(map_id: u32, keys: Vec<Vec<u8>>, children: Vec<ChildRef>) -> Arc<Page> {
        debug_assert_eq!(keys.len() + 1, children.len());
        let memory = node_memory(&keys, &children);
        Arc::new(Page {
            map_id,
            pos: AtomicU64::new(0),
            keys,
            content: PageContent::Node { children },
            memory,
        })
    }

    pub fn empty_leaf(map_id: u32) -> Arc<Page> {
        Self::new_leaf(map_id, Vec::new(), Vec::new())
    }

    pub fn map_id(&self) -> u32 {
        self.map_id
    }

    pub fn pos(&self) -> u64 {
        self.pos.load(Ordering::Acquire)
    }

    pub fn is_saved(&self) -> bool {
        self.pos() != 0
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.content, PageContent::Leaf { .. })
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    pub fn key(&self, i: usize) -> &[u8] {
        &self.keys[i]
    }

    pub fn keys(&self) -> &[Vec<u8>] {
        &self.keys
    }

    pub fn value(&self, i: usize) -> &[u8] {
        match &self.content {
            PageContent::Leaf { values } => &values[i],
            PageContent::Node { .. } => unreachable!("value() on interior page"),
        }
    }

    pub fn values(&self) -> &[Vec<u8>] {
        match &self.content {
            PageContent::Leaf { values } => values,
            PageContent::Node { .. } => unreachable!("values() on interior page"),
        }
    }

    pub fn children(&self) -> &[ChildRef] {
        match &self.content {
            PageContent::Node { children } => children,
            PageContent::Leaf { .. } => unreachable!("children() on leaf page"),
        }
    }

    /// Entries in the subtree under this page.
    pub fn total_count(&self) -> u64 {
        match &self.content {
            PageContent::Leaf { .. } => self.keys.len() as u64,
            PageContent::Node { children } => children.iter().map(|c| c.count()).sum(),
        }
    }

    /// In-memory size estimate, also the unsaved-memory unit.
    pub fn memory(&self) -> usize {
        self.memory as usize
    }

    pub fn search(&self, key: &[u8]) -> std::result::Result<usize, usize> {
        self.keys.binary_search_by(|k| k.as_slice().cmp(key))
    }

    /// Which child to descend into for `key`.
    pub fn child_index(&self, key: &[u8]) -> usize {
        match self.search(key) {
            Ok(i) => i + 1,
            Err(i) => i,
        }
    }

    /// Serializes this page and every unsaved descendant into `buf`,
    /// assigning positions and updating the chunk's occupancy counters.
    /// Post-order, so child positions are known when the parent's body is
    /// built. Returns the page's position.
    pub fn write_unsaved_recursive(
        &self,
        chunk: &mut Chunk,
        buf: &mut WriteBuffer,
        compressor: Option<&dyn Compressor>,
    ) -> Result<u64> {
        let existing = self.pos();
        if existing != 0 {
            return Ok(existing);
        }

        if let PageContent::Node { children } = &self.content {
            for child in children {
                if child.current_pos() == 0 {
                    let page = child.loaded().ok_or_else(|| {
                        StoreError::internal("unsaved child without an in-memory page")
                    })?;
                    page.write_unsaved_recursive(chunk, buf, compressor)?;
                }
            }
        }

        let mut body = Vec::with_capacity(self.memory());
        match &self.content {
            PageContent::Node { children } => {
                for child in children {
                    let pos = child.current_pos();
                    debug_assert_ne!(pos, 0);
                    body.extend_from_slice(&pos.to_le_bytes());
                    body.extend_from_slice(&child.count().to_le_bytes());
                }
                write_vecs(&mut body, &self.keys);
            }
            PageContent::Leaf { values } => {
                write_vecs(&mut body, &self.keys);
                write_vecs(&mut body, values);
            }
        }

        let mut flags = if self.is_leaf() { 0 } else { FLAG_NODE };
        let mut stored = body;
        if let Some(codec) = compressor {
            if stored.len() >= MIN_COMPRESS_LEN {
                let packed = codec.compress(&stored)?;
                if packed.len() + 4 < stored.len() {
                    let mut framed = Vec::with_capacity(packed.len() + 4);
                    framed.extend_from_slice(&(stored.len() as u32).to_le_bytes());
                    framed.extend_from_slice(&packed);
                    stored = framed;
                    flags |= FLAG_COMPRESSED;
                }
            }
        }

        let length = (PAGE_DISK_HEADER_SIZE + stored.len()) as u32;
        let check = CRC.checksum(&stored) as u16;
        let header = PageDiskHeader::new(
            length,
            check,
            self.map_id,
            self.keys.len() as u16,
            flags,
        );

        let offset = buf.position() as u32;
        buf.put(header.as_bytes());
        buf.put(&stored);

        let page_type = if self.is_leaf() { PAGE_TYPE_LEAF } else { PAGE_TYPE_NODE };
        let pos = encode_pos(chunk.id, offset, length, page_type);

        chunk.page_count += 1;
        chunk.page_count_live += 1;
        let max = crate::encoding::max_length(pos) as u64;
        chunk.max_len += max;
        chunk.max_len_live += max as i64;

        self.pos.store(pos, Ordering::Release);
        Ok(pos)
    }

    /// Deserializes a page from bytes read at `pos`.
    pub fn read(bytes: &[u8], pos: u64) -> Result<Arc<Page>> {
        let header: &PageDiskHeader = crate::parse_zerocopy(bytes, "PageDiskHeader")?;
        let length = header.length() as usize;
        if length < PAGE_DISK_HEADER_SIZE || length > bytes.len() {
            return Err(StoreError::corrupt(format!(
                "page length {length} out of range at position {pos:x}"
            )));
        }
        let is_node = header.flags & FLAG_NODE != 0;
        let expected_node = page_type(pos) == PAGE_TYPE_NODE;
        if is_node != expected_node {
            return Err(StoreError::corrupt(format!(
                "page type mismatch at position {pos:x}"
            )));
        }

        let stored = &bytes[PAGE_DISK_HEADER_SIZE..length];
        let check = CRC.checksum(stored) as u16;
        if check != header.check() {
            return Err(StoreError::corrupt(format!(
                "page checksum mismatch at position {pos:x}"
            )));
        }

        let body;
        let expanded;
        if header.flags & FLAG_COMPRESSED != 0 {
            if stored.len() < 4 {
                return Err(StoreError::corrupt("compressed page too short"));
            }
            let expanded_len =
                u32::from_le_bytes(stored[..4].try_into().unwrap()) as usize;
            expanded = crate::compress::reader().decompress(&stored[4..], expanded_len)?;
            body = expanded.as_slice();
        } else {
            body = stored;
        }

        let key_count = header.key_count() as usize;
        let mut r = BodyReader::new(body);
        let page = if is_node {
            let mut children = Vec::with_capacity(key_count + 1);
            for _ in 0..key_count + 1 {
                let child_pos = r.read_u64()?;
                let count = r.read_u64()?;
                children.push(ChildRef::from_pos(child_pos, count));
            }
            let keys = r.read_vecs(key_count)?;
            Page::new_node(header.map_id(), keys, children)
        } else {
            let keys = r.read_vecs(key_count)?;
            let values = r.read_vecs(key_count)?;
            Page::new_leaf(header.map_id(), keys, values)
        };
        page.pos.store(pos, Ordering::Release);
        Ok(page)
    }

    /// Positions of all children; for the reachability walk.
    pub fn child_positions(&self) -> SmallVec<[u64; 16]> {
        match &self.content {
            PageContent::Leaf { .. } => SmallVec::new(),
            PageContent::Node { children } => {
                children.iter().map(|c| c.current_pos()).collect()
            }
        }
    }
}

fn write_vecs(out: &mut Vec<u8>, items: &[Vec<u8>]) {
    for item in items {
        out.extend_from_slice(&(item.len() as u32).to_le_bytes());
        out.extend_from_slice(item);
    }
}

fn leaf_memory(keys: &[Vec<u8>], values: &[Vec<u8>]) -> u32 {
    let payload: usize = keys.iter().map(|k| k.len()).sum::<usize>()
        + values.iter().map(|v| v.len()).sum::<usize>();
    (64 + payload + 48 * keys.len()) as u32
}

fn node_memory(keys: &[Vec<u8>], children: &[ChildRef]) -> u32 {
    let payload: usize = keys.iter().map(|k| k.len()).sum();
    (64 + payload + 24 * keys.len() + 40 * children.len()) as u32
}

struct BodyReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BodyReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(StoreError::corrupt("page body truncated"));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn read_vecs(&mut self, n: usize) -> Result<Vec<Vec<u8>>> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            let len = self.read_u32()? as usize;
            out.push(self.take(len)?.to_vec());
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kv(n: usize) -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
        let keys = (0..n).map(|i| format!("key{i:04}").into_bytes()).collect();
        let values = (0..n).map(|i| format!("value{i}").into_bytes()).collect();
        (keys, values)
    }

    fn write_one(page: &Arc<Page>, compressor: Option<&dyn Compressor>) -> (u64, Vec<u8>, Chunk) {
        let mut chunk = Chunk::new(1);
        chunk.page_count = 0;
        chunk.page_count_live = 0;
        chunk.max_len = 0;
        chunk.max_len_live = 0;
        let mut buf = WriteBuffer::new();
        buf.set_position(64); // pretend a chunk header sits in front
        let pos = page.write_unsaved_recursive(&mut chunk, &mut buf, compressor).unwrap();
        (pos, buf.as_slice().to_vec(), chunk)
    }

    #[test]
    fn leaf_roundtrip() {
        let (keys, values) = kv(10);
        let page = Page::new_leaf(3, keys.clone(), values.clone());

        let (pos, bytes, chunk) = write_one(&page, None);
        let offset = crate::encoding::offset(pos) as usize;
        let read = Page::read(&bytes[offset..], pos).unwrap();

        assert!(read.is_leaf());
        assert_eq!(read.map_id(), 3);
        assert_eq!(read.keys(), keys.as_slice());
        assert_eq!(read.values(), values.as_slice());
        assert_eq!(chunk.page_count, 1);
        assert!(chunk.max_len > 0);
    }

    #[test]
    fn node_roundtrip_writes_children_first() {
        let (keys_a, values_a) = kv(4);
        let left = Page::new_leaf(1, keys_a, values_a);
        let (keys_b, values_b) = kv(4);
        let right = Page::new_leaf(1, keys_b, values_b);
        let sep = right.key(0).to_vec();
        let node = Page::new_node(
            1,
            vec![sep],
            vec![ChildRef::from_page(left), ChildRef::from_page(right)],
        );

        let (pos, bytes, chunk) = write_one(&node, None);

        assert_eq!(chunk.page_count, 3);
        let offset = crate::encoding::offset(pos) as usize;
        let read = Page::read(&bytes[offset..], pos).unwrap();
        assert!(!read.is_leaf());
        assert_eq!(read.children().len(), 2);
        assert_eq!(read.total_count(), 8);
        // children serialized before the parent, so their offsets are lower
        for child in read.children() {
            assert!(crate::encoding::offset(child.current_pos()) < offset as u32);
        }
    }

    #[test]
    fn already_saved_page_is_not_rewritten() {
        let (keys, values) = kv(2);
        let page = Page::new_leaf(1, keys, values);
        let (pos, _, _) = write_one(&page, None);

        let (pos2, bytes2, chunk2) = write_one(&page, None);

        assert_eq!(pos, pos2);
        assert_eq!(chunk2.page_count, 0);
        assert_eq!(bytes2.len(), 64); // nothing after the header stub
    }

    #[test]
    fn compressible_page_stores_compressed() {
        let keys = (0..50).map(|i| format!("key{i:04}").into_bytes()).collect();
        let values = (0..50).map(|_| vec![7u8; 200]).collect::<Vec<_>>();
        let page = Page::new_leaf(1, keys, values);

        let (pos, bytes, _) = write_one(&page, Some(&crate::compress::ZstdFast));
        let offset = crate::encoding::offset(pos) as usize;
        let header: &PageDiskHeader =
            crate::parse_zerocopy(&bytes[offset..], "PageDiskHeader").unwrap();

        assert!(header.flags & FLAG_COMPRESSED != 0);
        let read = Page::read(&bytes[offset..], pos).unwrap();
        assert_eq!(read.total_count(), 50);
        assert_eq!(read.value(0), &[7u8; 200][..]);
    }

    #[test]
    fn flipped_bit_is_detected() {
        let (keys, values) = kv(6);
        let page = Page::new_leaf(1, keys, values);
        let (pos, mut bytes, _) = write_one(&page, None);
        let offset = crate::encoding::offset(pos) as usize;
        bytes[offset + PAGE_DISK_HEADER_SIZE + 3] ^= 1;

        let err = Page::read(&bytes[offset..], pos).unwrap_err();

        assert_eq!(err.kind(), crate::error::ErrorKind::Corrupt);
    }

    #[test]
    fn type_bit_must_match_position() {
        let (keys, values) = kv(2);
        let page = Page::new_leaf(1, keys, values);
        let (pos, bytes, _) = write_one(&page, None);
        let offset = crate::encoding::offset(pos) as usize;
        let wrong = pos | 1; // claim it is a node

        assert!(Page::read(&bytes[offset..], wrong).is_err());
    }
}
