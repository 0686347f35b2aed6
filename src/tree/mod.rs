//! # Versioned Maps
//!
//! `MvMap` is one ordered byte-key/byte-value map backed by copy-on-write
//! pages. Every mutation replaces the pages along the root path and tags
//! the new root with the version the *next* commit will produce; the map
//! keeps a short chain of `(root page, version)` entries so that
//!
//! - a snapshot read finds the newest root at or below its pinned version,
//! - rollback drops every root newer than the target, and
//! - the garbage collector walks exactly the roots still reachable.
//!
//! The chain is trimmed against `oldest_version_to_keep` on each commit;
//! versions older than that fall back to the on-disk meta tree of the
//! closest chunk (the store's job, not this module's).
//!
//! Maps do not own their store. Tree operations take a [`PageSource`],
//! the narrow seam through which pages are read, unsaved memory is
//! accounted and dead pages are reported; the store implements it, and
//! unit tests substitute a stub.
//!
//! ## Concurrency
//!
//! The root chain sits behind a `RwLock`. Readers clone the head `Arc`
//! and work on an immutable tree; writers hold the write lock for the
//! whole descent (per-map writer serialization). Pages themselves are
//! immutable, so a serializing commit shares pages with concurrent
//! readers and writers without coordination.

mod cache;
mod page;

pub(crate) use cache::{chunk_ref_weight, ChunkRefCache, PageCache};
pub use page::{ChildRef, Page, PageContent, PAGE_DISK_HEADER_SIZE};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hashbrown::HashSet;
use parking_lot::{Mutex, RwLock};

use crate::error::{Result, StoreError};

/// The map id of the metadata map.
pub const META_MAP_ID: u32 = 0;

/// What tree operations need from their owner: page reads and the
/// unsaved/dead page accounting hooks.
pub(crate) trait PageSource {
    fn read_page(&self, map_id: u32, pos: u64) -> Result<Arc<Page>>;

    fn register_unsaved_page(&self, _memory: usize) {}

    fn remove_page(&self, _pos: u64, _memory: usize) {}

    fn page_split_size(&self) -> usize {
        16 * 1024
    }

    fn keys_per_page(&self) -> usize {
        48
    }
}

#[derive(Clone)]
pub(crate) struct RootEntry {
    pub page: Arc<Page>,
    pub version: u64,
}

pub(crate) struct MvMap {
    id: u32,
    create_version: u64,
    /// Ascending by version; the last entry is the working root.
    root: RwLock<Vec<RootEntry>>,
    /// Serializes mutations. The descent reads pages (possibly from
    /// disk, possibly recursing into the meta map), so it must not run
    /// under the root lock; the root lock is only held for the final
    /// swap.
    write_lock: Mutex<()>,
    unsaved: AtomicBool,
    closed: AtomicBool,
}

impl MvMap {
    pub fn new(id: u32, create_version: u64) -> Self {
        Self {
            id,
            create_version,
            root: RwLock::new(vec![RootEntry {
                page: Page::empty_leaf(id),
                version: create_version,
            }]),
            write_lock: Mutex::new(()),
            unsaved: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn create_version(&self) -> u64 {
        self.create_version
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Any mutation since the last successful store?
    pub fn has_unsaved_changes(&self) -> bool {
        self.unsaved.load(Ordering::Acquire)
    }

    /// Working root and its version.
    pub fn write_snapshot(&self) -> (Arc<Page>, u64) {
        let guard = self.root.read();
        let head = guard.last().expect("root chain is never empty");
        (head.page.clone(), head.version)
    }

    /// Root chain, newest first, for the reachability walk.
    pub fn root_chain(&self) -> Vec<RootEntry> {
        let guard = self.root.read();
        guard.iter().rev().cloned().collect()
    }

    /// Replaces the whole chain with a single (typically saved) root.
    pub fn set_root_page(&self, page: Arc<Page>, version: u64) {
        let mut guard = self.root.write();
        guard.clear();
        guard.push(RootEntry { page, version });
        self.unsaved.store(false, Ordering::Release);
    }

    /// Newest root at or below `version`, if this map still holds it.
    pub fn root_at(&self, version: u64) -> Option<Arc<Page>> {
        let guard = self.root.read();
        guard
            .iter()
            .rev()
            .find(|e| e.version <= version)
            .map(|e| e.page.clone())
    }

    /// Drops chain entries older than `oldest_keep`, keeping the newest
    /// entry at or below it as the floor.
    pub fn trim_versions(&self, oldest_keep: u64) {
        let mut guard = self.root.write();
        if let Some(floor) = guard.iter().rposition(|e| e.version <= oldest_keep) {
            guard.drain(..floor);
        }
    }

    /// After a successful store of `stored_root`: if the working root is
    /// still that snapshot (or got a position assigned), the map has no
    /// unsaved changes. A root replaced by a concurrent writer mid-commit
    /// stays dirty. Zero-count roots are never serialized, which is why
    /// pointer identity matters here, not just savedness.
    pub fn finish_store(&self, stored_root: &Arc<Page>) {
        let guard = self.root.read();
        if guard
            .last()
            .is_some_and(|e| Arc::ptr_eq(&e.page, stored_root) || e.page.is_saved())
        {
            self.unsaved.store(false, Ordering::Release);
        }
    }

    /// Discards roots newer than `version`. Returns false when nothing at
    /// or below the target remains, in which case the caller must either
    /// reload the root from disk or close the map.
    pub fn rollback_to(&self, version: u64) -> bool {
        let mut guard = self.root.write();
        while guard.last().is_some_and(|e| e.version > version) {
            guard.pop();
        }
        if guard.is_empty() {
            return false;
        }
        let head = guard.last().expect("just checked");
        // only the never-stored creation root is both unsaved and empty;
        // every other rollback target is a committed, saved page
        let dirty = !head.page.is_saved() && head.page.total_count() > 0;
        drop(guard);
        self.unsaved.store(dirty, Ordering::Release);
        true
    }

    pub fn total_count(&self) -> u64 {
        self.write_snapshot().0.total_count()
    }

    pub fn get(&self, src: &dyn PageSource, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let (root, _) = self.write_snapshot();
        get_from(src, &root, key)
    }

    /// Inserts or replaces, tagging the new root with `version`.
    pub fn put(
        &self,
        src: &dyn PageSource,
        version: u64,
        key: &[u8],
        value: Vec<u8>,
    ) -> Result<Option<Vec<u8>>> {
        let _w = self.write_lock.lock();
        let (head, _) = self.write_snapshot();

        let (result, old) = put_rec(src, self.id, &head, key, value)?;
        let new_root = match result {
            PutResult::Single(page) => page,
            PutResult::Split { left, sep, right } => {
                let root = Page::new_node(
                    self.id,
                    vec![sep],
                    vec![ChildRef::from_page(left), ChildRef::from_page(right)],
                );
                src.register_unsaved_page(root.memory());
                root
            }
        };
        push_root(&mut self.root.write(), new_root, version);
        self.unsaved.store(true, Ordering::Release);
        Ok(old)
    }

    /// Removes a key, tagging the new root with `version`.
    pub fn remove(
        &self,
        src: &dyn PageSource,
        version: u64,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        let _w = self.write_lock.lock();
        let (head, _) = self.write_snapshot();

        let (result, old) = remove_rec(src, self.id, &head, key)?;
        let new_root = match result {
            RemoveResult::Unchanged => return Ok(None),
            RemoveResult::Replaced(page) => page,
            RemoveResult::Empty => {
                let empty = Page::empty_leaf(self.id);
                src.register_unsaved_page(empty.memory());
                empty
            }
        };
        push_root(&mut self.root.write(), new_root, version);
        self.unsaved.store(true, Ordering::Release);
        Ok(old)
    }

    /// Re-puts one entry per leaf that lives in (or under a node in) one
    /// of the given chunks, forcing the next commit to relocate that data.
    /// Returns the number of rewritten entries.
    pub fn rewrite(
        &self,
        src: &dyn PageSource,
        version: u64,
        chunks: &HashSet<u32>,
    ) -> Result<usize> {
        let (root, _) = self.write_snapshot();
        let mut pending = Vec::new();
        collect_rewrite(src, &root, chunks, &mut pending)?;
        let count = pending.len();
        for (key, value) in pending {
            self.put(src, version, &key, value)?;
        }
        Ok(count)
    }

    pub fn cursor(
        &self,
        src: &dyn PageSource,
        start: Option<&[u8]>,
    ) -> Result<Cursor> {
        let (root, _) = self.write_snapshot();
        Cursor::new(src, root, start)
    }
}

fn push_root(chain: &mut Vec<RootEntry>, page: Arc<Page>, version: u64) {
    match chain.last_mut() {
        Some(head) if head.version == version => head.page = page,
        _ => chain.push(RootEntry { page, version }),
    }
}

/// Point lookup against an immutable root.
pub(crate) fn get_from(
    src: &dyn PageSource,
    root: &Arc<Page>,
    key: &[u8],
) -> Result<Option<Vec<u8>>> {
    let mut page = root.clone();
    loop {
        if page.is_leaf() {
            return Ok(match page.search(key) {
                Ok(i) => Some(page.value(i).to_vec()),
                Err(_) => None,
            });
        }
        let ci = page.child_index(key);
        page = load_child(src, &page, ci)?;
    }
}

fn load_child(src: &dyn PageSource, page: &Arc<Page>, index: usize) -> Result<Arc<Page>> {
    let child = &page.children()[index];
    match child.loaded() {
        Some(p) => Ok(p.clone()),
        None => src.read_page(page.map_id(), child.current_pos()),
    }
}

enum PutResult {
    Single(Arc<Page>),
    Split {
        left: Arc<Page>,
        sep: Vec<u8>,
        right: Arc<Page>,
    },
}

fn needs_split(src: &dyn PageSource, key_count: usize, memory: usize) -> bool {
    key_count > 1 && (key_count > src.keys_per_page() || memory > src.page_split_size())
}

fn put_rec(
    src: &dyn PageSource,
    map_id: u32,
    page: &Arc<Page>,
    key: &[u8],
    value: Vec<u8>,
) -> Result<(PutResult, Option<Vec<u8>>)> {
    if page.is_leaf() {
        let mut keys = page.keys().to_vec();
        let mut values = page.values().to_vec();
        let old = match page.search(key) {
            Ok(i) => Some(std::mem::replace(&mut values[i], value)),
            Err(i) => {
                keys.insert(i, key.to_vec());
                values.insert(i, value);
                None
            }
        };
        src.remove_page(page.pos(), page.memory());

        let replacement = Page::new_leaf(map_id, keys, values);
        src.register_unsaved_page(replacement.memory());
        if needs_split(src, replacement.key_count(), replacement.memory()) {
            return Ok((split_leaf(src, map_id, &replacement), old));
        }
        return Ok((PutResult::Single(replacement), old));
    }

    let ci = page.child_index(key);
    let child = load_child(src, page, ci)?;
    let (child_result, old) = put_rec(src, map_id, &child, key, value)?;

    let mut keys = page.keys().to_vec();
    let mut children = page.children().to_vec();
    match child_result {
        PutResult::Single(p) => children[ci] = ChildRef::from_page(p),
        PutResult::Split { left, sep, right } => {
            children[ci] = ChildRef::from_page(left);
            keys.insert(ci, sep);
            children.insert(ci + 1, ChildRef::from_page(right));
        }
    }
    src.remove_page(page.pos(), page.memory());

    let replacement = Page::new_node(map_id, keys, children);
    src.register_unsaved_page(replacement.memory());
    if needs_split(src, replacement.key_count(), replacement.memory()) {
        return Ok((split_node(src, map_id, &replacement), old));
    }
    Ok((PutResult::Single(replacement), old))
}

fn split_leaf(src: &dyn PageSource, map_id: u32, page: &Arc<Page>) -> PutResult {
    let mid = page.key_count() / 2;
    let left = Page::new_leaf(
        map_id,
        page.keys()[..mid].to_vec(),
        page.values()[..mid].to_vec(),
    );
    let right = Page::new_leaf(
        map_id,
        page.keys()[mid..].to_vec(),
        page.values()[mid..].to_vec(),
    );
    let sep = right.key(0).to_vec();
    // the oversized intermediate never leaves this function
    src.remove_page(0, page.memory());
    src.register_unsaved_page(left.memory());
    src.register_unsaved_page(right.memory());
    PutResult::Split { left, sep, right }
}

fn split_node(src: &dyn PageSource, map_id: u32, page: &Arc<Page>) -> PutResult {
    let mid = page.key_count() / 2;
    let sep = page.key(mid).to_vec();
    let left = Page::new_node(
        map_id,
        page.keys()[..mid].to_vec(),
        page.children()[..mid + 1].to_vec(),
    );
    let right = Page::new_node(
        map_id,
        page.keys()[mid + 1..].to_vec(),
        page.children()[mid + 1..].to_vec(),
    );
    src.remove_page(0, page.memory());
    src.register_unsaved_page(left.memory());
    src.register_unsaved_page(right.memory());
    PutResult::Split { left, sep, right }
}

enum RemoveResult {
    Unchanged,
    Replaced(Arc<Page>),
    Empty,
}

fn remove_rec(
    src: &dyn PageSource,
    map_id: u32,
    page: &Arc<Page>,
    key: &[u8],
) -> Result<(RemoveResult, Option<Vec<u8>>)> {
    if page.is_leaf() {
        let i = match page.search(key) {
            Ok(i) => i,
            Err(_) => return Ok((RemoveResult::Unchanged, None)),
        };
        let old = page.value(i).to_vec();
        src.remove_page(page.pos(), page.memory());
        if page.key_count() == 1 {
            return Ok((RemoveResult::Empty, Some(old)));
        }
        let mut keys = page.keys().to_vec();
        let mut values = page.values().to_vec();
        keys.remove(i);
        values.remove(i);
        let replacement = Page::new_leaf(map_id, keys, values);
        src.register_unsaved_page(replacement.memory());
        return Ok((RemoveResult::Replaced(replacement), Some(old)));
    }

    let ci = page.child_index(key);
    let child = load_child(src, page, ci)?;
    let (child_result, old) = remove_rec(src, map_id, &child, key)?;

    let mut keys = page.keys().to_vec();
    let mut children = page.children().to_vec();
    match child_result {
        RemoveResult::Unchanged => return Ok((RemoveResult::Unchanged, None)),
        RemoveResult::Replaced(p) => children[ci] = ChildRef::from_page(p),
        RemoveResult::Empty => {
            children.remove(ci);
            keys.remove(if ci == 0 { 0 } else { ci - 1 });
        }
    }
    src.remove_page(page.pos(), page.memory());

    if children.is_empty() {
        return Ok((RemoveResult::Empty, old));
    }
    if children.len() == 1 {
        // the node is redundant, its single child takes its place
        let only = match children[0].loaded() {
            Some(p) => p.clone(),
            None => src.read_page(map_id, children[0].current_pos())?,
        };
        return Ok((RemoveResult::Replaced(only), old));
    }
    let replacement = Page::new_node(map_id, keys, children);
    src.register_unsaved_page(replacement.memory());
    Ok((RemoveResult::Replaced(replacement), old))
}

fn collect_rewrite(
    src: &dyn PageSource,
    page: &Arc<Page>,
    chunks: &HashSet<u32>,
    out: &mut Vec<(Vec<u8>, Vec<u8>)>,
) -> Result<bool> {
    let in_set = |pos: u64| {
        crate::encoding::pos_is_saved(pos) && chunks.contains(&crate::encoding::chunk_id(pos))
    };
    if page.is_leaf() {
        if in_set(page.pos()) && page.key_count() > 0 {
            out.push((page.key(0).to_vec(), page.value(0).to_vec()));
            return Ok(true);
        }
        return Ok(false);
    }
    let mut any = false;
    for i in 0..page.children().len() {
        let child = load_child(src, page, i)?;
        any |= collect_rewrite(src, &child, chunks, out)?;
    }
    if !any && in_set(page.pos()) {
        // the node itself sits in a doomed chunk; rewriting any one entry
        // below it forces the path to move
        if let Some((key, value)) = first_entry(src, page)? {
            out.push((key, value));
            any = true;
        }
    }
    Ok(any)
}

fn first_entry(src: &dyn PageSource, page: &Arc<Page>) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
    let mut page = page.clone();
    loop {
        if page.is_leaf() {
            if page.key_count() == 0 {
                return Ok(None);
            }
            return Ok(Some((page.key(0).to_vec(), page.value(0).to_vec())));
        }
        page = load_child(src, &page, 0)?;
    }
}

/// Ascending iterator over one immutable root.
pub(crate) struct Cursor {
    stack: Vec<(Arc<Page>, usize)>,
}

impl Cursor {
    pub fn new(src: &dyn PageSource, root: Arc<Page>, start: Option<&[u8]>) -> Result<Cursor> {
        let mut stack = Vec::new();
        match start {
            None => stack.push((root, 0)),
            Some(key) => {
                let mut page = root;
                loop {
                    if page.is_leaf() {
                        let idx = match page.search(key) {
                            Ok(i) => i,
                            Err(i) => i,
                        };
                        stack.push((page, idx));
                        break;
                    }
                    let ci = page.child_index(key);
                    let child = load_child(src, &page, ci)?;
                    stack.push((page, ci + 1));
                    page = child;
                }
            }
        }
        Ok(Cursor { stack })
    }

    pub fn next(&mut self, src: &dyn PageSource) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        loop {
            let Some((page, idx)) = self.stack.last().cloned() else {
                return Ok(None);
            };
            if page.is_leaf() {
                if idx < page.key_count() {
                    self.stack.last_mut().unwrap().1 += 1;
                    return Ok(Some((page.key(idx).to_vec(), page.value(idx).to_vec())));
                }
                self.stack.pop();
                continue;
            }
            if idx < page.children().len() {
                self.stack.last_mut().unwrap().1 += 1;
                let child = load_child(src, &page, idx)?;
                self.stack.push((child, 0));
            } else {
                self.stack.pop();
            }
        }
    }
}

/// Meta values are strings; lift byte-level results.
pub(crate) fn to_string_value(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes).map_err(|_| StoreError::corrupt("meta value is not utf-8"))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Everything stays in memory; a disk read means the test tree leaked
    /// a position it should not have.
    struct NoDisk;

    impl PageSource for NoDisk {
        fn read_page(&self, map_id: u32, pos: u64) -> Result<Arc<Page>> {
            panic!("unexpected disk read: map {map_id} pos {pos:x}")
        }

        fn keys_per_page(&self) -> usize {
            8 // small pages so tests exercise splits
        }
    }

    fn filled(n: usize) -> MvMap {
        let map = MvMap::new(1, 0);
        for i in 0..n {
            map.put(&NoDisk, 1, format!("k{i:04}").as_bytes(), format!("v{i}").into_bytes())
                .unwrap();
        }
        map
    }

    #[test]
    fn put_get_roundtrip() {
        let map = filled(100);

        for i in 0..100 {
            let got = map.get(&NoDisk, format!("k{i:04}").as_bytes()).unwrap();
            assert_eq!(got, Some(format!("v{i}").into_bytes()));
        }
        assert_eq!(map.get(&NoDisk, b"missing").unwrap(), None);
        assert_eq!(map.total_count(), 100);
    }

    #[test]
    fn put_returns_previous_value() {
        let map = MvMap::new(1, 0);

        assert_eq!(map.put(&NoDisk, 1, b"a", b"1".to_vec()).unwrap(), None);
        let old = map.put(&NoDisk, 1, b"a", b"2".to_vec()).unwrap();

        assert_eq!(old, Some(b"1".to_vec()));
        assert_eq!(map.total_count(), 1);
    }

    #[test]
    fn remove_shrinks_and_returns_value() {
        let map = filled(50);

        let old = map.remove(&NoDisk, 1, b"k0025").unwrap();

        assert_eq!(old, Some(b"v25".to_vec()));
        assert_eq!(map.get(&NoDisk, b"k0025").unwrap(), None);
        assert_eq!(map.total_count(), 49);
        assert_eq!(map.remove(&NoDisk, 1, b"k0025").unwrap(), None);
    }

    #[test]
    fn removing_everything_leaves_an_empty_root() {
        let map = filled(30);

        for i in 0..30 {
            map.remove(&NoDisk, 1, format!("k{i:04}").as_bytes()).unwrap();
        }

        assert_eq!(map.total_count(), 0);
        let (root, _) = map.write_snapshot();
        assert!(root.is_leaf());
    }

    #[test]
    fn cursor_yields_sorted_order() {
        let map = filled(64);
        let mut cursor = map.cursor(&NoDisk, None).unwrap();

        let mut seen = Vec::new();
        while let Some((key, _)) = cursor.next(&NoDisk).unwrap() {
            seen.push(key);
        }

        assert_eq!(seen.len(), 64);
        let mut sorted = seen.clone();
        sorted.sort();
        assert_eq!(seen, sorted);
    }

    #[test]
    fn cursor_start_is_inclusive() {
        let map = filled(20);
        let mut cursor = map.cursor(&NoDisk, Some(b"k0010")).unwrap();

        let (first, _) = cursor.next(&NoDisk).unwrap().unwrap();

        assert_eq!(first, b"k0010".to_vec());
    }

    #[test]
    fn cursor_start_between_keys_lands_on_successor() {
        let map = filled(20);
        let mut cursor = map.cursor(&NoDisk, Some(b"k0010x")).unwrap();

        let (first, _) = cursor.next(&NoDisk).unwrap().unwrap();

        assert_eq!(first, b"k0011".to_vec());
    }

    #[test]
    fn mutations_mark_and_rollback_clears() {
        let map = MvMap::new(1, 0);
        assert!(!map.has_unsaved_changes());

        map.put(&NoDisk, 1, b"a", b"1".to_vec()).unwrap();
        assert!(map.has_unsaved_changes());

        // version-0 state is the empty creation root
        assert!(map.rollback_to(0));
        assert_eq!(map.get(&NoDisk, b"a").unwrap(), None);
    }

    #[test]
    fn root_chain_serves_old_versions() {
        let map = MvMap::new(1, 0);
        map.put(&NoDisk, 1, b"a", b"1".to_vec()).unwrap();
        map.put(&NoDisk, 2, b"a", b"2".to_vec()).unwrap();
        map.put(&NoDisk, 3, b"a", b"3".to_vec()).unwrap();

        let v1 = map.root_at(1).unwrap();
        let v2 = map.root_at(2).unwrap();

        assert_eq!(get_from(&NoDisk, &v1, b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(get_from(&NoDisk, &v2, b"a").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn same_version_mutations_share_one_chain_entry() {
        let map = MvMap::new(1, 0);
        map.put(&NoDisk, 1, b"a", b"1".to_vec()).unwrap();
        map.put(&NoDisk, 1, b"b", b"2".to_vec()).unwrap();

        assert_eq!(map.root_chain().len(), 2); // creation root + v1
    }

    #[test]
    fn trim_keeps_a_floor_entry() {
        let map = MvMap::new(1, 0);
        for v in 1..=5 {
            map.put(&NoDisk, v, b"a", vec![v as u8]).unwrap();
        }

        map.trim_versions(3);

        let chain = map.root_chain();
        assert_eq!(chain.last().unwrap().version, 3);
        assert!(map.root_at(3).is_some());
        assert!(map.root_at(2).is_none());
    }

    #[test]
    fn rollback_past_creation_reports_failure() {
        let map = MvMap::new(1, 5);
        map.put(&NoDisk, 6, b"a", b"1".to_vec()).unwrap();

        assert!(!map.rollback_to(4));
    }
}
