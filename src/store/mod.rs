//! # Store Coordinator
//!
//! The store owns everything: the block device, the chunk table, the
//! metadata map, the open-map registry, the version registry and the
//! background writer. All durable state flows through one path, the
//! commit pipeline in `store_now`:
//!
//! ```text
//! map mutations ──> dirty roots + unsaved memory
//!       │
//!       ▼  commit / try_commit / auto-commit
//! store_now: advance version ─ GC if due ─ allocate chunk id
//!    ─ serialize dirty roots into the write buffer ─ apply freed space
//!    ─ serialize meta root ─ allocate blocks ─ patch header, footer
//!    ─ write chunk ─ maybe rewrite store header ─ maybe shrink
//! ```
//!
//! ## Locking
//!
//! - the **store mutex** guards every structural mutation: commit,
//!   rollback, map create/rename/remove, recovery, chunk moves
//! - the **single-writer slot** keeps at most one store operation in
//!   flight and lets `try_commit` bail out instead of queueing; it also
//!   stops meta-map writes inside a commit from recursing into another
//!   commit
//! - the **freed-page mutex** serializes the delta map that any thread
//!   touches when it drops a page reference
//! - the **compaction mutex** bounds rewrite compaction to one caller
//! - readers never take the store mutex: the chunk table and caches are
//!   behind their own short-lived locks
//!
//! ## Failure model
//!
//! Any error inside the commit pipeline or a device write goes through
//! the panic path: the cause is retained, the background
//! writer is flagged down, the store closes without shrinking, and every
//! later operation fails with `Closed` carrying the original cause.

mod background;
mod builder;
mod compact;
mod version;

pub use builder::StoreBuilder;
pub use version::TxCounter;

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use hashbrown::{HashMap, HashSet};
use log::{debug, warn};
use parking_lot::{Mutex, MutexGuard, RwLock};
use smallvec::SmallVec;
use zeroize::Zeroize;

use crate::compress::Compressor;
use crate::encoding::{self, pos_is_saved};
use crate::error::{ErrorKind, Result, StoreError};
use crate::storage::{
    Chunk, ChunkDelta, FileStore, StoreHeader, WriteBuffer, BLOCK_SIZE, CHUNK_FOOTER_LENGTH,
    CHUNK_MAX_HEADER_LENGTH, FORMAT_READ, FORMAT_WRITE, MARKED_FREE, MAX_CHUNK_ID,
    MAX_POOLED_CAPACITY, UNSTORED_BLOCK,
};
use crate::tree::{
    chunk_ref_weight, get_from, to_string_value, ChunkRefCache, Cursor, MvMap, Page, PageCache,
    PageSource, META_MAP_ID,
};
use background::BackgroundWriter;
use version::VersionRegistry;

/// Rewrite the store header at least every this many versions.
const HEADER_VERSION_LAG: u64 = 20;

fn thread_token() -> u64 {
    use std::hash::{Hash, Hasher};
    let mut h = std::collections::hash_map::DefaultHasher::new();
    std::thread::current().id().hash(&mut h);
    h.finish() | 1
}

fn root_key(map_id: u32) -> String {
    format!("root.{map_id:x}")
}

fn map_key(map_id: u32) -> String {
    format!("map.{map_id:x}")
}

fn name_key(name: &str) -> String {
    format!("name.{name}")
}

pub(crate) struct StoreInner {
    self_ref: Weak<StoreInner>,
    file_store: Arc<FileStore>,
    read_only: bool,

    // construction-time config
    page_split_size: usize,
    keys_per_page: usize,
    compressor: Option<&'static dyn Compressor>,
    auto_commit_memory: usize,
    auto_compact_fill_rate: u8,
    #[allow(clippy::type_complexity)]
    background_error_handler: Option<Box<dyn Fn(&StoreError) + Send + Sync>>,

    // adjustable policy
    retention_time: AtomicI64,
    reuse_space: AtomicBool,
    versions_to_keep: AtomicU64,
    auto_commit_delay: AtomicU64,

    // locks
    store_lock: Mutex<()>,
    store_lock_owner: AtomicU64,
    writer_slot: AtomicBool,
    compact_lock: Mutex<()>,

    // registries
    meta: MvMap,
    maps: RwLock<HashMap<u32, Arc<MvMap>>>,
    chunks: RwLock<HashMap<u32, Chunk>>,
    last_chunk_id: RwLock<Option<u32>>,
    store_header: Mutex<StoreHeader>,
    last_map_id: AtomicU32,

    // versioning
    current_version: AtomicU64,
    last_stored_version: AtomicU64,
    current_store_version: AtomicI64,
    registry: VersionRegistry,

    // unsaved-change tracking
    freed_page_space: Mutex<HashMap<u32, ChunkDelta>>,
    unsaved_memory: AtomicUsize,
    save_needed: AtomicBool,
    meta_changed: AtomicBool,

    // clocks
    creation_time: AtomicU64,
    last_commit_time: AtomicU64,
    last_time_absolute: AtomicU64,
    last_free_unused: AtomicU64,
    auto_compact_last_file_ops: AtomicU64,

    // shared resources
    write_buffer: Mutex<Option<WriteBuffer>>,
    page_cache: Option<PageCache>,
    chunk_ref_cache: Option<ChunkRefCache>,

    background: Mutex<Option<BackgroundWriter>>,
    closed: AtomicBool,
    panic_error: Mutex<Option<Arc<StoreError>>>,
}

struct StoreLock<'a> {
    store: &'a StoreInner,
    _guard: MutexGuard<'a, ()>,
}

impl Drop for StoreLock<'_> {
    fn drop(&mut self) {
        self.store.store_lock_owner.store(0, Ordering::Release);
    }
}

impl PageSource for StoreInner {
    fn read_page(&self, _map_id: u32, pos: u64) -> Result<Arc<Page>> {
        self.read_page_at(pos)
    }

    fn register_unsaved_page(&self, memory: usize) {
        let new = self.unsaved_memory.fetch_add(memory, Ordering::AcqRel) + memory;
        if self.auto_commit_memory > 0 && new > self.auto_commit_memory {
            self.save_needed.store(true, Ordering::Release);
        }
    }

    fn remove_page(&self, pos: u64, memory: usize) {
        if !pos_is_saved(pos) {
            // allocated but never stored; only the memory estimate moves
            let _ = self
                .unsaved_memory
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                    Some(v.saturating_sub(memory))
                });
            return;
        }
        let mut freed = self.freed_page_space.lock();
        let delta = freed.entry(encoding::chunk_id(pos)).or_default();
        delta.pages -= 1;
        delta.max_len -= encoding::max_length(pos) as i64;
    }

    fn page_split_size(&self) -> usize {
        self.page_split_size
    }

    fn keys_per_page(&self) -> usize {
        self.keys_per_page
    }
}

impl StoreInner {
    // ---------------------------------------------------------------
    // lifecycle
    // ---------------------------------------------------------------

    fn lock_store(&self) -> StoreLock<'_> {
        let guard = self.store_lock.lock();
        self.store_lock_owner.store(thread_token(), Ordering::Release);
        StoreLock {
            store: self,
            _guard: guard,
        }
    }

    fn holds_store_lock(&self) -> bool {
        self.store_lock_owner.load(Ordering::Acquire) == thread_token()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(StoreError::Closed(self.panic_error.lock().clone()));
        }
        Ok(())
    }

    /// Terminal-state transition: retain the cause, stop the writer,
    /// close without shrinking, hand the error back for propagation.
    fn panic_with(&self, e: StoreError) -> StoreError {
        if !self.is_closed() {
            warn!("store panic: {e}");
            self.handle_background_error(&e);
            *self.panic_error.lock() = Some(Arc::new(e.duplicate()));
            self.close_store(false);
        }
        e
    }

    fn handle_background_error(&self, e: &StoreError) {
        if let Some(handler) = &self.background_error_handler {
            handler(e);
        }
    }

    fn stop_background(&self) {
        if let Some(writer) = self.background.lock().take() {
            writer.stop(!self.holds_store_lock());
        }
    }

    pub(crate) fn set_auto_commit_delay(&self, millis: u64) {
        if self.auto_commit_delay.swap(millis, Ordering::AcqRel) == millis {
            return;
        }
        if self.read_only {
            return;
        }
        self.stop_background();
        if millis > 0 && !self.is_closed() {
            let sleep = (millis / 10).max(1);
            let writer = BackgroundWriter::start(self.self_ref.clone(), sleep);
            *self.background.lock() = Some(writer);
        }
    }

    fn close(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        if !self.read_only {
            self.stop_background();
            {
                let _g = self.lock_store();
                let ids: Vec<u32> = {
                    let maps = self.maps.read();
                    maps.iter()
                        .filter(|(_, m)| m.is_closed())
                        .map(|(id, _)| *id)
                        .collect()
                };
                for id in ids {
                    self.meta_remove(&root_key(id))?;
                    self.maps.write().remove(&id);
                }
                self.writer_slot.store(true, Ordering::Release);
                let result = self.store_locked();
                self.writer_slot.store(false, Ordering::Release);
                result?;
            }
        }
        self.close_store(true);
        Ok(())
    }

    fn close_immediately(&self) {
        self.close_store(false);
    }

    fn close_store(&self, shrink: bool) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop_background();
        let _g = if self.holds_store_lock() {
            None
        } else {
            Some(self.lock_store())
        };
        if shrink {
            if let Err(e) = self.shrink_if_possible(0) {
                warn!("shrink on close failed: {e}");
            }
        }
        if let Some(cache) = &self.page_cache {
            cache.clear();
        }
        if let Some(cache) = &self.chunk_ref_cache {
            cache.clear();
        }
        for map in self.maps.read().values() {
            map.close();
        }
        self.maps.write().clear();
        self.chunks.write().clear();
    }

    // ---------------------------------------------------------------
    // time
    // ---------------------------------------------------------------

    fn time_absolute(&self) -> u64 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        // never runs backwards within a process, even if the wall clock
        // does
        self.last_time_absolute.fetch_max(now, Ordering::AcqRel).max(now)
    }

    fn time_since_creation(&self) -> u64 {
        self.time_absolute()
            .saturating_sub(self.creation_time.load(Ordering::Acquire))
    }

    // ---------------------------------------------------------------
    // versions
    // ---------------------------------------------------------------

    pub(crate) fn current_version(&self) -> u64 {
        self.current_version.load(Ordering::Acquire)
    }

    pub(crate) fn last_stored_version(&self) -> u64 {
        self.last_stored_version.load(Ordering::Acquire)
    }

    /// Version the next commit will produce; user mutations are tagged
    /// with it so rollback and snapshot reads agree on boundaries.
    fn user_version(&self) -> u64 {
        self.current_version() + 1
    }

    /// Version for meta mutations: inside a commit they belong to the
    /// version being stored, outside to the next one.
    fn meta_version(&self) -> u64 {
        if self.current_store_version.load(Ordering::Acquire) >= 0 {
            self.current_version()
        } else {
            self.user_version()
        }
    }

    pub(crate) fn oldest_version_to_keep(&self) -> u64 {
        let v = self.registry.oldest_version_to_keep();
        let storing = self.current_store_version.load(Ordering::Acquire);
        if storing >= 0 && (storing as u64) < v {
            storing as u64
        } else {
            v
        }
    }

    pub(crate) fn register_version_usage(&self) -> Arc<TxCounter> {
        self.registry.register()
    }

    pub(crate) fn deregister_version_usage(&self, tx: &TxCounter) {
        if self.registry.deregister(tx)
            && self
                .writer_slot
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.registry.drop_unused();
            self.writer_slot.store(false, Ordering::Release);
        }
    }

    fn is_known_version(&self, version: u64) -> bool {
        if version > self.current_version() {
            return false;
        }
        if version == self.current_version() || self.chunks.read().is_empty() {
            return true;
        }
        let Some(chunk) = self.chunk_for_version(version) else {
            return false;
        };
        let Ok(meta_root) = self.read_page_at(chunk.meta_root_pos) else {
            return false;
        };
        let check = || -> Result<bool> {
            let mut cursor = Cursor::new(self, meta_root, Some(b"chunk."))?;
            while let Some((key, value)) = cursor.next(self)? {
                if !key.starts_with(b"chunk.") {
                    break;
                }
                let key = String::from_utf8_lossy(&key).into_owned();
                if self.meta_get(&key)?.is_some() {
                    continue;
                }
                let c = Chunk::from_meta_value(&to_string_value(value)?)?;
                match self.read_chunk_header_and_footer(c.block) {
                    Some(test) if test.id == c.id => {}
                    _ => return Ok(false),
                }
            }
            Ok(true)
        };
        check().unwrap_or(false)
    }

    fn chunk_for_version(&self, version: u64) -> Option<Chunk> {
        let chunks = self.chunks.read();
        chunks
            .values()
            .filter(|c| c.version <= version)
            .max_by_key(|c| c.id)
            .cloned()
    }

    /// Root position of `map_id` as of `version`, read from the meta
    /// snapshot of the closest chunk.
    pub(crate) fn root_pos_at_version(&self, map_id: u32, version: u64) -> Result<u64> {
        let chunk = self
            .chunk_for_version(version)
            .ok_or_else(|| StoreError::argument(format!("unknown version {version}")))?;
        let meta_root = self.read_page_at(chunk.meta_root_pos)?;
        match get_from(self, &meta_root, root_key(map_id).as_bytes())? {
            Some(v) => encoding::parse_hex_u64(&to_string_value(v)?),
            None => Ok(0),
        }
    }

    // ---------------------------------------------------------------
    // meta map access
    // ---------------------------------------------------------------

    fn meta_get(&self, key: &str) -> Result<Option<String>> {
        match self.meta.get(self, key.as_bytes())? {
            Some(v) => Ok(Some(to_string_value(v)?)),
            None => Ok(None),
        }
    }

    fn meta_put(&self, key: &str, value: String) -> Result<()> {
        self.meta
            .put(self, self.meta_version(), key.as_bytes(), value.into_bytes())?;
        self.meta_changed.store(true, Ordering::Release);
        Ok(())
    }

    fn meta_remove(&self, key: &str) -> Result<bool> {
        let removed = self
            .meta
            .remove(self, self.meta_version(), key.as_bytes())?
            .is_some();
        if removed {
            self.meta_changed.store(true, Ordering::Release);
        }
        Ok(removed)
    }

    fn meta_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let mut cursor = self.meta.cursor(self, Some(prefix.as_bytes()))?;
        let mut out = Vec::new();
        while let Some((key, value)) = cursor.next(self)? {
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            out.push((
                String::from_utf8_lossy(&key).into_owned(),
                to_string_value(value)?,
            ));
        }
        Ok(out)
    }

    // ---------------------------------------------------------------
    // chunks and pages
    // ---------------------------------------------------------------

    fn get_chunk(&self, chunk_id: u32) -> Result<Chunk> {
        if let Some(c) = self.chunks.read().get(&chunk_id) {
            return Ok(c.clone());
        }
        self.check_open()?;
        // evicted from the table but still described in meta
        let Some(value) = self.meta_get(&Chunk::meta_key(chunk_id))? else {
            return Err(StoreError::ChunkNotFound(chunk_id));
        };
        let chunk = Chunk::from_meta_value(&value)?;
        if chunk.block == UNSTORED_BLOCK {
            return Err(StoreError::corrupt(format!("chunk {chunk_id} was never stored")));
        }
        self.chunks.write().insert(chunk.id, chunk.clone());
        Ok(chunk)
    }

    pub(crate) fn read_page_at(&self, pos: u64) -> Result<Arc<Page>> {
        if !pos_is_saved(pos) {
            return Err(StoreError::corrupt("read of unsaved page position"));
        }
        if let Some(cache) = &self.page_cache {
            if let Some(page) = cache.get(pos) {
                return Ok(page);
            }
        }
        let chunk = self.get_chunk(encoding::chunk_id(pos))?;
        let file_pos = chunk.block * BLOCK_SIZE as u64 + encoding::offset(pos) as u64;
        let chunk_end = (chunk.block + chunk.len as u64) * BLOCK_SIZE as u64;
        if file_pos >= chunk_end {
            return Err(StoreError::corrupt(format!(
                "page position {pos:x} outside chunk {}",
                chunk.id
            )));
        }
        let len = (encoding::max_length(pos) as u64).min(chunk_end - file_pos) as usize;
        let bytes = self.file_store.read_fully(file_pos, len)?;
        let page = Page::read(&bytes, pos)?;
        if let Some(cache) = &self.page_cache {
            cache.insert(pos, page.clone(), page.memory());
        }
        Ok(page)
    }

    fn evict_chunk_from_caches(&self, chunk_id: u32) {
        let matches = move |pos: u64| encoding::chunk_id(pos) == chunk_id;
        if let Some(cache) = &self.page_cache {
            cache.remove_where(matches);
        }
        if let Some(cache) = &self.chunk_ref_cache {
            cache.remove_where(matches);
        }
    }

    /// Device write with the engine's failure semantics: an IO error here
    /// is unrecoverable and closes the store.
    fn write_device(&self, pos: u64, data: &[u8]) -> Result<()> {
        self.file_store
            .write_fully(pos, data)
            .map_err(|e| self.panic_with(e))
    }

    // ---------------------------------------------------------------
    // unsaved changes
    // ---------------------------------------------------------------

    pub(crate) fn has_unsaved_changes(&self) -> bool {
        if self.meta_changed.load(Ordering::Acquire) || self.meta.has_unsaved_changes() {
            return true;
        }
        self.maps
            .read()
            .values()
            .any(|m| !m.is_closed() && m.has_unsaved_changes())
    }

    pub(crate) fn unsaved_memory(&self) -> usize {
        self.unsaved_memory.load(Ordering::Acquire)
    }

    /// Called before a map mutation: when enough unsaved memory piled up
    /// and auto-commit is on, commit on the spot so small writers are
    /// not starved waiting for the background pass.
    pub(crate) fn before_write(&self) {
        if self.save_needed.swap(false, Ordering::AcqRel)
            && !self.is_closed()
            && self.auto_commit_delay.load(Ordering::Acquire) > 0
            && self.auto_commit_memory > 0
            && self.unsaved_memory() > self.auto_commit_memory
        {
            self.try_commit();
        }
    }

    // ---------------------------------------------------------------
    // commit entry points
    // ---------------------------------------------------------------

    pub(crate) fn commit(&self) -> Result<u64> {
        let _g = self.lock_store();
        self.writer_slot.store(true, Ordering::Release);
        let result = self.store_locked();
        self.writer_slot.store(false, Ordering::Release);
        result?;
        Ok(self.current_version())
    }

    /// Commits unless another store operation is already in flight, in
    /// which case it returns immediately.
    pub(crate) fn try_commit(&self) -> u64 {
        if self
            .writer_slot
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let _g = self.lock_store();
            let result = self.store_locked();
            self.writer_slot.store(false, Ordering::Release);
            if let Err(e) = result {
                self.handle_background_error(&e);
            }
        }
        self.current_version()
    }

    fn store_locked(&self) -> Result<()> {
        if self.is_closed() || !self.has_unsaved_changes() {
            return Ok(());
        }
        if self.file_store.is_read_only() {
            return Err(StoreError::writing_failed("this store is read-only"));
        }
        self.current_store_version
            .store(self.current_version() as i64, Ordering::Release);
        let result = self.store_now().map_err(|e| match e.kind() {
            ErrorKind::Closed => e,
            _ => self.panic_with(e),
        });
        self.current_store_version.store(-1, Ordering::Release);
        result
    }

    // ---------------------------------------------------------------
    // the commit pipeline
    // ---------------------------------------------------------------

    fn store_now(&self) -> Result<()> {
        let store_version = self.current_version();
        let version = store_version + 1;
        self.current_version.store(version, Ordering::Release);

        let mut time = self.time_since_creation();
        self.free_unused_if_needed(time)?;
        self.last_commit_time.store(time, Ordering::Release);
        let unsaved_at_start = self.unsaved_memory();

        // the previous chunk's final descriptor was deferred to now, so
        // the meta map is not re-dirtied right after storing it
        let prev_chunk_id = *self.last_chunk_id.read();
        let mut prev_chunk = None;
        if let Some(id) = prev_chunk_id {
            let prev = self.get_chunk(id)?;
            self.meta_put(&Chunk::meta_key(id), prev.to_meta_value())?;
            time = time.max(prev.time);
            prev_chunk = Some(prev);
        }

        // allocate the next id, skipping ids still occupied
        let mut new_id = prev_chunk_id.unwrap_or(0);
        loop {
            new_id = (new_id + 1) & MAX_CHUNK_ID;
            match self.chunks.read().get(&new_id) {
                None => break,
                Some(old) if old.block == UNSTORED_BLOCK => {
                    return Err(StoreError::internal(format!(
                        "chunk {new_id} was never written, possibly out of memory"
                    )));
                }
                Some(_) => {}
            }
        }

        let mut c = Chunk::new(new_id);
        c.time = time;
        c.version = version;
        c.map_id = self.last_map_id.load(Ordering::Acquire);
        self.chunks.write().insert(new_id, c.clone());
        // dirty the meta map without persisting sentinel values
        self.meta_put(&Chunk::meta_key(new_id), c.to_meta_value())?;
        self.meta_remove(&Chunk::meta_key(new_id))?;

        // snapshot roots; finalize maps that were closed long enough ago
        let oldest = self.oldest_version_to_keep();
        let mut changed: Vec<(u32, Arc<Page>, Arc<MvMap>)> = Vec::new();
        let mut evict: Vec<u32> = Vec::new();
        for (id, map) in self.maps.read().iter() {
            if map.is_closed() {
                let (_, root_version) = map.write_snapshot();
                if root_version < oldest {
                    evict.push(*id);
                }
                continue;
            }
            map.trim_versions(oldest);
            if map.create_version() <= store_version && map.has_unsaved_changes() {
                changed.push((*id, map.write_snapshot().0, map.clone()));
            }
        }
        for id in evict {
            self.meta_remove(&root_key(id))?;
            self.maps.write().remove(&id);
        }

        let mut buf = self.take_write_buffer();
        let header_len = Chunk::header_region_length();
        buf.put(&c.header_bytes(header_len)?);
        c.page_count = 0;
        c.page_count_live = 0;
        c.max_len = 0;
        c.max_len_live = 0;

        for (id, root, _) in &changed {
            if root.total_count() == 0 {
                self.meta_remove(&root_key(*id))?;
            } else {
                if !root.is_saved() {
                    root.write_unsaved_recursive(&mut c, &mut buf, self.compressor)?;
                }
                self.meta_put(&root_key(*id), format!("{:x}", root.pos()))?;
            }
        }

        self.apply_freed_space(&mut c)?;

        self.meta.trim_versions(oldest);
        let (meta_root, _) = self.meta.write_snapshot();
        self.meta_changed.store(false, Ordering::Release);
        self.registry.on_version_change(version);
        meta_root.write_unsaved_recursive(&mut c, &mut buf, self.compressor)?;

        let chunk_len = buf.position();
        let length = (chunk_len + CHUNK_FOOTER_LENGTH).div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
        buf.pad_to(length);

        let reuse = self.reuse_space.load(Ordering::Acquire);
        let file_pos = self.allocate_file_space(length, !reuse);
        c.block = file_pos / BLOCK_SIZE as u64;
        c.len = (length / BLOCK_SIZE) as u32;
        c.meta_root_pos = meta_root.pos();
        c.next = if reuse {
            self.file_store.predict_allocation(length) / BLOCK_SIZE as u64
        } else {
            0
        };

        buf.patch(0, &c.header_bytes(header_len)?);
        buf.patch(length - CHUNK_FOOTER_LENGTH, &c.footer_bytes());

        self.write_device(file_pos, buf.as_slice())?;
        self.release_write_buffer(buf);
        self.chunks.write().insert(c.id, c.clone());

        // decide whether the store header must be rewritten; recovery
        // only ever finds chunks by walking forward from the header's
        // chunk (or from the trailing footer), so the header may lag but
        // never dangle
        let store_at_end = file_pos + length as u64 >= self.file_store.size();
        let write_header = match &prev_chunk {
            None => true,
            Some(prev) => {
                if prev.next != c.block {
                    // the forward prediction missed
                    true
                } else {
                    let header = self.store_header.lock().clone();
                    if prev.version.saturating_sub(header.version) > HEADER_VERSION_LAG {
                        true
                    } else {
                        // a gap between the header's chunk and the last
                        // one breaks the forward chain
                        let chunks = self.chunks.read();
                        let mut id = header.chunk;
                        loop {
                            if !chunks.contains_key(&id) {
                                break true;
                            }
                            if id == prev.id {
                                break false;
                            }
                            id = (id + 1) & MAX_CHUNK_ID;
                        }
                    }
                }
            }
        };

        *self.last_chunk_id.write() = Some(c.id);
        if write_header {
            self.write_store_header()?;
        }
        if !store_at_end {
            // only after the header is safe may the file shrink
            self.shrink_if_possible(1)?;
        }

        for (_, root, map) in &changed {
            map.finish_store(root);
        }
        self.meta.finish_store(&meta_root);

        let _ = self
            .unsaved_memory
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(v.saturating_sub(unsaved_at_start))
            });
        self.last_stored_version.store(store_version, Ordering::Release);
        debug!(
            "stored chunk {} at block {} ({} pages, version {})",
            c.id, c.block, c.page_count, version
        );
        Ok(())
    }

    fn take_write_buffer(&self) -> WriteBuffer {
        match self.write_buffer.lock().take() {
            Some(mut buf) => {
                buf.clear();
                buf
            }
            None => WriteBuffer::new(),
        }
    }

    fn release_write_buffer(&self, buf: WriteBuffer) {
        if buf.capacity() <= MAX_POOLED_CAPACITY {
            *self.write_buffer.lock() = Some(buf);
        }
    }

    pub(crate) fn allocate_file_space(&self, length: usize, at_end: bool) -> u64 {
        if at_end {
            let pos = self.file_store.file_length_in_use();
            self.file_store.mark_used(pos, length);
            pos
        } else {
            self.file_store.allocate(length)
        }
    }

    /// Merges pending per-chunk deltas into the chunk table. Meta updates
    /// can free further pages, so this loops until a pass changes
    /// nothing. Deltas for the in-flight chunk go straight into `current`.
    fn apply_freed_space(&self, current: &mut Chunk) -> Result<()> {
        loop {
            let mut modified: Vec<Chunk> = Vec::new();
            {
                let mut freed = self.freed_page_space.lock();
                let mut chunks = self.chunks.write();
                for (id, delta) in freed.drain() {
                    if id == current.id {
                        current.page_count_live += delta.pages;
                        current.max_len_live += delta.max_len;
                        continue;
                    }
                    if let Some(c) = chunks.get_mut(&id) {
                        c.page_count_live += delta.pages;
                        c.max_len_live += delta.max_len;
                        if c.page_count_live < 0 && c.page_count_live > -MARKED_FREE {
                            // transient after a rollback
                            c.page_count_live = 0;
                        }
                        if c.max_len_live < 0 && c.max_len_live > -MARKED_FREE {
                            c.max_len_live = 0;
                        }
                        modified.push(c.clone());
                    }
                }
            }
            if modified.is_empty() {
                return Ok(());
            }
            for c in modified {
                self.meta_put(&Chunk::meta_key(c.id), c.to_meta_value())?;
            }
        }
    }

    // ---------------------------------------------------------------
    // reachability GC
    // ---------------------------------------------------------------

    fn free_unused_if_needed(&self, time: u64) -> Result<()> {
        let retention = self.retention_time.load(Ordering::Acquire);
        let delay = (retention / 5).max(0) as u64;
        if time >= self.last_free_unused.load(Ordering::Acquire) + delay {
            // set first so a slow or failing collection is not retried
            // immediately
            self.last_free_unused.store(time, Ordering::Release);
            self.free_unused_chunks()?;
            self.last_free_unused
                .store(self.time_since_creation(), Ordering::Release);
        }
        Ok(())
    }

    pub(crate) fn free_unused_chunks(&self) -> Result<()> {
        if self.last_chunk_id.read().is_none() || !self.reuse_space.load(Ordering::Acquire) {
            return Ok(());
        }
        // roots below the oldest pinned version no longer hold chunks
        self.meta.trim_versions(self.oldest_version_to_keep());
        let referenced = self.collect_referenced_chunks()?;
        let time = self.time_since_creation();

        let candidates: Vec<Chunk> = {
            let chunks = self.chunks.read();
            chunks
                .values()
                .filter(|c| c.block != UNSTORED_BLOCK && !referenced.contains(&c.id))
                .cloned()
                .collect()
        };
        for c in candidates {
            if self.can_overwrite_chunk(&c, time) {
                debug!("freeing chunk {} (version {})", c.id, c.version);
                self.chunks.write().remove(&c.id);
                self.meta_remove(&Chunk::meta_key(c.id))?;
                self.file_store
                    .free(c.block * BLOCK_SIZE as u64, c.len as usize * BLOCK_SIZE);
                self.evict_chunk_from_caches(c.id);
            } else if c.unused == 0 {
                // first observation of death
                let mut stamped = c.clone();
                stamped.unused = time;
                self.chunks.write().insert(stamped.id, stamped.clone());
                self.meta_put(&Chunk::meta_key(stamped.id), stamped.to_meta_value())?;
            }
        }
        Ok(())
    }

    fn can_overwrite_chunk(&self, c: &Chunk, time: u64) -> bool {
        let retention = self.retention_time.load(Ordering::Acquire);
        if retention >= 0 {
            if c.time + retention as u64 > time {
                return false;
            }
            if c.unused == 0 || c.unused + (retention / 2) as u64 > time {
                return false;
            }
        }
        true
    }

    /// Chunks reachable from any root of any version that must stay
    /// readable: the working meta root, every retained older meta root,
    /// and every map root those snapshots name.
    fn collect_referenced_chunks(&self) -> Result<HashSet<u32>> {
        let last = {
            let id = self.last_chunk_id.read().expect("checked by caller");
            self.get_chunk(id)?
        };
        let mut collector = ChunkCollector {
            store: self,
            referenced: HashSet::new(),
            inspected_roots: HashSet::new(),
        };
        collector.inspected_roots.insert(last.meta_root_pos);
        collector.visit_pos(last.meta_root_pos)?;

        let oldest = self.oldest_version_to_keep();
        for entry in self.meta.root_chain() {
            let root = &entry.page;
            if root.is_saved() {
                if collector.inspected_roots.insert(root.pos()) {
                    collector.visit_pos(root.pos())?;
                }
            } else {
                collector.visit_page(root)?;
            }

            let mut cursor = Cursor::new(self, root.clone(), Some(b"root."))?;
            while let Some((key, value)) = cursor.next(self)? {
                if !key.starts_with(b"root.") {
                    break;
                }
                let pos = encoding::parse_hex_u64(&to_string_value(value)?)?;
                if pos_is_saved(pos) && collector.inspected_roots.insert(pos) {
                    collector.visit_pos(pos)?;
                }
            }

            if entry.version < oldest {
                break;
            }
        }
        Ok(collector.referenced)
    }

    // ---------------------------------------------------------------
    // file length
    // ---------------------------------------------------------------

    pub(crate) fn shrink_if_possible(&self, min_percent: u64) -> Result<()> {
        if self.file_store.is_read_only() {
            return Ok(());
        }
        let end = self.file_store.file_length_in_use();
        let size = self.file_store.size();
        if end >= size {
            return Ok(());
        }
        if min_percent > 0 && size - end < BLOCK_SIZE as u64 {
            return Ok(());
        }
        let saved_percent = 100 - end * 100 / size;
        if saved_percent < min_percent {
            return Ok(());
        }
        if !self.is_closed() {
            self.file_store.sync()?;
        }
        self.file_store.truncate(end)
    }

    // ---------------------------------------------------------------
    // store header + recovery
    // ---------------------------------------------------------------

    fn write_store_header(&self) -> Result<()> {
        let bytes = {
            let mut header = self.store_header.lock();
            if let Some(id) = *self.last_chunk_id.read() {
                if let Some(c) = self.chunks.read().get(&id) {
                    header.chunk = c.id;
                    header.block = c.block;
                    header.version = c.version;
                }
            }
            header.encode()
        };
        self.write_device(0, &bytes)
    }

    fn read_chunk_header_at(&self, block: u64) -> Result<Chunk> {
        let pos = block * BLOCK_SIZE as u64;
        let len = CHUNK_MAX_HEADER_LENGTH.min((self.file_store.size().saturating_sub(pos)) as usize);
        if len == 0 {
            return Err(StoreError::corrupt("chunk header beyond end of file"));
        }
        let bytes = self.file_store.read_fully(pos, len)?;
        Chunk::parse_header(&bytes, block)
    }

    /// Header and footer must both parse and agree; anything else means
    /// "no chunk here" (expected for torn tails).
    fn read_chunk_header_and_footer(&self, block: u64) -> Option<Chunk> {
        let header = self.read_chunk_header_at(block).ok()?;
        let end = (block + header.len as u64) * BLOCK_SIZE as u64;
        let (footer_id, _, _) = self.read_chunk_footer_before(end)?;
        if footer_id != header.id {
            return None;
        }
        Some(header)
    }

    fn read_chunk_footer_before(&self, end: u64) -> Option<(u32, u64, u64)> {
        let pos = end.checked_sub(CHUNK_FOOTER_LENGTH as u64)?;
        let bytes = self.file_store.read_fully(pos, CHUNK_FOOTER_LENGTH).ok()?;
        Chunk::parse_footer(&bytes).ok()
    }

    fn set_last_chunk(&self, last: Option<Chunk>) -> Result<()> {
        self.chunks.write().clear();
        match last {
            None => {
                *self.last_chunk_id.write() = None;
                self.last_map_id.store(0, Ordering::Release);
                self.current_version.store(0, Ordering::Release);
                self.last_stored_version.store(0, Ordering::Release);
                self.meta.set_root_page(Page::empty_leaf(META_MAP_ID), 0);
            }
            Some(c) => {
                self.last_map_id.store(c.map_id, Ordering::Release);
                self.current_version.store(c.version, Ordering::Release);
                // the recovered chunk is the stored state; an immediate
                // no-change commit must be a no-op
                self.last_stored_version.store(c.version, Ordering::Release);
                *self.last_chunk_id.write() = Some(c.id);
                let version = c.version;
                let meta_root_pos = c.meta_root_pos;
                self.chunks.write().insert(c.id, c);
                let root = self.read_page_at(meta_root_pos)?;
                self.meta.set_root_page(root, version);
            }
        }
        Ok(())
    }

    fn load_chunk_meta(&self) -> Result<()> {
        let last_version = {
            let id = self.last_chunk_id.read().expect("have a last chunk");
            self.get_chunk(id)?.version
        };
        for (_, value) in self.meta_prefix("chunk.")? {
            let c = Chunk::from_meta_value(&value)?;
            if c.version < last_version {
                if c.block == UNSTORED_BLOCK {
                    return Err(StoreError::corrupt(format!("chunk {} is invalid", c.id)));
                }
                self.chunks.write().entry(c.id).or_insert(c);
            }
        }
        Ok(())
    }

    pub(crate) fn read_store_header(&self) -> Result<()> {
        let blocks = self
            .file_store
            .read_fully(0, 2 * BLOCK_SIZE)
            .map_err(|_| StoreError::corrupt("store header unreadable"))?;
        let mut parsed: Vec<StoreHeader> = Vec::new();
        for copy in [&blocks[..BLOCK_SIZE], &blocks[BLOCK_SIZE..]] {
            match StoreHeader::decode_copy(copy) {
                Ok(h) => parsed.push(h),
                Err(e) if e.kind() == ErrorKind::UnsupportedFormat => return Err(e),
                Err(_) => {}
            }
        }
        if parsed.is_empty() {
            return Err(StoreError::corrupt("store header is corrupt in both copies"));
        }
        parsed.sort_by_key(|h| std::cmp::Reverse(h.version));

        let mut newest: Option<Chunk> = None;
        let mut adopted: Option<StoreHeader> = None;
        for header in &parsed {
            if header.version == 0 {
                if adopted.is_none() {
                    adopted = Some(header.clone());
                }
                continue;
            }
            match self.read_chunk_header_and_footer(header.block) {
                Some(test) if test.id == header.chunk => {
                    newest = Some(test);
                    adopted = Some(header.clone());
                    break;
                }
                _ => {
                    if adopted.is_none() {
                        adopted = Some(header.clone());
                    }
                }
            }
        }
        let adopted = adopted.expect("at least one copy parsed");

        if adopted.format > FORMAT_WRITE && !self.file_store.is_read_only() {
            return Err(StoreError::unsupported(format!(
                "write format {} is newer than supported {} and the store is not read-only",
                adopted.format, FORMAT_WRITE
            )));
        }
        if adopted.format_read > FORMAT_READ {
            return Err(StoreError::unsupported(format!(
                "read format {} is newer than supported {}",
                adopted.format_read, FORMAT_READ
            )));
        }

        let now = self.time_absolute();
        // rough year from quarter-days; exactness is irrelevant here
        let year = 1970 + now / (1000 * 60 * 60 * 6 * 1461);
        let mut header = adopted;
        if year < 2014 {
            // no real-time clock: pretend the store is old enough that
            // existing chunks are overwritable
            header.created = now.saturating_sub(self.file_store.default_retention_time() as u64);
        } else if now < header.created {
            header.created = now;
        }
        self.creation_time.store(header.created, Ordering::Release);
        *self.store_header.lock() = header;

        // the trailing footer may name a chunk newer than the header does
        if let Some((_, block, _)) = self.read_chunk_footer_before(self.file_store.size()) {
            if let Some(test) = self.read_chunk_header_and_footer(block) {
                if newest.as_ref().map_or(true, |n| test.version > n.version) {
                    newest = Some(test);
                }
            }
        }

        let Some(mut newest) = newest else {
            self.set_last_chunk(None)?;
            return Ok(());
        };

        // follow the forward chain of next-chunk predictions
        loop {
            if newest.next == 0 || newest.next >= self.file_store.size() / BLOCK_SIZE as u64 {
                break;
            }
            match self.read_chunk_header_and_footer(newest.next) {
                Some(test) if test.id > newest.id => newest = test,
                _ => break,
            }
        }

        loop {
            self.set_last_chunk(Some(newest.clone()))?;
            self.load_chunk_meta()?;
            // rebuild the free-space map from scratch on every
            // iteration; a rollback inside the sweep frees chunks that
            // were marked used
            self.file_store.clear_free_space();
            for c in self.chunks.read().values() {
                self.file_store
                    .mark_used(c.block * BLOCK_SIZE as u64, c.len as usize * BLOCK_SIZE);
            }
            match self.verify_last_chunks()? {
                Some(better) => newest = better,
                None => break,
            }
        }
        Ok(())
    }

    /// Consistency sweep: the newest chunk whose entire meta closure
    /// verifies on disk is the recovery point. Returns the chunk to roll
    /// back to, or None when the current last chunk already verifies.
    fn verify_last_chunks(&self) -> Result<Option<Chunk>> {
        let mut ids: Vec<u32> = self.chunks.read().keys().copied().collect();
        ids.sort_unstable();
        let mut valid: HashSet<u32> = HashSet::new();
        let mut newest_valid: Option<u32> = None;

        for id in ids {
            let c = match self.chunks.read().get(&id) {
                Some(c) => c.clone(),
                None => continue,
            };
            match self.read_chunk_header_and_footer(c.block) {
                Some(test) if test.id == c.id => {}
                _ => continue,
            }
            valid.insert(id);

            let closure_ok = (|| -> Result<bool> {
                let meta_root = self.read_page_at(c.meta_root_pos)?;
                let mut cursor = Cursor::new(self, meta_root, Some(b"chunk."))?;
                while let Some((key, value)) = cursor.next(self)? {
                    if !key.starts_with(b"chunk.") {
                        break;
                    }
                    let referenced = Chunk::from_meta_value(&to_string_value(value)?)?;
                    if !valid.contains(&referenced.id) {
                        return Ok(false);
                    }
                }
                Ok(true)
            })()
            .unwrap_or(false);
            if closure_ok {
                newest_valid = Some(id);
            }
        }

        let last = *self.last_chunk_id.read();
        if newest_valid == last {
            return Ok(None);
        }
        match newest_valid {
            None => {
                warn!("no chunk with a complete closure; store resets to empty");
                self.rollback_to_locked(0)?;
                Ok(None)
            }
            Some(id) => {
                let keep = self.chunks.read().get(&id).cloned().ok_or_else(|| {
                    StoreError::internal("verified chunk vanished from the table")
                })?;
                warn!(
                    "rolling back to chunk {} (version {}) after finding a torn tail",
                    keep.id, keep.version
                );
                self.rollback_to_locked(keep.version)?;
                Ok(Some(keep))
            }
        }
    }

    // ---------------------------------------------------------------
    // rollback
    // ---------------------------------------------------------------

    pub(crate) fn rollback_to(&self, version: u64) -> Result<()> {
        let _g = self.lock_store();
        self.check_open()?;
        self.rollback_to_locked(version)
    }

    fn rollback_to_locked(&self, version: u64) -> Result<()> {
        if version == 0 {
            for map in self.maps.read().values() {
                map.close();
            }
            self.maps.write().clear();
            self.meta.set_root_page(Page::empty_leaf(META_MAP_ID), 0);
            self.chunks.write().clear();
            self.file_store.clear_free_space();
            if let Some(cache) = &self.page_cache {
                cache.clear();
            }
            if let Some(cache) = &self.chunk_ref_cache {
                cache.clear();
            }
            *self.last_chunk_id.write() = None;
            self.freed_page_space.lock().clear();
            self.registry.clear(0);
            self.current_version.store(0, Ordering::Release);
            self.last_stored_version.store(0, Ordering::Release);
            self.meta_changed.store(false, Ordering::Release);
            return Ok(());
        }
        if !self.is_known_version(version) {
            return Err(StoreError::argument(format!("unknown version {version}")));
        }

        self.registry.rollback_to(version);
        let meta_rolled_back = self.meta.rollback_to(version);
        self.meta_changed.store(false, Ordering::Release);
        self.freed_page_space.lock().clear();

        // chunks written after the target are zeroed on disk so a later
        // recovery cannot mistake them for a valid tail
        let (mut remove, keep): (Vec<Chunk>, Option<Chunk>) = {
            let chunks = self.chunks.read();
            let remove: Vec<Chunk> =
                chunks.values().filter(|c| c.version > version).cloned().collect();
            let keep = chunks
                .values()
                .filter(|c| c.version <= version)
                .max_by_key(|c| c.id)
                .cloned();
            (remove, keep)
        };
        let load_from_file = !remove.is_empty();
        if load_from_file {
            remove.sort_by_key(|c| std::cmp::Reverse(c.id));
            for c in &remove {
                self.chunks.write().remove(&c.id);
                let start = c.block * BLOCK_SIZE as u64;
                let length = c.len as usize * BLOCK_SIZE;
                self.file_store.free(start, length);
                self.evict_chunk_from_caches(c.id);
                self.write_device(start, &vec![0u8; length])?;
                // rollback is not performance critical; sync per chunk so
                // reordered writes cannot resurrect a zeroed tail
                self.file_store.sync()?;
            }
            *self.last_chunk_id.write() = keep.as_ref().map(|c| c.id);
            self.write_store_header()?;
            self.read_store_header()?;
        } else if !meta_rolled_back {
            // the target predates the in-memory root chain; reload the
            // meta root from the closest chunk
            let chunk = self.chunk_for_version(version).ok_or_else(|| {
                StoreError::argument(format!("unknown version {version}"))
            })?;
            let root = self.read_page_at(chunk.meta_root_pos)?;
            self.meta.set_root_page(root, version);
        }

        let maps: Vec<(u32, Arc<MvMap>)> = self
            .maps
            .read()
            .iter()
            .map(|(id, m)| (*id, m.clone()))
            .collect();
        for (id, map) in maps {
            if map.create_version() >= version {
                map.close();
                self.maps.write().remove(&id);
            } else if load_from_file || !map.rollback_to(version) {
                let pos = match self.meta_get(&root_key(id))? {
                    Some(v) => encoding::parse_hex_u64(&v)?,
                    None => 0,
                };
                let page = if pos_is_saved(pos) {
                    self.read_page_at(pos)?
                } else {
                    Page::empty_leaf(id)
                };
                map.set_root_page(page, version);
            }
        }
        self.current_version.store(version, Ordering::Release);
        let _ = self
            .last_stored_version
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.min(version)));
        Ok(())
    }

    // ---------------------------------------------------------------
    // map registry
    // ---------------------------------------------------------------

    fn get_map_id(&self, name: &str) -> Result<Option<u32>> {
        match self.meta_get(&name_key(name))? {
            Some(v) => Ok(Some(encoding::parse_hex_u32(&v)?)),
            None => Ok(None),
        }
    }

    pub(crate) fn open_map(&self, name: &str) -> Result<Arc<MvMap>> {
        let _g = self.lock_store();
        self.check_open()?;
        if let Some(id) = self.get_map_id(name)? {
            if let Some(map) = self.maps.read().get(&id) {
                return Ok(map.clone());
            }
            let config = self.meta_get(&map_key(id))?.ok_or_else(|| {
                StoreError::corrupt(format!("map {name:?} has no map.{id:x} entry"))
            })?;
            let fields = encoding::parse_fields(&config)?;
            let create_version = match fields.get("createVersion") {
                Some(v) => encoding::parse_hex_u64(v)?,
                None => 0,
            };
            let map = Arc::new(MvMap::new(id, create_version));
            let pos = match self.meta_get(&root_key(id))? {
                Some(v) => encoding::parse_hex_u64(&v)?,
                None => 0,
            };
            let root = if pos_is_saved(pos) {
                self.read_page_at(pos)?
            } else {
                Page::empty_leaf(id)
            };
            map.set_root_page(root, self.last_stored_version());
            self.maps.write().insert(id, map.clone());
            return Ok(map);
        }

        let id = self.last_map_id.load(Ordering::Acquire) + 1;
        self.last_map_id.store(id, Ordering::Release);
        let create_version = self.current_version();
        let config = encoding::encode_fields(&[
            ("name", name.to_string()),
            ("createVersion", format!("{create_version:x}")),
        ]);
        self.meta_put(&map_key(id), config)?;
        self.meta_put(&name_key(name), format!("{id:x}"))?;
        let map = Arc::new(MvMap::new(id, create_version));
        self.maps.write().insert(id, map.clone());
        Ok(map)
    }

    pub(crate) fn has_map(&self, name: &str) -> Result<bool> {
        self.check_open()?;
        Ok(self.meta_get(&name_key(name))?.is_some())
    }

    pub(crate) fn has_data(&self, name: &str) -> Result<bool> {
        self.check_open()?;
        match self.get_map_id(name)? {
            Some(id) => Ok(self.meta_get(&root_key(id))?.is_some()),
            None => Ok(false),
        }
    }

    pub(crate) fn map_names(&self) -> Result<Vec<String>> {
        self.check_open()?;
        Ok(self
            .meta_prefix("name.")?
            .into_iter()
            .map(|(k, _)| k["name.".len()..].to_string())
            .collect())
    }

    pub(crate) fn map_name(&self, id: u32) -> Result<Option<String>> {
        self.check_open()?;
        match self.meta_get(&map_key(id))? {
            Some(config) => {
                let fields = encoding::parse_fields(&config)?;
                Ok(fields.get("name").cloned())
            }
            None => Ok(None),
        }
    }

    pub(crate) fn rename_map(&self, old_name: &str, new_name: &str) -> Result<()> {
        let _g = self.lock_store();
        self.check_open()?;
        if old_name == new_name {
            return Ok(());
        }
        let id = self
            .get_map_id(old_name)?
            .ok_or_else(|| StoreError::argument(format!("no map named {old_name:?}")))?;
        if id == META_MAP_ID {
            return Err(StoreError::argument("renaming the meta map is not allowed"));
        }
        if self.meta_get(&name_key(new_name))?.is_some() {
            return Err(StoreError::argument(format!(
                "a map named {new_name:?} already exists"
            )));
        }
        let create_version = match self.meta_get(&map_key(id))? {
            Some(config) => match encoding::parse_fields(&config)?.get("createVersion") {
                Some(v) => encoding::parse_hex_u64(v)?,
                None => 0,
            },
            None => 0,
        };
        self.meta_remove(&name_key(old_name))?;
        self.meta_put(
            &map_key(id),
            encoding::encode_fields(&[
                ("name", new_name.to_string()),
                ("createVersion", format!("{create_version:x}")),
            ]),
        )?;
        self.meta_put(&name_key(new_name), format!("{id:x}"))?;
        Ok(())
    }

    pub(crate) fn remove_map(&self, name: &str) -> Result<bool> {
        let _g = self.lock_store();
        self.check_open()?;
        let Some(id) = self.get_map_id(name)? else {
            return Ok(false);
        };
        if id == META_MAP_ID {
            return Err(StoreError::argument("removing the meta map is not allowed"));
        }
        if let Some(map) = self.maps.write().remove(&id) {
            map.close();
        }
        self.meta_remove(&map_key(id))?;
        self.meta_remove(&name_key(name))?;
        self.meta_remove(&root_key(id))?;
        Ok(true)
    }

    // ---------------------------------------------------------------
    // background pass
    // ---------------------------------------------------------------

    pub(crate) fn write_in_background(&self) {
        let result = (|| -> Result<()> {
            if self.is_closed() {
                return Ok(());
            }
            let time = self.time_since_creation();
            let delay = self.auto_commit_delay.load(Ordering::Acquire);
            if time <= self.last_commit_time.load(Ordering::Acquire) + delay {
                return Ok(());
            }
            self.try_commit();

            if self.auto_compact_fill_rate > 0 {
                let ops = self.file_store.read_count() + self.file_store.write_count();
                let busy = self.auto_compact_last_file_ops.load(Ordering::Acquire) != ops;
                // while the store is busy, be satisfied with a lower
                // fill rate
                let target = if busy {
                    self.auto_compact_fill_rate / 3
                } else {
                    self.auto_compact_fill_rate
                };
                self.compact(target, self.auto_commit_memory)?;
                self.auto_compact_last_file_ops.store(
                    self.file_store.read_count() + self.file_store.write_count(),
                    Ordering::Release,
                );
            }
            Ok(())
        })();
        if let Err(e) = result {
            self.handle_background_error(&e);
        }
    }

    // ---------------------------------------------------------------
    // accessors used across the impl blocks
    // ---------------------------------------------------------------

    pub(crate) fn retention_time(&self) -> i64 {
        self.retention_time.load(Ordering::Acquire)
    }

    pub(crate) fn set_retention_time(&self, ms: i64) {
        self.retention_time.store(ms, Ordering::Release);
    }

    pub(crate) fn reuse_space(&self) -> bool {
        self.reuse_space.load(Ordering::Acquire)
    }

    pub(crate) fn set_reuse_space(&self, reuse: bool) {
        self.reuse_space.store(reuse, Ordering::Release);
    }

    pub(crate) fn file_store(&self) -> &FileStore {
        &self.file_store
    }

    pub(crate) fn meta_map(&self) -> &MvMap {
        &self.meta
    }

    pub(crate) fn open_maps(&self) -> Vec<Arc<MvMap>> {
        self.maps.read().values().cloned().collect()
    }

    pub(crate) fn chunks_snapshot(&self) -> Vec<Chunk> {
        self.chunks.read().values().cloned().collect()
    }

    pub(crate) fn last_chunk(&self) -> Option<Chunk> {
        let id = (*self.last_chunk_id.read())?;
        self.chunks.read().get(&id).cloned()
    }

    pub(crate) fn update_chunk(&self, chunk: Chunk) {
        self.chunks.write().insert(chunk.id, chunk);
    }
}

/// Reachability walker. Registers, for every visited saved position, the
/// chunk holding it; interior pages additionally contribute their whole
/// subtree, memoized per position in the chunk-ref cache.
struct ChunkCollector<'a> {
    store: &'a StoreInner,
    referenced: HashSet<u32>,
    inspected_roots: HashSet<u64>,
}

impl ChunkCollector<'_> {
    fn visit_pos(&mut self, pos: u64) -> Result<()> {
        if !pos_is_saved(pos) {
            return Ok(());
        }
        self.referenced.insert(encoding::chunk_id(pos));
        if encoding::page_type(pos) == encoding::PAGE_TYPE_LEAF {
            return Ok(());
        }
        let ids = self.subtree_ids(pos)?;
        self.referenced.extend(ids.iter().copied());
        Ok(())
    }

    fn visit_page(&mut self, page: &Arc<Page>) -> Result<()> {
        if page.is_saved() {
            return self.visit_pos(page.pos());
        }
        if page.is_leaf() {
            return Ok(());
        }
        for child in page.children() {
            match child.loaded() {
                Some(p) if !p.is_saved() => self.visit_page(p)?,
                _ => self.visit_pos(child.current_pos())?,
            }
        }
        Ok(())
    }

    /// Chunk ids referenced below an interior page position.
    fn subtree_ids(&mut self, pos: u64) -> Result<Arc<SmallVec<[u32; 8]>>> {
        if let Some(cache) = &self.store.chunk_ref_cache {
            if let Some(ids) = cache.get(pos) {
                return Ok(ids);
            }
        }
        let page = self.store.read_page_at(pos)?;
        let mut ids: SmallVec<[u32; 8]> = SmallVec::new();
        for child_pos in page.child_positions() {
            if !pos_is_saved(child_pos) {
                continue;
            }
            let id = encoding::chunk_id(child_pos);
            if !ids.contains(&id) {
                ids.push(id);
            }
            if encoding::page_type(child_pos) == encoding::PAGE_TYPE_NODE {
                for id in self.subtree_ids(child_pos)?.iter() {
                    if !ids.contains(id) {
                        ids.push(*id);
                    }
                }
            }
        }
        let ids = Arc::new(ids);
        if let Some(cache) = &self.store.chunk_ref_cache {
            cache.insert(pos, ids.clone(), chunk_ref_weight(&ids));
        }
        Ok(ids)
    }
}

// =================================================================
// public surface
// =================================================================

/// A persistent, versioned multi-map store.
///
/// One backing file holds any number of named ordered maps. Commits are
/// atomic across all maps; historical versions stay readable until
/// reclamation, and the store can roll back to any retained version.
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Opens (or creates) a store at `path` with default settings.
    pub fn open(path: impl AsRef<Path>) -> Result<Store> {
        StoreBuilder::new().file_name(path).open()
    }

    pub fn builder() -> StoreBuilder {
        StoreBuilder::new()
    }

    pub(crate) fn open_with(mut builder: StoreBuilder) -> Result<Store> {
        if let Some(mut key) = builder.encryption_key.take() {
            // the cipher layer is an external collaborator; the key must
            // not outlive construction
            debug!("encryption key supplied; cipher layer is external, key zeroed");
            key.zeroize();
        }

        let file_store = match builder.file_store.clone() {
            Some(fs) => fs,
            None => {
                let path = builder.file_name.as_ref().ok_or_else(|| {
                    StoreError::argument("either file_name or file_store is required")
                })?;
                Arc::new(FileStore::open(path, builder.read_only)?)
            }
        };
        let read_only = file_store.is_read_only();

        let cache_bytes = builder.cache_size_mb * 1024 * 1024;
        let (page_cache, chunk_ref_cache) = if cache_bytes > 0 {
            (
                Some(PageCache::new(cache_bytes, builder.cache_concurrency)),
                Some(ChunkRefCache::new(cache_bytes / 4, builder.cache_concurrency)),
            )
        } else {
            (None, None)
        };

        let retention = file_store.default_retention_time();
        let inner = Arc::new_cyclic(|weak: &Weak<StoreInner>| StoreInner {
            self_ref: weak.clone(),
            file_store: file_store.clone(),
            read_only,
            page_split_size: builder.page_split_size,
            keys_per_page: builder.keys_per_page,
            compressor: crate::compress::for_level(builder.compress),
            auto_commit_memory: builder.auto_commit_memory(),
            auto_compact_fill_rate: builder.auto_compact_fill_rate,
            background_error_handler: builder.background_error_handler.take(),
            retention_time: AtomicI64::new(retention),
            reuse_space: AtomicBool::new(true),
            versions_to_keep: AtomicU64::new(5),
            auto_commit_delay: AtomicU64::new(0),
            store_lock: Mutex::new(()),
            store_lock_owner: AtomicU64::new(0),
            writer_slot: AtomicBool::new(false),
            compact_lock: Mutex::new(()),
            meta: MvMap::new(META_MAP_ID, 0),
            maps: RwLock::new(HashMap::new()),
            chunks: RwLock::new(HashMap::new()),
            last_chunk_id: RwLock::new(None),
            store_header: Mutex::new(StoreHeader::new(0)),
            last_map_id: AtomicU32::new(0),
            current_version: AtomicU64::new(0),
            last_stored_version: AtomicU64::new(0),
            current_store_version: AtomicI64::new(-1),
            registry: VersionRegistry::new(0),
            freed_page_space: Mutex::new(HashMap::new()),
            unsaved_memory: AtomicUsize::new(0),
            save_needed: AtomicBool::new(false),
            meta_changed: AtomicBool::new(false),
            creation_time: AtomicU64::new(0),
            last_commit_time: AtomicU64::new(0),
            last_time_absolute: AtomicU64::new(0),
            last_free_unused: AtomicU64::new(0),
            auto_compact_last_file_ops: AtomicU64::new(0),
            write_buffer: Mutex::new(None),
            page_cache,
            chunk_ref_cache,
            background: Mutex::new(None),
            closed: AtomicBool::new(false),
            panic_error: Mutex::new(None),
        });

        if file_store.size() == 0 {
            if read_only {
                return Err(StoreError::corrupt("read-only store has no header"));
            }
            let created = inner.time_absolute();
            inner.creation_time.store(created, Ordering::Release);
            *inner.store_header.lock() = StoreHeader::new(created);
            inner.write_store_header()?;
        } else if let Err(e) = inner.read_store_header() {
            return Err(inner.panic_with(e));
        }
        inner
            .last_commit_time
            .store(inner.time_since_creation(), Ordering::Release);

        // drop root entries whose map definition is gone
        if !read_only {
            let orphans: Vec<String> = inner
                .meta_prefix("root.")?
                .into_iter()
                .map(|(k, _)| k)
                .filter(|k| {
                    let id = &k["root.".len()..];
                    !matches!(inner.meta_get(&format!("map.{id}")), Ok(Some(_)))
                })
                .collect();
            for key in orphans {
                debug!("removing orphan meta entry {key}");
                inner.meta_remove(&key)?;
            }
        }

        inner.set_auto_commit_delay(builder.auto_commit_delay_ms);
        Ok(Store { inner })
    }

    /// Opens a named map, creating it on first use.
    pub fn open_map(&self, name: &str) -> Result<Map> {
        let map = self.inner.open_map(name)?;
        Ok(Map {
            store: Arc::downgrade(&self.inner),
            map,
        })
    }

    pub fn has_map(&self, name: &str) -> Result<bool> {
        self.inner.has_map(name)
    }

    /// Whether the map exists and has stored data.
    pub fn has_data(&self, name: &str) -> Result<bool> {
        self.inner.has_data(name)
    }

    pub fn remove_map(&self, name: &str) -> Result<bool> {
        self.inner.remove_map(name)
    }

    pub fn rename_map(&self, old_name: &str, new_name: &str) -> Result<()> {
        self.inner.rename_map(old_name, new_name)
    }

    pub fn map_names(&self) -> Result<Vec<String>> {
        self.inner.map_names()
    }

    pub fn map_name(&self, id: u32) -> Result<Option<String>> {
        self.inner.map_name(id)
    }

    /// Commits pending changes; returns the current version, advanced
    /// only if there was anything to store.
    pub fn commit(&self) -> Result<u64> {
        self.inner.check_open()?;
        self.inner.commit()
    }

    /// Commits unless another store operation is in flight; never
    /// blocks on the single-writer slot. May return before this
    /// thread's changes are persisted.
    pub fn try_commit(&self) -> u64 {
        self.inner.try_commit()
    }

    /// Reverts to the beginning of the current version, dropping
    /// uncommitted changes.
    pub fn rollback(&self) -> Result<()> {
        self.inner.rollback_to(self.inner.current_version())
    }

    /// Reverts to `version`; all later changes, stored or not, are
    /// forgotten. Version 0 empties the store. Removed maps are not
    /// restored.
    pub fn rollback_to(&self, version: u64) -> Result<()> {
        self.inner.rollback_to(version)
    }

    pub fn sync(&self) -> Result<()> {
        self.inner.check_open()?;
        self.inner.file_store().sync()
    }

    /// Rewrites sparse chunks until the overall fill rate reaches
    /// `target_fill_rate` percent or `write` bytes were rewritten.
    /// Returns whether anything was rewritten.
    pub fn compact(&self, target_fill_rate: u8, write: usize) -> Result<bool> {
        self.inner.compact(target_fill_rate, write)
    }

    /// Moves trailing chunks toward the file head and shrinks the file.
    pub fn compact_move_chunks(&self, target_fill_rate: u8, move_size: u64) -> Result<()> {
        self.inner.compact_move_chunks(target_fill_rate, move_size)
    }

    /// Rewrites every live page. Returns whether anything was written.
    pub fn compact_rewrite_fully(&self) -> Result<bool> {
        self.inner.compact_rewrite_fully()
    }

    pub fn current_version(&self) -> u64 {
        self.inner.current_version()
    }

    pub fn last_stored_version(&self) -> u64 {
        self.inner.last_stored_version()
    }

    pub fn oldest_version_to_keep(&self) -> u64 {
        self.inner.oldest_version_to_keep()
    }

    /// The user-facing store version from `setting.storeVersion`.
    pub fn store_version(&self) -> Result<u32> {
        self.inner.check_open()?;
        match self.inner.meta_get("setting.storeVersion")? {
            Some(v) => encoding::parse_hex_u32(&v),
            None => Ok(0),
        }
    }

    pub fn set_store_version(&self, version: u32) -> Result<()> {
        self.inner.check_open()?;
        self.inner
            .meta_put("setting.storeVersion", format!("{version:x}"))
    }

    /// Pins the current version against reclamation until the returned
    /// counter is deregistered.
    pub fn register_version_usage(&self) -> Arc<TxCounter> {
        self.inner.register_version_usage()
    }

    pub fn deregister_version_usage(&self, tx: &TxCounter) {
        self.inner.deregister_version_usage(tx)
    }

    /// How long unreferenced chunks stay readable, in ms. Negative
    /// disables retention entirely.
    pub fn set_retention_time(&self, ms: i64) {
        self.inner.set_retention_time(ms);
    }

    pub fn retention_time(&self) -> i64 {
        self.inner.retention_time()
    }

    /// Whether freed space inside the file is reused (default) or all
    /// chunks append at the end, e.g. during an online backup.
    pub fn set_reuse_space(&self, reuse: bool) {
        self.inner.set_reuse_space(reuse);
    }

    pub fn set_versions_to_keep(&self, count: u64) {
        self.inner.versions_to_keep.store(count, Ordering::Release);
    }

    pub fn versions_to_keep(&self) -> u64 {
        self.inner.versions_to_keep.load(Ordering::Acquire)
    }

    pub fn set_auto_commit_delay(&self, millis: u64) {
        self.inner.set_auto_commit_delay(millis);
    }

    pub fn auto_commit_delay(&self) -> u64 {
        self.inner.auto_commit_delay.load(Ordering::Acquire)
    }

    /// Replaces the cache budget (MiB) and drops current cache contents.
    pub fn set_cache_size(&self, mb: usize) {
        if let Some(cache) = &self.inner.page_cache {
            cache.set_max_memory(mb * 1024 * 1024);
        }
        if let Some(cache) = &self.inner.chunk_ref_cache {
            cache.set_max_memory(mb * 1024 * 1024 / 4);
        }
    }

    pub fn has_unsaved_changes(&self) -> bool {
        self.inner.has_unsaved_changes()
    }

    pub fn unsaved_memory(&self) -> usize {
        self.inner.unsaved_memory()
    }

    /// Live bytes over total chunk bytes, percent; young chunks count as
    /// fully live.
    pub fn current_fill_rate(&self) -> u8 {
        self.inner.current_fill_rate()
    }

    /// Size of the backing file in bytes.
    pub fn file_size(&self) -> u64 {
        self.inner.file_store().size()
    }

    /// Commits pending changes, stops the background writer and closes.
    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }

    /// Closes without writing anything; pending changes are lost.
    pub fn close_immediately(&self) {
        self.inner.close_immediately();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.read_only
    }

    /// The error that closed this store, if it died by panic.
    pub fn panic_error(&self) -> Option<Arc<StoreError>> {
        self.inner.panic_error.lock().clone()
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if !self.inner.is_closed() {
            if let Err(e) = self.inner.close() {
                warn!("close on drop failed: {e}");
                self.inner.close_immediately();
            }
        }
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.inner.file_store().path())
            .field("version", &self.inner.current_version())
            .field("closed", &self.inner.is_closed())
            .finish()
    }
}

/// Handle to one named, ordered byte-key/byte-value map.
///
/// Handles are cheap to clone and stay valid across commits; operations
/// fail with `Closed` once the store is gone.
#[derive(Clone)]
pub struct Map {
    store: Weak<StoreInner>,
    map: Arc<MvMap>,
}

impl Map {
    fn store(&self) -> Result<Arc<StoreInner>> {
        self.store
            .upgrade()
            .ok_or(StoreError::Closed(None))
    }

    pub fn id(&self) -> u32 {
        self.map.id()
    }

    pub fn name(&self) -> Result<Option<String>> {
        self.store()?.map_name(self.map.id())
    }

    fn read_target(&self) -> Result<Arc<StoreInner>> {
        let store = self.store()?;
        store.check_open()?;
        if self.map.is_closed() {
            return Err(StoreError::argument("this map is closed"));
        }
        Ok(store)
    }

    pub fn get(&self, key: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>> {
        let store = self.read_target()?;
        self.map.get(&*store, key.as_ref())
    }

    pub fn contains_key(&self, key: impl AsRef<[u8]>) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    pub fn put(&self, key: impl AsRef<[u8]>, value: impl Into<Vec<u8>>) -> Result<Option<Vec<u8>>> {
        let store = self.write_target()?;
        store.before_write();
        self.map
            .put(&*store, store.user_version(), key.as_ref(), value.into())
    }

    pub fn remove(&self, key: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>> {
        let store = self.write_target()?;
        store.before_write();
        self.map
            .remove(&*store, store.user_version(), key.as_ref())
    }

    fn write_target(&self) -> Result<Arc<StoreInner>> {
        let store = self.read_target()?;
        if store.read_only {
            return Err(StoreError::writing_failed("this store is read-only"));
        }
        Ok(store)
    }

    pub fn len(&self) -> Result<u64> {
        self.read_target()?;
        Ok(self.map.total_count())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Iterates the current state of the map in key order.
    pub fn iter(&self) -> Result<MapIter> {
        self.iter_from(None::<&[u8]>)
    }

    /// Iterates in key order starting at `start` (inclusive).
    pub fn iter_from(&self, start: Option<impl AsRef<[u8]>>) -> Result<MapIter> {
        let store = self.read_target()?;
        let cursor = self.map.cursor(&*store, start.as_ref().map(|s| s.as_ref()))?;
        Ok(MapIter { store, cursor })
    }

    /// Read-only view of this map at a historical version. Pin the
    /// version with `Store::register_version_usage` first if reclamation
    /// might run while the snapshot is in use.
    pub fn open_version(&self, version: u64) -> Result<MapSnapshot> {
        let store = self.read_target()?;
        if !store.is_known_version(version) {
            return Err(StoreError::argument(format!("unknown version {version}")));
        }
        let root = match self.map.root_at(version) {
            Some(root) => root,
            None => {
                let pos = store.root_pos_at_version(self.map.id(), version)?;
                if pos_is_saved(pos) {
                    store.read_page_at(pos)?
                } else {
                    Page::empty_leaf(self.map.id())
                }
            }
        };
        Ok(MapSnapshot {
            store: self.store.clone(),
            root,
            version,
        })
    }
}

impl std::fmt::Debug for Map {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Map").field("id", &self.map.id()).finish()
    }
}

/// Owning iterator over a map snapshot, yielding key/value pairs in key
/// order.
pub struct MapIter {
    store: Arc<StoreInner>,
    cursor: Cursor,
}

impl Iterator for MapIter {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.cursor.next(&*self.store).transpose()
    }
}

/// Read-only view of one map at one version.
pub struct MapSnapshot {
    store: Weak<StoreInner>,
    root: Arc<Page>,
    version: u64,
}

impl MapSnapshot {
    fn store(&self) -> Result<Arc<StoreInner>> {
        self.store
            .upgrade()
            .ok_or(StoreError::Closed(None))
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, key: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>> {
        let store = self.store()?;
        store.check_open()?;
        get_from(&*store, &self.root, key.as_ref())
    }

    pub fn len(&self) -> u64 {
        self.root.total_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> Result<MapIter> {
        let store = self.store()?;
        store.check_open()?;
        let cursor = Cursor::new(&*store, self.root.clone(), None)?;
        Ok(MapIter { store, cursor })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::builder()
            .file_name(dir.path().join("test.db"))
            .auto_commit_disabled()
            .open()
            .unwrap();
        (dir, store)
    }

    #[test]
    fn chunk_id_allocation_wraps_and_skips_live_ids() {
        let (_dir, store) = scratch_store();
        let map = store.open_map("m").unwrap();
        map.put("a", "1").unwrap();
        store.commit().unwrap();

        // force the id counter to the wrap point; the next allocation
        // wraps through the 26-bit mask
        let last = store.inner.last_chunk().unwrap();
        let mut moved = last.clone();
        moved.id = MAX_CHUNK_ID;
        store.inner.chunks.write().remove(&last.id);
        store.inner.update_chunk(moved);
        *store.inner.last_chunk_id.write() = Some(MAX_CHUNK_ID);

        map.put("b", "2").unwrap();
        store.commit().unwrap();

        let ids: Vec<u32> = store
            .inner
            .chunks_snapshot()
            .iter()
            .map(|c| c.id)
            .collect();
        assert!(ids.contains(&0), "wrapped id SHOULD be 0, got {ids:?}");
        assert!(ids.contains(&MAX_CHUNK_ID));
    }

    #[test]
    fn meta_version_tracks_commit_state() {
        let (_dir, store) = scratch_store();
        // outside a commit, meta mutations belong to the next version
        assert_eq!(store.inner.meta_version(), store.inner.user_version());
    }

    #[test]
    fn background_writer_exists_only_with_positive_delay() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::builder()
            .file_name(dir.path().join("t.db"))
            .auto_commit_delay_ms(0)
            .open()
            .unwrap();
        assert!(store.inner.background.lock().is_none());

        store.set_auto_commit_delay(50);
        assert!(store.inner.background.lock().is_some());

        store.set_auto_commit_delay(0);
        assert!(store.inner.background.lock().is_none());
    }

    #[test]
    fn panicked_store_reports_cause_on_every_call() {
        let (_dir, store) = scratch_store();
        let boom = StoreError::internal("simulated device failure");
        let returned = store.inner.panic_with(boom);

        assert_eq!(returned.kind(), ErrorKind::Internal);
        assert!(store.is_closed());
        let err = store.commit().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Closed);
        assert_eq!(err.cause().unwrap().kind(), ErrorKind::Internal);
        assert!(store.panic_error().is_some());
    }

    #[test]
    fn free_space_accounting_matches_chunks() {
        let (_dir, store) = scratch_store();
        let map = store.open_map("m").unwrap();
        for i in 0..100 {
            map.put(format!("k{i}"), format!("v{i}")).unwrap();
        }
        store.commit().unwrap();
        map.put("one", "more").unwrap();
        store.commit().unwrap();

        let expected = store
            .inner
            .chunks_snapshot()
            .iter()
            .map(|c| (c.block + c.len as u64) * BLOCK_SIZE as u64)
            .max()
            .unwrap();
        assert_eq!(store.inner.file_store().file_length_in_use(), expected);
    }
}
