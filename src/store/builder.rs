//! # Store Builder
//!
//! Construction-time configuration. Every knob has the engine's
//! documented default; `open` consumes the builder.
//!
//! ```no_run
//! use stratadb::Store;
//!
//! let store = Store::builder()
//!     .file_name("/var/data/app.db")
//!     .cache_size_mb(32)
//!     .compress(1)
//!     .auto_commit_delay_ms(500)
//!     .open()?;
//! # Ok::<(), stratadb::StoreError>(())
//! ```
//!
//! The auto-commit buffer size is given in KiB of *disk*; the in-memory
//! threshold is 19 bytes of heap per byte of disk, so the default 1024
//! KiB buffer auto-commits at roughly 19 MiB of unsaved pages.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Result, StoreError};
use crate::storage::FileStore;
use crate::store::Store;

/// Heap bytes estimated per byte of eventual disk space.
pub(crate) const MEMORY_PER_DISK_BYTE: usize = 19;

pub struct StoreBuilder {
    pub(crate) file_name: Option<PathBuf>,
    pub(crate) file_store: Option<Arc<FileStore>>,
    pub(crate) read_only: bool,
    pub(crate) cache_size_mb: usize,
    pub(crate) cache_concurrency: usize,
    pub(crate) page_split_size: usize,
    pub(crate) keys_per_page: usize,
    pub(crate) compress: u8,
    pub(crate) auto_commit_buffer_kb: usize,
    pub(crate) auto_commit_delay_ms: u64,
    pub(crate) auto_compact_fill_rate: u8,
    pub(crate) encryption_key: Option<Vec<u8>>,
    #[allow(clippy::type_complexity)]
    pub(crate) background_error_handler: Option<Box<dyn Fn(&StoreError) + Send + Sync>>,
}

impl Default for StoreBuilder {
    fn default() -> Self {
        Self {
            file_name: None,
            file_store: None,
            read_only: false,
            cache_size_mb: 16,
            cache_concurrency: 16,
            page_split_size: 16 * 1024,
            keys_per_page: 48,
            compress: 0,
            auto_commit_buffer_kb: 1024,
            auto_commit_delay_ms: 1000,
            auto_compact_fill_rate: 40,
            encryption_key: None,
            background_error_handler: None,
        }
    }
}

impl StoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backing file; created if absent (parent directory must exist).
    pub fn file_name(mut self, path: impl AsRef<Path>) -> Self {
        self.file_name = Some(path.as_ref().to_path_buf());
        self
    }

    /// Use an already-open device instead of opening `file_name`.
    pub fn file_store(mut self, fs: Arc<FileStore>) -> Self {
        self.file_store = Some(fs);
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Page cache budget in MiB (default 16). 0 disables caching.
    pub fn cache_size_mb(mut self, mb: usize) -> Self {
        self.cache_size_mb = mb;
        self
    }

    /// Cache shard count (default 16).
    pub fn cache_concurrency(mut self, shards: usize) -> Self {
        self.cache_concurrency = shards.max(1);
        self
    }

    /// Bytes a page may reach before it is split (default 16 KiB).
    pub fn page_split_size(mut self, bytes: usize) -> Self {
        self.page_split_size = bytes;
        self
    }

    /// Entries a page may hold before it is split (default 48).
    pub fn keys_per_page(mut self, keys: usize) -> Self {
        self.keys_per_page = keys.max(2);
        self
    }

    /// 0 = off, 1 = fast codec, 2 = high-ratio codec.
    pub fn compress(mut self, level: u8) -> Self {
        self.compress = level;
        self
    }

    /// Unsaved-change budget in KiB of disk before an automatic commit
    /// (default 1024). 0 disables memory-triggered commits.
    pub fn auto_commit_buffer_kb(mut self, kb: usize) -> Self {
        self.auto_commit_buffer_kb = kb;
        self
    }

    /// Maximum ms between automatic commits (default 1000). 0 disables
    /// the background writer entirely.
    pub fn auto_commit_delay_ms(mut self, ms: u64) -> Self {
        self.auto_commit_delay_ms = ms;
        self
    }

    /// Disables auto-commit: no background thread, no memory trigger.
    pub fn auto_commit_disabled(mut self) -> Self {
        self.auto_commit_buffer_kb = 0;
        self.auto_commit_delay_ms = 0;
        self
    }

    /// Target chunk fill rate for background compaction, percent
    /// (default 40). 0 disables auto-compaction.
    pub fn auto_compact_fill_rate(mut self, percent: u8) -> Self {
        self.auto_compact_fill_rate = percent;
        self
    }

    /// Encryption key. The cipher layer is external to this engine; the
    /// key is zeroed before `open` returns.
    pub fn encryption_key(mut self, key: Vec<u8>) -> Self {
        self.encryption_key = Some(key);
        self
    }

    /// Handler for errors raised on the background writer thread.
    pub fn background_error_handler(
        mut self,
        handler: impl Fn(&StoreError) + Send + Sync + 'static,
    ) -> Self {
        self.background_error_handler = Some(Box::new(handler));
        self
    }

    pub fn open(self) -> Result<Store> {
        Store::open_with(self)
    }

    pub(crate) fn auto_commit_memory(&self) -> usize {
        self.auto_commit_buffer_kb * 1024 * MEMORY_PER_DISK_BYTE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let b = StoreBuilder::new();

        assert_eq!(b.cache_size_mb, 16);
        assert_eq!(b.auto_commit_delay_ms, 1000);
        assert_eq!(b.auto_compact_fill_rate, 40);
        assert_eq!(b.auto_commit_memory(), 1024 * 1024 * 19);
    }

    #[test]
    fn auto_commit_disabled_zeroes_both_knobs() {
        let b = StoreBuilder::new().auto_commit_disabled();

        assert_eq!(b.auto_commit_delay_ms, 0);
        assert_eq!(b.auto_commit_buffer_kb, 0);
        assert_eq!(b.auto_commit_memory(), 0);
    }
}
