//! # File-Backed Block Device
//!
//! Positional reads and writes over a single file, plus the free-space
//! facade the commit pipeline and compaction negotiate chunk placement
//! through. All positions and lengths on the allocation facade are byte
//! values and block-aligned; the translation to block indices stays inside
//! this module.
//!
//! The device keeps its own view of the file length (extended by writes,
//! cut by `truncate`) and counts read/write operations; the background
//! writer compares those counters between passes to pick its compaction
//! target.
//!
//! ## Concurrency
//!
//! Reads and writes go through `pread`/`pwrite` style positional I/O and
//! can run concurrently; the free-space map sits behind its own mutex.
//! Exclusion between writers is the store's job (single-writer slot), not
//! the device's.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;
use parking_lot::Mutex;

use super::{FreeSpaceMap, BLOCK_SIZE, DEFAULT_RETENTION_TIME};
use crate::error::{Result, StoreError};

pub struct FileStore {
    path: PathBuf,
    file: File,
    read_only: bool,
    size: AtomicU64,
    read_count: AtomicU64,
    write_count: AtomicU64,
    free: Mutex<FreeSpaceMap>,
}

impl FileStore {
    /// Opens (or, in write mode, creates) the backing file.
    pub fn open(path: &Path, read_only: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(!read_only)
            .open(path)?;
        let size = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            file,
            read_only,
            size: AtomicU64::new(size),
            read_count: AtomicU64::new(0),
            write_count: AtomicU64::new(0),
            free: Mutex::new(FreeSpaceMap::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn read_count(&self) -> u64 {
        self.read_count.load(Ordering::Relaxed)
    }

    pub fn write_count(&self) -> u64 {
        self.write_count.load(Ordering::Relaxed)
    }

    pub fn default_retention_time(&self) -> i64 {
        DEFAULT_RETENTION_TIME
    }

    /// Reads exactly `len` bytes at `pos`.
    pub fn read_fully(&self, pos: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.file.read_exact_at(&mut buf, pos)?;
        self.read_count.fetch_add(1, Ordering::Relaxed);
        Ok(buf)
    }

    /// Writes all of `data` at `pos`, extending the tracked length.
    pub fn write_fully(&self, pos: u64, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(StoreError::writing_failed("store is read-only"));
        }
        self.file.write_all_at(data, pos)?;
        self.write_count.fetch_add(1, Ordering::Relaxed);
        self.size.fetch_max(pos + data.len() as u64, Ordering::AcqRel);
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    pub fn truncate(&self, size: u64) -> Result<()> {
        if self.read_only {
            return Err(StoreError::writing_failed("store is read-only"));
        }
        debug!("truncating {:?} to {} bytes", self.path, size);
        self.file.set_len(size)?;
        self.size.store(size, Ordering::Release);
        Ok(())
    }

    // ---------------------------------------------------------------
    // free-space facade (byte positions, block-aligned)
    // ---------------------------------------------------------------

    pub fn clear_free_space(&self) {
        self.free.lock().clear();
    }

    pub fn mark_used(&self, pos: u64, len: usize) {
        self.free
            .lock()
            .mark_used(pos / BLOCK_SIZE as u64, (len / BLOCK_SIZE) as u64);
    }

    pub fn free(&self, pos: u64, len: usize) {
        self.free
            .lock()
            .free_blocks(pos / BLOCK_SIZE as u64, (len / BLOCK_SIZE) as u64);
    }

    /// Reserves `len` bytes and returns their byte position.
    pub fn allocate(&self, len: usize) -> u64 {
        self.free.lock().allocate((len / BLOCK_SIZE) as u64) * BLOCK_SIZE as u64
    }

    /// Where the next `len`-byte allocation would land.
    pub fn predict_allocation(&self, len: usize) -> u64 {
        self.free.lock().predict_allocation((len / BLOCK_SIZE) as u64) * BLOCK_SIZE as u64
    }

    /// One byte past the last used block.
    pub fn file_length_in_use(&self) -> u64 {
        self.free.lock().length_in_use()
    }

    /// First free byte position (start of the first gap).
    pub fn first_free(&self) -> u64 {
        self.free.lock().first_free() * BLOCK_SIZE as u64
    }

    /// Percentage of the used span that is actually occupied.
    pub fn fill_rate(&self) -> u8 {
        self.free.lock().fill_rate()
    }
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore")
            .field("path", &self.path)
            .field("size", &self.size())
            .field("read_only", &self.read_only)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch() -> (tempfile::TempDir, FileStore) {
        let dir = tempfile::tempdir().unwrap();
        let fs = FileStore::open(&dir.path().join("t.db"), false).unwrap();
        (dir, fs)
    }

    #[test]
    fn write_extends_tracked_size() {
        let (_dir, fs) = scratch();

        fs.write_fully(8192, &[7u8; 4096]).unwrap();

        assert_eq!(fs.size(), 12288);
        assert_eq!(fs.read_fully(8192, 4096).unwrap(), vec![7u8; 4096]);
    }

    #[test]
    fn truncate_cuts_tracked_size() {
        let (_dir, fs) = scratch();
        fs.write_fully(0, &[1u8; 16384]).unwrap();

        fs.truncate(4096).unwrap();

        assert_eq!(fs.size(), 4096);
        assert!(fs.read_fully(8192, 16).is_err());
    }

    #[test]
    fn read_only_store_refuses_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");
        FileStore::open(&path, false)
            .unwrap()
            .write_fully(0, &[0u8; 4096])
            .unwrap();

        let ro = FileStore::open(&path, true).unwrap();

        let err = ro.write_fully(0, &[1u8; 16]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::WritingFailed);
        assert!(ro.truncate(0).is_err());
    }

    #[test]
    fn op_counters_advance() {
        let (_dir, fs) = scratch();
        fs.write_fully(0, &[0u8; 4096]).unwrap();
        fs.read_fully(0, 16).unwrap();

        assert_eq!(fs.write_count(), 1);
        assert_eq!(fs.read_count(), 1);
    }

    #[test]
    fn allocation_facade_works_in_bytes() {
        let (_dir, fs) = scratch();

        let pos = fs.allocate(2 * BLOCK_SIZE);
        assert_eq!(pos, 2 * BLOCK_SIZE as u64);
        assert_eq!(fs.file_length_in_use(), 4 * BLOCK_SIZE as u64);

        fs.free(pos, 2 * BLOCK_SIZE);
        assert_eq!(fs.first_free(), pos);
    }
}
