//! # Compaction
//!
//! Two complementary strategies, both driven by chunk occupancy
//! statistics:
//!
//! **Rewrite** targets sparsity: when the overall fill rate (live bytes
//! over total chunk bytes, young chunks counted as fully live) drops
//! below the target, the oldest and emptiest chunks are selected by
//! `fill_rate * 1000 / age` and their live data is re-put, so the next
//! commit relocates it and reclamation can free the husks. Serialized on
//! its own mutex so at most one rewrite pass runs at a time.
//!
//! **Move** targets fragmentation: chunks sitting past the first free
//! gap are copied to the end of the file, the metadata commits, and the
//! same chunks are then pulled back into the holes near the file head,
//! after which the file truncates. Retention is suspended and space
//! reuse toggled around the dance, exactly because it deliberately
//! rewrites chunks that would otherwise be protected.
//!
//! Neither strategy runs on a read-only store; both go through the
//! normal commit pipeline for every durable change.

use std::sync::atomic::Ordering;

use hashbrown::HashSet;
use log::debug;

use crate::error::Result;
use crate::storage::{Chunk, BLOCK_SIZE, CHUNK_FOOTER_LENGTH};

use super::StoreInner;

impl StoreInner {
    /// Live bytes over total chunk bytes, in percent. Chunks younger
    /// than the retention time are counted as fully live so fresh data
    /// does not look like garbage.
    pub(crate) fn current_fill_rate(&self) -> u8 {
        let time = self.time_since_creation() as i64;
        let retention = self.retention_time();
        let mut max_sum: i64 = 1;
        let mut live_sum: i64 = 1;
        for c in self.chunks_snapshot() {
            if !c.is_stored() {
                // a commit is serializing this chunk right now
                continue;
            }
            max_sum += c.max_len as i64;
            if c.time as i64 + retention > time {
                live_sum += c.max_len as i64;
            } else {
                live_sum += c.max_len_live;
            }
        }
        (100 * live_sum / max_sum).clamp(0, 100) as u8
    }

    /// Rewrites the live data of sparse old chunks. Returns whether
    /// anything was selected.
    pub(crate) fn compact(&self, target_fill_rate: u8, write: usize) -> Result<bool> {
        if !self.reuse_space() {
            return Ok(false);
        }
        let _serialize = self.compact_lock.lock();
        self.check_open()?;
        let old = {
            let _g = self.lock_store();
            self.find_old_chunks(target_fill_rate, write)
        };
        let Some(old) = old else {
            return Ok(false);
        };
        if old.is_empty() {
            return Ok(false);
        }
        debug!(
            "compaction rewriting {} chunks: {:?}",
            old.len(),
            old.iter().map(|c| c.id).collect::<Vec<_>>()
        );
        self.compact_rewrite(&old)?;
        Ok(true)
    }

    fn find_old_chunks(&self, target_fill_rate: u8, write: usize) -> Option<Vec<Chunk>> {
        let last = self.last_chunk()?;
        if self.current_fill_rate() >= target_fill_rate {
            return None;
        }
        let time = self.time_since_creation() as i64;
        let retention = self.retention_time();

        // rank candidates: old and sparse first
        let mut old: Vec<(i64, Chunk)> = self
            .chunks_snapshot()
            .into_iter()
            .filter(|c| c.time as i64 + retention <= time)
            .map(|c| {
                let age = (last.version.saturating_sub(c.version) + 1) as i64;
                let priority = c.fill_rate() as i64 * 1000 / age.max(1);
                (priority, c)
            })
            .collect();
        if old.is_empty() {
            return None;
        }
        old.sort_by_key(|(priority, c)| (*priority, c.max_len_live));

        // take the prefix whose live bytes fill the write budget; fully
        // dead chunks (priority 0) ride along for free
        let budget = write.min(i64::MAX as usize) as i64;
        let mut written: i64 = 0;
        let mut count = 0;
        for (priority, c) in &old {
            if count > 0 && *priority > 0 && written > budget {
                break;
            }
            written += c.max_len_live;
            count += 1;
        }
        if count == 0 {
            return None;
        }
        old.truncate(count);
        Some(old.into_iter().map(|(_, c)| c).collect())
    }

    fn compact_rewrite(&self, old: &[Chunk]) -> Result<()> {
        let set: HashSet<u32> = old.iter().map(|c| c.id).collect();
        let version = self.user_version();
        for map in self.open_maps() {
            if !map.is_closed() {
                map.rewrite(self, version, &set)?;
            }
        }
        self.meta_map().rewrite(self, self.meta_version(), &set)?;
        {
            let _g = self.lock_store();
            self.free_unused_chunks()?;
        }
        self.commit()?;
        Ok(())
    }

    /// Rewrites every live page of every open map. Heavyweight; mostly
    /// useful before an offline copy.
    pub(crate) fn compact_rewrite_fully(&self) -> Result<bool> {
        let _serialize = self.compact_lock.lock();
        self.check_open()?;
        if self.last_chunk().is_none() {
            return Ok(false);
        }
        let all: HashSet<u32> = self.chunks_snapshot().into_iter().map(|c| c.id).collect();
        let version = self.user_version();
        for map in self.open_maps() {
            if !map.is_closed() {
                map.rewrite(self, version, &all)?;
            }
        }
        self.meta_map().rewrite(self, self.meta_version(), &all)?;
        self.commit()?;
        Ok(true)
    }

    /// Moves chunks next to each other to close gaps and shrink the
    /// file. May temporarily grow the file; chunks are overwritten
    /// irrespective of the retention time.
    pub(crate) fn compact_move_chunks(&self, target_fill_rate: u8, move_size: u64) -> Result<()> {
        let _g = self.lock_store();
        self.check_open()?;
        if self.last_chunk().is_none() || !self.reuse_space() {
            return Ok(());
        }
        let old_retention = self.retention_time();
        self.set_retention_time(-1);
        let result = (|| -> Result<()> {
            self.free_unused_chunks()?;
            if self.file_store().fill_rate() <= target_fill_rate {
                let start_block = self.file_store().first_free() / BLOCK_SIZE as u64;
                let selected = self.find_chunks_to_move(start_block, move_size);
                self.move_selected_chunks(selected)?;
            }
            Ok(())
        })();
        self.set_reuse_space(true);
        self.set_retention_time(old_retention);
        result
    }

    /// Chunks past `start_block`, by block order, up to `move_size`
    /// bytes. Of an oversized selection only the first chunk (closing
    /// the first gap) and the tail (letting the file shrink) are kept.
    fn find_chunks_to_move(&self, start_block: u64, move_size: u64) -> Vec<Chunk> {
        let mut selected: Vec<Chunk> = self
            .chunks_snapshot()
            .into_iter()
            .filter(|c| c.block > start_block)
            .collect();
        selected.sort_by_key(|c| c.block);

        let mut size = 0u64;
        let mut count = 0;
        for c in &selected {
            size += c.len as u64 * BLOCK_SIZE as u64;
            if size > move_size {
                break;
            }
            count += 1;
        }
        while selected.len() > count && selected.len() > 1 {
            selected.remove(1);
        }
        selected
    }

    fn move_selected_chunks(&self, selected: Vec<Chunk>) -> Result<()> {
        for c in &selected {
            self.move_chunk(c.id, true)?;
        }
        // persist the relocated metadata at the end of the file
        self.set_reuse_space(false);
        self.commit_locked()?;
        self.file_store().sync()?;

        let boundary = self.last_chunk();

        // now pull everything back into the holes
        self.set_reuse_space(true);
        for c in &selected {
            // may have been reclaimed by the commit above
            if self.chunks.read().contains_key(&c.id) {
                self.move_chunk(c.id, false)?;
            }
        }
        self.commit_locked()?;
        self.file_store().sync()?;

        if let Some(boundary) = boundary {
            if self.chunks.read().contains_key(&boundary.id) {
                self.move_chunk(boundary.id, false)?;
                self.commit_locked()?;
            }
        }
        self.shrink_if_possible(0)?;
        self.file_store().sync()?;
        Ok(())
    }

    fn move_chunk(&self, chunk_id: u32, to_end: bool) -> Result<()> {
        let c = self.get_chunk(chunk_id)?;
        let start = c.block * BLOCK_SIZE as u64;
        let length = c.len as usize * BLOCK_SIZE;
        let mut bytes = self.file_store().read_fully(start, length)?;

        let new_pos = self.allocate_file_space(length, to_end);
        self.file_store().free(start, length);

        let old_block = c.block;
        let mut moved = c;
        moved.block = new_pos / BLOCK_SIZE as u64;
        moved.next = 0;
        let region = Chunk::header_region_length();
        bytes[..region].copy_from_slice(&moved.header_bytes(region)?);
        bytes[length - CHUNK_FOOTER_LENGTH..].copy_from_slice(&moved.footer_bytes());

        self.write_device(new_pos, &bytes)?;
        debug!("moved chunk {} from block {} to {}", moved.id, old_block, moved.block);
        self.update_chunk(moved.clone());
        self.meta_put(&Chunk::meta_key(moved.id), moved.to_meta_value())?;
        Ok(())
    }

    /// Commit while the caller already holds the store mutex.
    pub(crate) fn commit_locked(&self) -> Result<u64> {
        self.writer_slot.store(true, Ordering::Release);
        let result = self.store_locked();
        self.writer_slot.store(false, Ordering::Release);
        result?;
        Ok(self.current_version())
    }
}

#[cfg(test)]
mod tests {
    use crate::store::Store;

    fn scratch() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::builder()
            .file_name(dir.path().join("c.db"))
            .auto_commit_disabled()
            .open()
            .unwrap();
        (dir, store)
    }

    #[test]
    fn compact_is_a_noop_on_a_full_store() {
        let (_dir, store) = scratch();
        let map = store.open_map("m").unwrap();
        for i in 0..200 {
            map.put(format!("k{i}"), format!("v{i}")).unwrap();
        }
        store.commit().unwrap();

        // everything is young and live, nothing qualifies
        assert!(!store.compact(95, usize::MAX).unwrap());
    }

    #[test]
    fn dead_chunks_are_rewritten_once_retention_expires() {
        let (_dir, store) = scratch();
        store.set_retention_time(0);
        let map = store.open_map("m").unwrap();
        for round in 0..5 {
            for i in 0..100 {
                map.put(format!("k{i}"), format!("round{round}-{i}")).unwrap();
            }
            store.commit().unwrap();
        }

        // most of the earlier chunks are shadowed by later rounds
        let before = store.current_fill_rate();
        assert!(before < 90, "expected garbage, fill rate {before}");

        assert!(store.compact(90, usize::MAX).unwrap());
        let after = store.current_fill_rate();
        assert!(after >= before, "fill rate SHOULD not regress ({before} -> {after})");
    }

    #[test]
    fn move_chunks_shrinks_a_fragmented_file() {
        let (_dir, store) = scratch();
        store.set_retention_time(0);
        let map = store.open_map("m").unwrap();
        for i in 0..300 {
            map.put(format!("k{i:04}"), vec![b'x'; 64]).unwrap();
            if i % 50 == 0 {
                store.commit().unwrap();
            }
        }
        store.commit().unwrap();
        for i in 0..250 {
            map.remove(format!("k{i:04}")).unwrap();
        }
        store.commit().unwrap();
        store.compact(99, usize::MAX).unwrap();
        let before = store.file_size();

        store.compact_move_chunks(100, u64::MAX).unwrap();

        let after = store.file_size();
        assert!(after <= before, "file SHOULD not grow: {before} -> {after}");
        for i in 250..300 {
            assert_eq!(
                map.get(format!("k{i:04}")).unwrap(),
                Some(vec![b'x'; 64]),
                "surviving key k{i:04} SHOULD read back"
            );
        }
    }
}
