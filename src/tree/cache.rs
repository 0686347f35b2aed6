//! # Sharded SIEVE Caches
//!
//! Two read-path caches, one structure: deserialized pages keyed by
//! position, and (at a quarter of the budget) the per-position
//! referenced-chunk-id arrays the garbage collector memoizes.
//!
//! ## Why SIEVE instead of LRU
//!
//! A sequential cursor scan would evict the whole cache under LRU: every
//! freshly read page becomes most-recently-used. SIEVE keeps a `visited`
//! flag per entry and sweeps with a hand pointer; a page touched since the
//! last sweep gets a second chance, a scan page does not. Frequently read
//! upper-tree nodes survive, scan leaves churn through one slot.
//!
//! ## Sharding
//!
//! Entries hash to `cache_concurrency` independent shards, each behind
//! its own `RwLock`, so point reads on different shards never contend.
//! Eviction is per shard against a per-shard memory budget; weights are
//! supplied by the caller (page memory estimate, or array size for the
//! chunk-ref cache).
//!
//! Positions are immutable once assigned and chunks never change in
//! place, so there is no dirty state and no write-back: eviction is
//! always a plain drop.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;
use smallvec::SmallVec;

use super::page::Page;

struct Entry<V> {
    key: u64,
    value: V,
    weight: usize,
    visited: AtomicBool,
}

struct Shard<V> {
    entries: Vec<Entry<V>>,
    index: HashMap<u64, usize>,
    hand: usize,
    memory: usize,
}

impl<V: Clone> Shard<V> {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
            hand: 0,
            memory: 0,
        }
    }

    fn get(&self, key: u64) -> Option<V> {
        let idx = *self.index.get(&key)?;
        let entry = &self.entries[idx];
        entry.visited.store(true, Ordering::Release);
        Some(entry.value.clone())
    }

    fn evict_one(&mut self) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let mut sweeps = 0;
        loop {
            if self.hand >= self.entries.len() {
                self.hand = 0;
            }
            let entry = &self.entries[self.hand];
            if entry.visited.swap(false, Ordering::AcqRel) {
                self.hand += 1;
                sweeps += 1;
                if sweeps > 2 * self.entries.len() {
                    return false;
                }
                continue;
            }
            self.remove_at(self.hand);
            return true;
        }
    }

    fn remove_at(&mut self, idx: usize) {
        let entry = self.entries.swap_remove(idx);
        self.index.remove(&entry.key);
        self.memory -= entry.weight;
        if idx < self.entries.len() {
            let moved = self.entries[idx].key;
            self.index.insert(moved, idx);
        }
    }

    fn insert(&mut self, key: u64, value: V, weight: usize, budget: usize) {
        if weight > budget {
            return;
        }
        if let Some(&idx) = self.index.get(&key) {
            self.remove_at(idx);
        }
        while self.memory + weight > budget {
            if !self.evict_one() {
                return;
            }
        }
        let idx = self.entries.len();
        self.entries.push(Entry {
            key,
            value,
            weight,
            visited: AtomicBool::new(false),
        });
        self.index.insert(key, idx);
        self.memory += weight;
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
        self.hand = 0;
        self.memory = 0;
    }
}

/// Memory-bounded cache with SIEVE eviction and lock sharding.
pub struct SieveCache<V: Clone> {
    shards: Vec<RwLock<Shard<V>>>,
    max_memory: AtomicUsize,
}

impl<V: Clone> SieveCache<V> {
    pub fn new(max_memory: usize, shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        Self {
            shards: (0..shard_count).map(|_| RwLock::new(Shard::new())).collect(),
            max_memory: AtomicUsize::new(max_memory),
        }
    }

    fn shard(&self, key: u64) -> &RwLock<Shard<V>> {
        // multiplicative hash; positions cluster by chunk in the high bits
        let hash = key.wrapping_mul(0x9e37_79b9_7f4a_7c15);
        &self.shards[(hash >> 32) as usize % self.shards.len()]
    }

    fn shard_budget(&self) -> usize {
        self.max_memory.load(Ordering::Relaxed) / self.shards.len()
    }

    pub fn get(&self, key: u64) -> Option<V> {
        self.shard(key).read().get(key)
    }

    pub fn insert(&self, key: u64, value: V, weight: usize) {
        let budget = self.shard_budget();
        self.shard(key).write().insert(key, value, weight, budget);
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            shard.write().clear();
        }
    }

    /// Drops every entry whose key matches; used when a chunk is freed so
    /// a later chunk reusing its id cannot serve stale pages.
    pub fn remove_where(&self, pred: impl Fn(u64) -> bool) {
        for shard in &self.shards {
            let mut guard = shard.write();
            let doomed: Vec<usize> = guard
                .entries
                .iter()
                .enumerate()
                .filter(|(_, e)| pred(e.key))
                .map(|(i, _)| i)
                .collect();
            for idx in doomed.into_iter().rev() {
                guard.remove_at(idx);
            }
        }
    }

    /// Replaces the memory bound and drops everything cached; the next
    /// reads repopulate under the new bound.
    pub fn set_max_memory(&self, bytes: usize) {
        self.max_memory.store(bytes, Ordering::Relaxed);
        self.clear();
    }

    pub fn memory_used(&self) -> usize {
        self.shards.iter().map(|s| s.read().memory).sum()
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Page cache: position → deserialized page.
pub type PageCache = SieveCache<Arc<Page>>;

/// GC memoization: interior page position → chunk ids its subtree touches.
pub type ChunkRefCache = SieveCache<Arc<SmallVec<[u32; 8]>>>;

/// Weight of a chunk-ref entry.
pub fn chunk_ref_weight(ids: &SmallVec<[u32; 8]>) -> usize {
    32 + 4 * ids.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> SieveCache<u64> {
        SieveCache::new(1024, 4)
    }

    #[test]
    fn insert_then_get() {
        let c = cache();

        c.insert(1, 100, 16);
        c.insert(2, 200, 16);

        assert_eq!(c.get(1), Some(100));
        assert_eq!(c.get(2), Some(200));
        assert_eq!(c.get(3), None);
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn reinsert_replaces_weight_and_value() {
        let c = cache();
        c.insert(1, 100, 16);

        c.insert(1, 101, 64);

        assert_eq!(c.get(1), Some(101));
        assert_eq!(c.memory_used(), 64);
    }

    #[test]
    fn oversized_entry_is_not_cached() {
        let c = SieveCache::<u64>::new(64, 1);

        c.insert(1, 100, 1000);

        assert_eq!(c.get(1), None);
    }

    #[test]
    fn eviction_respects_the_budget() {
        let c = SieveCache::<u64>::new(256, 1);

        for i in 0..100 {
            c.insert(i, i, 16);
        }

        assert!(c.memory_used() <= 256);
        assert!(c.len() <= 16);
    }

    #[test]
    fn visited_entries_get_a_second_chance() {
        let c = SieveCache::<u64>::new(64, 1);
        c.insert(1, 1, 16);
        c.insert(2, 2, 16);
        c.insert(3, 3, 16);
        c.insert(4, 4, 16);

        // touch 1 so the sweep prefers evicting an untouched entry
        assert_eq!(c.get(1), Some(1));
        c.insert(5, 5, 16);

        assert_eq!(c.get(1), Some(1), "recently visited entry SHOULD survive");
    }

    #[test]
    fn set_max_memory_clears() {
        let c = cache();
        c.insert(1, 1, 16);

        c.set_max_memory(2048);

        assert!(c.is_empty());
    }
}
