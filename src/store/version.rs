//! # Version Pinning
//!
//! Readers and transactions pin the store version they started on so the
//! garbage collector cannot reclaim chunks their snapshot still needs.
//!
//! Each version has a [`TxCounter`]. Registering increments the counter
//! of the *current* version; when a commit advances the version, the
//! counter retires into a FIFO and loses the store's own implicit
//! reference (one decrement). A retired counter that drains below zero is
//! fully released, and `oldest_version_to_keep` advances to the oldest
//! still-pinned version.
//!
//! ## The register/drain race
//!
//! A registering reader can grab the current counter right as a commit
//! retires and drains it. The increment then observes a negative previous
//! value, meaning the version is already being reclaimed; the reader
//! undoes its increment and retries against the (by then replaced)
//! current counter. This is what keeps a dying version from being
//! revived.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

/// A version together with the number of operations still reading it.
///
/// Returned by `Store::register_version_usage`; hand it back to
/// `deregister_version_usage` when the operation finishes.
#[derive(Debug)]
pub struct TxCounter {
    version: u64,
    counter: AtomicI64,
}

impl TxCounter {
    fn new(version: u64) -> Self {
        Self {
            version,
            counter: AtomicI64::new(0),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }
}

pub(crate) struct VersionRegistry {
    current: RwLock<Arc<TxCounter>>,
    retired: Mutex<VecDeque<Arc<TxCounter>>>,
    oldest: AtomicU64,
}

impl VersionRegistry {
    pub fn new(version: u64) -> Self {
        Self {
            current: RwLock::new(Arc::new(TxCounter::new(version))),
            retired: Mutex::new(VecDeque::new()),
            oldest: AtomicU64::new(version),
        }
    }

    /// Pins the current version.
    pub fn register(&self) -> Arc<TxCounter> {
        loop {
            let tx = self.current.read().clone();
            if tx.counter.fetch_add(1, Ordering::AcqRel) >= 0 {
                return tx;
            }
            // grabbed a counter mid-drain; undo and retry on the
            // replacement
            tx.counter.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Releases a pin. Returns true when the counter drained and a
    /// reclamation attempt is worthwhile.
    pub fn deregister(&self, tx: &TxCounter) -> bool {
        tx.counter.fetch_sub(1, Ordering::AcqRel) - 1 <= 0
    }

    /// Retires the current counter and installs one for `version`.
    pub fn on_version_change(&self, version: u64) {
        let old = {
            let mut current = self.current.write();
            std::mem::replace(&mut *current, Arc::new(TxCounter::new(version)))
        };
        self.retired.lock().push_back(old.clone());
        // release the store's own reference; the counter may now go
        // negative, which is the fully-drained sentinel
        old.counter.fetch_sub(1, Ordering::AcqRel);
        self.drop_unused();
    }

    /// Peels drained counters off the FIFO head and advances the oldest
    /// version to keep.
    pub fn drop_unused(&self) {
        let oldest = {
            let mut retired = self.retired.lock();
            while retired
                .front()
                .is_some_and(|tx| tx.counter.load(Ordering::Acquire) < 0)
            {
                retired.pop_front();
            }
            match retired.front() {
                Some(tx) => tx.version(),
                None => self.current.read().version(),
            }
        };
        self.advance_oldest(oldest);
    }

    fn advance_oldest(&self, version: u64) {
        // monotonic: only ever move forward
        self.oldest.fetch_max(version, Ordering::AcqRel);
    }

    pub fn oldest_version_to_keep(&self) -> u64 {
        self.oldest.load(Ordering::Acquire)
    }

    /// Drops every retired counter at or above `version` and restarts
    /// from it. Pins on dropped versions are abandoned (rollback wins).
    pub fn rollback_to(&self, version: u64) {
        let mut retired = self.retired.lock();
        while retired.back().is_some_and(|tx| tx.version() >= version) {
            retired.pop_back();
        }
        drop(retired);
        *self.current.write() = Arc::new(TxCounter::new(version));
    }

    /// Forgets everything; used by rollback to version 0.
    pub fn clear(&self, version: u64) {
        self.retired.lock().clear();
        *self.current.write() = Arc::new(TxCounter::new(version));
        self.oldest.store(version, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_pins_the_current_version() {
        let reg = VersionRegistry::new(5);

        let tx = reg.register();

        assert_eq!(tx.version(), 5);
        reg.on_version_change(6);
        assert_eq!(reg.oldest_version_to_keep(), 5, "pinned version SHOULD hold");
    }

    #[test]
    fn deregister_releases_and_oldest_advances() {
        let reg = VersionRegistry::new(5);
        let tx = reg.register();
        reg.on_version_change(6);
        reg.on_version_change(7);
        assert_eq!(reg.oldest_version_to_keep(), 5);

        assert!(reg.deregister(&tx));
        reg.drop_unused();

        assert_eq!(reg.oldest_version_to_keep(), 7);
    }

    #[test]
    fn unpinned_versions_drain_immediately() {
        let reg = VersionRegistry::new(0);

        for v in 1..=10 {
            reg.on_version_change(v);
        }

        assert_eq!(reg.oldest_version_to_keep(), 10);
    }

    #[test]
    fn oldest_is_monotonic() {
        let reg = VersionRegistry::new(0);
        let mut last = 0;

        for v in 1..=20 {
            let tx = reg.register();
            reg.on_version_change(v);
            let o = reg.oldest_version_to_keep();
            assert!(o >= last);
            last = o;
            reg.deregister(&tx);
            reg.drop_unused();
        }
    }

    #[test]
    fn drained_counter_is_not_revived() {
        let reg = VersionRegistry::new(1);
        let stale = reg.current.read().clone();
        reg.on_version_change(2);
        // drain the retired counter fully
        reg.drop_unused();
        assert!(stale.counter.load(Ordering::Acquire) < 0);

        // a late register never lands on the drained counter
        let tx = reg.register();
        assert_eq!(tx.version(), 2);
    }

    #[test]
    fn rollback_drops_newer_counters() {
        let reg = VersionRegistry::new(0);
        for v in 1..=5 {
            let _pin = reg.register();
            reg.on_version_change(v);
        }

        reg.rollback_to(3);
        reg.drop_unused();

        // the two remaining pinned counters are 0,1,2-era; oldest stays put
        assert!(reg.oldest_version_to_keep() <= 3);
        assert_eq!(reg.register().version(), 3);
    }

    #[test]
    fn concurrent_register_deregister_is_consistent() {
        use std::sync::Barrier;

        let reg = Arc::new(VersionRegistry::new(0));
        let barrier = Arc::new(Barrier::new(4));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let reg = reg.clone();
            let barrier = barrier.clone();
            handles.push(std::thread::spawn(move || {
                barrier.wait();
                for _ in 0..500 {
                    let tx = reg.register();
                    if reg.deregister(&tx) {
                        reg.drop_unused();
                    }
                }
            }));
        }
        for v in 1..=50 {
            reg.on_version_change(v);
        }
        for h in handles {
            h.join().unwrap();
        }

        reg.drop_unused();
        assert_eq!(reg.oldest_version_to_keep(), 50);
    }
}
