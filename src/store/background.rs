//! # Background Writer
//!
//! One thread per store, alive only while `auto_commit_delay > 0` and the
//! store is writable. It wakes every `max(1, delay / 10)` ms (or earlier
//! when notified), commits once the last commit is older than the delay,
//! and then gives auto-compaction a slice.
//!
//! The thread holds a weak store reference: a dropped store ends the
//! loop even without an explicit stop. Stopping is a flag plus a
//! notification; the stopping side joins unless it *is* the writer or is
//! holding the store mutex (the writer may be blocked on that same mutex,
//! so joining would deadlock).
//!
//! Errors inside a pass are routed to the configured handler and never
//! kill the thread; a store panic flips `closed` and the next wakeup
//! exits cleanly.

use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use log::debug;
use parking_lot::{Condvar, Mutex};

use super::StoreInner;

struct Shared {
    stop: Mutex<bool>,
    wake: Condvar,
}

pub(crate) struct BackgroundWriter {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
    thread_id: std::thread::ThreadId,
}

impl BackgroundWriter {
    pub fn start(store: Weak<StoreInner>, sleep_ms: u64) -> Self {
        let shared = Arc::new(Shared {
            stop: Mutex::new(false),
            wake: Condvar::new(),
        });
        let thread_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name("strata-background-writer".into())
            .spawn(move || run(store, thread_shared, sleep_ms))
            .expect("failed to spawn background writer");
        let thread_id = handle.thread().id();
        Self {
            shared,
            handle: Some(handle),
            thread_id,
        }
    }

    /// Flags the thread down and wakes it; `join` must be false when the
    /// caller might be blocking the thread (holding the store mutex) or
    /// is the thread itself.
    pub fn stop(mut self, join: bool) {
        *self.shared.stop.lock() = true;
        self.shared.wake.notify_all();
        if join && std::thread::current().id() != self.thread_id {
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

fn run(store: Weak<StoreInner>, shared: Arc<Shared>, sleep_ms: u64) {
    debug!("background writer started, sleep {sleep_ms} ms");
    loop {
        {
            let mut stop = shared.stop.lock();
            if *stop {
                break;
            }
            shared
                .wake
                .wait_for(&mut stop, Duration::from_millis(sleep_ms));
            if *stop {
                break;
            }
        }
        let Some(store) = store.upgrade() else { break };
        if store.is_closed() {
            break;
        }
        store.write_in_background();
    }
    debug!("background writer stopped");
}
