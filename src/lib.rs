//! # StrataDB - Versioned Multi-Map Storage Engine
//!
//! StrataDB keeps any number of named, ordered key/value maps in a
//! single file, organized as an append-structured log of immutable
//! chunks holding copy-on-write B-tree pages. Every commit produces a
//! new chunk and a new store version; historical versions stay readable
//! until reclamation, and the store can roll back to any retained
//! version.
//!
//! ## Quick Start
//!
//! ```no_run
//! use stratadb::Store;
//!
//! let store = Store::open("./app.db")?;
//! let users = store.open_map("users")?;
//!
//! users.put("alice", "admin")?;
//! users.put("bob", "reader")?;
//! let version = store.commit()?;
//!
//! assert_eq!(users.get("alice")?, Some(b"admin".to_vec()));
//!
//! // undo everything after that commit
//! users.put("alice", "revoked")?;
//! store.rollback_to(version)?;
//! assert_eq!(users.get("alice")?, Some(b"admin".to_vec()));
//! # Ok::<(), stratadb::StoreError>(())
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------+
//! |           Public API (Store, Map)                |
//! +--------------------------------------------------+
//! |  Store coordinator: commit pipeline, recovery,   |
//! |  reachability GC, compaction, version registry,  |
//! |  background writer                (src/store)    |
//! +--------------------------------------------------+
//! |  Copy-on-write maps: pages, root chains,         |
//! |  cursors, page cache              (src/tree)     |
//! +--------------------------------------------------+
//! |  Chunk log: store header, chunk descriptors,     |
//! |  free-space map, block device     (src/storage)  |
//! +--------------------------------------------------+
//! ```
//!
//! ## Durability model
//!
//! A commit serializes all dirty roots into one chunk and writes it with
//! a checksummed header and footer; the twice-written store header only
//! has to name a *recent* chunk, because recovery follows footers and
//! forward predictions to the newest chunk whose entire meta closure
//! verifies. A torn tail after a crash therefore rolls back to the last
//! consistent commit instead of failing the open.
//!
//! Unreferenced chunks survive for a retention window (default 45 s) so
//! concurrent readers of older versions finish their traversals; pinning
//! a version with [`Store::register_version_usage`] extends that
//! protection for long-running readers.
//!
//! ## Module overview
//!
//! - [`store`]: the coordinator - commits, recovery, GC, compaction
//! - `tree`: copy-on-write pages, versioned maps, the page cache
//! - `storage`: block device, free-space accounting, chunk descriptors
//! - `encoding`: checksummed records, page position packing
//! - `compress`: the pluggable page compressor

#[macro_use]
mod macros;

pub mod compress;
pub mod encoding;
mod error;
pub mod storage;
pub mod store;
mod tree;

pub use error::{ErrorKind, Result, StoreError};
pub use store::{Map, MapIter, MapSnapshot, Store, StoreBuilder, TxCounter};

use zerocopy::{FromBytes, Immutable, KnownLayout};

/// Parses a zerocopy struct from a byte slice with size validation.
#[inline]
pub(crate) fn parse_zerocopy<'a, T: FromBytes + KnownLayout + Immutable>(
    bytes: &'a [u8],
    type_name: &str,
) -> Result<&'a T> {
    let size = std::mem::size_of::<T>();
    if bytes.len() < size {
        return Err(StoreError::corrupt(format!(
            "buffer too small for {}: {} < {}",
            type_name,
            bytes.len(),
            size
        )));
    }
    T::ref_from_bytes(&bytes[..size])
        .map_err(|e| StoreError::corrupt(format!("failed to parse {type_name}: {e:?}")))
}
