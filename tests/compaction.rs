//! # Compaction and Space Reclamation
//!
//! Drives the rewrite and move strategies end to end: bulk-load many
//! maps, drop most of them, compact, and verify that the file shrinks
//! while every surviving byte reads back. Also pins down the two space
//! policies at their boundaries: append-only mode never shrinks the
//! file, and zero retention reclaims dead chunks as soon as they are
//! observed dead.

use stratadb::Store;
use tempfile::tempdir;

fn open(path: &std::path::Path) -> Store {
    Store::builder()
        .file_name(path)
        .auto_commit_disabled()
        .open()
        .unwrap()
}

#[test]
fn dropping_most_maps_then_compacting_shrinks_the_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("s5.db");
    let store = open(&path);

    const MAPS: usize = 30;
    const KEEP: usize = 6;
    const ENTRIES: usize = 200;

    for m in 0..MAPS {
        let map = store.open_map(&format!("bulk-{m}")).unwrap();
        for i in 0..ENTRIES {
            map.put(format!("key-{i:05}"), format!("value-{m}-{i}")).unwrap();
        }
        store.commit().unwrap();
    }
    for m in KEEP..MAPS {
        store.remove_map(&format!("bulk-{m}")).unwrap();
    }
    store.commit().unwrap();
    let before = store.file_size();

    store.set_retention_time(0);
    store.compact(50, 1_000_000).unwrap();
    store.compact_move_chunks(100, u64::MAX).unwrap();

    let after = store.file_size();
    assert!(
        after < before,
        "file SHOULD shrink after dropping {}/{} maps: {before} -> {after}",
        MAPS - KEEP,
        MAPS
    );

    for m in 0..KEEP {
        let map = store.open_map(&format!("bulk-{m}")).unwrap();
        assert_eq!(map.len().unwrap(), ENTRIES as u64);
        for i in (0..ENTRIES).step_by(17) {
            assert_eq!(
                map.get(format!("key-{i:05}")).unwrap(),
                Some(format!("value-{m}-{i}").into_bytes()),
                "map bulk-{m} key {i} after compaction"
            );
        }
    }

    // and the compacted file still recovers cleanly
    store.close().unwrap();
    let store = open(&path);
    let map = store.open_map("bulk-0").unwrap();
    assert_eq!(map.len().unwrap(), ENTRIES as u64);
}

#[test]
fn disabling_space_reuse_makes_the_file_append_only() {
    let dir = tempdir().unwrap();
    let store = open(&dir.path().join("append.db"));
    store.set_reuse_space(false);
    store.set_retention_time(0);
    let map = store.open_map("m").unwrap();

    let mut last_size = 0;
    for round in 0..10 {
        for i in 0..50 {
            map.put(format!("k{i}"), format!("round-{round}")).unwrap();
        }
        store.commit().unwrap();
        let size = store.file_size();
        assert!(size > last_size, "append-only file SHOULD grow every commit");
        last_size = size;
    }
}

#[test]
fn zero_retention_reclaims_dead_chunks_quickly() {
    let dir = tempdir().unwrap();
    let store = open(&dir.path().join("ret0.db"));
    store.set_retention_time(0);
    let map = store.open_map("m").unwrap();

    let mut mid_size = 0;
    for round in 0..30 {
        for i in 0..50 {
            map.put(format!("k{i}"), format!("round-{round}-{i}")).unwrap();
        }
        store.commit().unwrap();
        if round == 14 {
            mid_size = store.file_size();
        }
    }

    // overwritten rounds keep dying and their chunks keep being reused,
    // so the file reaches a steady state instead of growing linearly
    let final_size = store.file_size();
    assert!(
        final_size <= mid_size * 2,
        "file SHOULD stay bounded with zero retention: {mid_size} at round 15, {final_size} at round 30"
    );
    for i in 0..50 {
        assert_eq!(
            map.get(format!("k{i}")).unwrap(),
            Some(format!("round-29-{i}").into_bytes())
        );
    }
}

#[test]
fn full_rewrite_relocates_every_live_page() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("full.db");
    let store = open(&path);
    store.set_retention_time(0);
    let map = store.open_map("m").unwrap();
    for i in 0..300 {
        map.put(format!("k{i:04}"), format!("v{i}")).unwrap();
        if i % 60 == 0 {
            store.commit().unwrap();
        }
    }
    store.commit().unwrap();

    assert!(store.compact_rewrite_fully().unwrap());
    store.compact_move_chunks(100, u64::MAX).unwrap();

    for i in 0..300 {
        assert_eq!(
            map.get(format!("k{i:04}")).unwrap(),
            Some(format!("v{i}").into_bytes())
        );
    }
    store.close().unwrap();
    let store = open(&path);
    assert_eq!(store.open_map("m").unwrap().len().unwrap(), 300);
}

#[test]
fn fill_rate_degrades_with_garbage_and_recovers_after_compaction() {
    let dir = tempdir().unwrap();
    let store = open(&dir.path().join("fill.db"));
    store.set_retention_time(0);
    let map = store.open_map("m").unwrap();

    for i in 0..200 {
        map.put(format!("k{i}"), vec![b'a'; 100]).unwrap();
    }
    store.commit().unwrap();
    let fresh = store.current_fill_rate();

    for round in 0..4 {
        for i in 0..200 {
            map.put(format!("k{i}"), vec![b'b' + round; 100]).unwrap();
        }
        store.commit().unwrap();
    }
    let dirty = store.current_fill_rate();
    assert!(dirty < fresh, "overwrites SHOULD lower the fill rate ({fresh} -> {dirty})");

    store.compact(95, usize::MAX).unwrap();
    store.compact_move_chunks(100, u64::MAX).unwrap();
    let compacted = store.current_fill_rate();
    assert!(
        compacted > dirty,
        "compaction SHOULD raise the fill rate ({dirty} -> {compacted})"
    );
}
