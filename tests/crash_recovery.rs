//! # Crash Recovery
//!
//! Simulated torn writes and corrupted headers. The engine's promise: a
//! partially written tail chunk rolls the store back to the newest
//! commit whose entire closure verifies, a damaged header copy falls
//! back to its twin, and a store with both copies destroyed refuses to
//! open instead of guessing.

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use stratadb::{encoding, storage::BLOCK_SIZE, ErrorKind, Store};
use tempfile::tempdir;

fn open(path: &std::path::Path) -> Store {
    Store::builder()
        .file_name(path)
        .auto_commit_disabled()
        .open()
        .unwrap()
}

#[test]
fn truncated_tail_chunk_rolls_back_to_previous_commit() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("crash.db");

    let mut sizes = Vec::new();
    {
        let store = open(&path);
        let m = store.open_map("m").unwrap();
        for round in 0..5 {
            for i in 0..50 {
                m.put(format!("r{round}-k{i}"), format!("r{round}-v{i}")).unwrap();
            }
            store.commit().unwrap();
            sizes.push(store.file_size());
        }
        store.close_immediately();
    }

    // cut the file in the middle of the last chunk
    let cut = (sizes[3] + sizes[4]) / 2;
    assert!(cut > sizes[3], "last chunk SHOULD have nonzero extent");
    OpenOptions::new()
        .write(true)
        .open(&path)
        .unwrap()
        .set_len(cut)
        .unwrap();

    let store = open(&path);
    let m = store.open_map("m").unwrap();

    // everything up to round 3 survives, the torn round 4 is gone
    assert_eq!(store.current_version(), 4);
    assert_eq!(m.get("r3-k0").unwrap(), Some(b"r3-v0".to_vec()));
    assert_eq!(m.get("r4-k0").unwrap(), None);

    // and the store keeps working
    m.put("after-crash", "ok").unwrap();
    store.commit().unwrap();
    store.close().unwrap();

    let store = open(&path);
    let m = store.open_map("m").unwrap();
    assert_eq!(m.get("after-crash").unwrap(), Some(b"ok".to_vec()));
}

#[test]
fn one_damaged_header_copy_is_survivable() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("h1.db");
    {
        let store = open(&path);
        let m = store.open_map("m").unwrap();
        m.put("k", "v").unwrap();
        store.commit().unwrap();
        store.close().unwrap();
    }

    // wreck the first header block only
    let mut f = OpenOptions::new().write(true).open(&path).unwrap();
    f.seek(SeekFrom::Start(0)).unwrap();
    f.write_all(&[0xAA; 128]).unwrap();
    f.sync_all().unwrap();

    let store = open(&path);
    let m = store.open_map("m").unwrap();
    assert_eq!(m.get("k").unwrap(), Some(b"v".to_vec()));
}

#[test]
fn both_header_copies_damaged_is_corrupt() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("h2.db");
    {
        let store = open(&path);
        let m = store.open_map("m").unwrap();
        m.put("k", "v").unwrap();
        store.commit().unwrap();
        store.close().unwrap();
    }

    let mut f = OpenOptions::new().write(true).open(&path).unwrap();
    f.write_all(&vec![0xAA; 2 * BLOCK_SIZE]).unwrap();
    f.sync_all().unwrap();
    drop(f);

    let err = Store::builder()
        .file_name(&path)
        .auto_commit_disabled()
        .open()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Corrupt);
}

#[test]
fn newer_write_format_is_rejected_unless_read_only() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("fmt.db");

    // hand-craft a header claiming a future write format that is still
    // readable by this build
    let record = encoding::encode_record(&[
        ("H", "2".to_string()),
        ("blockSize", format!("{:x}", BLOCK_SIZE)),
        ("format", "2".to_string()),
        ("formatRead", "1".to_string()),
        ("created", "0".to_string()),
    ]);
    let mut bytes = vec![0u8; 2 * BLOCK_SIZE];
    bytes[..record.len()].copy_from_slice(&record);
    bytes[BLOCK_SIZE..BLOCK_SIZE + record.len()].copy_from_slice(&record);
    std::fs::write(&path, &bytes).unwrap();

    let err = Store::builder()
        .file_name(&path)
        .auto_commit_disabled()
        .open()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedFormat);

    // read-only opens are allowed to read a future write format
    let store = Store::builder()
        .file_name(&path)
        .read_only()
        .auto_commit_disabled()
        .open()
        .unwrap();
    assert_eq!(store.current_version(), 0);
}

#[test]
fn repeated_reopen_cycles_accumulate_data() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cycles.db");

    for round in 0..5 {
        let store = open(&path);
        let m = store.open_map("m").unwrap();
        m.put(format!("round{round}"), format!("{round}")).unwrap();
        store.commit().unwrap();
        store.close().unwrap();
    }

    let store = open(&path);
    let m = store.open_map("m").unwrap();
    assert_eq!(m.len().unwrap(), 5);
    for round in 0..5 {
        assert_eq!(
            m.get(format!("round{round}")).unwrap(),
            Some(format!("{round}").into_bytes())
        );
    }
}

#[test]
fn compressed_store_reopens_without_compression_config() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("z.db");
    {
        let store = Store::builder()
            .file_name(&path)
            .compress(1)
            .auto_commit_disabled()
            .open()
            .unwrap();
        let m = store.open_map("m").unwrap();
        for i in 0..200 {
            m.put(format!("key{i:04}"), "x".repeat(100)).unwrap();
        }
        store.commit().unwrap();
        store.close().unwrap();
    }

    // the compressed flag travels with each page, not with the config
    let store = open(&path);
    let m = store.open_map("m").unwrap();
    assert_eq!(m.get("key0100").unwrap(), Some("x".repeat(100).into_bytes()));
    assert_eq!(m.len().unwrap(), 200);
}
