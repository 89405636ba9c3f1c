use tempfile::TempDir;

use super::helpers::{db_path, init_tracing, open_default, open_with};
use crate::store::{Store, StoreError, StoreOptions, lock_file_path};

fn unlocked_reader_options() -> StoreOptions {
    StoreOptions {
        enable_lock: false,
        register_reader: false,
        ..StoreOptions::default()
    }
}

#[test]
fn second_locked_open_reports_contention() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let path = db_path(&dir);

    let writer = open_default(&path);
    let err = Store::open(&path, StoreOptions::default()).unwrap_err();
    assert!(matches!(err, StoreError::LockContention(_)));
    writer.close().unwrap();

    // After close the lock is released and a new writer may open.
    let writer = open_default(&path);
    writer.close().unwrap();
}

#[test]
fn unlocked_open_with_pending_wal_bytes_is_refused() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let path = db_path(&dir);

    let writer = open_default(&path);
    writer.add_fact("a", "r", "b").unwrap(); // WAL now has payload bytes

    let err = Store::open(&path, unlocked_reader_options()).unwrap_err();
    assert!(matches!(err, StoreError::UnsafeUnlockedOpen));

    // Once the writer flushes (WAL reset), the unlocked open is safe.
    writer.flush().unwrap();
    let reader = open_with(&path, unlocked_reader_options());
    reader.close().unwrap();
    writer.close().unwrap();
}

#[test]
fn unlocked_open_without_any_lock_is_fine() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let path = db_path(&dir);

    {
        let store = open_default(&path);
        store.add_fact("a", "r", "b").unwrap();
        store.flush().unwrap();
        store.close().unwrap();
    }

    let reader = open_with(&path, unlocked_reader_options());
    assert_eq!(reader.stats().unwrap().epoch, 1);
    reader.close().unwrap();
}

#[test]
fn lock_file_is_removed_on_drop() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let path = db_path(&dir);

    {
        let store = open_default(&path);
        store.add_fact("a", "r", "b").unwrap();
        drop(store);
    }
    assert!(!lock_file_path(&path).exists());

    // A fresh writer can open and recovers the unflushed fact.
    let store = open_default(&path);
    assert_eq!(super::helpers::all_facts(&store).len(), 1);
    store.close().unwrap();
}
