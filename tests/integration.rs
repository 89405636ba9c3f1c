//! Integration tests for the public `Store` API.
//!
//! These tests exercise the full storage stack (WAL → staging → paged
//! indexes → manifest → maintenance) through the public
//! `synapsedb::{Store, StoreOptions, …}` surface only.  No internal
//! modules are referenced.
//!
//! ## Coverage areas
//! - **Lifecycle**: open, flush, close, idempotent close, drop-based
//!   recovery via WAL replay
//! - **Round-trip**: facts and property bags survive close → reopen
//! - **Batches**: nested commit/abort semantics, txId idempotence
//! - **Crash recovery**: injected crashes at every labelled flush step
//! - **Maintenance**: incremental compaction, page GC, strict check and
//!   repair after byte-level corruption
//! - **Cross-process contracts**: writer lock, unsafe unlocked open,
//!   reader-registry gating
//!
//! ## See also
//! - `store::tests` — conductor-level unit tests
//! - `wal::tests` — replay state-machine unit tests
//! - `pages::tests` — page codec unit tests

use serde_json::json;
use synapsedb::{
    BatchMeta, CompactOptions, CompactionMode, QueryCriteria, Store, StoreError, StoreOptions,
    TripleOrder,
};
use tempfile::TempDir;

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

/// Page size 2 keeps fragmentation easy to provoke.
fn small_pages() -> StoreOptions {
    StoreOptions {
        page_size: 2,
        ..StoreOptions::default()
    }
}

fn facts(store: &Store) -> Vec<(String, String, String)> {
    let mut rows: Vec<_> = store
        .query(&QueryCriteria::default())
        .unwrap()
        .into_iter()
        .map(|r| (r.subject, r.predicate, r.object))
        .collect();
    rows.sort();
    rows
}

fn triple(s: &str, p: &str, o: &str) -> (String, String, String) {
    (s.to_string(), p.to_string(), o.to_string())
}

// ================================================================================================
// Lifecycle & round-trip
// ================================================================================================

/// # Scenario
/// Insert `(Alice, KNOWS, Bob)`, flush, reopen, query by subject.
///
/// # Expected behavior
/// Exactly one record comes back, with predicate `KNOWS` and object
/// `Bob`, and its interned ids are identical across the reopen.
#[test]
fn insert_flush_reopen_query() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("graph.db");

    let ids = {
        let store = Store::open(&path, StoreOptions::default()).unwrap();
        let ids = store.add_fact("Alice", "KNOWS", "Bob").unwrap();
        store.flush().unwrap();
        store.close().unwrap();
        ids
    };

    let store = Store::open(&path, StoreOptions::default()).unwrap();
    let rows = store.query(&QueryCriteria::subject("Alice")).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].predicate, "KNOWS");
    assert_eq!(rows[0].object, "Bob");
    assert_eq!((rows[0].ids.s, rows[0].ids.p, rows[0].ids.o), ids);
    store.close().unwrap();
}

/// # Scenario
/// Drop the handle without flushing or closing.
///
/// # Expected behavior
/// The WAL alone recovers every unflushed effect at the next open.
#[test]
fn drop_without_close_recovers_from_wal() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("graph.db");

    {
        let store = Store::open(&path, StoreOptions::default()).unwrap();
        store.add_fact("a", "r", "b").unwrap();
        let (node, _, _) = store.add_fact("n", "r", "m").unwrap();
        store.set_node_properties(node, json!({"k": true})).unwrap();
        drop(store);
    }

    let store = Store::open(&path, StoreOptions::default()).unwrap();
    assert_eq!(facts(&store).len(), 2);
    let node = store.query(&QueryCriteria::subject("n")).unwrap()[0].ids.s;
    assert_eq!(
        store.get_node_properties(node).unwrap(),
        Some(json!({"k": true}))
    );
    store.close().unwrap();
}

#[test]
fn close_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(dir.path().join("graph.db"), StoreOptions::default()).unwrap();
    store.close().unwrap();
    store.close().unwrap();
}

/// # Scenario
/// Delete a flushed fact, flush, reopen.
///
/// # Expected behavior
/// The tombstone shadows the fact across the reopen; re-adding it makes
/// it visible again.
#[test]
fn tombstone_survives_reopen_until_re_add() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("graph.db");

    {
        let store = Store::open(&path, StoreOptions::default()).unwrap();
        store.add_fact("a", "r", "b").unwrap();
        store.flush().unwrap();
        store.delete_fact("a", "r", "b").unwrap();
        store.flush().unwrap();
        store.close().unwrap();
    }

    let store = Store::open(&path, StoreOptions::default()).unwrap();
    assert!(facts(&store).is_empty());
    store.add_fact("a", "r", "b").unwrap();
    assert_eq!(facts(&store), vec![triple("a", "r", "b")]);
    store.close().unwrap();
}

// ================================================================================================
// Batches
// ================================================================================================

/// # Scenario (§ nested semantics)
/// BEGIN ADD(A) [BEGIN ADD(B) COMMIT] [BEGIN ADD(C) ABORT] ADD(D),
/// then either outer ABORT or outer COMMIT; reopen afterwards.
///
/// # Expected behavior
/// Outer ABORT: nothing visible (the committed inner batch merged into
/// the outer frame and died with it).  Outer COMMIT: A, B, D visible and
/// C never is — in the live session and after replay.
#[test]
fn nested_batch_semantics_after_reopen() {
    for outer_commits in [false, true] {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("graph.db");

        {
            let store = Store::open(&path, StoreOptions::default()).unwrap();
            store.begin_batch(BatchMeta::default()).unwrap();
            store.add_fact("A", "r", "x").unwrap();
            store.begin_batch(BatchMeta::default()).unwrap();
            store.add_fact("B", "r", "x").unwrap();
            store.commit_batch(false).unwrap();
            store.begin_batch(BatchMeta::default()).unwrap();
            store.add_fact("C", "r", "x").unwrap();
            store.abort_batch().unwrap();
            store.add_fact("D", "r", "x").unwrap();
            if outer_commits {
                store.commit_batch(false).unwrap();
            } else {
                store.abort_batch().unwrap();
            }
            drop(store); // recovery path: WAL replay only
        }

        let store = Store::open(&path, StoreOptions::default()).unwrap();
        let expected = if outer_commits {
            vec![triple("A", "r", "x"), triple("B", "r", "x"), triple("D", "r", "x")]
        } else {
            Vec::new()
        };
        assert_eq!(facts(&store), expected, "outer_commits = {outer_commits}");
        store.close().unwrap();
    }
}

/// # Scenario (§ txId idempotence)
/// Two outermost commits carry the same txId; no flush; reopen.
///
/// # Expected behavior
/// Replay applies only the first transaction.
#[test]
fn duplicate_tx_id_applies_once() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("graph.db");

    {
        let store = Store::open(&path, StoreOptions::default()).unwrap();
        for object in ["O1", "O2"] {
            store
                .begin_batch(BatchMeta {
                    tx_id: Some("T".into()),
                    session_id: Some("session-1".into()),
                })
                .unwrap();
            store.add_fact("S", "R", object).unwrap();
            store.commit_batch(false).unwrap();
        }
        drop(store);
    }

    let store = Store::open(&path, StoreOptions::default()).unwrap();
    assert_eq!(facts(&store), vec![triple("S", "R", "O1")]);
    store.close().unwrap();
}

// ================================================================================================
// Crash recovery
// ================================================================================================

/// # Scenario (§ idempotent open)
/// Arm a crash at each labelled flush step in turn; flush fails; reopen.
///
/// # Expected behavior
/// Whatever step the crash hits, the reopened store exposes the same
/// logical fact set, and a follow-up flush completes.
#[test]
fn every_flush_crash_point_recovers() {
    for label in [
        "before-main-write",
        "before-page-append",
        "before-manifest-write",
        "before-wal-reset",
    ] {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("graph.db");

        {
            let store = Store::open(&path, StoreOptions::default()).unwrap();
            store.add_fact("keep", "r", "x").unwrap();
            store.add_fact("gone", "r", "x").unwrap();
            store.delete_fact("gone", "r", "x").unwrap();
            store.inject_crash(label).unwrap();
            let err = store.flush().unwrap_err();
            assert!(matches!(err, StoreError::InjectedCrash(_)), "{label}");
            drop(store);
        }

        let store = Store::open(&path, StoreOptions::default()).unwrap();
        assert_eq!(facts(&store), vec![triple("keep", "r", "x")], "{label}");
        store.flush().unwrap();
        assert_eq!(facts(&store), vec![triple("keep", "r", "x")], "{label}");
        store.close().unwrap();
    }
}

// ================================================================================================
// Maintenance
// ================================================================================================

/// # Scenario (§ incremental compaction)
/// Three same-subject facts at page size 2, flushed into fragments.
///
/// # Expected behavior
/// The subject spans ≥ 2 SPO pages before compaction and fewer after;
/// the query still returns all three facts.
#[test]
fn incremental_compaction_merges_fragmented_primary() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(dir.path().join("graph.db"), small_pages()).unwrap();

    store.add_fact("S", "R", "O1").unwrap();
    store.add_fact("S", "R", "O2").unwrap();
    store.flush().unwrap();
    store.add_fact("S", "R", "O3").unwrap();
    store.flush().unwrap();

    let pages = |store: &Store| {
        store
            .stats()
            .unwrap()
            .pages_per_order
            .into_iter()
            .find(|(order, _)| *order == TripleOrder::Spo)
            .map(|(_, n)| n)
            .unwrap()
    };
    let before = pages(&store);
    assert!(before >= 2);

    let report = store
        .compact(&CompactOptions {
            mode: CompactionMode::Incremental,
            min_merge_pages: 2,
            ..CompactOptions::default()
        })
        .unwrap();
    assert!(!report.skipped);
    assert!(pages(&store) < before);

    let rows = store
        .query(&QueryCriteria::subject("S").with_predicate("R"))
        .unwrap();
    assert_eq!(rows.len(), 3);

    // GC afterwards reclaims the displaced bytes without changing
    // results.
    let gc = store.gc_pages(false).unwrap();
    assert!(!gc.skipped);
    assert_eq!(
        store
            .query(&QueryCriteria::subject("S").with_predicate("R"))
            .unwrap()
            .len(),
        3
    );
    store.close().unwrap();
}

/// # Scenario (§ check & repair)
/// Corrupt one byte of the first SPO page on disk.
///
/// # Expected behavior
/// The strict check reports order SPO with the subject's id; per-order
/// repair restores the file; reopening and querying returns all three
/// records.
#[test]
fn corruption_is_detected_and_repaired() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("graph.db");

    let subject_id = {
        let store = Store::open(&path, small_pages()).unwrap();
        let (s, _, _) = store.add_fact("S", "R", "O1").unwrap();
        store.add_fact("S", "R", "O2").unwrap();
        store.add_fact("S", "R", "O3").unwrap();
        store.flush().unwrap();
        store.close().unwrap();
        s
    };

    let spo_file = dir.path().join("graph.db.pages").join("SPO.idxpage");
    let mut bytes = std::fs::read(&spo_file).unwrap();
    bytes[0] ^= 0x01;
    std::fs::write(&spo_file, &bytes).unwrap();

    let store = Store::open(&path, small_pages()).unwrap();
    let findings = store.check_strict().unwrap();
    assert!(findings
        .iter()
        .any(|f| f.order == TripleOrder::Spo && f.primary == subject_id));

    store.repair_orders(&[TripleOrder::Spo]).unwrap();
    assert!(store.check_strict().unwrap().is_empty());
    store.close().unwrap();

    let store = Store::open(&path, small_pages()).unwrap();
    let rows = store
        .query(&QueryCriteria::subject("S").with_predicate("R"))
        .unwrap();
    assert_eq!(rows.len(), 3);
    store.close().unwrap();
}

// ================================================================================================
// Cross-process contracts
// ================================================================================================

/// # Scenario (§ unsafe unlocked open)
/// A writer holds the lock with uncommitted WAL bytes; a second handle
/// opens with `enable_lock = false`.
///
/// # Expected behavior
/// The open fails — a reader cannot attach to a torn in-flight state.
#[test]
fn unlocked_open_is_refused_while_writer_has_pending_bytes() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("graph.db");

    let writer = Store::open(&path, StoreOptions::default()).unwrap();
    writer.add_fact("a", "r", "b").unwrap();

    let err = Store::open(
        &path,
        StoreOptions {
            enable_lock: false,
            register_reader: false,
            ..StoreOptions::default()
        },
    )
    .unwrap_err();
    assert!(matches!(err, StoreError::UnsafeUnlockedOpen));
    writer.close().unwrap();
}

#[test]
fn second_writer_is_locked_out() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("graph.db");

    let writer = Store::open(&path, StoreOptions::default()).unwrap();
    assert!(matches!(
        Store::open(&path, StoreOptions::default()).unwrap_err(),
        StoreError::LockContention(_)
    ));
    writer.close().unwrap();
}

/// # Scenario (§ snapshot pinning)
/// Pin the flushed epoch, add more facts, query, release.
///
/// # Expected behavior
/// Pinned queries serve the epoch's pages only; after the pop the new
/// delta becomes visible.
#[test]
fn snapshot_pin_freezes_the_view() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(dir.path().join("graph.db"), StoreOptions::default()).unwrap();

    store.add_fact("old", "r", "x").unwrap();
    store.flush().unwrap();
    let epoch = store.stats().unwrap().epoch;

    store.push_pinned_epoch(epoch).unwrap();
    store.add_fact("new", "r", "x").unwrap();
    assert_eq!(facts(&store), vec![triple("old", "r", "x")]);

    store.pop_pinned_epoch().unwrap();
    assert_eq!(facts(&store).len(), 2);
    store.close().unwrap();
}
