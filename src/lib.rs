//! # SynapseDB
//!
//! An embeddable, **single-writer / multi-reader** triple store for
//! knowledge-graph data.  Each datum is a (subject, predicate, object)
//! triple of interned strings mapped to dense 32-bit ids, with optional
//! JSON property bags per node and per edge.  The engine persists to
//! local files, survives a crash mid-write, and answers key-prefix
//! queries over six permutations of triple ordering.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                          Store                             │
//! │  ┌───────────┐  ┌───────────────┐  ┌────────────────────┐  │
//! │  │  Staging  │  │  Tombstones   │  │  Paged indexes     │  │
//! │  │  (6 orders│  │  + property   │  │  SPO SOP POS PSO   │  │
//! │  │   + WAL)  │  │    bags       │  │  OSP OPS (on disk) │  │
//! │  └─────┬─────┘  └───────┬───────┘  └─────────┬──────────┘  │
//! │        │    flush       │    flush           │             │
//! │        └──────────►     └─────────►          │             │
//! │                                              │             │
//! │  ┌───────────────────────────────────────────┘             │
//! │  │  Maintenance (compact / page GC / check / repair)       │
//! │  └─────────────────────────────────────────────────────────│
//! │                                                            │
//! │  ┌────────────────────────────────────────────────────┐    │
//! │  │   Manifest (epoch catalog) + reader registry       │    │
//! │  └────────────────────────────────────────────────────┘    │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`store`] | The conductor — open, recover, write, query, flush, close |
//! | [`wal`] | Framed write-ahead log with nested BEGIN/COMMIT/ABORT |
//! | [`pages`] | Per-order append-only page files, CRC'd and optionally Brotli-compressed |
//! | [`manifest`] | Epoch-versioned JSON catalog of pages, tombstones, and orphans |
//! | [`staging`] | In-memory ordered buckets for the unflushed delta |
//! | [`dictionary`] | Dense `String ↔ u32` interning |
//! | [`props`] | Versioned node/edge JSON property bags |
//! | [`maintenance`] | Compaction, page GC, strict check, repair |
//! | [`hotness`] | Decayed per-primary access counters |
//! | [`readers`] | Cross-process reader registry |
//! | [`txids`] | Persistent transaction-id set for replay idempotence |
//! | [`encoding`] | Hand-written binary wire format + checksums |
//! | [`storage_file`] | Main-file header, sections, and atomic writes |
//! | [`model`] | Triples, the six orders, and query criteria |
//!
//! ## Key guarantees
//!
//! - **WAL-first writes** — every mutation hits the log before any other
//!   byte, so a crash between any two flush steps replays cleanly.
//! - **Atomic catalogs** — main file and manifest are only ever replaced
//!   via tmp → fsync → rename.
//! - **Tombstone shadowing** — deletions are logical until a rewrite
//!   compaction physically drops them.
//! - **Snapshot pinning** — readers can freeze their view at an epoch;
//!   maintenance honours the registry and never unlinks pinned pages.
//! - **Page CRCs** — a tampered page is skipped on read and reported by
//!   the strict check, never silently decoded.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use synapsedb::{QueryCriteria, Store, StoreOptions};
//!
//! let store = Store::open("/tmp/graph.db", StoreOptions::default()).unwrap();
//!
//! store.add_fact("alice", "knows", "bob").unwrap();
//! store.flush().unwrap();
//!
//! let rows = store.query(&QueryCriteria::subject("alice")).unwrap();
//! assert_eq!(rows[0].object, "bob");
//!
//! store.close().unwrap();
//! ```

pub mod dictionary;
pub mod encoding;
pub mod hotness;
pub mod maintenance;
pub mod manifest;
pub mod model;
pub mod pages;
pub mod props;
pub mod readers;
pub mod staging;
pub mod storage_file;
pub mod store;
pub mod txids;
pub mod wal;

pub use maintenance::{CompactOptions, CompactionMode, CompactionReport, GcReport};
pub use model::{Triple, TripleOrder};
pub use pages::Compression;
pub use staging::StagingMode;
pub use store::{FactRecord, QueryCriteria, Store, StoreError, StoreOptions, StoreStats};
pub use wal::BatchMeta;
