//! Manifest: the epoch-versioned catalog of the paged index.
//!
//! `index-manifest.json` is the **central metadata authority** for the
//! pages directory: which pages exist per order, which triples are
//! tombstoned, which pages were orphaned by compaction, and the epoch
//! counter that tells readers how fresh their view is.
//!
//! # Durability model
//!
//! The manifest is a single compact JSON document, always replaced
//! atomically (tmp → fsync → rename → fsync parent directory).  There is
//! no in-place mutation: a crash during a write leaves the previous
//! manifest intact, and the WAL replays any effect the lost epoch would
//! have described.
//!
//! # Schema
//!
//! ```json
//! { "version": 1, "pageSize": 1024, "createdAt": 1700000000000,
//!   "compression": { "codec": "none" },
//!   "epoch": 7,
//!   "tombstones": [[1, 2, 3]],
//!   "orphans":   [{ "order": "SPO", "pages": [ … ] }],
//!   "lookups":   [{ "order": "SPO", "pages": [
//!       { "primaryValue": 1, "offset": 0, "length": 36, "crc32": 123 } ] }] }
//! ```
//!
//! Unknown fields are tolerated on read so the schema can evolve
//! additively.
//!
//! # Invariants
//!
//! - `epoch` never decreases; it is bumped on every page-append cycle.
//! - Every page referenced by any lookup is physically present in its
//!   order's file.
//! - `tombstones` equals the in-memory tombstone set at write time.


use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::model::TripleOrder;
use crate::pages::{Compression, PageMeta};
use crate::storage_file::write_atomic;

/// Manifest file name inside the pages directory.
pub const MANIFEST_FILE: &str = "index-manifest.json";

/// Current manifest schema version.
pub const MANIFEST_VERSION: u32 = 1;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by manifest operations.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON (de)serialization failure.  Fatal on the open path — a
    /// present-but-unreadable catalog must not silently trigger a rebuild.
    #[error("manifest JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// ------------------------------------------------------------------------------------------------
// Schema structures
// ------------------------------------------------------------------------------------------------

/// Per-order page table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderLookup {
    /// Which of the six orders this table describes.
    pub order: TripleOrder,

    /// Pages in append order; a primary value may appear in several.
    pub pages: Vec<PageMeta>,
}

/// Pages no longer reachable from any lookup, awaiting GC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrphanEntry {
    pub order: TripleOrder,
    pub pages: Vec<PageMeta>,
}

/// The catalog itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub version: u32,

    /// Triples per page the files were written with.
    pub page_size: usize,

    /// Creation time, epoch milliseconds.
    pub created_at: u64,

    /// Page codec the files were written with.
    pub compression: Compression,

    /// Monotone index-state version; advanced on every page append.
    #[serde(default)]
    pub epoch: u64,

    /// Tombstoned triples as `[s, p, o]` id arrays.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tombstones: Vec<[u32; 3]>,

    /// Unreachable pages awaiting page-level GC.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub orphans: Vec<OrphanEntry>,

    /// One page table per order.
    pub lookups: Vec<OrderLookup>,
}

impl Manifest {
    /// Fresh manifest at epoch 0 with one empty lookup per order.
    pub fn new(page_size: usize, compression: Compression) -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            version: MANIFEST_VERSION,
            page_size,
            created_at,
            compression,
            epoch: 0,
            tombstones: Vec::new(),
            orphans: Vec::new(),
            lookups: TripleOrder::ALL
                .iter()
                .map(|order| OrderLookup {
                    order: *order,
                    pages: Vec::new(),
                })
                .collect(),
        }
    }

    /// Load from the pages directory.  Missing file → `Ok(None)`;
    /// unreadable JSON → error.
    pub fn load(pages_dir: &Path) -> Result<Option<Self>, ManifestError> {
        let path = pages_dir.join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let mut raw = String::new();
        File::open(&path)?.read_to_string(&mut raw)?;
        let manifest: Manifest = serde_json::from_str(&raw)?;
        debug!(
            path = %path.display(),
            epoch = manifest.epoch,
            lookups = manifest.lookups.len(),
            "manifest loaded"
        );
        Ok(Some(manifest))
    }

    /// Atomically persist into the pages directory.
    pub fn store(&self, pages_dir: &Path) -> Result<(), ManifestError> {
        let path = pages_dir.join(MANIFEST_FILE);
        let bytes = serde_json::to_vec(self)?;
        write_atomic(&path, &bytes)?;
        info!(path = %path.display(), epoch = self.epoch, "manifest written");
        Ok(())
    }

    /// Advance the epoch.  Never decreases.
    pub fn bump_epoch(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }

    /// The page table for `order` (present for all six after `new`;
    /// created on demand for manifests from older writers).
    pub fn lookup_mut(&mut self, order: TripleOrder) -> &mut OrderLookup {
        if let Some(pos) = self.lookups.iter().position(|l| l.order == order) {
            return &mut self.lookups[pos];
        }
        self.lookups.push(OrderLookup {
            order,
            pages: Vec::new(),
        });
        let last = self.lookups.len() - 1;
        &mut self.lookups[last]
    }

    /// The pages for `order`, empty when the order has no table yet.
    pub fn pages_for(&self, order: TripleOrder) -> &[PageMeta] {
        self.lookups
            .iter()
            .find(|l| l.order == order)
            .map_or(&[], |l| l.pages.as_slice())
    }

    /// Append freshly written pages to an order's table.
    pub fn append_pages(&mut self, order: TripleOrder, pages: Vec<PageMeta>) {
        self.lookup_mut(order).pages.extend(pages);
    }

    /// Replace an order's table wholesale (compaction / repair), moving
    /// the displaced pages into the orphan list for later GC.
    pub fn replace_pages(&mut self, order: TripleOrder, pages: Vec<PageMeta>) {
        let lookup = self.lookup_mut(order);
        let displaced = std::mem::replace(&mut lookup.pages, pages);
        if !displaced.is_empty() {
            self.orphans.push(OrphanEntry {
                order,
                pages: displaced,
            });
        }
    }

    /// Drop orphan records for `order` (their bytes were reclaimed).
    pub fn clear_orphans(&mut self, order: TripleOrder) {
        self.orphans.retain(|o| o.order != order);
    }
}
