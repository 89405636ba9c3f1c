//! Staging index: in-memory ordered buckets for unflushed triples.
//!
//! Every added triple that has not yet been appended to the page files
//! lives here, visible to queries and drained by flush.  The index keeps
//! **six buckets**, one per [`TripleOrder`], each mapping a primary-key
//! value to a vec of triples sorted by the order's projection, so that any
//! bound key prefix resolves with binary search.
//!
//! ## Capability seam
//!
//! The store talks to staging through the small [`StagingIndex`] trait
//! (add / remove / ordered views / drain), so an append-only segment
//! staging can substitute for the default sorted buckets without changing
//! query semantics:
//!
//! - [`SortedStaging`] — the default, purely in-memory.
//! - [`SegmentStaging`] — additionally appends every triple to a segment
//!   file under `<pages>/lsm/`, catalogued by `lsm-manifest.json`, so the
//!   unflushed delta survives a transient stop without a main-file write.
//!
//! ## Serialization
//!
//! Only the SPO bucket is serialized (`[u32 count][12-byte records]`); the
//! other five orders are recomputed on deserialize.  Staging holds only
//! the unflushed delta, so the recompute cost stays small.


use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::encoding::{self, Encode, EncodingError};
use crate::model::{Triple, TripleFilter, TripleOrder, decode_triple_records};
use crate::storage_file::write_atomic;

/// Directory (under the pages directory) holding staging segment files.
pub const SEGMENT_DIR: &str = "lsm";

/// Catalog of pending staging segments, next to the segment directory.
pub const SEGMENT_MANIFEST: &str = "lsm-manifest.json";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by staging operations.
#[derive(Debug, Error)]
pub enum StagingError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Segment catalog JSON error.
    #[error("Segment catalog error: {0}")]
    Catalog(#[from] serde_json::Error),
}

// ------------------------------------------------------------------------------------------------
// Mode selector
// ------------------------------------------------------------------------------------------------

/// Which staging backend the store uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StagingMode {
    /// Sorted in-memory buckets (the default).
    #[default]
    Sorted,

    /// Sorted buckets plus append-only segment files under `lsm/`.
    Segments,
}

// ------------------------------------------------------------------------------------------------
// Capability trait
// ------------------------------------------------------------------------------------------------

/// The staging capability the store depends on.
pub trait StagingIndex: std::fmt::Debug + Send {
    /// Insert into all six buckets. Returns `false` when already staged.
    fn add(&mut self, triple: Triple) -> Result<bool, StagingError>;

    /// Remove from all six buckets. Returns `true` when present.
    fn remove(&mut self, triple: &Triple) -> Result<bool, StagingError>;

    /// Number of staged triples.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn contains(&self, triple: &Triple) -> bool;

    /// All staged triples in the given order, flattened primary-first.
    fn triples_for(&self, order: TripleOrder) -> Vec<Triple>;

    /// Staged triples matching the filter, via the filter's best order.
    fn query(&self, filter: &TripleFilter) -> Vec<Triple>;

    /// Drop all staged triples (flush consumed them).
    fn clear(&mut self) -> Result<(), StagingError>;

    /// Serialize the unflushed delta (SPO bucket only).
    fn serialize(&self) -> Result<Vec<u8>, StagingError>;
}

// ------------------------------------------------------------------------------------------------
// SortedStaging
// ------------------------------------------------------------------------------------------------

/// Default staging backend: six sorted buckets, purely in memory.
#[derive(Debug, Default, Clone)]
pub struct SortedStaging {
    /// One bucket per order (indexed by position in [`TripleOrder::ALL`]):
    /// primary value → triples sorted by the order's projection.
    buckets: [BTreeMap<u32, Vec<Triple>>; 6],

    /// Staged triple count (same in every bucket).
    count: usize,
}

impl SortedStaging {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from a serialized SPO bucket.  The other five orders are
    /// recomputed by re-adding every triple.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, StagingError> {
        let mut staging = Self::default();
        for triple in decode_serialized_triples(bytes)? {
            staging.insert_sorted(triple);
        }
        Ok(staging)
    }

    fn insert_sorted(&mut self, triple: Triple) -> bool {
        // Probe SPO first: if present there, it is present everywhere.
        let spo = TripleOrder::Spo;
        let probe = self.buckets[0].entry(spo.primary(&triple)).or_default();
        match probe.binary_search_by(|t| spo.cmp_triples(t, &triple)) {
            Ok(_) => return false,
            Err(pos) => probe.insert(pos, triple),
        }

        for (idx, order) in TripleOrder::ALL.iter().enumerate().skip(1) {
            let bucket = self.buckets[idx].entry(order.primary(&triple)).or_default();
            if let Err(pos) = bucket.binary_search_by(|t| order.cmp_triples(t, &triple)) {
                bucket.insert(pos, triple);
            }
        }
        self.count += 1;
        true
    }

    fn remove_sorted(&mut self, triple: &Triple) -> bool {
        let mut removed = false;
        for (idx, order) in TripleOrder::ALL.iter().enumerate() {
            let primary = order.primary(triple);
            if let Some(bucket) = self.buckets[idx].get_mut(&primary) {
                if let Ok(pos) = bucket.binary_search_by(|t| order.cmp_triples(t, triple)) {
                    bucket.remove(pos);
                    removed = true;
                }
                if bucket.is_empty() {
                    self.buckets[idx].remove(&primary);
                }
            }
        }
        if removed {
            self.count -= 1;
        }
        removed
    }

    fn bucket(&self, order: TripleOrder) -> &BTreeMap<u32, Vec<Triple>> {
        let idx = TripleOrder::ALL
            .iter()
            .position(|o| *o == order)
            .unwrap_or(0);
        &self.buckets[idx]
    }

    fn query_sorted(&self, filter: &TripleFilter) -> Vec<Triple> {
        let order = filter.best_order();
        let bucket = self.bucket(order);

        let (first, second) = filter.prefix_for(order);
        let Some(primary) = first else {
            // Full scan.
            return bucket
                .values()
                .flatten()
                .filter(|t| filter.matches(t))
                .copied()
                .collect();
        };

        let Some(run) = bucket.get(&primary) else {
            return Vec::new();
        };

        match second {
            // Two-sided binary search on the (primary, second) prefix.
            Some(second) => {
                let lo = run.partition_point(|t| {
                    let (a, b, _) = order.project(t);
                    (a, b) < (primary, second)
                });
                let hi = run.partition_point(|t| {
                    let (a, b, _) = order.project(t);
                    (a, b) <= (primary, second)
                });
                run[lo..hi]
                    .iter()
                    .filter(|t| filter.matches(t))
                    .copied()
                    .collect()
            }
            None => run.iter().filter(|t| filter.matches(t)).copied().collect(),
        }
    }
}

impl StagingIndex for SortedStaging {
    fn add(&mut self, triple: Triple) -> Result<bool, StagingError> {
        Ok(self.insert_sorted(triple))
    }

    fn remove(&mut self, triple: &Triple) -> Result<bool, StagingError> {
        Ok(self.remove_sorted(triple))
    }

    fn len(&self) -> usize {
        self.count
    }

    fn contains(&self, triple: &Triple) -> bool {
        let spo = TripleOrder::Spo;
        self.buckets[0]
            .get(&spo.primary(triple))
            .is_some_and(|run| {
                run.binary_search_by(|t| spo.cmp_triples(t, triple)).is_ok()
            })
    }

    fn triples_for(&self, order: TripleOrder) -> Vec<Triple> {
        self.bucket(order).values().flatten().copied().collect()
    }

    fn query(&self, filter: &TripleFilter) -> Vec<Triple> {
        self.query_sorted(filter)
    }

    fn clear(&mut self) -> Result<(), StagingError> {
        for bucket in &mut self.buckets {
            bucket.clear();
        }
        self.count = 0;
        Ok(())
    }

    fn serialize(&self) -> Result<Vec<u8>, StagingError> {
        serialize_spo_bucket(self.triples_for(TripleOrder::Spo))
    }
}

// ------------------------------------------------------------------------------------------------
// SegmentStaging
// ------------------------------------------------------------------------------------------------

/// Catalog file describing pending staging segments.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentCatalog {
    pub version: u32,
    #[serde(default)]
    pub segments: Vec<String>,
}

/// Staging backend that mirrors every add into an append-only segment file
/// under `<pages>/lsm/`.
///
/// Queries are served from the wrapped [`SortedStaging`]; the segment
/// files exist so the unflushed delta survives a stop that never reached a
/// main-file write.  Flush (or a compaction with `include_lsm_segments`)
/// clears both.
#[derive(Debug)]
pub struct SegmentStaging {
    inner: SortedStaging,
    dir: PathBuf,
    active_segment: PathBuf,
    catalog: SegmentCatalog,
}

impl SegmentStaging {
    /// Open segment staging rooted at the pages directory, reloading any
    /// pending segments into memory.
    pub fn open(pages_dir: &Path) -> Result<Self, StagingError> {
        let dir = pages_dir.join(SEGMENT_DIR);
        fs::create_dir_all(&dir)?;

        let catalog = load_segment_catalog(pages_dir)?;
        let mut inner = SortedStaging::new();
        for name in &catalog.segments {
            for triple in read_segment(&dir.join(name))? {
                inner.insert_sorted(triple);
            }
        }

        let active_name = fresh_segment_name(&catalog);
        let active_segment = dir.join(&active_name);

        let mut catalog = catalog;
        catalog.version = 1;
        catalog.segments.push(active_name);
        store_segment_catalog(pages_dir, &catalog)?;

        debug!(dir = %dir.display(), staged = inner.len(), "segment staging opened");
        Ok(Self {
            inner,
            dir,
            active_segment,
            catalog,
        })
    }

    fn pages_dir(&self) -> &Path {
        // `dir` is `<pages>/lsm`; the catalog lives in the parent.
        self.dir.parent().unwrap_or(&self.dir)
    }

    fn append_to_segment(&self, triple: &Triple) -> Result<(), StagingError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.active_segment)?;
        let mut buf = Vec::with_capacity(crate::model::TRIPLE_RECORD_SIZE);
        triple.encode_to(&mut buf)?;
        file.write_all(&buf)?;
        Ok(())
    }
}

impl StagingIndex for SegmentStaging {
    fn add(&mut self, triple: Triple) -> Result<bool, StagingError> {
        if !self.inner.insert_sorted(triple) {
            return Ok(false);
        }
        self.append_to_segment(&triple)?;
        Ok(true)
    }

    fn remove(&mut self, triple: &Triple) -> Result<bool, StagingError> {
        // Segments are append-only; the in-memory view is authoritative for
        // removals and replay re-applies tombstones over segment contents.
        Ok(self.inner.remove_sorted(triple))
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn contains(&self, triple: &Triple) -> bool {
        self.inner.contains(triple)
    }

    fn triples_for(&self, order: TripleOrder) -> Vec<Triple> {
        self.inner.triples_for(order)
    }

    fn query(&self, filter: &TripleFilter) -> Vec<Triple> {
        self.inner.query(filter)
    }

    fn clear(&mut self) -> Result<(), StagingError> {
        self.inner.clear()?;
        let pages_dir = self.pages_dir().to_path_buf();
        clear_segments(&pages_dir)?;

        // Start a fresh catalogued segment so later adds stay durable.
        let mut catalog = SegmentCatalog {
            version: 1,
            segments: Vec::new(),
        };
        let active_name = fresh_segment_name(&catalog);
        self.active_segment = self.dir.join(&active_name);
        catalog.segments.push(active_name);
        store_segment_catalog(&pages_dir, &catalog)?;
        self.catalog = catalog;
        Ok(())
    }

    fn serialize(&self) -> Result<Vec<u8>, StagingError> {
        self.inner.serialize()
    }
}

// ------------------------------------------------------------------------------------------------
// Shared serialization helpers
// ------------------------------------------------------------------------------------------------

/// `[u32 count][12-byte records…]` over the SPO-ordered triples.
fn serialize_spo_bucket(triples: Vec<Triple>) -> Result<Vec<u8>, StagingError> {
    let mut buf = Vec::new();
    encoding::encode_vec(&triples, &mut buf)?;
    Ok(buf)
}

/// Inverse of [`serialize_spo_bucket`]; tolerates an empty slice.
pub fn decode_serialized_triples(bytes: &[u8]) -> Result<Vec<Triple>, StagingError> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    let (triples, _) = encoding::decode_vec::<Triple>(bytes)?;
    Ok(triples)
}

// ------------------------------------------------------------------------------------------------
// Segment catalog I/O (also used by maintenance's include_lsm_segments)
// ------------------------------------------------------------------------------------------------

/// Load the segment catalog; missing or unreadable catalogs yield empty.
pub fn load_segment_catalog(pages_dir: &Path) -> Result<SegmentCatalog, StagingError> {
    let path = pages_dir.join(SEGMENT_MANIFEST);
    if !path.exists() {
        return Ok(SegmentCatalog::default());
    }
    let mut raw = String::new();
    File::open(&path)?.read_to_string(&mut raw)?;
    match serde_json::from_str(&raw) {
        Ok(catalog) => Ok(catalog),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "segment catalog unreadable; starting empty");
            Ok(SegmentCatalog::default())
        }
    }
}

/// Atomically persist the segment catalog.
pub fn store_segment_catalog(
    pages_dir: &Path,
    catalog: &SegmentCatalog,
) -> Result<(), StagingError> {
    let bytes = serde_json::to_vec(catalog)?;
    write_atomic(&pages_dir.join(SEGMENT_MANIFEST), &bytes)?;
    Ok(())
}

/// All triples pending in catalogued segment files.
pub fn pending_segment_triples(pages_dir: &Path) -> Result<Vec<Triple>, StagingError> {
    let catalog = load_segment_catalog(pages_dir)?;
    let dir = pages_dir.join(SEGMENT_DIR);
    let mut triples = Vec::new();
    for name in &catalog.segments {
        triples.extend(read_segment(&dir.join(name))?);
    }
    Ok(triples)
}

/// Delete all catalogued segment files and reset the catalog.
pub fn clear_segments(pages_dir: &Path) -> Result<(), StagingError> {
    let catalog = load_segment_catalog(pages_dir)?;
    let dir = pages_dir.join(SEGMENT_DIR);
    for name in &catalog.segments {
        let path = dir.join(name);
        if path.exists()
            && let Err(e) = fs::remove_file(&path)
        {
            warn!(path = %path.display(), error = %e, "failed to remove staging segment");
        }
    }
    store_segment_catalog(
        pages_dir,
        &SegmentCatalog {
            version: 1,
            segments: Vec::new(),
        },
    )
}

/// A segment name not already present in the catalog (timestamps can
/// collide within one millisecond).
fn fresh_segment_name(catalog: &SegmentCatalog) -> String {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let mut suffix = 0u32;
    loop {
        let name = if suffix == 0 {
            format!("segment-{ts}.seg")
        } else {
            format!("segment-{ts}-{suffix}.seg")
        };
        if !catalog.segments.contains(&name) {
            return name;
        }
        suffix += 1;
    }
}

fn read_segment(path: &Path) -> Result<Vec<Triple>, StagingError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;
    // A torn tail (partial record) is dropped, mirroring WAL truncation.
    let whole = bytes.len() - bytes.len() % crate::model::TRIPLE_RECORD_SIZE;
    Ok(decode_triple_records(&bytes[..whole])?)
}
