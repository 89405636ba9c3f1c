//! Persistent store — the conductor.
//!
//! [`Store`] orchestrates everything the lower layers provide: open and
//! crash recovery, the WAL-first write path, nested batches, tombstones,
//! query planning over the six paged orders plus staging, the flush
//! pipeline, snapshot pinning, and the reader-registry lifecycle.
//!
//! # Write path
//!
//! ```text
//! add/delete/setProps ──► WAL record (sync OS write)
//!                          │
//!                          ├─ batch open? ──► buffered in the top frame
//!                          └─ otherwise  ──► staging / tombstones / props
//! ```
//!
//! # Flush pipeline
//!
//! Five steps, each crash-safe on its own thanks to tmp-rename writes and
//! WAL replay; the labelled points can be armed by tests via
//! [`Store::inject_crash`]:
//!
//! 1. `before-main-write` — atomically rewrite the main file (dictionary,
//!    zero-count triples, empty staging sentinel, properties).
//! 2. `before-page-append` — append staged triples per order, advance the
//!    manifest epoch, clear staging, re-hydrate readers.
//! 3. `before-manifest-write` — persist the manifest with the tombstone
//!    set.
//! 4. decay and persist hotness; persist newly committed txids.
//! 5. `before-wal-reset` — truncate the WAL to its header.
//!
//! # Concurrency
//!
//! The handle follows the engine convention of a cloneable
//! `Arc<RwLock<Inner>>`: mutations serialize behind the write lock, and
//! cross-process single-writer ownership is enforced by the optional
//! `<db>.lock` file.  Reader processes open the same path without the
//! lock and observe flushed epochs via the manifest.

#[cfg(test)]
mod tests;

use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::dictionary::Dictionary;
use crate::hotness::{self, Hotness, HotnessError};
use crate::manifest::{Manifest, ManifestError};
use crate::model::{Triple, TripleFilter, TripleOrder};
use crate::pages::{
    Compression, DEFAULT_PAGE_SIZE, PageError, PagedIndexReader, PagedIndexWriter, page_file_path,
};
use crate::props::PropertyStore;
use crate::readers::{self, ReaderRegistryError};
use crate::staging::{
    self, SegmentStaging, SortedStaging, StagingError, StagingIndex, StagingMode,
};
use crate::storage_file::{
    StorageFileError, StorageSections, initialize_if_missing, read_storage_file,
    write_storage_file,
};
use crate::txids::{DEFAULT_MAX_REMEMBER, TxIdError, TxIdRegistry};
use crate::wal::{self, BatchMeta, WalEffect, WalError, WalRecord, WalWriter};

/// Crash-injection label before the atomic main-file rewrite.
pub const CRASH_BEFORE_MAIN_WRITE: &str = "before-main-write";
/// Crash-injection label before staged pages are appended.
pub const CRASH_BEFORE_PAGE_APPEND: &str = "before-page-append";
/// Crash-injection label before the manifest is written.
pub const CRASH_BEFORE_MANIFEST_WRITE: &str = "before-manifest-write";
/// Crash-injection label before the WAL is truncated to its header.
pub const CRASH_BEFORE_WAL_RESET: &str = "before-wal-reset";

/// Minimum interval between manifest re-reads on the query path.
const MANIFEST_REFRESH_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Main-file error (corrupt header is fatal on open).
    #[error("Storage file error: {0}")]
    StorageFile(#[from] StorageFileError),

    /// WAL error (unsupported version is fatal on open).
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// Paged-index error.
    #[error("Page error: {0}")]
    Page(#[from] PageError),

    /// Manifest error.
    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// Staging error.
    #[error("Staging error: {0}")]
    Staging(#[from] StagingError),

    /// Hotness persistence error.
    #[error("Hotness error: {0}")]
    Hotness(#[from] HotnessError),

    /// Reader registry error.
    #[error("Reader registry error: {0}")]
    Readers(#[from] ReaderRegistryError),

    /// TxId registry error.
    #[error("TxId registry error: {0}")]
    TxIds(#[from] TxIdError),

    /// Another process holds the exclusive writer lock.
    #[error("database is locked by another writer: {0}")]
    LockContention(PathBuf),

    /// A writer lock exists and the WAL holds uncommitted bytes; opening
    /// without a lock would read a torn state.
    #[error("unsafe unlocked open: writer lock present and WAL has pending bytes")]
    UnsafeUnlockedOpen,

    /// Synthetic failure raised at an armed crash-injection point.
    #[error("injected crash at '{0}'")]
    InjectedCrash(String),

    /// Internal invariant violation (poisoned lock, no open batch, …).
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Options
// ------------------------------------------------------------------------------------------------

/// Configuration accepted by [`Store::open`].  The set is exhaustive —
/// there are no other knobs.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Pages directory; defaults to `<db>.pages` next to the main file.
    pub index_directory: Option<PathBuf>,

    /// Triples per page (default 1024).
    pub page_size: usize,

    /// Force a rebuild of all six page files from the main file's
    /// historical triples.
    pub rebuild_indexes: bool,

    /// Page codec for newly written pages.
    pub compression: Compression,

    /// Acquire the exclusive `<db>.lock` writer lock.
    pub enable_lock: bool,

    /// Register this process in the reader registry on open.
    pub register_reader: bool,

    /// Persist applied transaction ids for cross-restart replay dedup.
    pub enable_persistent_tx_dedupe: bool,

    /// Cap of the persistent txid registry.
    pub max_remember_tx_ids: usize,

    /// Staging backend selection.
    pub staging_mode: StagingMode,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            index_directory: None,
            page_size: DEFAULT_PAGE_SIZE,
            rebuild_indexes: false,
            compression: Compression::None,
            enable_lock: true,
            register_reader: true,
            enable_persistent_tx_dedupe: true,
            max_remember_tx_ids: DEFAULT_MAX_REMEMBER,
            staging_mode: StagingMode::Sorted,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Query surface
// ------------------------------------------------------------------------------------------------

/// String-level query criteria; every bound term must match exactly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryCriteria {
    pub subject: Option<String>,
    pub predicate: Option<String>,
    pub object: Option<String>,
}

impl QueryCriteria {
    pub fn subject(s: impl Into<String>) -> Self {
        Self {
            subject: Some(s.into()),
            ..Self::default()
        }
    }

    pub fn with_predicate(mut self, p: impl Into<String>) -> Self {
        self.predicate = Some(p.into());
        self
    }

    pub fn with_object(mut self, o: impl Into<String>) -> Self {
        self.object = Some(o.into());
        self
    }
}

/// One query result row: the triple's strings plus its stable ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactRecord {
    pub subject: String,
    pub predicate: String,
    pub object: String,
    pub ids: Triple,
}

/// Point-in-time statistics, mirroring the engine's stats discipline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
    /// Unflushed staged triples.
    pub staged: usize,
    /// Live tombstones.
    pub tombstones: usize,
    /// Current manifest epoch.
    pub epoch: u64,
    /// Interned dictionary entries.
    pub dictionary_len: usize,
    /// Reachable pages per order.
    pub pages_per_order: Vec<(TripleOrder, usize)>,
}

// ------------------------------------------------------------------------------------------------
// Internal state
// ------------------------------------------------------------------------------------------------

/// One open batch frame.  Effects buffer here until the outermost commit.
#[derive(Debug, Default)]
struct TxFrame {
    effects: Vec<WalEffect>,
    meta: BatchMeta,
}

pub(crate) struct StoreInner {
    path: PathBuf,
    pub(crate) pages_dir: PathBuf,
    pub(crate) options: StoreOptions,

    pub(crate) dictionary: Dictionary,
    pub(crate) props: PropertyStore,
    pub(crate) staging: Box<dyn StagingIndex>,
    pub(crate) tombstones: HashSet<Triple>,

    /// Triples from the main file's historical section.  Zero after the
    /// first flush under the paged layout; kept as a repair source.
    pub(crate) historical_triples: Vec<Triple>,

    wal: WalWriter,
    tx_frames: Vec<TxFrame>,

    pub(crate) manifest: Manifest,
    pub(crate) page_readers: HashMap<TripleOrder, PagedIndexReader>,
    pub(crate) hotness: Hotness,
    txids: TxIdRegistry,

    lock_path: Option<PathBuf>,
    dirty: bool,
    closed: bool,

    pinned_epochs: Vec<u64>,
    last_manifest_check: Option<Instant>,
    crash_points: HashSet<String>,
}

impl std::fmt::Debug for StoreInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreInner")
            .field("path", &self.path)
            .field("dirty", &self.dirty)
            .field("epoch", &self.manifest.epoch)
            .field("staged", &self.staging.len())
            .finish_non_exhaustive()
    }
}

/// The store handle.  Clone freely; all clones share one inner state.
#[derive(Debug, Clone)]
pub struct Store {
    inner: Arc<RwLock<StoreInner>>,
}

impl Store {
    // --------------------------------------------------------------------
    // Open
    // --------------------------------------------------------------------

    /// Open (or create) the database at `path`.
    ///
    /// Recovery happens here: the main file's sections are deserialized,
    /// the WAL is replayed with the persistent txid set, its torn tail is
    /// truncated, and the paged indexes are hydrated from the manifest —
    /// or rebuilt from the main file's historical triples when the
    /// manifest is missing, `rebuild_indexes` is set, or the page size
    /// changed.
    pub fn open(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let pages_dir = options
            .index_directory
            .clone()
            .unwrap_or_else(|| default_pages_dir(&path));
        let wal_path = wal_file_path(&path);
        let lock_path = lock_file_path(&path);

        // 1. Main file + the unlocked-open safety gate.
        initialize_if_missing(&path)?;
        fs::create_dir_all(&pages_dir)?;

        if !options.enable_lock && lock_path.exists() && wal::payload_bytes(&wal_path) > 0 {
            return Err(StoreError::UnsafeUnlockedOpen);
        }

        // 2. Deserialize persistent in-memory state.
        let sections = read_storage_file(&path)?;
        let mut dictionary = Dictionary::deserialize(&sections.dictionary)
            .map_err(|e| StoreError::Internal(format!("dictionary section: {e}")))?;
        let props = PropertyStore::deserialize(&sections.properties)
            .map_err(|e| StoreError::Internal(format!("properties section: {e}")))?;
        let historical_triples = staging::decode_serialized_triples(&sections.triples)?;

        let mut staging: Box<dyn StagingIndex> = match options.staging_mode {
            StagingMode::Sorted => Box::new(SortedStaging::deserialize(&sections.indexes)?),
            StagingMode::Segments => {
                let mut segment_staging = SegmentStaging::open(&pages_dir)?;
                for triple in staging::decode_serialized_triples(&sections.indexes)? {
                    segment_staging.add(triple)?;
                }
                Box::new(segment_staging)
            }
        };

        // 3. Exclusive writer lock.  The guard removes the file again if
        //    any later open step fails, so a failed open cannot wedge the
        //    database behind a stale lock.
        let mut lock_guard = LockGuard { path: None };
        if options.enable_lock {
            lock_guard.path = Some(acquire_lock(&lock_path)?);
        }

        // 4. Manifest (or rebuild), so tombstones seed before WAL effects.
        let loaded = Manifest::load(&pages_dir)?;
        let needs_rebuild = loaded.is_none()
            || options.rebuild_indexes
            || loaded
                .as_ref()
                .is_some_and(|m| m.page_size != options.page_size);

        let mut manifest = if needs_rebuild {
            let mut fresh = Manifest::new(options.page_size, options.compression);
            // Rebuild source: the main file's historical triples, plus
            // whatever the previous manifest can still reach (a page-size
            // change must not lose flushed triples).
            let mut source = historical_triples.clone();
            if let Some(previous) = &loaded {
                fresh.epoch = previous.epoch + 1;
                fresh.tombstones = previous.tombstones.clone();
                let old_readers = hydrate_readers(&pages_dir, previous);
                if let Some(spo) = old_readers.get(&TripleOrder::Spo) {
                    source.extend(spo.read_all()?);
                }
            }
            rebuild_page_files(&pages_dir, &source, &mut fresh)?;
            fresh.store(&pages_dir)?;
            info!(
                path = %path.display(),
                triples = source.len(),
                "page files rebuilt"
            );
            fresh
        } else {
            // Unwrap is safe by needs_rebuild, but stay panic-free.
            loaded.unwrap_or_else(|| Manifest::new(options.page_size, options.compression))
        };

        let mut tombstones: HashSet<Triple> = manifest
            .tombstones
            .iter()
            .map(|[s, p, o]| Triple::new(*s, *p, *o))
            .collect();

        let page_readers = hydrate_readers(&pages_dir, &manifest);

        // 5. WAL replay, seeded with the persistent txid set.
        let mut txids = if options.enable_persistent_tx_dedupe {
            TxIdRegistry::load(&pages_dir, options.max_remember_tx_ids)
        } else {
            TxIdRegistry::default()
        };

        let dictionary_len_before = dictionary.len();
        let replay = wal::replay(&wal_path, &txids.id_set(), &mut dictionary)?;
        let mut wal = WalWriter::open(&wal_path)?;
        wal.truncate_to(replay.safe_offset)?;
        for _ in 0..replay.open_layers {
            wal.append(&WalRecord::Abort)?;
        }

        let mut props = props;
        // Terms interned during replay live only in memory until the next
        // flush persists the dictionary section.
        let dirty =
            !replay.effects.is_empty() || dictionary.len() != dictionary_len_before;
        for effect in replay.effects {
            apply_recovered_effect(
                effect,
                staging.as_mut(),
                &mut tombstones,
                &mut props,
                &page_readers,
            )?;
        }

        if options.enable_persistent_tx_dedupe && !replay.newly_committed.is_empty() {
            for (id, session) in &replay.newly_committed {
                txids.remember(id, session.as_deref());
            }
            txids.store(&pages_dir)?;
        }

        // 6. Hotness (fresh on failure).
        let hotness = Hotness::load(&pages_dir);

        // 7. Reader registration.
        if options.register_reader {
            readers::register(&pages_dir, std::process::id(), manifest.epoch)?;
        }

        // Keep the manifest's tombstone list aligned with memory.
        manifest.tombstones = sorted_tombstones(&tombstones);

        info!(
            path = %path.display(),
            epoch = manifest.epoch,
            staged = staging.len(),
            tombstones = tombstones.len(),
            "store opened"
        );

        Ok(Self {
            inner: Arc::new(RwLock::new(StoreInner {
                path,
                pages_dir,
                options,
                dictionary,
                props,
                staging,
                tombstones,
                historical_triples,
                wal,
                tx_frames: Vec::new(),
                manifest,
                page_readers,
                hotness,
                txids,
                lock_path: lock_guard.release(),
                dirty,
                closed: false,
                pinned_epochs: Vec::new(),
                last_manifest_check: None,
                crash_points: HashSet::new(),
            })),
        })
    }

    // --------------------------------------------------------------------
    // Lock helpers
    // --------------------------------------------------------------------

    pub(crate) fn read_inner(&self) -> Result<RwLockReadGuard<'_, StoreInner>, StoreError> {
        self.inner
            .read()
            .map_err(|_| StoreError::Internal("RwLock poisoned".into()))
    }

    pub(crate) fn write_inner(&self) -> Result<RwLockWriteGuard<'_, StoreInner>, StoreError> {
        self.inner
            .write()
            .map_err(|_| StoreError::Internal("RwLock poisoned".into()))
    }

    // --------------------------------------------------------------------
    // Write operations
    // --------------------------------------------------------------------

    /// Intern the three strings and add the fact.  Returns the ids.
    ///
    /// Re-adding a tombstoned fact clears its tombstone.
    pub fn add_fact(&self, s: &str, p: &str, o: &str) -> Result<(u32, u32, u32), StoreError> {
        let mut inner = self.write_inner()?;
        inner.ensure_open()?;

        let triple = Triple::new(
            inner.dictionary.get_or_create_id(s),
            inner.dictionary.get_or_create_id(p),
            inner.dictionary.get_or_create_id(o),
        );

        inner.wal.append(&WalRecord::add(s, p, o))?;
        inner.buffer_or_apply(WalEffect::Add(triple))?;
        inner.dirty = true;
        Ok((triple.s, triple.p, triple.o))
    }

    /// Tombstone a fact.  Unknown terms mean the fact never existed and
    /// the call is a no-op.
    pub fn delete_fact(&self, s: &str, p: &str, o: &str) -> Result<(), StoreError> {
        let mut inner = self.write_inner()?;
        inner.ensure_open()?;

        let (Some(s_id), Some(p_id), Some(o_id)) = (
            inner.dictionary.get_id(s),
            inner.dictionary.get_id(p),
            inner.dictionary.get_id(o),
        ) else {
            return Ok(());
        };
        let triple = Triple::new(s_id, p_id, o_id);

        inner.wal.append(&WalRecord::delete(s, p, o))?;
        inner.buffer_or_apply(WalEffect::Delete(triple))?;
        inner.dirty = true;
        Ok(())
    }

    /// Overwrite a node's property bag (bumping its `__v`).
    pub fn set_node_properties(&self, id: u32, bag: Value) -> Result<(), StoreError> {
        let mut inner = self.write_inner()?;
        inner.ensure_open()?;

        inner.wal.append(&WalRecord::SetNodeProps {
            id,
            data: bag.clone(),
        })?;
        inner.buffer_or_apply(WalEffect::NodeProps { id, data: bag })?;
        inner.dirty = true;
        Ok(())
    }

    /// Overwrite an edge's property bag, interning its terms if needed.
    pub fn set_edge_properties(
        &self,
        s: &str,
        p: &str,
        o: &str,
        bag: Value,
    ) -> Result<(), StoreError> {
        let mut inner = self.write_inner()?;
        inner.ensure_open()?;

        let triple = Triple::new(
            inner.dictionary.get_or_create_id(s),
            inner.dictionary.get_or_create_id(p),
            inner.dictionary.get_or_create_id(o),
        );

        inner.wal.append(&WalRecord::SetEdgeProps {
            s: s.to_string(),
            p: p.to_string(),
            o: o.to_string(),
            data: bag.clone(),
        })?;
        inner.buffer_or_apply(WalEffect::EdgeProps { triple, data: bag })?;
        inner.dirty = true;
        Ok(())
    }

    // --------------------------------------------------------------------
    // Batches
    // --------------------------------------------------------------------

    /// Open a (possibly nested) batch.  Effects buffer in the new frame
    /// until commit.
    pub fn begin_batch(&self, meta: BatchMeta) -> Result<(), StoreError> {
        let mut inner = self.write_inner()?;
        inner.ensure_open()?;

        inner.wal.append(&WalRecord::Begin(meta.clone()))?;
        inner.tx_frames.push(TxFrame {
            effects: Vec::new(),
            meta,
        });
        Ok(())
    }

    /// Commit the innermost open batch.
    ///
    /// A nested commit merges the frame into its parent (an outer abort
    /// still discards it); the outermost commit applies the frame to the
    /// main state and remembers its `tx_id`.  Ordinary commits are
    /// synchronous OS writes that survive a process crash but not power
    /// loss; pass `durable = true` to fsync the WAL.
    pub fn commit_batch(&self, durable: bool) -> Result<(), StoreError> {
        let mut inner = self.write_inner()?;
        inner.ensure_open()?;

        if inner.tx_frames.is_empty() {
            return Err(StoreError::Internal("commit without an open batch".into()));
        }

        inner.wal.append(&WalRecord::Commit)?;
        if durable {
            inner.wal.sync()?;
        }

        let frame = match inner.tx_frames.pop() {
            Some(frame) => frame,
            None => return Err(StoreError::Internal("commit without an open batch".into())),
        };
        match inner.tx_frames.last_mut() {
            Some(parent) => parent.effects.extend(frame.effects),
            None => {
                for effect in frame.effects {
                    inner.apply_effect(effect)?;
                }
                if let Some(tx_id) = &frame.meta.tx_id
                    && inner.options.enable_persistent_tx_dedupe
                {
                    // Persisted at the next flush; remembering now keeps a
                    // same-process duplicate from re-applying on replay.
                    let session = frame.meta.session_id.clone();
                    inner.txids.remember(tx_id, session.as_deref());
                }
                inner.dirty = true;
            }
        }
        Ok(())
    }

    /// Abort the innermost open batch, discarding only its frame.
    pub fn abort_batch(&self) -> Result<(), StoreError> {
        let mut inner = self.write_inner()?;
        inner.ensure_open()?;

        if inner.tx_frames.is_empty() {
            return Err(StoreError::Internal("abort without an open batch".into()));
        }
        inner.wal.append(&WalRecord::Abort)?;
        inner.tx_frames.pop();
        Ok(())
    }

    // --------------------------------------------------------------------
    // Queries
    // --------------------------------------------------------------------

    /// Primitive read: all live facts matching the criteria.
    ///
    /// Unless a snapshot is pinned, the result merges paged pages with
    /// the in-memory staging delta, shadowed by tombstones; ids are
    /// dereferenced to strings through the dictionary.
    pub fn query(&self, criteria: &QueryCriteria) -> Result<Vec<FactRecord>, StoreError> {
        let mut inner = self.write_inner()?;
        inner.ensure_open()?;

        inner.maybe_refresh_manifest();

        // Bound terms that were never interned cannot match anything.
        let mut filter = TripleFilter::default();
        for (term, slot) in [
            (&criteria.subject, &mut filter.s),
            (&criteria.predicate, &mut filter.p),
            (&criteria.object, &mut filter.o),
        ] {
            if let Some(term) = term {
                match inner.dictionary.get_id(term) {
                    Some(id) => *slot = Some(id),
                    None => return Ok(Vec::new()),
                }
            }
        }

        let order = filter.best_order();
        let primary = filter.primary_for(order);
        let pinned = !inner.pinned_epochs.is_empty();

        let mut matches: HashSet<Triple> = HashSet::new();

        // Paged side.
        match primary {
            Some(primary) => {
                let page_hits = match inner.page_readers.get(&order) {
                    Some(reader) => reader.read(primary)?,
                    None => Vec::new(),
                };
                matches.extend(page_hits.into_iter().filter(|t| filter.matches(t)));
                inner.hotness.record_hit(order, primary);
            }
            None => {
                // Full scan over the SPO file (every triple appears in
                // every order; SPO is the canonical scan order).
                let scan = match inner.page_readers.get(&TripleOrder::Spo) {
                    Some(reader) => reader.read_all()?,
                    None => Vec::new(),
                };
                matches.extend(scan.into_iter().filter(|t| filter.matches(t)));
            }
        }

        // In-memory delta, unless a snapshot pin freezes the view.
        if !pinned {
            matches.extend(inner.staging.query(&filter));
        }

        let mut rows: Vec<FactRecord> = matches
            .into_iter()
            .filter(|t| !inner.tombstones.contains(t))
            .filter_map(|t| inner.to_record(&t))
            .collect();
        rows.sort_by(|a, b| a.ids.cmp(&b.ids));
        Ok(rows)
    }

    /// A node's property bag (`data` payload), with the open-transaction
    /// overlay applied newest-first.
    pub fn get_node_properties(&self, id: u32) -> Result<Option<Value>, StoreError> {
        let inner = self.read_inner()?;
        inner.ensure_open()?;

        for frame in inner.tx_frames.iter().rev() {
            for effect in frame.effects.iter().rev() {
                if let WalEffect::NodeProps { id: eid, data } = effect
                    && *eid == id
                {
                    return Ok(Some(data.clone()));
                }
            }
        }
        Ok(inner.props.node(id).map(|bag| bag.data.clone()))
    }

    /// An edge's property bag, with the open-transaction overlay.
    pub fn get_edge_properties(
        &self,
        s: &str,
        p: &str,
        o: &str,
    ) -> Result<Option<Value>, StoreError> {
        let inner = self.read_inner()?;
        inner.ensure_open()?;

        let (Some(s), Some(p), Some(o)) = (
            inner.dictionary.get_id(s),
            inner.dictionary.get_id(p),
            inner.dictionary.get_id(o),
        ) else {
            return Ok(None);
        };
        let triple = Triple::new(s, p, o);

        for frame in inner.tx_frames.iter().rev() {
            for effect in frame.effects.iter().rev() {
                if let WalEffect::EdgeProps { triple: et, data } = effect
                    && *et == triple
                {
                    return Ok(Some(data.clone()));
                }
            }
        }
        Ok(inner.props.edge(&triple.key()).map(|bag| bag.data.clone()))
    }

    /// Point-in-time statistics.
    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let inner = self.read_inner()?;
        Ok(StoreStats {
            staged: inner.staging.len(),
            tombstones: inner.tombstones.len(),
            epoch: inner.manifest.epoch,
            dictionary_len: inner.dictionary.len(),
            pages_per_order: TripleOrder::ALL
                .iter()
                .map(|order| (*order, inner.manifest.pages_for(*order).len()))
                .collect(),
        })
    }

    // --------------------------------------------------------------------
    // Snapshot pinning
    // --------------------------------------------------------------------

    /// Pin the view at `epoch`.  While any pin is held, queries neither
    /// refresh the manifest nor merge the in-memory delta.
    pub fn push_pinned_epoch(&self, epoch: u64) -> Result<(), StoreError> {
        let mut inner = self.write_inner()?;
        inner.ensure_open()?;

        if inner.pinned_epochs.is_empty() {
            readers::register(&inner.pages_dir, std::process::id(), epoch)?;
        }
        inner.pinned_epochs.push(epoch);
        Ok(())
    }

    /// Release the innermost pin; the last pop de-registers the reader
    /// (or re-registers it at the current epoch when the store keeps a
    /// standing registration).
    pub fn pop_pinned_epoch(&self) -> Result<(), StoreError> {
        let mut inner = self.write_inner()?;
        inner.ensure_open()?;

        inner.pinned_epochs.pop();
        if inner.pinned_epochs.is_empty() {
            if inner.options.register_reader {
                let epoch = inner.manifest.epoch;
                readers::register(&inner.pages_dir, std::process::id(), epoch)?;
            } else {
                readers::unregister(&inner.pages_dir, std::process::id());
            }
        }
        Ok(())
    }

    // --------------------------------------------------------------------
    // Flush / close
    // --------------------------------------------------------------------

    /// Run the five-step flush pipeline (no-op when clean).
    pub fn flush(&self) -> Result<(), StoreError> {
        let mut inner = self.write_inner()?;
        inner.ensure_open()?;
        inner.flush_locked()
    }

    /// Flush (best-effort), release the lock, unregister the reader, and
    /// drop caches.  Idempotent.
    pub fn close(&self) -> Result<(), StoreError> {
        let mut inner = self.write_inner()?;
        if inner.closed {
            return Ok(());
        }

        if inner.dirty
            && let Err(e) = inner.flush_locked()
        {
            warn!(error = %e, "flush on close failed; WAL retains the delta");
        }

        if let Some(lock_path) = inner.lock_path.take()
            && let Err(e) = fs::remove_file(&lock_path)
        {
            warn!(path = %lock_path.display(), error = %e, "failed to remove writer lock");
        }
        readers::unregister(&inner.pages_dir, std::process::id());

        inner.page_readers.clear();
        inner.tx_frames.clear();
        inner.closed = true;
        info!(path = %inner.path.display(), "store closed");
        Ok(())
    }

    // --------------------------------------------------------------------
    // Test hook
    // --------------------------------------------------------------------

    /// Arm a one-shot crash at the given labelled flush step.  The next
    /// flush reaching that step fails with
    /// [`StoreError::InjectedCrash`]; recovery is exercised by reopening.
    pub fn inject_crash(&self, label: &str) -> Result<(), StoreError> {
        let mut inner = self.write_inner()?;
        inner.crash_points.insert(label.to_string());
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Inner implementation
// ------------------------------------------------------------------------------------------------

impl StoreInner {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed {
            return Err(StoreError::Internal("store is closed".into()));
        }
        Ok(())
    }

    fn crash_point(&mut self, label: &str) -> Result<(), StoreError> {
        if self.crash_points.remove(label) {
            return Err(StoreError::InjectedCrash(label.to_string()));
        }
        Ok(())
    }

    /// Route an effect into the open batch frame, or apply it directly.
    fn buffer_or_apply(&mut self, effect: WalEffect) -> Result<(), StoreError> {
        match self.tx_frames.last_mut() {
            Some(frame) => {
                frame.effects.push(effect);
                Ok(())
            }
            None => self.apply_effect(effect),
        }
    }

    fn apply_effect(&mut self, effect: WalEffect) -> Result<(), StoreError> {
        match effect {
            WalEffect::Add(triple) => {
                self.tombstones.remove(&triple);
                self.staging.add(triple)?;
            }
            WalEffect::Delete(triple) => {
                self.tombstones.insert(triple);
                self.staging.remove(&triple)?;
            }
            WalEffect::NodeProps { id, data } => self.props.set_node(id, data),
            WalEffect::EdgeProps { triple, data } => {
                self.props.set_edge(&triple.key(), data);
            }
        }
        Ok(())
    }

    /// Re-read the manifest at most once per second (and never while a
    /// snapshot is pinned), adopting newer epochs published by the
    /// writer.
    fn maybe_refresh_manifest(&mut self) {
        if !self.pinned_epochs.is_empty() {
            return;
        }
        let due = self
            .last_manifest_check
            .is_none_or(|at| at.elapsed() >= MANIFEST_REFRESH_INTERVAL);
        if !due {
            return;
        }
        self.last_manifest_check = Some(Instant::now());

        match Manifest::load(&self.pages_dir) {
            Ok(Some(fresh)) if fresh.epoch > self.manifest.epoch => {
                debug!(
                    old_epoch = self.manifest.epoch,
                    new_epoch = fresh.epoch,
                    "adopting newer manifest"
                );
                self.tombstones = fresh
                    .tombstones
                    .iter()
                    .map(|[s, p, o]| Triple::new(*s, *p, *o))
                    .collect();
                self.manifest = fresh;
                self.page_readers = hydrate_readers(&self.pages_dir, &self.manifest);
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "manifest refresh failed; keeping current epoch"),
        }
    }

    fn to_record(&self, triple: &Triple) -> Option<FactRecord> {
        Some(FactRecord {
            subject: self.dictionary.get_value(triple.s)?.to_string(),
            predicate: self.dictionary.get_value(triple.p)?.to_string(),
            object: self.dictionary.get_value(triple.o)?.to_string(),
            ids: *triple,
        })
    }

    /// The five-step flush pipeline.  Caller holds the write lock.
    pub(crate) fn flush_locked(&mut self) -> Result<(), StoreError> {
        if !self.dirty {
            return Ok(());
        }
        // Resetting the WAL would erase an open batch's BEGIN frame and
        // orphan its eventual COMMIT.
        if !self.tx_frames.is_empty() {
            return Err(StoreError::Internal(
                "cannot flush while a batch is open".into(),
            ));
        }

        // 1. Main file: dictionary + zero-count triples + empty staging
        //    sentinel + properties.  Pages are the triples' home now.
        self.crash_point(CRASH_BEFORE_MAIN_WRITE)?;
        let sections = StorageSections {
            dictionary: self
                .dictionary
                .serialize()
                .map_err(|e| StoreError::Internal(format!("dictionary serialize: {e}")))?,
            triples: empty_triple_section(),
            indexes: empty_triple_section(),
            properties: self
                .props
                .serialize()
                .map_err(|e| StoreError::Internal(format!("properties serialize: {e}")))?,
        };
        write_storage_file(&self.path, &sections)?;
        self.historical_triples.clear();

        // 2. Per-order page append + epoch bump.
        self.crash_point(CRASH_BEFORE_PAGE_APPEND)?;
        let mut appended = false;
        for order in TripleOrder::ALL {
            let staged = self.staging.triples_for(order);
            if staged.is_empty() {
                continue;
            }
            let mut writer = PagedIndexWriter::new(
                page_file_path(&self.pages_dir, order),
                order,
                self.manifest.page_size,
                self.manifest.compression,
            );
            writer.push_all(staged);
            let metas = writer.finalize()?;
            self.manifest.append_pages(order, metas);
            appended = true;
        }
        if appended {
            self.manifest.bump_epoch();
        }
        self.staging.clear()?;
        self.page_readers = hydrate_readers(&self.pages_dir, &self.manifest);

        // 3. Manifest with the current tombstone set.
        self.crash_point(CRASH_BEFORE_MANIFEST_WRITE)?;
        self.manifest.tombstones = sorted_tombstones(&self.tombstones);
        self.manifest.store(&self.pages_dir)?;

        // 4. Hotness decay + persist; txid registry persist.
        self.hotness.decay(hotness::DEFAULT_HALF_LIFE);
        if let Err(e) = self.hotness.store(&self.pages_dir) {
            warn!(error = %e, "hotness persist failed; counters reset next open");
        }
        if self.options.enable_persistent_tx_dedupe {
            self.txids.store(&self.pages_dir)?;
        }

        // 5. WAL reset.
        self.crash_point(CRASH_BEFORE_WAL_RESET)?;
        self.wal.reset()?;

        self.dirty = false;
        info!(
            path = %self.path.display(),
            epoch = self.manifest.epoch,
            "flush complete"
        );
        Ok(())
    }

    /// Mark the store dirty (maintenance mutated durable state).
    pub(crate) fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// True while any snapshot pin is held by this process.
    pub(crate) fn has_pins(&self) -> bool {
        !self.pinned_epochs.is_empty()
    }
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        // No flush here: the WAL already holds every unflushed effect, so
        // the next open replays it.  Only the cross-process artifacts are
        // released.
        if let Some(lock_path) = self.lock_path.take()
            && let Err(e) = fs::remove_file(&lock_path)
        {
            warn!(path = %lock_path.display(), error = %e, "failed to remove writer lock on drop");
        }
        readers::unregister(&self.pages_dir, std::process::id());
    }
}

// ------------------------------------------------------------------------------------------------
// Free helpers
// ------------------------------------------------------------------------------------------------

/// `<db>.pages` next to the main file.
pub fn default_pages_dir(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".pages");
    PathBuf::from(os)
}

/// `<db>.wal` next to the main file.
pub fn wal_file_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".wal");
    PathBuf::from(os)
}

/// `<db>.lock` next to the main file.
pub fn lock_file_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".lock");
    PathBuf::from(os)
}

/// Removes the writer lock on drop unless ownership was handed to the
/// store.
struct LockGuard {
    path: Option<PathBuf>,
}

impl LockGuard {
    fn release(mut self) -> Option<PathBuf> {
        self.path.take()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(path) = &self.path
            && let Err(e) = fs::remove_file(path)
        {
            warn!(path = %path.display(), error = %e, "failed to remove writer lock after failed open");
        }
    }
}

fn acquire_lock(lock_path: &Path) -> Result<PathBuf, StoreError> {
    let mut file = match OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(lock_path)
    {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            return Err(StoreError::LockContention(lock_path.to_path_buf()));
        }
        Err(e) => return Err(StoreError::Io(e)),
    };
    file.write_all(std::process::id().to_string().as_bytes())?;
    file.sync_all()?;
    Ok(lock_path.to_path_buf())
}

/// Serialized empty triple list (`[u32 count = 0]`).
fn empty_triple_section() -> Vec<u8> {
    0u32.to_le_bytes().to_vec()
}

fn sorted_tombstones(tombstones: &HashSet<Triple>) -> Vec<[u32; 3]> {
    let mut list: Vec<[u32; 3]> = tombstones.iter().map(|t| [t.s, t.p, t.o]).collect();
    list.sort_unstable();
    list
}

/// Build one reader per order from the manifest's lookups.
pub(crate) fn hydrate_readers(
    pages_dir: &Path,
    manifest: &Manifest,
) -> HashMap<TripleOrder, PagedIndexReader> {
    TripleOrder::ALL
        .iter()
        .map(|order| {
            (
                *order,
                PagedIndexReader::new(
                    page_file_path(pages_dir, *order),
                    *order,
                    manifest.pages_for(*order).to_vec(),
                    manifest.compression,
                ),
            )
        })
        .collect()
}

/// Rewrite all six page files from scratch out of `triples`, updating the
/// manifest's lookups in place.  Existing files are removed first — the
/// caller persists the manifest afterwards.
pub(crate) fn rebuild_page_files(
    pages_dir: &Path,
    triples: &[Triple],
    manifest: &mut Manifest,
) -> Result<(), StoreError> {
    let unique: HashSet<Triple> = triples.iter().copied().collect();
    for order in TripleOrder::ALL {
        let path = page_file_path(pages_dir, order);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        let mut writer = PagedIndexWriter::new(
            &path,
            order,
            manifest.page_size,
            manifest.compression,
        );
        writer.push_all(unique.iter().copied());
        let metas = writer.finalize()?;
        let lookup = manifest.lookup_mut(order);
        lookup.pages = metas;
    }
    manifest.orphans.clear();
    Ok(())
}

/// Apply one replayed WAL effect during open.
///
/// Adds that are already durable in the paged index are not re-staged —
/// this is the crash window between manifest write and WAL reset, and
/// re-staging would append duplicate pages at the next flush.
fn apply_recovered_effect(
    effect: WalEffect,
    staging: &mut dyn StagingIndex,
    tombstones: &mut HashSet<Triple>,
    props: &mut PropertyStore,
    page_readers: &HashMap<TripleOrder, PagedIndexReader>,
) -> Result<(), StoreError> {
    match effect {
        WalEffect::Add(triple) => {
            tombstones.remove(&triple);
            let durable = page_readers
                .get(&TripleOrder::Spo)
                .map(|reader| reader.read(triple.s))
                .transpose()?
                .is_some_and(|page| page.contains(&triple));
            if !durable {
                staging.add(triple)?;
            }
        }
        WalEffect::Delete(triple) => {
            tombstones.insert(triple);
            staging.remove(&triple)?;
        }
        WalEffect::NodeProps { id, data } => props.set_node(id, data),
        WalEffect::EdgeProps { triple, data } => props.set_edge(&triple.key(), data),
    }
    Ok(())
}
