//! Maintenance: compaction, page-level GC, strict check, and repair.
//!
//! All maintenance operates on the paged index and the manifest; none of
//! it touches the WAL or the in-memory staging delta (with the one
//! documented exception of folding pending staging segments into a
//! rewrite).
//!
//! ## Compaction
//!
//! Two modes, per order:
//!
//! - **Rewrite** — read every reachable triple, drop tombstoned ones, and
//!   emit a fresh page file; the order's lookup is replaced wholesale.
//!   When *all six* orders are rewritten the dropped tombstones are
//!   retired from the manifest.
//! - **Incremental** — only primaries fragmented across at least
//!   `min_merge_pages` pages (optionally just the hot ones) get their
//!   pages merged and re-appended; the mapping is spliced per primary.
//!
//! Gates shared by both: `dry_run` computes statistics without writing;
//! `respect_readers` reports `skipped` while any *other* process is
//! registered; `tombstone_ratio_threshold` upgrades an order to a rewrite
//! when its tombstoned fraction exceeds the threshold.
//!
//! ## Safety discipline
//!
//! Destructive steps always run **after** the replacement state is
//! durable: fresh files are written and fsynced before lookups move, the
//! manifest is written atomically, and displaced pages are parked in the
//! manifest's orphan list until page GC physically reclaims them.  Under
//! any uncertainty (a reachable page that fails its bounds check, a
//! registered reader) the operation reports and does nothing.

#[cfg(test)]
mod tests;

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::{debug, info, warn};

use crate::model::{Triple, TripleOrder};
use crate::pages::{PageMeta, PagedIndexReader, PagedIndexWriter, page_file_path};
use crate::readers::{self, DEFAULT_READER_TTL};
use crate::staging;
use crate::storage_file::fsync_dir;
use crate::store::{Store, StoreError, hydrate_readers};

// ------------------------------------------------------------------------------------------------
// Options & reports
// ------------------------------------------------------------------------------------------------

/// How much of an order a compaction run rewrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompactionMode {
    /// Re-emit the whole order, physically dropping tombstoned triples.
    #[default]
    Rewrite,

    /// Merge only fragmented primaries' pages in place.
    Incremental,
}

/// Compaction configuration.
#[derive(Debug, Clone)]
pub struct CompactOptions {
    /// Orders to work on; `None` means all six.
    pub orders: Option<Vec<TripleOrder>>,

    pub mode: CompactionMode,

    /// Rewrite only these primaries per order (rewrite mode).
    pub only_primaries: Option<HashMap<TripleOrder, Vec<u32>>>,

    /// Minimum physical pages a primary needs before incremental
    /// compaction merges it.
    pub min_merge_pages: usize,

    /// Restrict incremental compaction to primaries the hotness counters
    /// consider hot.
    pub hot_only: bool,

    /// Minimum hotness count for `hot_only`.
    pub hot_min_count: u64,

    /// Compute statistics without modifying anything.
    pub dry_run: bool,

    /// Report `skipped` if any other process is registered as a reader.
    pub respect_readers: bool,

    /// Upgrade an order to a rewrite when its tombstoned fraction exceeds
    /// this threshold.
    pub tombstone_ratio_threshold: Option<f64>,

    /// Fold pending append-only staging segments into the rewrite and
    /// clear their catalog.  Experimental.
    pub include_lsm_segments: bool,
}

impl Default for CompactOptions {
    fn default() -> Self {
        Self {
            orders: None,
            mode: CompactionMode::Rewrite,
            only_primaries: None,
            min_merge_pages: 2,
            hot_only: false,
            hot_min_count: 1,
            dry_run: false,
            respect_readers: false,
            tombstone_ratio_threshold: None,
            include_lsm_segments: false,
        }
    }
}

/// Per-order compaction outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderCompaction {
    pub order: TripleOrder,
    pub pages_before: usize,
    pub pages_after: usize,
    pub triples_kept: usize,
    pub tombstones_dropped: usize,
    /// Primaries whose pages were merged (incremental mode).
    pub merged_primaries: Vec<u32>,
}

/// Outcome of one compaction run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompactionReport {
    /// True when `respect_readers` aborted the run.
    pub skipped: bool,
    pub orders: Vec<OrderCompaction>,
}

/// Outcome of a page-GC run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GcReport {
    /// True when `respect_readers` aborted the run.
    pub skipped: bool,
    /// Bytes reclaimed per order.
    pub reclaimed: Vec<(TripleOrder, u64)>,
}

/// One strict-check failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckFinding {
    pub order: TripleOrder,
    pub primary: u32,
    pub offset: u64,
}

// ------------------------------------------------------------------------------------------------
// Store maintenance surface
// ------------------------------------------------------------------------------------------------

impl Store {
    /// Run one compaction pass per [`CompactOptions`].
    pub fn compact(&self, options: &CompactOptions) -> Result<CompactionReport, StoreError> {
        let mut inner = self.write_inner()?;

        if options.respect_readers && (inner.has_pins() || other_readers_exist(&inner.pages_dir)?) {
            info!("compaction skipped: live readers registered");
            return Ok(CompactionReport {
                skipped: true,
                orders: Vec::new(),
            });
        }

        let orders = options
            .orders
            .clone()
            .unwrap_or_else(|| TripleOrder::ALL.to_vec());

        // Segment staging folded into rewrites, at most once per run.
        let folded_segments = if options.include_lsm_segments {
            staging::pending_segment_triples(&inner.pages_dir)?
        } else {
            Vec::new()
        };

        let mut report = CompactionReport::default();
        let mut changed = false;
        let mut full_rewrite_orders: HashSet<TripleOrder> = HashSet::new();

        for order in &orders {
            let order = *order;
            let pages_before = inner.manifest.pages_for(order).len();
            let reader = reader_for(&inner.pages_dir, &inner.manifest, order);

            let mode = effective_mode(options, &inner.tombstones, &reader)?;
            match mode {
                CompactionMode::Rewrite => {
                    let only = options
                        .only_primaries
                        .as_ref()
                        .and_then(|m| m.get(&order).cloned());
                    let outcome = rewrite_order(
                        &mut inner,
                        order,
                        only.as_deref(),
                        &folded_segments,
                        options.dry_run,
                    )?;
                    if !options.dry_run && only.is_none() {
                        full_rewrite_orders.insert(order);
                    }
                    changed |= !options.dry_run;
                    report.orders.push(OrderCompaction {
                        order,
                        pages_before,
                        ..outcome
                    });
                }
                CompactionMode::Incremental => {
                    let outcome = incremental_order(&mut inner, order, options)?;
                    changed |= !options.dry_run && !outcome.merged_primaries.is_empty();
                    report.orders.push(OrderCompaction {
                        order,
                        pages_before,
                        ..outcome
                    });
                }
            }
        }

        if options.dry_run {
            return Ok(report);
        }

        // Tombstones retire only once no order can still carry their
        // bytes: every one of the six orders was fully rewritten.
        if full_rewrite_orders.len() == TripleOrder::ALL.len() {
            let retired = inner.tombstones.len();
            inner.tombstones.clear();
            inner.manifest.tombstones.clear();
            if retired > 0 {
                info!(retired, "tombstones retired after full rewrite");
            }
        }

        if options.include_lsm_segments && !folded_segments.is_empty() {
            staging::clear_segments(&inner.pages_dir)?;
            inner.staging.clear()?;
        }

        if changed {
            inner.manifest.bump_epoch();
            inner.manifest.store(&inner.pages_dir)?;
            inner.page_readers = hydrate_readers(&inner.pages_dir, &inner.manifest);
        }
        Ok(report)
    }

    /// Rewrite each order's page file keeping only manifest-reachable
    /// pages, reclaiming bytes orphaned by compaction.
    ///
    /// The writer must never unlink bytes a reader may still need: with
    /// `respect_readers` the run reports `skipped` while any other
    /// process is registered.
    pub fn gc_pages(&self, respect_readers: bool) -> Result<GcReport, StoreError> {
        let mut inner = self.write_inner()?;

        if respect_readers && (inner.has_pins() || other_readers_exist(&inner.pages_dir)?) {
            info!("page GC skipped: live readers registered");
            return Ok(GcReport {
                skipped: true,
                reclaimed: Vec::new(),
            });
        }

        let mut report = GcReport::default();
        let mut changed = false;

        for order in TripleOrder::ALL {
            let path = page_file_path(&inner.pages_dir, order);
            if !path.exists() {
                continue;
            }
            let old_len = fs::metadata(&path)?.len();
            let pages = inner.manifest.pages_for(order).to_vec();

            let Some((new_metas, new_len)) = compact_file(&path, &pages)? else {
                // A reachable page failed its bounds check — do nothing
                // for this order rather than guess.
                warn!(order = %order, "page GC skipped order: reachable page out of bounds");
                continue;
            };

            if new_len == old_len {
                continue;
            }

            inner.manifest.lookup_mut(order).pages = new_metas;
            inner.manifest.clear_orphans(order);
            report.reclaimed.push((order, old_len - new_len));
            changed = true;
        }

        if changed {
            inner.manifest.bump_epoch();
            inner.manifest.store(&inner.pages_dir)?;
            inner.page_readers = hydrate_readers(&inner.pages_dir, &inner.manifest);
            info!(reclaimed = ?report.reclaimed, "page GC complete");
        }
        Ok(report)
    }

    /// Verify every manifest page strictly (bounds + CRC), reporting each
    /// mismatch with its order and primary value.
    pub fn check_strict(&self) -> Result<Vec<CheckFinding>, StoreError> {
        let inner = self.read_inner()?;
        let mut findings = Vec::new();
        for order in TripleOrder::ALL {
            let reader = reader_for(&inner.pages_dir, &inner.manifest, order);
            if reader.pages().is_empty() {
                continue;
            }
            for meta in reader.check_pages()? {
                findings.push(CheckFinding {
                    order,
                    primary: meta.primary_value,
                    offset: meta.offset,
                });
            }
        }
        Ok(findings)
    }

    /// Fully rebuild the given (corrupt) orders from the authoritative
    /// triple set: the main file's historical triples plus everything
    /// readable from the intact orders.  Tombstones carry over unchanged.
    pub fn repair_orders(&self, orders: &[TripleOrder]) -> Result<(), StoreError> {
        if orders.is_empty() {
            return Ok(());
        }
        let mut inner = self.write_inner()?;

        let corrupt: HashSet<TripleOrder> = orders.iter().copied().collect();
        let mut authoritative: HashSet<Triple> =
            inner.historical_triples.iter().copied().collect();
        for order in TripleOrder::ALL {
            if corrupt.contains(&order) {
                continue;
            }
            let reader = reader_for(&inner.pages_dir, &inner.manifest, order);
            // Read-path CRC skipping means a damaged page in a source
            // order contributes nothing rather than failing the repair.
            authoritative.extend(reader.read_all()?);
        }

        let triples: Vec<Triple> = authoritative.into_iter().collect();
        for order in &corrupt {
            let order = *order;
            let path = page_file_path(&inner.pages_dir, order);
            if path.exists() {
                fs::remove_file(&path)?;
            }
            let mut writer = PagedIndexWriter::new(
                &path,
                order,
                inner.manifest.page_size,
                inner.manifest.compression,
            );
            writer.push_all(triples.iter().copied());
            let metas = writer.finalize()?;
            inner.manifest.lookup_mut(order).pages = metas;
            inner.manifest.clear_orphans(order);
            info!(order = %order, triples = triples.len(), "order rebuilt");
        }

        inner.manifest.bump_epoch();
        inner.manifest.store(&inner.pages_dir)?;
        inner.page_readers = hydrate_readers(&inner.pages_dir, &inner.manifest);
        inner.mark_dirty();
        Ok(())
    }

    /// Re-emit only the flagged primaries' pages and splice the mapping,
    /// leaving the rest of each order untouched.
    ///
    /// The replacement triples come from the sibling order sharing the
    /// same primary component (SPO↔SOP, POS↔PSO, OSP↔OPS), falling back
    /// to a full scan of an intact order when the sibling is damaged too.
    pub fn repair_pages_fast(
        &self,
        flagged: &[(TripleOrder, u32)],
    ) -> Result<(), StoreError> {
        if flagged.is_empty() {
            return Ok(());
        }
        let mut inner = self.write_inner()?;
        let mut changed = false;

        for (order, primary) in flagged {
            let order = *order;
            let primary = *primary;

            let replacement = recover_primary(&inner, order, primary)?;
            if replacement.is_empty() {
                warn!(order = %order, primary, "no replacement triples recoverable; page left flagged");
                continue;
            }

            let mut writer = PagedIndexWriter::new(
                page_file_path(&inner.pages_dir, order),
                order,
                inner.manifest.page_size,
                inner.manifest.compression,
            );
            writer.push_all(replacement);
            let fresh = writer.finalize()?;

            let lookup = inner.manifest.lookup_mut(order);
            let displaced: Vec<PageMeta> = lookup
                .pages
                .iter()
                .filter(|p| p.primary_value == primary)
                .cloned()
                .collect();
            lookup.pages.retain(|p| p.primary_value != primary);
            lookup.pages.extend(fresh);
            if !displaced.is_empty() {
                inner.manifest.orphans.push(crate::manifest::OrphanEntry {
                    order,
                    pages: displaced,
                });
            }
            changed = true;
            info!(order = %order, primary, "primary pages re-emitted");
        }

        if changed {
            inner.manifest.bump_epoch();
            inner.manifest.store(&inner.pages_dir)?;
            inner.page_readers = hydrate_readers(&inner.pages_dir, &inner.manifest);
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Compaction internals
// ------------------------------------------------------------------------------------------------

use crate::store::StoreInner;

fn reader_for(
    pages_dir: &Path,
    manifest: &crate::manifest::Manifest,
    order: TripleOrder,
) -> PagedIndexReader {
    PagedIndexReader::new(
        page_file_path(pages_dir, order),
        order,
        manifest.pages_for(order).to_vec(),
        manifest.compression,
    )
}

/// Any reader registered by a process other than this one?
fn other_readers_exist(pages_dir: &Path) -> Result<bool, StoreError> {
    let own_pid = std::process::id();
    Ok(readers::active_readers(pages_dir, DEFAULT_READER_TTL)?
        .iter()
        .any(|r| r.pid != own_pid))
}

/// Apply the tombstone-ratio upgrade rule.
fn effective_mode(
    options: &CompactOptions,
    tombstones: &HashSet<Triple>,
    reader: &PagedIndexReader,
) -> Result<CompactionMode, StoreError> {
    if options.mode == CompactionMode::Rewrite {
        return Ok(CompactionMode::Rewrite);
    }
    let Some(threshold) = options.tombstone_ratio_threshold else {
        return Ok(options.mode);
    };
    if tombstones.is_empty() {
        return Ok(options.mode);
    }
    let all = reader.read_all()?;
    if all.is_empty() {
        return Ok(options.mode);
    }
    let dead = all.iter().filter(|t| tombstones.contains(t)).count();
    let ratio = dead as f64 / all.len() as f64;
    if ratio > threshold {
        debug!(order = %reader.order(), ratio, threshold, "tombstone ratio upgrade to rewrite");
        Ok(CompactionMode::Rewrite)
    } else {
        Ok(options.mode)
    }
}

fn rewrite_order(
    inner: &mut StoreInner,
    order: TripleOrder,
    only_primaries: Option<&[u32]>,
    folded_segments: &[Triple],
    dry_run: bool,
) -> Result<OrderCompaction, StoreError> {
    let reader = reader_for(&inner.pages_dir, &inner.manifest, order);

    match only_primaries {
        None => {
            let mut unique: HashSet<Triple> = reader.read_all()?.into_iter().collect();
            unique.extend(folded_segments.iter().copied());

            let total = unique.len();
            let live: Vec<Triple> = unique
                .into_iter()
                .filter(|t| !inner.tombstones.contains(t))
                .collect();
            let dropped = total - live.len();

            if dry_run {
                return Ok(OrderCompaction {
                    order,
                    pages_before: 0,
                    pages_after: live.len().div_ceil(inner.manifest.page_size.max(1)),
                    triples_kept: live.len(),
                    tombstones_dropped: dropped,
                    merged_primaries: Vec::new(),
                });
            }

            let path = page_file_path(&inner.pages_dir, order);
            if path.exists() {
                fs::remove_file(&path)?;
            }
            let mut writer = PagedIndexWriter::new(
                &path,
                order,
                inner.manifest.page_size,
                inner.manifest.compression,
            );
            writer.push_all(live.iter().copied());
            let metas = writer.finalize()?;
            let pages_after = metas.len();
            inner.manifest.lookup_mut(order).pages = metas;
            inner.manifest.clear_orphans(order);

            Ok(OrderCompaction {
                order,
                pages_before: 0,
                pages_after,
                triples_kept: live.len(),
                tombstones_dropped: dropped,
                merged_primaries: Vec::new(),
            })
        }
        Some(primaries) => {
            // Partial rewrite: merge and clean just these primaries,
            // splicing the mapping like the fast repair path.
            let mut kept = 0usize;
            let mut dropped = 0usize;
            let mut merged = Vec::new();

            for primary in primaries {
                let triples: HashSet<Triple> = reader.read(*primary)?.into_iter().collect();
                if triples.is_empty() {
                    continue;
                }
                let total = triples.len();
                let live: Vec<Triple> = triples
                    .into_iter()
                    .filter(|t| !inner.tombstones.contains(t))
                    .collect();
                dropped += total - live.len();
                kept += live.len();
                merged.push(*primary);

                if dry_run {
                    continue;
                }
                splice_primary(inner, order, *primary, live)?;
            }

            let pages_after = inner.manifest.pages_for(order).len();
            Ok(OrderCompaction {
                order,
                pages_before: 0,
                pages_after,
                triples_kept: kept,
                tombstones_dropped: dropped,
                merged_primaries: merged,
            })
        }
    }
}

fn incremental_order(
    inner: &mut StoreInner,
    order: TripleOrder,
    options: &CompactOptions,
) -> Result<OrderCompaction, StoreError> {
    let reader = reader_for(&inner.pages_dir, &inner.manifest, order);

    // Page count per primary.
    let mut counts: HashMap<u32, usize> = HashMap::new();
    for meta in reader.pages() {
        *counts.entry(meta.primary_value).or_insert(0) += 1;
    }

    let hot: Option<HashSet<u32>> = options.hot_only.then(|| {
        inner
            .hotness
            .hot_primaries(order, options.hot_min_count)
            .into_iter()
            .collect()
    });

    let mut fragmented: Vec<u32> = counts
        .into_iter()
        .filter(|(primary, pages)| {
            *pages >= options.min_merge_pages.max(2)
                && hot.as_ref().is_none_or(|h| h.contains(primary))
        })
        .map(|(primary, _)| primary)
        .collect();
    fragmented.sort_unstable();

    let mut kept = 0usize;
    let mut merged = Vec::new();
    for primary in fragmented {
        let unique: HashSet<Triple> = reader.read(primary)?.into_iter().collect();
        if unique.is_empty() {
            continue;
        }
        kept += unique.len();
        merged.push(primary);
        if options.dry_run {
            continue;
        }
        splice_primary(inner, order, primary, unique.into_iter().collect())?;
    }

    let pages_after = inner.manifest.pages_for(order).len();
    Ok(OrderCompaction {
        order,
        pages_before: 0,
        pages_after,
        triples_kept: kept,
        tombstones_dropped: 0,
        merged_primaries: merged,
    })
}

/// Append the merged page for one primary and replace its mapping;
/// displaced pages go to the orphan list for GC.
///
/// The merge deliberately ignores the configured page size: the point of
/// the splice is that one primary's triples end up in one page, so the
/// lookup shrinks even when the primary exceeds the batching bound.
fn splice_primary(
    inner: &mut StoreInner,
    order: TripleOrder,
    primary: u32,
    triples: Vec<Triple>,
) -> Result<(), StoreError> {
    let mut writer = PagedIndexWriter::new(
        page_file_path(&inner.pages_dir, order),
        order,
        usize::MAX,
        inner.manifest.compression,
    );
    writer.push_all(triples);
    let fresh = writer.finalize()?;

    let lookup = inner.manifest.lookup_mut(order);
    let displaced: Vec<PageMeta> = lookup
        .pages
        .iter()
        .filter(|p| p.primary_value == primary)
        .cloned()
        .collect();
    lookup.pages.retain(|p| p.primary_value != primary);
    lookup.pages.extend(fresh);
    if !displaced.is_empty() {
        inner.manifest.orphans.push(crate::manifest::OrphanEntry {
            order,
            pages: displaced,
        });
    }
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// GC internals
// ------------------------------------------------------------------------------------------------

/// Copy only the reachable pages into a compact successor and atomically
/// replace the file.  Returns the remapped metas and the new file length,
/// or `None` when a reachable page is out of bounds.
fn compact_file(
    path: &Path,
    pages: &[PageMeta],
) -> Result<Option<(Vec<PageMeta>, u64)>, StoreError> {
    let mut source = File::open(path)?;
    let source_len = source.metadata()?.len();

    // Validate reachability before writing anything.
    for meta in pages {
        let Some(end) = meta.offset.checked_add(meta.length) else {
            return Ok(None);
        };
        if end > source_len {
            return Ok(None);
        }
    }

    let tmp_path = path.with_extension("idxpage.gc");
    let mut new_metas = Vec::with_capacity(pages.len());
    {
        let mut tmp = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut offset = 0u64;
        let mut buf = Vec::new();
        for meta in pages {
            buf.resize(meta.length as usize, 0);
            source.seek(SeekFrom::Start(meta.offset))?;
            source.read_exact(&mut buf)?;
            tmp.write_all(&buf)?;
            let mut remapped = meta.clone();
            remapped.offset = offset;
            new_metas.push(remapped);
            offset += meta.length;
        }
        tmp.sync_all()?;
    }

    fs::rename(&tmp_path, path)?;
    if let Some(parent) = path.parent() {
        fsync_dir(parent);
    }

    let new_len: u64 = pages.iter().map(|p| p.length).sum();
    Ok(Some((new_metas, new_len)))
}

// ------------------------------------------------------------------------------------------------
// Repair internals
// ------------------------------------------------------------------------------------------------

/// Recover the triples of one (order, primary) page set from elsewhere.
fn recover_primary(
    inner: &StoreInner,
    order: TripleOrder,
    primary: u32,
) -> Result<Vec<Triple>, StoreError> {
    // The sibling order shares the primary component, so a primary read
    // there yields exactly the triples the damaged pages held.
    let sibling = match order {
        TripleOrder::Spo => TripleOrder::Sop,
        TripleOrder::Sop => TripleOrder::Spo,
        TripleOrder::Pos => TripleOrder::Pso,
        TripleOrder::Pso => TripleOrder::Pos,
        TripleOrder::Osp => TripleOrder::Ops,
        TripleOrder::Ops => TripleOrder::Osp,
    };

    let from_sibling = reader_for(&inner.pages_dir, &inner.manifest, sibling).read(primary)?;
    if !from_sibling.is_empty() {
        let unique: HashSet<Triple> = from_sibling.into_iter().collect();
        return Ok(unique.into_iter().collect());
    }

    // Sibling damaged too: full-scan the first intact order and filter by
    // the primary component.
    for source in TripleOrder::ALL {
        if source == order || source == sibling {
            continue;
        }
        let all = reader_for(&inner.pages_dir, &inner.manifest, source).read_all()?;
        if all.is_empty() {
            continue;
        }
        let unique: HashSet<Triple> = all
            .into_iter()
            .filter(|t| order.primary(t) == primary)
            .collect();
        if !unique.is_empty() {
            return Ok(unique.into_iter().collect());
        }
    }
    Ok(Vec::new())
}
