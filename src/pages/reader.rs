//! Read side of the paged index: random page reads and lazy streams.

use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Path, PathBuf};

use crossbeam::channel::{Receiver, bounded};
use memmap2::Mmap;
use tracing::{debug, warn};

use crate::encoding;
use crate::model::{Triple, TripleOrder, decode_triple_records};
use crate::pages::{Compression, PageError, PageMeta};

/// Pages kept in flight inside a streaming channel.
const STREAM_CHANNEL_CAPACITY: usize = 4;

/// Random-access reader over one order's page file.
///
/// Holds only the path and the manifest's page list; the file handle is
/// opened (memory-mapped) per call and dropped on return, per the
/// engine's resource policy.  Pages whose CRC mismatches are **skipped**
/// with a warning — only the strict maintenance check reports them.
#[derive(Debug, Clone)]
pub struct PagedIndexReader {
    path: PathBuf,
    order: TripleOrder,
    pages: Vec<PageMeta>,
    compression: Compression,
}

/// One decoded page worth of triples.
#[derive(Debug, Clone, PartialEq)]
pub struct PageBatch {
    /// Primary value shared by every triple in the batch.
    pub primary_value: u32,

    /// Decoded triples, in the order's projection order.
    pub triples: Vec<Triple>,
}

impl PagedIndexReader {
    pub fn new(
        path: impl AsRef<Path>,
        order: TripleOrder,
        pages: Vec<PageMeta>,
        compression: Compression,
    ) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            order,
            pages,
            compression,
        }
    }

    pub fn order(&self) -> TripleOrder {
        self.order
    }

    pub fn pages(&self) -> &[PageMeta] {
        &self.pages
    }

    /// All triples carrying `primary`, merged across that primary's pages
    /// in append order.
    pub fn read(&self, primary: u32) -> Result<Vec<Triple>, PageError> {
        if !self.pages.iter().any(|p| p.primary_value == primary) {
            return Ok(Vec::new());
        }
        let mmap = self.map_file()?;
        let mut triples = Vec::new();
        for meta in self.pages.iter().filter(|p| p.primary_value == primary) {
            if let Some(batch) = self.decode_page(&mmap, meta) {
                triples.extend(batch);
            }
        }
        Ok(triples)
    }

    /// Whole-file decode, pages in manifest order.
    pub fn read_all(&self) -> Result<Vec<Triple>, PageError> {
        if self.pages.is_empty() {
            return Ok(Vec::new());
        }
        let mmap = self.map_file()?;
        let mut triples = Vec::new();
        for meta in &self.pages {
            if let Some(batch) = self.decode_page(&mmap, meta) {
                triples.extend(batch);
            }
        }
        Ok(triples)
    }

    /// Deduplicated, sorted list of primary values carried by this order.
    pub fn primary_values(&self) -> Vec<u32> {
        let set: BTreeSet<u32> = self.pages.iter().map(|p| p.primary_value).collect();
        set.into_iter().collect()
    }

    /// Lazy whole-file stream of per-page batches.
    pub fn stream_batches(&self) -> PageBatchStream {
        self.spawn_stream(None)
    }

    /// Lazy stream of the triples for one primary value.
    pub fn stream_by_primary(&self, primary: u32) -> TripleStream {
        TripleStream::new(self.spawn_stream(Some(primary)))
    }

    /// Lazy stream of every triple in this order.
    pub fn stream_all(&self) -> TripleStream {
        TripleStream::new(self.spawn_stream(None))
    }

    /// Verify every page strictly.  Returns the metas whose bytes are
    /// missing or whose CRC mismatches; unlike the read path nothing is
    /// skipped silently.
    pub fn check_pages(&self) -> Result<Vec<PageMeta>, PageError> {
        if self.pages.is_empty() {
            return Ok(Vec::new());
        }
        let mmap = self.map_file()?;
        let mut damaged = Vec::new();
        for meta in &self.pages {
            if !page_bytes_valid(&mmap, meta) {
                damaged.push(meta.clone());
            }
        }
        Ok(damaged)
    }

    // --------------------------------------------------------------------
    // Internal helpers
    // --------------------------------------------------------------------

    fn map_file(&self) -> Result<Mmap, PageError> {
        let file = File::open(&self.path)?;
        // SAFETY: the mapping is read-only and the writer only ever
        // appends past the offsets recorded in the manifest, so the pages
        // sliced below are never mutated while mapped.
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(mmap)
    }

    /// Decode one page, or `None` when the page is out of bounds / CRC
    /// mismatched / undecodable (read-path skip policy).
    fn decode_page(&self, mmap: &Mmap, meta: &PageMeta) -> Option<Vec<Triple>> {
        decode_page_bytes(mmap, meta, &self.compression, self.order)
    }

    fn spawn_stream(&self, primary: Option<u32>) -> PageBatchStream {
        let (tx, rx) = bounded(STREAM_CHANNEL_CAPACITY);
        let reader = self.clone();
        std::thread::spawn(move || {
            if reader.pages.is_empty() {
                return;
            }
            let mmap = match reader.map_file() {
                Ok(m) => m,
                Err(e) => {
                    let _ = tx.send(Err(e));
                    return;
                }
            };
            for meta in &reader.pages {
                if primary.is_some_and(|p| p != meta.primary_value) {
                    continue;
                }
                if let Some(triples) = reader.decode_page(&mmap, meta) {
                    let batch = PageBatch {
                        primary_value: meta.primary_value,
                        triples,
                    };
                    // Receiver dropped → stop producing.
                    if tx.send(Ok(batch)).is_err() {
                        debug!(order = %reader.order, "page stream receiver dropped");
                        return;
                    }
                }
            }
        });
        PageBatchStream { rx }
    }
}

/// Slice, CRC-verify, decompress, and decode one page.  Shared with the
/// maintenance paths that operate on raw mmaps.
pub(crate) fn decode_page_bytes(
    mmap: &Mmap,
    meta: &PageMeta,
    compression: &Compression,
    order: TripleOrder,
) -> Option<Vec<Triple>> {
    let start = meta.offset as usize;
    let end = start.checked_add(meta.length as usize)?;
    if end > mmap.len() {
        warn!(
            order = %order,
            primary = meta.primary_value,
            offset = meta.offset,
            "page out of bounds; skipped"
        );
        return None;
    }
    let stored = &mmap[start..end];

    if let Some(expected) = meta.crc32
        && encoding::crc32(stored) != expected
    {
        warn!(
            order = %order,
            primary = meta.primary_value,
            offset = meta.offset,
            "page CRC mismatch; skipped"
        );
        return None;
    }

    let raw = match compression.decompress(stored, meta.raw_length) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(order = %order, primary = meta.primary_value, error = %e, "page decompression failed; skipped");
            return None;
        }
    };
    match decode_triple_records(&raw) {
        Ok(triples) => Some(triples),
        Err(e) => {
            warn!(order = %order, primary = meta.primary_value, error = %e, "page decode failed; skipped");
            None
        }
    }
}

/// Strict validity test for one page's stored bytes (bounds + CRC).
pub(crate) fn page_bytes_valid(mmap: &Mmap, meta: &PageMeta) -> bool {
    let start = meta.offset as usize;
    let Some(end) = start.checked_add(meta.length as usize) else {
        return false;
    };
    if end > mmap.len() {
        return false;
    }
    match meta.crc32 {
        Some(expected) => encoding::crc32(&mmap[start..end]) == expected,
        // No recorded CRC: bounds are the only verifiable property.
        None => true,
    }
}

// ------------------------------------------------------------------------------------------------
// Streams
// ------------------------------------------------------------------------------------------------

/// Lazy sequence of per-page batches fed by a reader thread.
///
/// Dropping the stream stops the producer at its next send.
#[derive(Debug)]
pub struct PageBatchStream {
    rx: Receiver<Result<PageBatch, PageError>>,
}

impl Iterator for PageBatchStream {
    type Item = Result<PageBatch, PageError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.recv().ok()
    }
}

/// Lazy sequence of individual triples, flattened from page batches.
#[derive(Debug)]
pub struct TripleStream {
    batches: PageBatchStream,
    current: std::vec::IntoIter<Triple>,
    failed: Option<PageError>,
}

impl TripleStream {
    fn new(batches: PageBatchStream) -> Self {
        Self {
            batches,
            current: Vec::new().into_iter(),
            failed: None,
        }
    }

    /// The first stream error, if any batch failed.
    ///
    /// Per-page corruption is skipped upstream; only file-level failures
    /// (open/mmap) land here.
    pub fn take_error(&mut self) -> Option<PageError> {
        self.failed.take()
    }
}

impl Iterator for TripleStream {
    type Item = Triple;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(t) = self.current.next() {
                return Some(t);
            }
            match self.batches.next() {
                Some(Ok(batch)) => self.current = batch.triples.into_iter(),
                Some(Err(e)) => {
                    self.failed = Some(e);
                    return None;
                }
                None => return None,
            }
        }
    }
}
