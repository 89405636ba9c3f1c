//! Append side of the paged index.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::encoding;
use crate::model::{Triple, TripleOrder, encode_triple_records};
use crate::pages::{Compression, PageError, PageMeta};

use std::io::Write;

/// Batches pushed triples into bounded pages and appends them to an
/// order's page file.
///
/// Triples group by the order's primary-key value in an in-memory map;
/// a group that reaches `page_size` entries is sealed for the next
/// [`finalize`](Self::finalize).  Finalize appends every sealed and
/// pending group in one open → write* → fsync → close cycle and returns
/// the new [`PageMeta`]s **only after** the fsync succeeds, so a crash
/// mid-finalize leaves the file shorter than any recorded page.
#[derive(Debug)]
pub struct PagedIndexWriter {
    path: PathBuf,
    order: TripleOrder,
    page_size: usize,
    compression: Compression,

    /// Open groups, primary → triples (unsorted until sealed).
    pending: BTreeMap<u32, Vec<Triple>>,

    /// Groups that reached `page_size` and await finalize.
    sealed: Vec<(u32, Vec<Triple>)>,
}

impl PagedIndexWriter {
    pub fn new(
        path: impl AsRef<Path>,
        order: TripleOrder,
        page_size: usize,
        compression: Compression,
    ) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            order,
            page_size: page_size.max(1),
            compression,
            pending: BTreeMap::new(),
            sealed: Vec::new(),
        }
    }

    /// Add one triple to its primary group, sealing the group when it
    /// reaches the page size.
    pub fn push(&mut self, triple: Triple) {
        let primary = self.order.primary(&triple);
        let group = self.pending.entry(primary).or_default();
        group.push(triple);
        if group.len() >= self.page_size {
            let full = std::mem::take(group);
            self.pending.remove(&primary);
            self.sealed.push((primary, full));
        }
    }

    /// Push a whole batch.
    pub fn push_all(&mut self, triples: impl IntoIterator<Item = Triple>) {
        for t in triples {
            self.push(t);
        }
    }

    /// Number of triples currently buffered (sealed + pending).
    pub fn buffered(&self) -> usize {
        self.sealed.iter().map(|(_, g)| g.len()).sum::<usize>()
            + self.pending.values().map(Vec::len).sum::<usize>()
    }

    /// Append all buffered groups to the page file.
    ///
    /// Returns the metadata of the freshly written pages, offsets relative
    /// to the file start.  An empty writer returns an empty vec without
    /// touching the file.
    pub fn finalize(mut self) -> Result<Vec<PageMeta>, PageError> {
        // Seal the remainder, primary order for deterministic output.
        let pending = std::mem::take(&mut self.pending);
        for (primary, group) in pending {
            self.sealed.push((primary, group));
        }
        self.sealed.sort_by_key(|(primary, _)| *primary);

        if self.sealed.is_empty() {
            return Ok(Vec::new());
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut offset = file.metadata()?.len();

        let mut metas = Vec::with_capacity(self.sealed.len());
        let order = self.order;
        for (primary, mut group) in std::mem::take(&mut self.sealed) {
            group.sort_by(|a, b| order.cmp_triples(a, b));

            let raw = encode_triple_records(&group)?;
            let stored = self.compression.compress(&raw)?;
            let crc = encoding::crc32(&stored);

            file.write_all(&stored)?;

            metas.push(PageMeta {
                primary_value: primary,
                offset,
                length: stored.len() as u64,
                raw_length: self
                    .compression
                    .is_compressed()
                    .then_some(raw.len() as u64),
                crc32: Some(crc),
            });
            offset += stored.len() as u64;
        }

        // Metadata is only valid once the bytes are durable.
        file.sync_all()?;

        debug!(
            path = %self.path.display(),
            order = %order,
            pages = metas.len(),
            "page groups appended"
        );
        Ok(metas)
    }
}
