//! Paged per-order index files.
//!
//! Each of the six triple orders owns one **append-only** page file,
//! `<pages>/<ORDER>.idxpage`.  A *page* is a contiguous byte range holding
//! the 12-byte records of triples that share one primary-key value,
//! optionally Brotli-compressed.  Page boundaries and checksums are **not**
//! embedded in the file — the manifest's per-order lookup table is
//! authoritative.
//!
//! # On-disk layout
//!
//! ```text
//! [page bytes][page bytes][page bytes]…       (pure concatenation)
//! ```
//!
//! Each page is either the raw record bytes (`codec = "none"`) or their
//! Brotli stream.  The CRC-32 recorded in [`PageMeta`] covers the bytes
//! **as stored**.
//!
//! # Crash safety
//!
//! [`PagedIndexWriter::finalize`] appends every sealed group in a single
//! open → write* → fsync → close cycle and hands back metadata only after
//! the fsync succeeds.  A crash mid-finalize therefore leaves the file
//! shorter than any recorded page, never the reverse; the stale bytes are
//! unreachable and reclaimed by page GC.
//!
//! # Read path
//!
//! [`PagedIndexReader`] opens the file per call (mmap, dropped on return)
//! and **skips** pages whose CRC mismatches — corruption degrades results
//! instead of failing reads; the strict maintenance check reports such
//! pages exactly.  Streaming variants feed per-page batches through a
//! bounded crossbeam channel so huge result sets never materialise at
//! once.
//!
//! # Sub-modules
//!
//! - [`writer`] — [`PagedIndexWriter`], the append side.
//! - [`reader`] — [`PagedIndexReader`] plus the streaming iterators.

pub mod reader;
pub mod writer;

#[cfg(test)]
mod tests;

pub use reader::{PageBatch, PageBatchStream, PagedIndexReader, TripleStream};
pub use writer::PagedIndexWriter;

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::encoding::EncodingError;

/// File extension of per-order page files.
pub const PAGE_FILE_EXT: &str = "idxpage";

/// Default page size (triples per page) when the caller does not override.
pub const DEFAULT_PAGE_SIZE: usize = 1024;

/// Path of an order's page file inside the pages directory
/// (`<pages>/SPO.idxpage`, …).
pub fn page_file_path(
    pages_dir: &std::path::Path,
    order: crate::model::TripleOrder,
) -> std::path::PathBuf {
    pages_dir.join(format!("{}.{PAGE_FILE_EXT}", order.as_str()))
}

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by page file operations.
///
/// A CRC mismatch is deliberately **not** an error here: the read path
/// skips the damaged page and the strict maintenance check reports it
/// with its order and primary value.
#[derive(Debug, Error)]
pub enum PageError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),
}

// ------------------------------------------------------------------------------------------------
// Page metadata
// ------------------------------------------------------------------------------------------------

/// Catalog entry for one page, as stored in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageMeta {
    /// Primary-key value every triple in this page shares.
    pub primary_value: u32,

    /// Byte offset of the page inside the order's file.
    pub offset: u64,

    /// Stored length in bytes (compressed length under Brotli).
    pub length: u64,

    /// Uncompressed length; present only for compressed pages.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub raw_length: Option<u64>,

    /// CRC-32 over the bytes as stored.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub crc32: Option<u32>,
}

// ------------------------------------------------------------------------------------------------
// Compression
// ------------------------------------------------------------------------------------------------

/// Page codec configuration, shared by store options, the manifest, and
/// both sides of the page pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "codec", rename_all = "lowercase")]
pub enum Compression {
    /// Raw 12-byte records.
    #[default]
    None,

    /// Brotli-compressed record bytes.
    Brotli {
        /// Quality level 0–11; `None` means [`DEFAULT_BROTLI_LEVEL`].
        #[serde(skip_serializing_if = "Option::is_none", default)]
        level: Option<u32>,
    },
}

/// Brotli quality used when the manifest does not pin one.
pub const DEFAULT_BROTLI_LEVEL: u32 = 5;

/// Brotli LZ77 window size (log2).
const BROTLI_LG_WINDOW: u32 = 22;

/// Brotli stream buffer size.
const BROTLI_BUFFER: usize = 4096;

impl Compression {
    /// Encode raw page bytes into their stored form.
    pub fn compress(&self, raw: &[u8]) -> Result<Vec<u8>, PageError> {
        match self {
            Compression::None => Ok(raw.to_vec()),
            Compression::Brotli { level } => {
                let quality = level.unwrap_or(DEFAULT_BROTLI_LEVEL);
                let mut out = Vec::new();
                {
                    let mut encoder = brotli::CompressorWriter::new(
                        &mut out,
                        BROTLI_BUFFER,
                        quality,
                        BROTLI_LG_WINDOW,
                    );
                    encoder.write_all(raw)?;
                    encoder.flush()?;
                }
                Ok(out)
            }
        }
    }

    /// Decode stored page bytes back into raw record bytes.
    pub fn decompress(&self, stored: &[u8], raw_length: Option<u64>) -> Result<Vec<u8>, PageError> {
        match self {
            Compression::None => Ok(stored.to_vec()),
            Compression::Brotli { .. } => {
                let capacity = raw_length.map_or(stored.len() * 4, |n| n as usize);
                let mut out = Vec::with_capacity(capacity);
                brotli::Decompressor::new(stored, BROTLI_BUFFER).read_to_end(&mut out)?;
                Ok(out)
            }
        }
    }

    /// True when pages carry a `raw_length` (compressed codecs only).
    pub fn is_compressed(&self) -> bool {
        !matches!(self, Compression::None)
    }
}
