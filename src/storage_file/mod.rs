//! Main-file header and section layout.
//!
//! The main database file carries a fixed 64-byte header followed by four
//! contiguous sections: dictionary, triples, indexes (staged delta), and
//! properties.
//!
//! # On-disk layout
//!
//! ```text
//! offset 0   9-byte magic "SYNAPSEDB"
//! offset 9   u32 LE version (= 2)
//! offset 13  3 bytes padding
//! offset 16  4 × { u32 LE offset, u32 LE length }   (dictionary, triples,
//!            indexes, properties)
//! offset 48  zero padding to 64
//! offset 64  section bytes, concatenated in pointer order
//! ```
//!
//! A zero-length section denotes the corresponding empty structure.
//!
//! # Crash safety
//!
//! [`write_storage_file`] never mutates the live file in place: it writes
//! `<path>.tmp`, fsyncs it, renames over `<path>`, and fsyncs the parent
//! directory.  A crash at any point leaves either the old file or the new
//! file, never a torn mix.  The same [`write_atomic`] helper backs the
//! manifest, hotness, and txid catalogs.


use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;

use thiserror::Error;
use tracing::{debug, info};

/// 9-byte magic identifying a SynapseDB main file.
pub const STORAGE_MAGIC: &[u8; 9] = b"SYNAPSEDB";

/// Current main-file format version.
pub const STORAGE_VERSION: u32 = 2;

/// Total header size; sections start here.
pub const STORAGE_HEADER_SIZE: usize = 64;

const SECTION_TABLE_OFFSET: usize = 16;
const TMP_SUFFIX: &str = ".tmp";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by main-file operations.
#[derive(Debug, Error)]
pub enum StorageFileError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// File too short, bad magic, or unsupported version. Fatal on open.
    #[error("corrupt storage header: {0}")]
    CorruptHeader(String),

    /// A section pointer reaches outside the file.
    #[error("section out of bounds: {0}")]
    SectionOutOfBounds(String),
}

// ------------------------------------------------------------------------------------------------
// Sections
// ------------------------------------------------------------------------------------------------

/// The four payload sections of the main file, in pointer order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StorageSections {
    /// Serialized string dictionary.
    pub dictionary: Vec<u8>,

    /// Historical triple list (`[u32 count][12-byte records]`).
    ///
    /// After the first flush under the paged layout this section is a
    /// zero count: page files are the triples' source of truth.
    pub triples: Vec<u8>,

    /// Serialized staging-index delta (SPO bucket only).
    pub indexes: Vec<u8>,

    /// Serialized property store.
    pub properties: Vec<u8>,
}

// ------------------------------------------------------------------------------------------------
// Atomic write primitives
// ------------------------------------------------------------------------------------------------

/// Fsync a directory so that a rename inside it is durable.
///
/// Some platforms cannot open or sync directories; those failures are
/// swallowed, matching the storage contract.
pub fn fsync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir)
        && let Err(e) = handle.sync_all()
    {
        debug!(dir = %dir.display(), error = %e, "directory fsync not supported; ignored");
    }
}

/// Write `bytes` to `path` atomically: tmp file → fsync → rename → fsync
/// parent directory.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), io::Error> {
    let tmp_path = tmp_path_for(path);
    {
        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    if let Some(parent) = path.parent() {
        fsync_dir(parent);
    }
    Ok(())
}

fn tmp_path_for(path: &Path) -> std::path::PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(TMP_SUFFIX);
    std::path::PathBuf::from(os)
}

// ------------------------------------------------------------------------------------------------
// Header + section I/O
// ------------------------------------------------------------------------------------------------

/// Serialize the header + sections and atomically replace `path`.
pub fn write_storage_file(path: &Path, sections: &StorageSections) -> Result<(), StorageFileError> {
    let payloads = [
        &sections.dictionary,
        &sections.triples,
        &sections.indexes,
        &sections.properties,
    ];

    let total: usize = STORAGE_HEADER_SIZE + payloads.iter().map(|p| p.len()).sum::<usize>();
    let mut bytes = Vec::with_capacity(total);

    bytes.extend_from_slice(STORAGE_MAGIC);
    bytes.extend_from_slice(&STORAGE_VERSION.to_le_bytes());
    bytes.extend_from_slice(&[0u8; 3]);

    let mut offset = STORAGE_HEADER_SIZE as u32;
    for payload in payloads {
        let len = u32::try_from(payload.len()).map_err(|_| {
            StorageFileError::SectionOutOfBounds(format!(
                "section length {} exceeds u32::MAX",
                payload.len()
            ))
        })?;
        bytes.extend_from_slice(&offset.to_le_bytes());
        bytes.extend_from_slice(&len.to_le_bytes());
        offset = offset.checked_add(len).ok_or_else(|| {
            StorageFileError::SectionOutOfBounds("section table offset overflow".into())
        })?;
    }
    bytes.resize(STORAGE_HEADER_SIZE, 0);

    for payload in payloads {
        bytes.extend_from_slice(payload);
    }

    write_atomic(path, &bytes)?;
    debug!(path = %path.display(), size = bytes.len(), "storage file written");
    Ok(())
}

/// Read and validate the main file, returning its four sections.
pub fn read_storage_file(path: &Path) -> Result<StorageSections, StorageFileError> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;

    if bytes.len() < STORAGE_HEADER_SIZE {
        return Err(StorageFileError::CorruptHeader(format!(
            "file is {} bytes, header needs {STORAGE_HEADER_SIZE}",
            bytes.len()
        )));
    }
    if &bytes[..STORAGE_MAGIC.len()] != STORAGE_MAGIC {
        return Err(StorageFileError::CorruptHeader("bad magic".into()));
    }
    let version = u32::from_le_bytes([bytes[9], bytes[10], bytes[11], bytes[12]]);
    if version != STORAGE_VERSION {
        return Err(StorageFileError::CorruptHeader(format!(
            "unsupported version {version} (expected {STORAGE_VERSION})"
        )));
    }

    let mut slots: [Vec<u8>; 4] = [Vec::new(), Vec::new(), Vec::new(), Vec::new()];
    for (i, slot) in slots.iter_mut().enumerate() {
        let base = SECTION_TABLE_OFFSET + i * 8;
        let offset = u32::from_le_bytes([
            bytes[base],
            bytes[base + 1],
            bytes[base + 2],
            bytes[base + 3],
        ]) as usize;
        let length = u32::from_le_bytes([
            bytes[base + 4],
            bytes[base + 5],
            bytes[base + 6],
            bytes[base + 7],
        ]) as usize;
        let end = offset.checked_add(length).ok_or_else(|| {
            StorageFileError::SectionOutOfBounds(format!("section {i} offset overflow"))
        })?;
        if end > bytes.len() {
            return Err(StorageFileError::SectionOutOfBounds(format!(
                "section {i} [{offset}, {end}) exceeds file size {}",
                bytes.len()
            )));
        }
        *slot = bytes[offset..end].to_vec();
    }

    let [dictionary, triples, indexes, properties] = slots;
    Ok(StorageSections {
        dictionary,
        triples,
        indexes,
        properties,
    })
}

/// Create an empty main file (all sections empty) when `path` is absent.
pub fn initialize_if_missing(path: &Path) -> Result<(), StorageFileError> {
    if path.exists() {
        return Ok(());
    }
    write_storage_file(path, &StorageSections::default())?;
    info!(path = %path.display(), "storage file initialised");
    Ok(())
}
