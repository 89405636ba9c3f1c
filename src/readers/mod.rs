//! Reader registry: per-process reader files under `<pages>/readers/`.
//!
//! A process holding a snapshot writes one file, `{pid}-{ts}.reader`,
//! containing `{pid, epoch, ts}`.  Maintenance consults the registry
//! before unlinking page bytes: while any reader file exists, GC and
//! reader-respecting compaction report `skipped` instead of touching the
//! files.
//!
//! One file per reader process deliberately avoids multi-writer
//! contention over a single catalog: creation is an atomic tmp → rename,
//! removal deletes only this pid's files, and stale files (older than a
//! TTL, default 30 s) are swept best-effort during listing.


use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::storage_file::write_atomic;

/// Registry directory name inside the pages directory.
pub const READERS_DIR: &str = "readers";

/// Reader file extension.
pub const READER_EXT: &str = "reader";

/// Default staleness TTL for best-effort cleanup.
pub const DEFAULT_READER_TTL: Duration = Duration::from_secs(30);

/// Errors returned by reader-registry operations.
#[derive(Debug, Error)]
pub enum ReaderRegistryError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("reader file JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Contents of one reader file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReaderInfo {
    /// Reader process id.
    pub pid: u32,

    /// Manifest epoch the reader has pinned.
    pub epoch: u64,

    /// Registration time, epoch milliseconds.
    pub ts: u64,
}

/// Atomically create (or refresh) this process's reader file.
///
/// Returns the path written.  A previous file for the same pid is
/// removed first so each process owns at most one registration.
pub fn register(
    pages_dir: &Path,
    pid: u32,
    epoch: u64,
) -> Result<PathBuf, ReaderRegistryError> {
    let dir = pages_dir.join(READERS_DIR);
    fs::create_dir_all(&dir)?;
    remove_pid_files(&dir, pid);

    let ts = now_ms();
    let info = ReaderInfo { pid, epoch, ts };
    let path = dir.join(format!("{pid}-{ts}.{READER_EXT}"));
    write_atomic(&path, &serde_json::to_vec(&info)?)?;
    debug!(pid, epoch, path = %path.display(), "reader registered");
    Ok(path)
}

/// Remove every reader file belonging to `pid`.
pub fn unregister(pages_dir: &Path, pid: u32) {
    let dir = pages_dir.join(READERS_DIR);
    if dir.exists() {
        remove_pid_files(&dir, pid);
        debug!(pid, "reader unregistered");
    }
}

/// Walk the registry, sweep files older than `ttl` best-effort, and
/// return the remaining (live) readers.
pub fn active_readers(
    pages_dir: &Path,
    ttl: Duration,
) -> Result<Vec<ReaderInfo>, ReaderRegistryError> {
    let dir = pages_dir.join(READERS_DIR);
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let cutoff = now_ms().saturating_sub(ttl.as_millis() as u64);
    let mut live = Vec::new();

    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(READER_EXT) {
            continue;
        }

        let ts = timestamp_of(&path);
        if ts < cutoff {
            // Stale: the owning process died without unregistering.
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to sweep stale reader file");
            }
            continue;
        }

        match read_info(&path) {
            Some(info) => live.push(info),
            // Unreadable but fresh: count it as a live reader with an
            // unknown epoch.  Maintenance must stay conservative.
            None => live.push(ReaderInfo {
                pid: pid_of(&path).unwrap_or(0),
                epoch: 0,
                ts,
            }),
        }
    }

    Ok(live)
}

/// Minimum epoch pinned by any live reader, if readers exist.
pub fn min_pinned_epoch(
    pages_dir: &Path,
    ttl: Duration,
) -> Result<Option<u64>, ReaderRegistryError> {
    Ok(active_readers(pages_dir, ttl)?
        .iter()
        .map(|r| r.epoch)
        .min())
}

// ------------------------------------------------------------------------------------------------
// Internal helpers
// ------------------------------------------------------------------------------------------------

fn remove_pid_files(dir: &Path, pid: u32) {
    let prefix = format!("{pid}-");
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with(&prefix)
            && let Err(e) = fs::remove_file(entry.path())
        {
            warn!(pid, file = name, error = %e, "failed to remove reader file");
        }
    }
}

fn read_info(path: &Path) -> Option<ReaderInfo> {
    let mut raw = String::new();
    fs::File::open(path)
        .and_then(|mut f| f.read_to_string(&mut raw))
        .ok()?;
    serde_json::from_str(&raw).ok()
}

/// Registration time from the `{pid}-{ts}.reader` name, falling back to
/// the file mtime.
fn timestamp_of(path: &Path) -> u64 {
    let from_name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .and_then(|stem| stem.rsplit_once('-'))
        .and_then(|(_, ts)| ts.parse::<u64>().ok());
    if let Some(ts) = from_name {
        return ts;
    }
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn pid_of(path: &Path) -> Option<u32> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .and_then(|stem| stem.split_once('-'))
        .and_then(|(pid, _)| pid.parse::<u32>().ok())
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
