//! Transaction-id registry: cross-restart replay idempotence.
//!
//! Outermost commits may carry an opaque `txId`.  Applied ids are
//! remembered in `txids.json` so that replaying a WAL that still contains
//! the same transaction (crash before reset) applies it exactly once.
//!
//! The registry is bounded: beyond `max` entries the oldest-by-timestamp
//! ids are trimmed (LRU).  An id trimmed out could in principle re-apply,
//! but by then the WAL that carried it has long been reset — the cap
//! bounds the file, not correctness of the common path.

#[cfg(test)]
mod tests;

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::storage_file::write_atomic;

/// Registry file name inside the pages directory.
pub const TXIDS_FILE: &str = "txids.json";

/// Default cap when the caller does not configure one.
pub const DEFAULT_MAX_REMEMBER: usize = 1000;

/// Errors returned when persisting the registry.
#[derive(Debug, Error)]
pub enum TxIdError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("txid registry JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One remembered transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxIdEntry {
    pub id: String,

    /// Time the id was applied, epoch milliseconds (LRU key).
    pub ts: u64,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub session_id: Option<String>,
}

/// Persistent set of recently applied transaction ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxIdRegistry {
    pub version: u32,

    #[serde(default)]
    pub tx_ids: Vec<TxIdEntry>,

    /// Size cap; absent means [`DEFAULT_MAX_REMEMBER`].
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub max: Option<usize>,
}

impl Default for TxIdRegistry {
    fn default() -> Self {
        Self {
            version: 1,
            tx_ids: Vec::new(),
            max: None,
        }
    }
}

impl TxIdRegistry {
    /// Load from the pages directory; empty registry on any failure.
    pub fn load(pages_dir: &Path, max: usize) -> Self {
        let path = pages_dir.join(TXIDS_FILE);
        let mut registry = if path.exists() {
            let mut raw = String::new();
            let read = File::open(&path).and_then(|mut f| f.read_to_string(&mut raw));
            match read.map_err(TxIdError::from).and_then(|_| {
                serde_json::from_str::<TxIdRegistry>(&raw).map_err(TxIdError::from)
            }) {
                Ok(registry) => registry,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "txid registry unreadable; starting empty");
                    TxIdRegistry::default()
                }
            }
        } else {
            TxIdRegistry::default()
        };
        registry.max = Some(max);
        registry.trim();
        registry
    }

    /// Atomically persist into the pages directory.
    pub fn store(&self, pages_dir: &Path) -> Result<(), TxIdError> {
        let bytes = serde_json::to_vec(self)?;
        write_atomic(&pages_dir.join(TXIDS_FILE), &bytes)?;
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tx_ids.iter().any(|entry| entry.id == id)
    }

    /// All remembered ids, for seeding a WAL replay.
    pub fn id_set(&self) -> HashSet<String> {
        self.tx_ids.iter().map(|entry| entry.id.clone()).collect()
    }

    /// Remember an applied id (refreshing its timestamp when already
    /// present) and trim past the cap.
    pub fn remember(&mut self, id: &str, session_id: Option<&str>) {
        let ts = now_ms();
        if let Some(entry) = self.tx_ids.iter_mut().find(|entry| entry.id == id) {
            entry.ts = ts;
            entry.session_id = session_id.map(str::to_string);
        } else {
            self.tx_ids.push(TxIdEntry {
                id: id.to_string(),
                ts,
                session_id: session_id.map(str::to_string),
            });
        }
        self.trim();
    }

    pub fn len(&self) -> usize {
        self.tx_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx_ids.is_empty()
    }

    /// Drop oldest-by-timestamp entries beyond the cap.
    fn trim(&mut self) {
        let max = self.max.unwrap_or(DEFAULT_MAX_REMEMBER);
        if self.tx_ids.len() <= max {
            return;
        }
        self.tx_ids.sort_by_key(|entry| entry.ts);
        let excess = self.tx_ids.len() - max;
        self.tx_ids.drain(..excess);
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
