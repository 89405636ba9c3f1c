//! Hotness counters: per-(order, primary) access frequency with decay.
//!
//! Every paged query that resolves a specific primary value increments its
//! bucket.  At flush time the counters decay multiplicatively with a
//! 10-minute half-life (`count ← ⌊count · 0.5^(Δt / half_life)⌋`, zeros
//! dropped) and the structure is persisted atomically to
//! `hotness.json`.  Auto-compaction reads the counters to pick hot,
//! multi-page primaries.
//!
//! Loading is permissive: a missing or unreadable file yields a fresh
//! structure — hotness is an optimisation hint, never ground truth.


use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::model::TripleOrder;
use crate::storage_file::write_atomic;

/// Hotness file name inside the pages directory.
pub const HOTNESS_FILE: &str = "hotness.json";

/// Decay half-life applied at flush.
pub const DEFAULT_HALF_LIFE: Duration = Duration::from_secs(600);

/// Errors returned when persisting hotness counters.
#[derive(Debug, Error)]
pub enum HotnessError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("hotness JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Decayed access counters, `{order → {primary → count}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hotness {
    pub version: u32,

    /// Last persist time, epoch milliseconds; decay baseline.
    pub updated_at: u64,

    #[serde(default)]
    pub counts: BTreeMap<TripleOrder, BTreeMap<String, u64>>,
}

impl Default for Hotness {
    fn default() -> Self {
        Self {
            version: 1,
            updated_at: now_ms(),
            counts: BTreeMap::new(),
        }
    }
}

impl Hotness {
    /// Load from the pages directory; fresh structure on any failure.
    pub fn load(pages_dir: &Path) -> Self {
        let path = pages_dir.join(HOTNESS_FILE);
        if !path.exists() {
            return Self::default();
        }
        let mut raw = String::new();
        let read = File::open(&path).and_then(|mut f| f.read_to_string(&mut raw));
        match read {
            Ok(_) => match serde_json::from_str(&raw) {
                Ok(hotness) => hotness,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "hotness file unreadable; starting fresh");
                    Self::default()
                }
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "hotness file unreadable; starting fresh");
                Self::default()
            }
        }
    }

    /// Atomically persist into the pages directory.
    pub fn store(&self, pages_dir: &Path) -> Result<(), HotnessError> {
        let bytes = serde_json::to_vec(self)?;
        write_atomic(&pages_dir.join(HOTNESS_FILE), &bytes)?;
        Ok(())
    }

    /// Increment the bucket for a primary-value hit.
    pub fn record_hit(&mut self, order: TripleOrder, primary: u32) {
        let bucket = self
            .counts
            .entry(order)
            .or_default()
            .entry(primary.to_string())
            .or_insert(0);
        *bucket += 1;
    }

    /// Current count for a primary.
    pub fn count(&self, order: TripleOrder, primary: u32) -> u64 {
        self.counts
            .get(&order)
            .and_then(|bucket| bucket.get(&primary.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Primaries of an order whose count is at least `min_count`,
    /// hottest first.
    pub fn hot_primaries(&self, order: TripleOrder, min_count: u64) -> Vec<u32> {
        let Some(bucket) = self.counts.get(&order) else {
            return Vec::new();
        };
        let mut hot: Vec<(u32, u64)> = bucket
            .iter()
            .filter_map(|(key, count)| {
                let primary = key.parse::<u32>().ok()?;
                (*count >= min_count).then_some((primary, *count))
            })
            .collect();
        hot.sort_by(|a, b| b.1.cmp(&a.1));
        hot.into_iter().map(|(primary, _)| primary).collect()
    }

    /// Apply exponential decay for the time elapsed since `updated_at`,
    /// drop zeroed buckets, and move the baseline to now.
    pub fn decay(&mut self, half_life: Duration) {
        let now = now_ms();
        let elapsed_ms = now.saturating_sub(self.updated_at);
        self.updated_at = now;
        if elapsed_ms == 0 {
            return;
        }

        let factor = 0.5_f64.powf(elapsed_ms as f64 / half_life.as_millis().max(1) as f64);
        for bucket in self.counts.values_mut() {
            bucket.retain(|_, count| {
                *count = (*count as f64 * factor).floor() as u64;
                *count > 0
            });
        }
        self.counts.retain(|_, bucket| !bucket.is_empty());
        debug!(elapsed_ms, factor, "hotness decayed");
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
