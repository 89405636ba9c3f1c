use std::collections::HashSet;
use std::path::Path;

use crate::dictionary::Dictionary;
use crate::wal::{BatchMeta, WalEffect, WalRecord, WalReplay, WalWriter, replay};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("trace")
        .with_test_writer()
        .try_init();
}

/// Open a writer, append the records, and return the handle.
pub fn write_records(path: &Path, records: &[WalRecord]) -> WalWriter {
    let mut wal = WalWriter::open(path).unwrap();
    for record in records {
        wal.append(record).unwrap();
    }
    wal
}

/// Replay with an empty applied-txid seed into a fresh dictionary.
pub fn replay_fresh(path: &Path) -> (WalReplay, Dictionary) {
    let mut dictionary = Dictionary::new();
    let replayed = replay(path, &HashSet::new(), &mut dictionary).unwrap();
    (replayed, dictionary)
}

pub fn add(s: &str, p: &str, o: &str) -> WalRecord {
    WalRecord::add(s, p, o)
}

pub fn begin_with_tx(tx_id: &str) -> WalRecord {
    WalRecord::Begin(BatchMeta {
        tx_id: Some(tx_id.to_string()),
        session_id: None,
    })
}

/// The added facts among the replayed effects, dereferenced to strings.
pub fn added(replayed: &WalReplay, dictionary: &Dictionary) -> Vec<(String, String, String)> {
    replayed
        .effects
        .iter()
        .filter_map(|e| match e {
            WalEffect::Add(t) => Some((
                dictionary.get_value(t.s).unwrap_or("?").to_string(),
                dictionary.get_value(t.p).unwrap_or("?").to_string(),
                dictionary.get_value(t.o).unwrap_or("?").to_string(),
            )),
            _ => None,
        })
        .collect()
}

pub fn fact(s: &str, p: &str, o: &str) -> (String, String, String) {
    (s.to_string(), p.to_string(), o.to_string())
}
