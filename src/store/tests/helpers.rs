use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::store::{QueryCriteria, Store, StoreOptions};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

pub fn db_path(dir: &TempDir) -> PathBuf {
    dir.path().join("graph.db")
}

pub fn open_default(path: &Path) -> Store {
    Store::open(path, StoreOptions::default()).unwrap()
}

pub fn open_with(path: &Path, options: StoreOptions) -> Store {
    Store::open(path, options).unwrap()
}

/// Triple objects returned for a subject query, sorted.
pub fn objects_of(store: &Store, subject: &str) -> Vec<String> {
    let mut objects: Vec<String> = store
        .query(&QueryCriteria::subject(subject))
        .unwrap()
        .into_iter()
        .map(|r| r.object)
        .collect();
    objects.sort();
    objects
}

/// Every fact in the store as `(s, p, o)` strings, sorted.
pub fn all_facts(store: &Store) -> Vec<(String, String, String)> {
    let mut rows: Vec<(String, String, String)> = store
        .query(&QueryCriteria::default())
        .unwrap()
        .into_iter()
        .map(|r| (r.subject, r.predicate, r.object))
        .collect();
    rows.sort();
    rows
}

pub fn fact(s: &str, p: &str, o: &str) -> (String, String, String) {
    (s.to_string(), p.to_string(), o.to_string())
}
