use tempfile::TempDir;

use crate::txids::{TXIDS_FILE, TxIdRegistry};

#[test]
fn remember_and_contains() {
    let mut registry = TxIdRegistry::default();
    assert!(!registry.contains("tx-1"));

    registry.remember("tx-1", None);
    registry.remember("tx-2", Some("session-a"));
    assert!(registry.contains("tx-1"));
    assert!(registry.contains("tx-2"));
    assert_eq!(registry.len(), 2);
}

#[test]
fn remembering_twice_refreshes_instead_of_duplicating() {
    let mut registry = TxIdRegistry::default();
    registry.remember("tx-1", None);
    registry.remember("tx-1", Some("s"));
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.tx_ids[0].session_id.as_deref(), Some("s"));
}

#[test]
fn trim_drops_oldest_by_timestamp() {
    let mut registry = TxIdRegistry {
        max: Some(3),
        ..TxIdRegistry::default()
    };
    for i in 0..5 {
        registry.remember(&format!("tx-{i}"), None);
        // Force distinct, increasing timestamps.
        registry.tx_ids.last_mut().unwrap().ts = i;
    }
    registry.remember("tx-final", None);

    assert!(registry.len() <= 3);
    assert!(registry.contains("tx-final"));
    assert!(!registry.contains("tx-0"));
}

#[test]
fn store_load_roundtrip() {
    let dir = TempDir::new().unwrap();
    let mut registry = TxIdRegistry::default();
    registry.remember("tx-persist", Some("sess"));
    registry.store(dir.path()).unwrap();

    let loaded = TxIdRegistry::load(dir.path(), 100);
    assert!(loaded.contains("tx-persist"));
    assert_eq!(loaded.id_set().len(), 1);
}

#[test]
fn unreadable_file_loads_empty() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join(TXIDS_FILE), b"][").unwrap();
    let loaded = TxIdRegistry::load(dir.path(), 100);
    assert!(loaded.is_empty());
}

#[test]
fn load_applies_the_configured_cap() {
    let dir = TempDir::new().unwrap();
    let mut registry = TxIdRegistry::default();
    for i in 0..10 {
        registry.remember(&format!("tx-{i}"), None);
        registry.tx_ids.last_mut().unwrap().ts = i;
    }
    registry.store(dir.path()).unwrap();

    let loaded = TxIdRegistry::load(dir.path(), 4);
    assert_eq!(loaded.len(), 4);
    assert!(loaded.contains("tx-9"));
}
