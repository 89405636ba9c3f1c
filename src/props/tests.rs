use serde_json::json;

use crate::props::PropertyStore;

#[test]
fn node_bag_version_bumps_on_overwrite() {
    let mut store = PropertyStore::new();
    store.set_node(7, json!({"name": "alice"}));
    assert_eq!(store.node(7).unwrap().version, 1);

    store.set_node(7, json!({"name": "alice", "age": 34}));
    let bag = store.node(7).unwrap();
    assert_eq!(bag.version, 2);
    assert_eq!(bag.data, json!({"name": "alice", "age": 34}));
}

#[test]
fn edge_bags_key_by_triple_key() {
    let mut store = PropertyStore::new();
    store.set_edge("1:2:3", json!({"weight": 0.5}));
    store.set_edge("1:2:4", json!({"weight": 0.9}));

    assert_eq!(store.edge("1:2:3").unwrap().data, json!({"weight": 0.5}));
    assert_eq!(store.edge("1:2:4").unwrap().data, json!({"weight": 0.9}));
    assert!(store.edge("9:9:9").is_none());
}

#[test]
fn wrapper_carries_version_and_data() {
    let mut store = PropertyStore::new();
    store.set_node(1, json!({"k": "v"}));
    store.set_node(1, json!({"k": "v2"}));

    let wrapped = store.node(1).unwrap().wrapped();
    assert_eq!(wrapped, json!({"__v": 2, "data": {"k": "v2"}}));
}

#[test]
fn serialize_deserialize_roundtrip() {
    let mut store = PropertyStore::new();
    store.set_node(1, json!({"name": "alice"}));
    store.set_node(2, json!({"name": "bob", "tags": ["x", "y"]}));
    store.set_node(2, json!({"name": "bob"}));
    store.set_edge("1:5:2", json!({"since": 2019}));

    let bytes = store.serialize().unwrap();
    let restored = PropertyStore::deserialize(&bytes).unwrap();

    assert_eq!(restored.len(), store.len());
    assert_eq!(restored.node(1), store.node(1));
    assert_eq!(restored.node(2), store.node(2));
    assert_eq!(restored.node(2).unwrap().version, 2);
    assert_eq!(restored.edge("1:5:2"), store.edge("1:5:2"));
}

#[test]
fn empty_section_deserializes_to_empty_store() {
    let store = PropertyStore::deserialize(&[]).unwrap();
    assert!(store.is_empty());
}
