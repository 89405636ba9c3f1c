//! Property store: per-node and per-edge JSON property bags.
//!
//! Bags are byte-opaque JSON objects wrapped as `{"__v": n, "data": {…}}`,
//! where `n` increments on each overwrite so that backup and forensic
//! tooling can distinguish overwrites.  The engine never interprets the
//! `data` payload; a typed façade above the store must validate on write.
//!
//! Node bags are keyed by node id; edge bags by the canonical triple key
//! `"sId:pId:oId"`.  Bags are never deleted at this layer — absent means
//! undefined.
//!
//! # Serialized form
//!
//! ```text
//! [u32 node-count] { [u32 id][u64 __v][u32 json-len][json bytes] }…
//! [u32 edge-count] { [string key][u64 __v][u32 json-len][json bytes] }…
//! ```

#[cfg(test)]
mod tests;

use std::collections::HashMap;

use serde_json::Value;

use crate::encoding::{self, Decode, Encode, EncodingError};

// ------------------------------------------------------------------------------------------------
// Versioned bag
// ------------------------------------------------------------------------------------------------

/// A property bag plus its monotonic overwrite counter.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedBag {
    /// Overwrite counter (`__v`), starting at 1.
    pub version: u64,

    /// The caller's JSON object, stored verbatim.
    pub data: Value,
}

impl VersionedBag {
    /// Render the mandatory wire wrapper `{"__v": n, "data": {…}}`.
    pub fn wrapped(&self) -> Value {
        serde_json::json!({ "__v": self.version, "data": self.data })
    }
}

// ------------------------------------------------------------------------------------------------
// Property store
// ------------------------------------------------------------------------------------------------

/// In-memory node/edge property state, serialized into the main file's
/// properties section.
#[derive(Debug, Default, Clone)]
pub struct PropertyStore {
    node_bags: HashMap<u32, VersionedBag>,
    edge_bags: HashMap<String, VersionedBag>,
}

impl PropertyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the bag for a node, bumping `__v`.
    pub fn set_node(&mut self, id: u32, data: Value) {
        let version = self.node_bags.get(&id).map_or(1, |bag| bag.version + 1);
        self.node_bags.insert(id, VersionedBag { version, data });
    }

    /// Overwrite the bag for an edge (by canonical triple key), bumping `__v`.
    pub fn set_edge(&mut self, key: &str, data: Value) {
        let version = self.edge_bags.get(key).map_or(1, |bag| bag.version + 1);
        self.edge_bags
            .insert(key.to_string(), VersionedBag { version, data });
    }

    pub fn node(&self, id: u32) -> Option<&VersionedBag> {
        self.node_bags.get(&id)
    }

    pub fn edge(&self, key: &str) -> Option<&VersionedBag> {
        self.edge_bags.get(key)
    }

    /// Total number of bags (nodes + edges).
    pub fn len(&self) -> usize {
        self.node_bags.len() + self.edge_bags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.node_bags.is_empty() && self.edge_bags.is_empty()
    }

    pub fn serialize(&self) -> Result<Vec<u8>, EncodingError> {
        let mut buf = Vec::new();

        // Node bags, id order for deterministic output.
        let mut node_ids: Vec<u32> = self.node_bags.keys().copied().collect();
        node_ids.sort_unstable();
        (node_ids.len() as u32).encode_to(&mut buf)?;
        for id in node_ids {
            let bag = &self.node_bags[&id];
            id.encode_to(&mut buf)?;
            bag.version.encode_to(&mut buf)?;
            encoding::encode_json(&bag.data, &mut buf)?;
        }

        // Edge bags, key order.
        let mut edge_keys: Vec<&String> = self.edge_bags.keys().collect();
        edge_keys.sort();
        (edge_keys.len() as u32).encode_to(&mut buf)?;
        for key in edge_keys {
            let bag = &self.edge_bags[key];
            key.as_str().encode_to(&mut buf)?;
            bag.version.encode_to(&mut buf)?;
            encoding::encode_json(&bag.data, &mut buf)?;
        }

        Ok(buf)
    }

    /// Rebuild from a serialized section.  An empty slice yields an empty
    /// store.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, EncodingError> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }

        let mut offset = 0;

        let (node_count, n) = u32::decode_from(&bytes[offset..])?;
        offset += n;
        let mut node_bags = HashMap::with_capacity(node_count as usize);
        for _ in 0..node_count {
            let (id, n) = u32::decode_from(&bytes[offset..])?;
            offset += n;
            let (version, n) = u64::decode_from(&bytes[offset..])?;
            offset += n;
            let (data, n) = encoding::decode_json(&bytes[offset..])?;
            offset += n;
            node_bags.insert(id, VersionedBag { version, data });
        }

        let (edge_count, n) = u32::decode_from(&bytes[offset..])?;
        offset += n;
        let mut edge_bags = HashMap::with_capacity(edge_count as usize);
        for _ in 0..edge_count {
            let (key, n) = String::decode_from(&bytes[offset..])?;
            offset += n;
            let (version, n) = u64::decode_from(&bytes[offset..])?;
            offset += n;
            let (data, n) = encoding::decode_json(&bytes[offset..])?;
            offset += n;
            edge_bags.insert(key, VersionedBag { version, data });
        }

        Ok(Self {
            node_bags,
            edge_bags,
        })
    }
}
