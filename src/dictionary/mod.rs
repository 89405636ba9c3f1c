//! String dictionary: bidirectional `String ↔ u32` interning.
//!
//! Ids are assigned densely from 0, monotonically, and are never reused —
//! `id ↔ value` stays bijective for the lifetime of the database.  The
//! serialized form is append-order, so deserializing reproduces identical
//! id assignments.
//!
//! # Serialized form
//!
//! `[u32 count][{u32 len, utf-8 bytes}…]` — entries in id order.


use std::collections::HashMap;

use crate::encoding::{self, EncodingError};

/// Append-only string interner.
#[derive(Debug, Default, Clone)]
pub struct Dictionary {
    /// Values indexed by id.
    values: Vec<String>,

    /// Reverse map value → id.
    ids: HashMap<String, u32>,
}

impl Dictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the id for `value`, interning it if unseen.
    ///
    /// Equal inputs return the same id on every call.
    pub fn get_or_create_id(&mut self, value: &str) -> u32 {
        if let Some(id) = self.ids.get(value) {
            return *id;
        }
        let id = self.values.len() as u32;
        self.values.push(value.to_string());
        self.ids.insert(value.to_string(), id);
        id
    }

    /// The id for `value`, if already interned.
    pub fn get_id(&self, value: &str) -> Option<u32> {
        self.ids.get(value).copied()
    }

    /// The value for `id`, if assigned.
    pub fn get_value(&self, id: u32) -> Option<&str> {
        self.values.get(id as usize).map(String::as_str)
    }

    /// Number of interned entries.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Serialize as `[count][{len, bytes}…]` in id order.
    pub fn serialize(&self) -> Result<Vec<u8>, EncodingError> {
        let mut buf = Vec::new();
        encoding::encode_vec(&self.values, &mut buf)?;
        Ok(buf)
    }

    /// Rebuild a dictionary observationally equivalent to the serialized
    /// original.  An empty slice yields an empty dictionary.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, EncodingError> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        let (values, _) = encoding::decode_vec::<String>(bytes)?;
        let mut ids = HashMap::with_capacity(values.len());
        for (idx, value) in values.iter().enumerate() {
            ids.insert(value.clone(), idx as u32);
        }
        Ok(Self { values, ids })
    }
}
