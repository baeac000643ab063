//! In-memory key-value storage for a replica.
//!
//! Every replica applies writes here in leader-assigned order, so two stores
//! that applied the same prefix of the order hold the same contents.

use std::collections::BTreeMap;

/// A stored value together with the order index of the write that set it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub value: String,
    pub order_index: u64,
}

/// Key-value store owned by a single replica.
///
/// Keys are created by their first write and overwritten by later ones; there
/// is no delete. `BTreeMap` keeps snapshots and log output in a stable order.
#[derive(Debug, Default)]
pub struct DataStore {
    data: BTreeMap<String, Versioned>,
}

impl DataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a value tagged with the order index of the write setting it.
    pub fn put(&mut self, key: String, value: String, order_index: u64) {
        self.data.insert(key, Versioned { value, order_index });
    }

    /// Returns the current value for a key, or `None` if it was never written.
    pub fn get(&self, key: &str) -> Option<&Versioned> {
        self.data.get(key)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns a copy of every key with its value and order index.
    pub fn snapshot(&self) -> BTreeMap<String, Versioned> {
        self.data.clone()
    }
}
