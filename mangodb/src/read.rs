use std::collections::HashMap;

use crate::{
    message::{Message, Requester},
    store::Versioned,
};

/// Bookkeeping for one client read that may span several keys.
///
/// Keys without an outstanding write are resolved when the read arrives;
/// the others are resolved one by one as their writes get applied. The reply
/// is assembled once nothing is pending.
#[derive(Debug)]
pub struct ReadTransaction {
    client: Requester,
    keys: Vec<String>,
    resolved: HashMap<String, Option<Versioned>>,
    n_pending: usize,
}

impl ReadTransaction {
    pub fn new(client: Requester) -> Self {
        Self {
            client,
            keys: Vec::new(),
            resolved: HashMap::new(),
            n_pending: 0,
        }
    }

    pub fn client(&self) -> Requester {
        self.client
    }

    pub fn n_pending(&self) -> usize {
        self.n_pending
    }

    pub fn is_ready(&self) -> bool {
        self.n_pending == 0
    }

    /// Adds a key whose value is known right away.
    pub fn add_resolved(&mut self, key: String, stored: Option<Versioned>) {
        self.resolved.insert(key.clone(), stored);
        self.keys.push(key);
    }

    /// Adds a key that must wait for an outstanding write.
    pub fn add_pending(&mut self, key: String) {
        self.n_pending += 1;
        self.keys.push(key);
    }

    /// Fills in one pending registration of `key`. Returns true when the
    /// transaction has nothing left to wait for.
    pub fn resolve(&mut self, key: &str, stored: Option<Versioned>) -> bool {
        self.resolved.insert(key.to_string(), stored);
        self.n_pending = self.n_pending.saturating_sub(1);
        self.is_ready()
    }

    /// Builds the `read_result` for the client, keys in request order.
    pub fn into_reply(self) -> Message {
        let mut value = Vec::with_capacity(self.keys.len());
        let mut order_index = Vec::with_capacity(self.keys.len());
        for key in &self.keys {
            let stored = self.resolved.get(key).and_then(Option::as_ref);
            value.push(stored.map(|s| s.value.clone()));
            order_index.push(stored.map(|s| s.order_index));
        }
        Message::ReadResult {
            key: self.keys,
            value,
            order_index,
            request: self.client.request,
        }
    }
}
