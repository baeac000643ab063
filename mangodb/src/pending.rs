use std::{collections::HashSet, net::SocketAddr};

use crate::message::Requester;

/// A write this replica accepted from a client, waiting for every replica to
/// store it.
#[derive(Debug, Clone)]
pub struct PendingWrite {
    pub keys: Vec<String>,
    pub values: Vec<String>,
    pub client: Option<Requester>,
    acknowledged: HashSet<SocketAddr>,
}

impl PendingWrite {
    pub fn new(keys: Vec<String>, values: Vec<String>, client: Option<Requester>) -> Self {
        Self {
            keys,
            values,
            client,
            acknowledged: HashSet::new(),
        }
    }

    /// Records that `node` stored the write. Repeated acknowledgements from
    /// the same node count once.
    pub fn acknowledge(&mut self, node: SocketAddr) {
        self.acknowledged.insert(node);
    }

    /// The write is durable once every replica, this one included, holds it.
    pub fn is_complete(&self, replica_count: usize) -> bool {
        self.acknowledged.len() == replica_count
    }

    pub fn touches(&self, key: &str) -> bool {
        self.keys.iter().any(|k| k == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn pending() -> PendingWrite {
        PendingWrite::new(
            vec!["k".into()],
            vec!["v".into()],
            Some(Requester::from(addr(9))),
        )
    }

    #[test]
    fn completes_when_every_replica_acknowledged() {
        let mut write = pending();
        write.acknowledge(addr(1));
        write.acknowledge(addr(2));
        assert!(!write.is_complete(3));
        write.acknowledge(addr(3));
        assert!(write.is_complete(3));
    }

    #[test]
    fn repeated_acknowledgements_count_once() {
        let mut write = pending();
        write.acknowledge(addr(1));
        write.acknowledge(addr(2));
        write.acknowledge(addr(2));
        assert!(!write.is_complete(3));
    }

    #[test]
    fn touches_only_its_own_keys() {
        let write = pending();
        assert!(write.touches("k"));
        assert!(!write.touches("other"));
    }
}
