//! The replica state machine shared by followers and the leader.
//!
//! A write moves through three stages, keyed by its [`WriteId`]:
//!
//! 1. **awaiting acknowledgement**: the replica that took the client write
//!    broadcasts it and collects an acknowledgement from every other replica.
//! 2. **awaiting order**: every replica holds the write in its write buffer;
//!    the leader has not assigned it an order index yet (or the index has not
//!    reached this replica).
//! 3. **applied**: the write was merged into the data store in index order.
//!
//! The replica performs no I/O. Handlers queue [`Outgoing`] datagrams which
//! the caller drains and sends, so all protocol state can be driven from tests
//! without sockets.

use std::{
    collections::{BTreeMap, HashMap},
    net::SocketAddr,
};

use anyhow::{ensure, Result};
use tracing::{debug, info, warn};

use crate::{
    error::{validate_write, RequestError},
    leader::OrderAssigner,
    message::{Message, Requester, WriteId},
    pending::PendingWrite,
    read::ReadTransaction,
    store::{DataStore, Versioned},
    topology::Topology,
};

/// Where an outgoing datagram goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Node(SocketAddr),
    /// Every replica except the sender.
    Peers,
}

/// A datagram the replica wants sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub to: Destination,
    pub message: Message,
}

/// Everything that came out of handling one message.
#[derive(Debug, Default)]
pub struct Effects {
    pub outgoing: Vec<Outgoing>,
    /// The replica was told to stop.
    pub exit: bool,
}

/// A write stored on every replica that is waiting for its order index.
#[derive(Debug, Clone)]
pub struct BufferedWrite {
    pub keys: Vec<String>,
    pub values: Vec<String>,
    /// Set only on the replica that accepted the write from the client.
    pub client: Option<Requester>,
}

impl BufferedWrite {
    fn touches(&self, key: &str) -> bool {
        self.keys.iter().any(|k| k == key)
    }
}

type ReadId = u64;

pub struct Replica {
    addr: SocketAddr,
    peers: Vec<SocketAddr>,
    leader: SocketAddr,
    order_on_write: bool,
    assigner: Option<OrderAssigner>,
    write_seq: u64,
    ack_buffer: HashMap<WriteId, PendingWrite>,
    write_buffer: HashMap<WriteId, BufferedWrite>,
    order_buffer: BTreeMap<u64, WriteId>,
    next_index: u64,
    store: DataStore,
    reads: HashMap<ReadId, ReadTransaction>,
    read_buffer: HashMap<String, Vec<ReadId>>,
    next_read: ReadId,
    outbox: Vec<Outgoing>,
}

impl Replica {
    /// Creates the replica listening at `addr`. It orders writes itself when
    /// `addr` is the topology's leader.
    ///
    /// With `order_on_write` the client hears back only once its write is
    /// applied; otherwise the reply goes out as soon as the write is durable.
    pub fn new(addr: SocketAddr, topology: &Topology, order_on_write: bool) -> Result<Self> {
        ensure!(
            topology.contains(addr),
            "replica {addr} is not a member of the topology"
        );
        let leader = topology.leader();
        Ok(Self {
            addr,
            peers: topology.peers_of(addr),
            leader,
            order_on_write,
            assigner: (addr == leader).then(OrderAssigner::new),
            write_seq: 0,
            ack_buffer: HashMap::new(),
            write_buffer: HashMap::new(),
            order_buffer: BTreeMap::new(),
            next_index: 0,
            store: DataStore::new(),
            reads: HashMap::new(),
            read_buffer: HashMap::new(),
            next_read: 0,
            outbox: Vec::new(),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_leader(&self) -> bool {
        self.assigner.is_some()
    }

    pub fn peers(&self) -> &[SocketAddr] {
        &self.peers
    }

    /// Number of replicas in the cluster, this one included.
    pub fn replica_count(&self) -> usize {
        self.peers.len() + 1
    }

    pub fn get(&self, key: &str) -> Option<&Versioned> {
        self.store.get(key)
    }

    pub fn store(&self) -> &DataStore {
        &self.store
    }

    /// The order index this replica will apply next.
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    pub fn awaiting_acknowledgement(&self) -> usize {
        self.ack_buffer.len()
    }

    pub fn awaiting_order(&self) -> usize {
        self.write_buffer.len()
    }

    pub fn buffered_orders(&self) -> usize {
        self.order_buffer.len()
    }

    pub fn waiting_reads(&self) -> usize {
        self.reads.len()
    }

    /// Handles one incoming message and returns the datagrams it produced.
    pub fn on_message(&mut self, from: SocketAddr, message: Message) -> Effects {
        let kind = message.kind();
        let mut exit = false;
        match message {
            Message::Exit => {
                info!(replica = %self.addr, peer = %from, "received exit");
                exit = true;
            }
            Message::ClientWrite {
                keys,
                values,
                request,
            } => {
                let client = Requester::new(from, request);
                if let Err(error) = self.handle_client_write(client, keys, values) {
                    warn!(client = %from, %error, "rejected client write");
                }
            }
            Message::ClientRead { key, request } => {
                self.handle_client_read(Requester::new(from, request), key)
            }
            Message::Write {
                id,
                keys,
                values,
                from: origin,
            } => self.handle_write(origin, id, keys, values),
            Message::Acknowledge { id, from: replica } => self.handle_acknowledge(replica, id),
            Message::ClientWriteAck { id } => self.handle_client_write_ack(from, id),
            Message::WriteOrder { id, index } => self.handle_write_order(id, index),
            Message::WriteResult { .. } | Message::ReadResult { .. } => {
                warn!(
                    replica = %self.addr,
                    peer = %from,
                    kind,
                    "dropping reply meant for a client"
                );
            }
        }
        Effects {
            outgoing: self.take_outgoing(),
            exit,
        }
    }

    /// Drains the datagrams queued by the handlers.
    pub fn take_outgoing(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.outbox)
    }

    /// Accepts a client write and broadcasts it to every other replica.
    ///
    /// Invalid requests are rejected before any state changes.
    pub fn handle_client_write(
        &mut self,
        client: Requester,
        keys: Vec<String>,
        values: Vec<String>,
    ) -> Result<WriteId, RequestError> {
        validate_write(&keys, &values)?;

        let id = WriteId::new(self.addr, self.write_seq);
        self.write_seq += 1;

        let mut pending = PendingWrite::new(keys.clone(), values.clone(), Some(client));
        pending.acknowledge(self.addr);
        self.ack_buffer.insert(id, pending);
        info!(replica = %self.addr, %id, client = %client.addr, ?keys, "accepted client write");

        self.send_to_peers(Message::Write {
            id,
            keys,
            values,
            from: self.addr,
        });
        self.complete_if_durable(id);
        Ok(id)
    }

    /// Stores a write broadcast by `origin` and acknowledges it.
    pub fn handle_write(
        &mut self,
        origin: SocketAddr,
        id: WriteId,
        keys: Vec<String>,
        values: Vec<String>,
    ) {
        debug!(replica = %self.addr, %id, peer = %origin, "buffered peer write");
        self.write_buffer.insert(
            id,
            BufferedWrite {
                keys,
                values,
                client: None,
            },
        );
        self.send(
            origin,
            Message::Acknowledge {
                id,
                from: self.addr,
            },
        );
    }

    pub fn handle_acknowledge(&mut self, replica: SocketAddr, id: WriteId) {
        let Some(pending) = self.ack_buffer.get_mut(&id) else {
            debug!(
                replica = %self.addr,
                %id,
                peer = %replica,
                "acknowledgement for a write not awaiting one"
            );
            return;
        };
        pending.acknowledge(replica);
        debug!(replica = %self.addr, %id, peer = %replica, "received acknowledgement");
        self.complete_if_durable(id);
    }

    /// Orders a durable write. Only the leader accepts this.
    pub fn handle_client_write_ack(&mut self, from: SocketAddr, id: WriteId) {
        if self.assigner.is_none() {
            warn!(replica = %self.addr, %id, peer = %from, "only the leader orders writes");
            return;
        }
        if !self.write_buffer.contains_key(&id) {
            warn!(replica = %self.addr, %id, peer = %from, "write is not awaiting an order");
            return;
        }
        let Some(index) = self.assigner.as_mut().map(OrderAssigner::assign) else {
            return;
        };
        self.store_data(id, index);
    }

    /// Applies a newly ordered write on the leader and announces its index to
    /// every follower.
    fn store_data(&mut self, id: WriteId, index: u64) {
        info!(replica = %self.addr, %id, index, "assigned order index");
        self.send_to_peers(Message::WriteOrder { id, index });
        self.handle_write_order(id, index);
    }

    /// Records an order announcement and applies every write whose turn has
    /// come. A gap in the indices holds back everything after it.
    pub fn handle_write_order(&mut self, id: WriteId, index: u64) {
        if index < self.next_index {
            debug!(replica = %self.addr, %id, index, "ignoring order for an applied index");
            return;
        }
        self.order_buffer.insert(index, id);

        while let Some(&id) = self.order_buffer.get(&self.next_index) {
            let Some(write) = self.write_buffer.remove(&id) else {
                warn!(
                    replica = %self.addr,
                    %id,
                    index = self.next_index,
                    "ordered write is missing from the write buffer"
                );
                break;
            };
            self.order_buffer.remove(&self.next_index);
            self.apply(id, write);
        }

        if !self.order_buffer.is_empty() {
            debug!(
                replica = %self.addr,
                next_index = self.next_index,
                buffered = self.order_buffer.len(),
                "waiting for earlier write orders"
            );
        }
    }

    /// Answers a read at once unless one of its keys has a write in flight.
    pub fn handle_client_read(&mut self, client: Requester, keys: Vec<String>) {
        let mut txn = ReadTransaction::new(client);
        let mut waiting = Vec::new();
        for key in keys {
            if self.is_key_pending(&key) {
                waiting.push(key.clone());
                txn.add_pending(key);
            } else {
                let stored = self.store.get(&key).cloned();
                txn.add_resolved(key, stored);
            }
        }

        if txn.is_ready() {
            debug!(replica = %self.addr, client = %client.addr, "served read");
            self.send(client.addr, txn.into_reply());
            return;
        }

        let read_id = self.next_read;
        self.next_read += 1;
        debug!(
            replica = %self.addr,
            client = %client.addr,
            keys = ?waiting,
            "deferred read behind writes in flight"
        );
        for key in waiting {
            self.read_buffer.entry(key).or_default().push(read_id);
        }
        self.reads.insert(read_id, txn);
    }

    /// A key is pending while any write to it is accepted but not applied.
    pub fn is_key_pending(&self, key: &str) -> bool {
        self.ack_buffer.values().any(|pending| pending.touches(key))
            || self.write_buffer.values().any(|write| write.touches(key))
    }

    fn complete_if_durable(&mut self, id: WriteId) {
        let replica_count = self.replica_count();
        let durable = self
            .ack_buffer
            .get(&id)
            .is_some_and(|pending| pending.is_complete(replica_count));
        if !durable {
            return;
        }
        let Some(pending) = self.ack_buffer.remove(&id) else {
            return;
        };
        info!(replica = %self.addr, %id, "write is durable on every replica");

        if !self.order_on_write {
            if let Some(client) = pending.client {
                self.send_write_result(client, pending.keys.clone(), pending.values.clone());
            }
        }
        self.write_buffer.insert(
            id,
            BufferedWrite {
                keys: pending.keys,
                values: pending.values,
                client: pending.client,
            },
        );
        self.notify_leader(id);
    }

    fn notify_leader(&mut self, id: WriteId) {
        if self.is_leader() {
            self.handle_client_write_ack(self.addr, id);
        } else {
            self.send(self.leader, Message::ClientWriteAck { id });
        }
    }

    fn apply(&mut self, id: WriteId, write: BufferedWrite) {
        let index = self.next_index;
        for (key, value) in write.keys.iter().zip(&write.values) {
            self.store.put(key.clone(), value.clone(), index);
        }
        self.next_index += 1;
        debug!(replica = %self.addr, %id, index, keys = ?write.keys, "applied write");

        if self.order_on_write {
            if let Some(client) = write.client {
                self.send_write_result(client, write.keys.clone(), write.values.clone());
            }
        }
        for key in &write.keys {
            self.resolve_reads(key);
        }
    }

    fn resolve_reads(&mut self, key: &str) {
        if self.is_key_pending(key) {
            return;
        }
        let Some(waiting) = self.read_buffer.remove(key) else {
            return;
        };
        let stored = self.store.get(key).cloned();
        for read_id in waiting {
            let ready = match self.reads.get_mut(&read_id) {
                Some(txn) => txn.resolve(key, stored.clone()),
                None => false,
            };
            if !ready {
                continue;
            }
            if let Some(txn) = self.reads.remove(&read_id) {
                let client = txn.client();
                debug!(replica = %self.addr, client = %client.addr, "served deferred read");
                self.send(client.addr, txn.into_reply());
            }
        }
    }

    fn send_write_result(&mut self, client: Requester, keys: Vec<String>, values: Vec<String>) {
        self.send(
            client.addr,
            Message::WriteResult {
                key: keys,
                value: values,
                request: client.request,
            },
        );
    }

    fn send(&mut self, to: SocketAddr, message: Message) {
        self.outbox.push(Outgoing {
            to: Destination::Node(to),
            message,
        });
    }

    fn send_to_peers(&mut self, message: Message) {
        if self.peers.is_empty() {
            return;
        }
        self.outbox.push(Outgoing {
            to: Destination::Peers,
            message,
        });
    }
}
