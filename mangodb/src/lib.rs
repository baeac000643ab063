//! Replicated key-value store over UDP.
//!
//! Every replica keeps a full copy of the data. A client write is first made
//! durable on every replica, then the leader gives it a place in one global
//! order, and finally each replica applies writes strictly in that order.
//! Reads of a key wait while a write to it is still in flight.
//!
//! - [`replica`] is the protocol state machine. It performs no I/O.
//! - [`node`] drives a replica from a UDP socket on a tokio task.
//! - [`client`] sends requests and waits for replies with a bounded timeout.
//! - [`cluster`] runs a whole cluster in one process on loopback sockets.
//! - [`message`] is the JSON wire format, one message per datagram.
//! - [`pending`], [`read`], [`store`] and [`leader`] hold the per-write,
//!   per-read, per-key and ordering state the replica is built from.
//! - [`topology`] and [`cli`] carry configuration, [`error`] the typed errors.

pub mod cli;
pub mod client;
pub mod cluster;
pub mod error;
pub mod leader;
pub mod message;
pub mod node;
pub mod pending;
pub mod read;
pub mod replica;
pub mod store;
pub mod topology;
