//! UDP transport and receive loop for a replica.
//!
//! Each node is one task owning its socket and its [`Replica`]. Messages are
//! handled strictly one at a time in arrival order, so the replica state needs
//! no locks. The loop ends when an `exit` message arrives or the shutdown
//! future passed to [`Node::run_until`] resolves.

use std::{future::Future, net::SocketAddr, time::Duration};

use anyhow::{Context, Result};
use tokio::{net::UdpSocket, select};
use tracing::{debug, info, warn};

use crate::{
    message::{decode, encode, Message, MAX_DATAGRAM},
    replica::{Destination, Outgoing, Replica},
    topology::Topology,
};

/// Everything a node needs to know at construction time.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Address this node binds and is known by.
    pub addr: SocketAddr,
    pub topology: Topology,
    /// Reply to clients only once their write is applied.
    pub order_on_write: bool,
    /// Sleep before every receive. Only useful to provoke reordering in tests.
    pub receive_delay: Option<Duration>,
}

impl NodeConfig {
    pub fn new(addr: SocketAddr, topology: Topology) -> Self {
        Self {
            addr,
            topology,
            order_on_write: false,
            receive_delay: None,
        }
    }
}

/// The socket side of a node: encoding, sending, and the optional receive delay.
struct Transport {
    socket: UdpSocket,
    receive_delay: Option<Duration>,
}

impl Transport {
    async fn send(&self, to: SocketAddr, message: &Message) {
        let bytes = match encode(message) {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(peer = %to, kind = message.kind(), %error, "failed to encode message");
                return;
            }
        };
        if let Err(error) = self.socket.send_to(&bytes, to).await {
            warn!(peer = %to, kind = message.kind(), %error, "failed to send message");
        }
    }

    async fn send_to_all(&self, peers: &[SocketAddr], message: &Message) {
        for &peer in peers {
            self.send(peer, message).await;
        }
    }

    async fn receive(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        if let Some(delay) = self.receive_delay {
            tokio::time::sleep(delay).await;
        }
        self.socket.recv_from(buf).await
    }

    async fn dispatch(&self, peers: &[SocketAddr], outgoing: Vec<Outgoing>) {
        for Outgoing { to, message } in outgoing {
            match to {
                Destination::Node(addr) => self.send(addr, &message).await,
                Destination::Peers => self.send_to_all(peers, &message).await,
            }
        }
    }
}

pub struct Node {
    transport: Transport,
    replica: Replica,
}

impl Node {
    /// Binds `config.addr` and builds the replica behind it.
    pub async fn bind(config: NodeConfig) -> Result<Self> {
        let socket = UdpSocket::bind(config.addr)
            .await
            .with_context(|| format!("failed to bind {}", config.addr))?;
        Self::from_socket(socket, config)
    }

    /// Wraps an already bound socket, e.g. one bound to an ephemeral port.
    pub fn from_socket(socket: UdpSocket, config: NodeConfig) -> Result<Self> {
        let replica = Replica::new(config.addr, &config.topology, config.order_on_write)?;
        info!(
            replica = %config.addr,
            leader = replica.is_leader(),
            members = ?config.topology.members(),
            "node constructed"
        );
        Ok(Self {
            transport: Transport {
                socket,
                receive_delay: config.receive_delay,
            },
            replica,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.transport.socket.local_addr()
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    /// Sends one message. Delivery is best effort: failures are logged only.
    pub async fn send(&self, to: SocketAddr, message: &Message) {
        self.transport.send(to, message).await;
    }

    /// Sends one message to every other replica.
    pub async fn send_to_all(&self, message: &Message) {
        self.transport
            .send_to_all(self.replica.peers(), message)
            .await;
    }

    /// Runs until an `exit` message arrives and returns the replica state.
    pub async fn run(self) -> Result<Replica> {
        self.run_until(std::future::pending()).await
    }

    /// Like [`Node::run`], but sleeps for `delay` before every receive.
    pub async fn run_delayed(mut self, delay: Duration) -> Result<Replica> {
        self.transport.receive_delay = Some(delay);
        self.run().await
    }

    pub async fn run_until_ctrl_c(self) -> Result<Replica> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Runs until an `exit` message arrives or `shutdown` resolves.
    pub async fn run_until<F>(self, shutdown: F) -> Result<Replica>
    where
        F: Future<Output = ()> + Send,
    {
        let Node {
            transport,
            mut replica,
        } = self;
        tokio::pin!(shutdown);

        let mut buf = vec![0u8; MAX_DATAGRAM];
        info!(replica = %replica.addr(), "node started");
        loop {
            let (len, from) = select! {
                _ = &mut shutdown => {
                    info!(replica = %replica.addr(), "shutdown requested");
                    break;
                }
                received = transport.receive(&mut buf) => match received {
                    Ok(received) => received,
                    Err(error) => {
                        warn!(replica = %replica.addr(), %error, "receive failed");
                        continue;
                    }
                },
            };

            let message = match decode(&buf[..len]) {
                Ok(message) => message,
                Err(error) => {
                    warn!(
                        replica = %replica.addr(),
                        peer = %from,
                        %error,
                        "dropping malformed datagram"
                    );
                    continue;
                }
            };
            debug!(
                replica = %replica.addr(),
                peer = %from,
                kind = message.kind(),
                "received message"
            );

            let effects = replica.on_message(from, message);
            transport.dispatch(replica.peers(), effects.outgoing).await;
            if effects.exit {
                break;
            }
        }

        info!(replica = %replica.addr(), "node stopped");
        Ok(replica)
    }
}
