//! An in-process cluster on loopback sockets.
//!
//! Every replica runs as its own tokio task with a real UDP socket bound to an
//! ephemeral port. The followers come first and the leader is the last host,
//! the same layout the `node` subcommand expects from `--member` lists.

use std::{net::SocketAddr, time::Duration};

use anyhow::{anyhow, Context, Result};
use tokio::{net::UdpSocket, task::JoinHandle, time::timeout};
use tracing::{info, warn};

use crate::{
    client::{Client, ClientConfig, DEFAULT_TIMEOUT},
    node::{Node, NodeConfig},
    replica::Replica,
    topology::Topology,
};

/// How long [`LocalCluster::shutdown`] waits for each node to stop.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ClusterOptions {
    pub followers: usize,
    pub order_on_write: bool,
    /// Run the first follower with this delay before every receive.
    pub delayed_follower: Option<Duration>,
    pub client_timeout: Duration,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            followers: 3,
            order_on_write: false,
            delayed_follower: None,
            client_timeout: DEFAULT_TIMEOUT,
        }
    }
}

pub struct LocalCluster {
    hosts: Vec<SocketAddr>,
    tasks: Vec<JoinHandle<Result<Replica>>>,
    client_timeout: Duration,
}

impl LocalCluster {
    pub async fn spawn(options: ClusterOptions) -> Result<Self> {
        let mut sockets = Vec::with_capacity(options.followers + 1);
        for _ in 0..=options.followers {
            let socket = UdpSocket::bind("127.0.0.1:0")
                .await
                .context("failed to bind replica socket")?;
            sockets.push(socket);
        }
        let hosts = sockets
            .iter()
            .map(UdpSocket::local_addr)
            .collect::<std::io::Result<Vec<_>>>()?;
        let leader = *hosts.last().context("cluster has no replicas")?;
        let topology = Topology::new(hosts.clone(), leader)?;

        let mut tasks = Vec::with_capacity(sockets.len());
        let bound = sockets.into_iter().zip(hosts.iter().copied());
        for (position, (socket, addr)) in bound.enumerate() {
            let mut config = NodeConfig::new(addr, topology.clone());
            config.order_on_write = options.order_on_write;
            let node = Node::from_socket(socket, config)?;

            let task = match options.delayed_follower {
                Some(delay) if position == 0 && addr != leader => {
                    info!(replica = %addr, ?delay, "starting delayed follower");
                    tokio::spawn(node.run_delayed(delay))
                }
                _ => tokio::spawn(node.run()),
            };
            tasks.push(task);
        }

        info!(?hosts, %leader, "local cluster started");
        Ok(Self {
            hosts,
            tasks,
            client_timeout: options.client_timeout,
        })
    }

    /// Every replica address, followers first and the leader last.
    pub fn hosts(&self) -> &[SocketAddr] {
        &self.hosts
    }

    pub fn leader(&self) -> SocketAddr {
        // `spawn` always binds at least the leader.
        self.hosts[self.hosts.len() - 1]
    }

    pub fn followers(&self) -> &[SocketAddr] {
        &self.hosts[..self.hosts.len() - 1]
    }

    /// A fresh client that knows every replica.
    pub async fn client(&self) -> Result<Client> {
        let config = ClientConfig::new(self.hosts.clone()).with_timeout(self.client_timeout);
        Ok(Client::connect(config).await?)
    }

    /// Sends `exit` to every replica and returns their final states in
    /// [`LocalCluster::hosts`] order.
    pub async fn shutdown(mut self) -> Result<Vec<Replica>> {
        self.client().await?.exit().await?;

        let mut replicas = Vec::with_capacity(self.tasks.len());
        let tasks = std::mem::take(&mut self.tasks);
        for (addr, mut task) in self.hosts.clone().into_iter().zip(tasks) {
            match timeout(SHUTDOWN_GRACE, &mut task).await {
                Ok(joined) => {
                    let replica = joined.with_context(|| format!("node {addr} panicked"))??;
                    replicas.push(replica);
                }
                Err(_) => {
                    warn!(replica = %addr, "node ignored exit, aborting");
                    task.abort();
                    return Err(anyhow!("node {addr} did not stop within {SHUTDOWN_GRACE:?}"));
                }
            }
        }
        info!("local cluster stopped");
        Ok(replicas)
    }
}

impl Drop for LocalCluster {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
