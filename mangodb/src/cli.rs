use std::{net::SocketAddr, time::Duration};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use crate::{client::ClientConfig, node::NodeConfig, topology::Topology};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one replica of the store.
    Node(NodeArgs),
    /// Send a single request to the replicas.
    Client(ClientArgs),
    /// Start a local cluster, write a key five times, read it back and stop.
    Demo(DemoArgs),
}

#[derive(Args, Debug, Clone)]
pub struct NodeArgs {
    /// Address this replica binds and is known by. Must be a member.
    #[arg(long)]
    pub listen: SocketAddr,

    /// Every replica in the cluster, this one included.
    #[arg(
        long = "member",
        env = "MANGODB_MEMBERS",
        value_delimiter = ',',
        required = true
    )]
    pub members: Vec<SocketAddr>,

    /// Replica that assigns the order of writes. Defaults to the last member.
    #[arg(long)]
    pub leader: Option<SocketAddr>,

    /// Reply to clients only after their write is applied here.
    #[arg(long)]
    pub order_on_write: bool,

    /// Sleep this many milliseconds before every receive.
    #[arg(long, value_name = "MILLIS")]
    pub receive_delay: Option<u64>,
}

impl NodeArgs {
    pub fn node_config(&self) -> Result<NodeConfig> {
        let leader = match self.leader {
            Some(leader) => leader,
            None => *self.members.last().context("at least one --member is required")?,
        };
        let topology = Topology::new(self.members.clone(), leader)?;
        anyhow::ensure!(
            topology.contains(self.listen),
            "--listen {} is not one of the members",
            self.listen
        );
        Ok(NodeConfig {
            addr: self.listen,
            topology,
            order_on_write: self.order_on_write,
            receive_delay: self.receive_delay.map(Duration::from_millis),
        })
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Replicas the client may talk to.
    #[arg(
        long = "host",
        env = "MANGODB_MEMBERS",
        value_delimiter = ',',
        required = true
    )]
    pub hosts: Vec<SocketAddr>,

    /// Seconds to wait for a reply before redirecting to another replica.
    #[arg(long, default_value_t = 5)]
    pub timeout: u64,

    #[command(subcommand)]
    pub request: Request,
}

impl ClientArgs {
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig::new(self.hosts.clone()).with_timeout(Duration::from_secs(self.timeout))
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Request {
    /// Write key-value pairs as one write.
    Write {
        #[arg(long = "key", required = true)]
        keys: Vec<String>,
        #[arg(long = "value", required = true)]
        values: Vec<String>,
        /// Replica to send the write to. Random when omitted.
        #[arg(long)]
        to: Option<SocketAddr>,
    },
    /// Read one or more keys.
    Read {
        #[arg(long = "key", required = true)]
        keys: Vec<String>,
        #[arg(long)]
        to: Option<SocketAddr>,
    },
    /// Stop every replica, or only the one given.
    Exit {
        #[arg(long)]
        to: Option<SocketAddr>,
    },
}

#[derive(Args, Debug, Clone)]
pub struct DemoArgs {
    #[arg(long, default_value_t = 3)]
    pub followers: usize,

    #[arg(long)]
    pub order_on_write: bool,
}
