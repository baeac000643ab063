use std::net::SocketAddr;

use anyhow::{ensure, Result};

/// Fixed cluster membership: every replica address and which one leads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    members: Vec<SocketAddr>,
    leader: SocketAddr,
}

impl Topology {
    pub fn new(members: Vec<SocketAddr>, leader: SocketAddr) -> Result<Self> {
        ensure!(!members.is_empty(), "topology requires at least one replica");
        ensure!(
            members.contains(&leader),
            "leader {leader} is not a member of the topology"
        );
        for (i, member) in members.iter().enumerate() {
            ensure!(
                !members[..i].contains(member),
                "replica {member} is listed twice"
            );
        }
        Ok(Self { members, leader })
    }

    pub fn members(&self) -> &[SocketAddr] {
        &self.members
    }

    pub fn leader(&self) -> SocketAddr {
        self.leader
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, addr: SocketAddr) -> bool {
        self.members.contains(&addr)
    }

    /// Every replica except `addr`.
    pub fn peers_of(&self, addr: SocketAddr) -> Vec<SocketAddr> {
        self.members
            .iter()
            .copied()
            .filter(|member| *member != addr)
            .collect()
    }
}
