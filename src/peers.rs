//! Peer resolution for the master quorum.
//!
//! A master learns its peers from a raw comma-separated list. The resolved
//! set always contains this node and must have an odd number of members so
//! that a majority always exists.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{MasterError, Result};

/// `host:port` identity of a master, as it appears in the peer list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeAddress(String);

impl NodeAddress {
    pub fn new(host: &str, port: u16) -> Self {
        Self(format!("{}:{}", host, port))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split into host and port. Fails if the port is missing or not numeric.
    pub fn host_port(&self) -> Result<(&str, u16)> {
        let (host, port) = self
            .0
            .rsplit_once(':')
            .ok_or_else(|| MasterError::InvalidAddress(self.0.clone()))?;
        let port = port
            .parse()
            .map_err(|_| MasterError::InvalidAddress(self.0.clone()))?;
        Ok((host, port))
    }
}

impl From<&str> for NodeAddress {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeAddress {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Every master taking part in consensus, including this one.
///
/// Built once by [`resolve_peers`] and never mutated. Cloning is cheap, so
/// consensus and management each hold their own handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSet(Arc<[NodeAddress]>);

impl PeerSet {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeAddress> {
        self.0.iter()
    }

    pub fn contains(&self, addr: &NodeAddress) -> bool {
        self.0.iter().any(|p| p == addr)
    }

    /// Peers other than `me`.
    pub fn others<'a>(&'a self, me: &'a NodeAddress) -> impl Iterator<Item = &'a NodeAddress> {
        self.0.iter().filter(move |p| *p != me)
    }

    /// Votes needed for a majority.
    pub fn quorum(&self) -> usize {
        self.0.len() / 2 + 1
    }

    pub fn to_strings(&self) -> Vec<String> {
        self.0.iter().map(|p| p.to_string()).collect()
    }
}

/// Resolve this master's address and the full peer set.
///
/// `raw_peers` is split on commas with entries kept verbatim. If the
/// computed self address is not among them it is appended. An even result
/// is rejected.
pub fn resolve_peers(
    self_ip: &str,
    self_port: u16,
    raw_peers: &str,
) -> Result<(NodeAddress, PeerSet)> {
    let self_address = NodeAddress::new(self_ip, self_port);

    let mut candidates: Vec<NodeAddress> = if raw_peers.is_empty() {
        Vec::new()
    } else {
        raw_peers.split(',').map(NodeAddress::from).collect()
    };

    {
        let mut seen = HashSet::new();
        for peer in &candidates {
            if !seen.insert(peer) {
                tracing::warn!(peer = %peer, "Peer listed more than once, keeping duplicate entry");
            }
        }
    }

    if !candidates.contains(&self_address) {
        candidates.push(self_address.clone());
    }

    if candidates.len() % 2 == 0 {
        return Err(MasterError::EvenQuorum {
            count: candidates.len(),
            peers: candidates.iter().map(|p| p.to_string()).collect(),
        });
    }

    Ok((self_address, PeerSet(candidates.into())))
}
