//! Core type definitions shared across the lock manager.
//!
//! # Type Aliases
//!
//! - [`NodeId`] = `u64`: member of a regional Raft cluster
//! - [`Term`] = `u64`: Raft term number
//! - [`LogIndex`] = `u64`: Raft log position
//! - [`RegionId`] = `String`: name of a region
//!
//! # Topology
//!
//! Cluster members and peer regions are configured as comma-separated
//! `id:host:port` lists. Malformed entries are logged and skipped.
//!
//! ```rust
//! use geolock::types::{parse_cluster_nodes, LockId};
//!
//! let nodes = parse_cluster_nodes("1:10.0.0.1:7000, 2:10.0.0.2:7000, bogus", 1);
//! assert_eq!(nodes.len(), 1);
//! assert_eq!(nodes[0].id, 2);
//!
//! assert!(LockId::parse("0b6f1a52-8f5d-4e55-9a7e-3f2d4c1b0a99").is_ok());
//! assert!(LockId::parse("invalid-lock-id").is_err());
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a node in a regional cluster.
pub type NodeId = u64;

/// Raft term number.
pub type Term = u64;

/// Raft log index.
pub type LogIndex = u64;

/// Region name, e.g. `us-east`.
pub type RegionId = String;

/// Canonical lock identifier: a hyphenated, 36-character UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LockId(Uuid);

impl LockId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a lock id, accepting only the canonical hyphenated form.
    ///
    /// `Uuid::parse_str` also accepts simple, braced and URN forms, which
    /// would let two spellings of one id map to distinct locks.
    pub fn parse(s: &str) -> Result<Self, String> {
        if s.len() != 36 {
            return Err(format!("lock id must be a 36-character UUID, got {:?}", s));
        }
        Uuid::try_parse(s)
            .map(Self)
            .map_err(|e| format!("invalid lock id {:?}: {}", s, e))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for LockId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl TryFrom<String> for LockId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<LockId> for String {
    fn from(id: LockId) -> Self {
        id.to_string()
    }
}

/// A member of the local Raft cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNode {
    pub id: NodeId,
    pub host: String,
    pub port: u16,
}

impl ClusterNode {
    /// Parse an `id:host:port` spec.
    pub fn parse(spec: &str) -> Option<Self> {
        let (id, host, port) = split_peer_spec(spec)?;
        Some(Self {
            id: id.parse().ok()?,
            host,
            port,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A peer region participating in cross-region quorum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRegion {
    pub region_id: RegionId,
    pub host: String,
    pub port: u16,
}

impl PeerRegion {
    /// Parse a `regionId:host:port` spec.
    pub fn parse(spec: &str) -> Option<Self> {
        let (region_id, host, port) = split_peer_spec(spec)?;
        Some(Self {
            region_id: region_id.to_string(),
            host,
            port,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Split `id:host:port`. The host may itself contain colons (IPv6), so the
/// id is taken from the front and the port from the back.
fn split_peer_spec(spec: &str) -> Option<(&str, String, u16)> {
    let spec = spec.trim();
    let (id, rest) = spec.split_once(':')?;
    let (host, port) = rest.rsplit_once(':')?;
    if id.is_empty() || host.is_empty() {
        return None;
    }
    let port = port.parse().ok()?;
    Some((id, host.trim_matches(|c| c == '[' || c == ']').to_string(), port))
}

/// Parse a comma-separated `nodeId:host:port` list, excluding `self_id`.
pub fn parse_cluster_nodes(specs: &str, self_id: NodeId) -> Vec<ClusterNode> {
    specs
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .filter_map(|s| match ClusterNode::parse(s) {
            Some(node) => Some(node),
            None => {
                tracing::warn!(spec = s.trim(), "Skipping malformed cluster node spec");
                None
            }
        })
        .filter(|node| node.id != self_id)
        .collect()
}

/// Parse a comma-separated `regionId:host:port` list, excluding `self_region`.
pub fn parse_peer_regions(specs: &str, self_region: &str) -> Vec<PeerRegion> {
    specs
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .filter_map(|s| match PeerRegion::parse(s) {
            Some(region) => Some(region),
            None => {
                tracing::warn!(spec = s.trim(), "Skipping malformed peer region spec");
                None
            }
        })
        .filter(|region| region.region_id != self_region)
        .collect()
}
