//! Configuration for a geolock node.
//!
//! Loaded from a JSON file and overridden by command-line flags. Peer lists
//! use the comma-separated `id:host:port` form; malformed entries are
//! logged and skipped rather than failing startup.

use crate::error::{GeolockError, Result};
use crate::raft::RaftConfig;
use crate::types::{parse_cluster_nodes, parse_peer_regions, ClusterNode, PeerRegion};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for a geolock node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeolockConfig {
    pub node: NodeConfig,
    pub raft: RaftSettings,
    pub region: RegionConfig,
    pub lock: LockConfig,
    pub network: NetworkConfig,
    pub observability: ObservabilityConfig,
}

impl GeolockConfig {
    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            GeolockError::Config(format!("Failed to read config file: {}", e))
        })?;

        let config: Self = serde_json::from_str(&content).map_err(|e| {
            GeolockError::Config(format!("Failed to parse config: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.node.id == 0 {
            return Err(GeolockError::InvalidConfig {
                field: "node.id".to_string(),
                reason: "Node ID must be non-zero".to_string(),
            });
        }

        if self.region.region_id.trim().is_empty() {
            return Err(GeolockError::InvalidConfig {
                field: "region.region_id".to_string(),
                reason: "Region ID must not be empty".to_string(),
            });
        }

        if self.raft.heartbeat_interval >= self.raft.election_timeout {
            return Err(GeolockError::InvalidConfig {
                field: "raft.heartbeat_interval".to_string(),
                reason: "Heartbeat interval must be shorter than the election timeout".to_string(),
            });
        }

        let lock = &self.lock;
        if lock.min_timeout_ms == 0
            || lock.min_timeout_ms > lock.default_timeout_ms
            || lock.default_timeout_ms > lock.max_timeout_ms
        {
            return Err(GeolockError::InvalidConfig {
                field: "lock".to_string(),
                reason: format!(
                    "Timeouts must satisfy 0 < min ({}) <= default ({}) <= max ({})",
                    lock.min_timeout_ms, lock.default_timeout_ms, lock.max_timeout_ms
                ),
            });
        }

        Ok(())
    }

    /// Single-node, single-region configuration with in-memory storage.
    pub fn development() -> Self {
        Self {
            node: NodeConfig {
                id: 1,
                bind_addr: SocketAddr::from(([127, 0, 0, 1], 7070)),
                data_dir: None,
                sync_writes: false,
            },
            raft: RaftSettings::default(),
            region: RegionConfig {
                region_id: "local".to_string(),
                ..RegionConfig::default()
            },
            lock: LockConfig::default(),
            network: NetworkConfig::default(),
            observability: ObservabilityConfig {
                metrics_enabled: false,
                ..ObservabilityConfig::default()
            },
        }
    }

    /// Members of the local Raft cluster, excluding this node.
    pub fn raft_peers(&self) -> Vec<ClusterNode> {
        parse_cluster_nodes(&self.raft.peers, self.node.id)
    }

    /// Peer regions, excluding our own.
    pub fn peer_regions(&self) -> Vec<PeerRegion> {
        parse_peer_regions(&self.region.peers, &self.region.region_id)
    }

    pub fn raft_config(&self) -> RaftConfig {
        RaftConfig {
            node_id: self.node.id,
            peers: self
                .raft_peers()
                .into_iter()
                .map(|node| (node.id, node.addr()))
                .collect(),
            election_timeout: self.raft.election_timeout,
            heartbeat_interval: self.raft.heartbeat_interval,
            submit_timeout: self.raft.submit_timeout,
            rpc_timeout: self.raft.rpc_timeout,
            max_entries_per_append: self.raft.max_entries_per_append,
        }
    }
}

/// Node-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Unique node identifier within the region.
    pub id: u64,
    /// Address serving the public, raft and region endpoints.
    pub bind_addr: SocketAddr,
    /// Directory for the raft log and state. In-memory when unset.
    pub data_dir: Option<PathBuf>,
    /// fsync every raft write.
    pub sync_writes: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: 1,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 7070)),
            data_dir: Some(PathBuf::from("/var/lib/geolock")),
            sync_writes: true,
        }
    }
}

/// Raft settings for the regional cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftSettings {
    /// Comma-separated `nodeId:host:port` list. May include this node.
    pub peers: String,
    /// Base election timeout; the effective timeout is drawn from [T, 2T].
    #[serde(with = "humantime_serde")]
    pub election_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub submit_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub rpc_timeout: Duration,
    pub max_entries_per_append: usize,
}

impl Default for RaftSettings {
    fn default() -> Self {
        let defaults = RaftConfig::default();
        Self {
            peers: String::new(),
            election_timeout: defaults.election_timeout,
            heartbeat_interval: defaults.heartbeat_interval,
            submit_timeout: defaults.submit_timeout,
            rpc_timeout: defaults.rpc_timeout,
            max_entries_per_append: defaults.max_entries_per_append,
        }
    }
}

/// Cross-region settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionConfig {
    pub region_id: String,
    /// Comma-separated `regionId:host:port` list. May include this region.
    pub peers: String,
    /// Upper bound on a quorum round. Also how long a granted vote
    /// reserves a lock id for the requester.
    #[serde(with = "humantime_serde")]
    pub quorum_timeout: Duration,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            region_id: "default".to_string(),
            peers: String::new(),
            quorum_timeout: Duration::from_secs(2),
        }
    }
}

/// Lock timeout bounds, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub default_timeout_ms: u64,
    pub min_timeout_ms: u64,
    pub max_timeout_ms: u64,
    /// Period of the expired-lock sweep. Zero disables it; expiry is
    /// still enforced on read.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            min_timeout_ms: 1_000,
            max_timeout_ms: 300_000,
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl LockConfig {
    /// Missing or zero means the default; anything else is clamped to
    /// [min, max].
    pub fn normalize_timeout(&self, requested: Option<u64>) -> u64 {
        match requested {
            None | Some(0) => self.default_timeout_ms,
            Some(ms) => ms.clamp(self.min_timeout_ms, self.max_timeout_ms),
        }
    }
}

/// Outbound HTTP settings for raft and region traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(500),
            request_timeout: Duration::from_secs(2),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics.
    pub metrics_enabled: bool,
    /// Metrics bind address.
    pub metrics_addr: SocketAddr,
    /// Log level.
    pub log_level: String,
    /// Enable JSON logging.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Serde helper for Duration using humantime format.
pub mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    /// Parse `150ms`, `5s`, `2m`, or a bare millisecond count.
    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        } else if let Some(s_val) = s.strip_suffix('s') {
            s_val
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| e.to_string())
        } else if let Some(m) = s.strip_suffix('m') {
            m.parse::<u64>()
                .map(|v| Duration::from_secs(v * 60))
                .map_err(|e| e.to_string())
        } else {
            s.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        }
    }
}
