//! Command-line interface for geolock.

use crate::config::{humantime_serde::parse_duration, GeolockConfig};
use crate::error::{GeolockError, Result};
use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

/// geolock - a cross-region distributed lock service.
#[derive(Parser)]
#[command(name = "geolock")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "GEOLOCK_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "GEOLOCK_LOG_LEVEL", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Start a geolock node
    Server(ServerArgs),

    /// Lock operations against a running node
    Lock {
        /// Node address
        #[arg(short, long, env = "GEOLOCK_ADDR", default_value = "127.0.0.1:7070")]
        addr: String,

        #[command(subcommand)]
        command: LockCommands,
    },

    /// Show raft and region status of a node
    Status {
        /// Node address
        #[arg(short, long, env = "GEOLOCK_ADDR", default_value = "127.0.0.1:7070")]
        addr: String,
    },

    /// Show version information
    Version,
}

/// Flags for `geolock server`. Each one overrides the config file.
#[derive(Args, Debug, Default)]
pub struct ServerArgs {
    /// Node ID within the region
    #[arg(short, long, env = "GEOLOCK_NODE_ID")]
    pub node_id: Option<u64>,

    /// Listen address for client, raft and region traffic
    #[arg(long, env = "GEOLOCK_BIND_ADDR")]
    pub bind_addr: Option<String>,

    /// Directory for the raft log and state
    #[arg(long, env = "GEOLOCK_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Raft peers in this region (format: id:host:port,id:host:port)
    #[arg(long, env = "GEOLOCK_RAFT_PEERS")]
    pub raft_peers: Option<String>,

    /// This region's ID
    #[arg(long, env = "GEOLOCK_REGION")]
    pub region: Option<String>,

    /// Peer regions (format: region:host:port,region:host:port)
    #[arg(long, env = "GEOLOCK_REGION_PEERS")]
    pub region_peers: Option<String>,

    /// Quorum round timeout, e.g. "2s"
    #[arg(long, env = "GEOLOCK_QUORUM_TIMEOUT")]
    pub quorum_timeout: Option<String>,

    /// Election timeout, e.g. "150ms"
    #[arg(long, env = "GEOLOCK_ELECTION_TIMEOUT")]
    pub election_timeout: Option<String>,

    /// Heartbeat interval, e.g. "50ms"
    #[arg(long, env = "GEOLOCK_HEARTBEAT_INTERVAL")]
    pub heartbeat_interval: Option<String>,

    /// Prometheus metrics address
    #[arg(long, env = "GEOLOCK_METRICS_ADDR")]
    pub metrics_addr: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    pub json_logs: bool,
}

impl ServerArgs {
    /// Apply the flags that were given on top of `config`.
    pub fn apply(&self, config: &mut GeolockConfig) -> Result<()> {
        if let Some(id) = self.node_id {
            config.node.id = id;
        }
        if let Some(addr) = &self.bind_addr {
            config.node.bind_addr = parse_addr("bind_addr", addr)?;
        }
        if let Some(dir) = &self.data_dir {
            config.node.data_dir = Some(dir.clone());
        }
        if let Some(peers) = &self.raft_peers {
            config.raft.peers = peers.clone();
        }
        if let Some(region) = &self.region {
            config.region.region_id = region.clone();
        }
        if let Some(peers) = &self.region_peers {
            config.region.peers = peers.clone();
        }
        if let Some(timeout) = &self.quorum_timeout {
            config.region.quorum_timeout = parse_flag_duration("quorum_timeout", timeout)?;
        }
        if let Some(timeout) = &self.election_timeout {
            config.raft.election_timeout = parse_flag_duration("election_timeout", timeout)?;
        }
        if let Some(interval) = &self.heartbeat_interval {
            config.raft.heartbeat_interval = parse_flag_duration("heartbeat_interval", interval)?;
        }
        if let Some(addr) = &self.metrics_addr {
            config.observability.metrics_addr = parse_addr("metrics_addr", addr)?;
            config.observability.metrics_enabled = true;
        }
        if self.json_logs {
            config.observability.json_logs = true;
        }
        Ok(())
    }
}

/// Lock subcommands.
#[derive(Subcommand)]
pub enum LockCommands {
    /// Acquire a lock
    Acquire {
        /// Lock ID (UUID)
        lock_id: String,

        /// Client identity to hold the lock as
        #[arg(long, env = "GEOLOCK_CLIENT_ID")]
        client_id: String,

        /// Lock timeout in milliseconds
        #[arg(short, long)]
        timeout_ms: Option<u64>,
    },

    /// Release a lock
    Release {
        /// Lock ID (UUID)
        lock_id: String,

        #[arg(long, env = "GEOLOCK_CLIENT_ID")]
        client_id: String,

        /// Fencing token returned by acquire
        #[arg(short, long)]
        fencing_token: u64,
    },

    /// Extend a held lock
    Extend {
        /// Lock ID (UUID)
        lock_id: String,

        #[arg(long, env = "GEOLOCK_CLIENT_ID")]
        client_id: String,

        /// Fencing token returned by acquire
        #[arg(short, long)]
        fencing_token: u64,

        /// New timeout in milliseconds, counted from now
        #[arg(short, long)]
        timeout_ms: Option<u64>,
    },

    /// Show the current holder of a lock
    Check {
        /// Lock ID (UUID)
        lock_id: String,
    },

    /// List held locks
    List,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

fn parse_addr(field: &str, value: &str) -> Result<SocketAddr> {
    value.parse().map_err(|e| GeolockError::InvalidConfig {
        field: field.to_string(),
        reason: format!("{}: {}", value, e),
    })
}

fn parse_flag_duration(field: &str, value: &str) -> Result<std::time::Duration> {
    parse_duration(value).map_err(|reason| GeolockError::InvalidConfig {
        field: field.to_string(),
        reason,
    })
}
