//! geolock - a distributed lock service spanning multiple regions.
//!
//! Each region runs its own Raft cluster that orders lock commands and
//! issues fencing tokens. An acquisition committed in one region only
//! counts once a majority of all regions has voted for it, so a lock id has
//! at most one holder worldwide even when regions are partitioned.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │  Client API: LockService (acquire/release/extend/check)    │
//! ├────────────────────────────────────────────────────────────┤
//! │  Cross-region: QuorumManager (votes | shadow copies)       │
//! ├────────────────────────────────────────────────────────────┤
//! │  Regional: RaftNode → LockStateMachine → LockStore         │
//! ├────────────────────────────────────────────────────────────┤
//! │  Storage: append-only raft log | fencing token counters    │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use geolock::config::GeolockConfig;
//!
//! #[tokio::main]
//! async fn main() -> geolock::Result<()> {
//!     // Single node, single region, in-memory log
//!     let config = GeolockConfig::development();
//!     geolock::run(config).await
//! }
//! ```

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod lock;
pub mod observability;
pub mod quorum;
pub mod raft;
pub mod server;
pub mod shutdown;
pub mod types;

// Re-exports
pub use error::{GeolockError, Result};
pub use types::*;

use config::GeolockConfig;
use shutdown::{ShutdownCoordinator, SignalHandler};
use tracing::{error, info, warn};

/// Run a geolock node with the given configuration until a shutdown
/// signal arrives.
pub async fn run(config: GeolockConfig) -> Result<()> {
    config.validate()?;
    observability::init(&config.observability)?;

    if let Some(dir) = &config.node.data_dir {
        std::fs::create_dir_all(dir)?;
    }

    let coordinator = ShutdownCoordinator::new();

    let metrics = if config.observability.metrics_enabled {
        let obs_config = config.observability.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = observability::run_metrics_server(obs_config).await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    let signal_coordinator = coordinator.clone();
    tokio::spawn(async move {
        SignalHandler::new(signal_coordinator).run().await;
    });

    let grace = coordinator.timeout();
    let mut server = tokio::spawn(server::run_server(config, coordinator.clone()));

    let outcome = tokio::select! {
        joined = &mut server => Some(joined),
        _ = coordinator.wait_for_shutdown() => None,
    };

    let outcome = match outcome {
        Some(joined) => joined,
        None => {
            info!("Shutting down geolock gracefully...");
            match tokio::time::timeout(grace, server).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!("Server did not stop within {:?}", grace);
                    Ok(Ok(()))
                }
            }
        }
    };

    if let Some(metrics) = metrics {
        metrics.abort();
    }

    match outcome {
        Ok(result) => result?,
        Err(e) => error!("Server task failed: {}", e),
    }

    info!("Geolock shutdown complete");
    Ok(())
}
