//! Logging and metrics.

use crate::config::ObservabilityConfig;
use crate::error::{GeolockError, Result};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize logging. `RUST_LOG` overrides the configured level.
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| GeolockError::Internal(format!("Failed to init logging: {}", e)))?;
    } else {
        subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| GeolockError::Internal(format!("Failed to init logging: {}", e)))?;
    }

    info!("Observability initialized");
    Ok(())
}

/// Run the Prometheus metrics server.
pub async fn run_metrics_server(config: ObservabilityConfig) -> Result<()> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| GeolockError::Internal(format!("Failed to install metrics recorder: {}", e)))?;

    register_metrics();

    let app = axum::Router::new()
        .route("/metrics", axum::routing::get(move || async move { handle.render() }))
        .route("/health", axum::routing::get(|| async { "OK" }));

    let listener = TcpListener::bind(config.metrics_addr).await?;
    info!(addr = %config.metrics_addr, "Metrics server listening");

    axum::serve(listener, app)
        .await
        .map_err(|e| GeolockError::Network(e.to_string()))?;

    Ok(())
}

fn register_metrics() {
    gauge!("geolock_raft_term").set(0.0);
    gauge!("geolock_raft_commit_index").set(0.0);
    gauge!("geolock_raft_is_leader").set(0.0);
    counter!("geolock_raft_elections_total").absolute(0);
    gauge!("geolock_locks_active").set(0.0);
    counter!("geolock_locks_expired_purged_total").absolute(0);
}

/// Record the outcome of a client-facing lock operation.
pub fn record_lock_op(op: &'static str, status: &'static str) {
    counter!("geolock_lock_ops_total", "op" => op, "status" => status).increment(1);
}

/// Record the outcome of a cross-region quorum round.
pub fn record_quorum(granted: bool, votes: usize) {
    let outcome = if granted { "granted" } else { "failed" };
    counter!("geolock_quorum_rounds_total", "outcome" => outcome).increment(1);
    gauge!("geolock_quorum_last_votes").set(votes as f64);
}

pub fn record_election() {
    counter!("geolock_raft_elections_total").increment(1);
}

pub fn update_raft_metrics(term: u64, commit_index: u64, is_leader: bool) {
    gauge!("geolock_raft_term").set(term as f64);
    gauge!("geolock_raft_commit_index").set(commit_index as f64);
    gauge!("geolock_raft_is_leader").set(if is_leader { 1.0 } else { 0.0 });
}

pub fn update_lock_metrics(active: usize, purged: usize) {
    gauge!("geolock_locks_active").set(active as f64);
    counter!("geolock_locks_expired_purged_total").increment(purged as u64);
}
