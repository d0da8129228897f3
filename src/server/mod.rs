//! HTTP server for a region member.
//!
//! One listener serves the public lock API, raft traffic from the other
//! members of the region and vote/notification traffic from peer regions.

pub mod api;
mod network;

pub use network::{HttpRaftRpc, HttpRegionRpc};

use api::*;
use crate::config::GeolockConfig;
use crate::error::{GeolockError, Result};
use crate::lock::{
    FencingTokenGenerator, LockRaftHandle, LockService, LockStateMachine, LockStore,
};
use crate::quorum::{
    LockAcquiredNotification, LockReleasedNotification, LockVoteRequest, LockVoteResponse,
    QuorumManager, RegionRpc,
};
use crate::raft::{
    AppendEntriesRequest, AppendEntriesResponse, RaftNode, RaftRpc, RaftStorage,
    RequestVoteRequest, RequestVoteResponse,
};
use crate::shutdown::ShutdownCoordinator;
use crate::types::PeerRegion;
use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// The wired-up components of one region member.
pub struct RegionNode {
    pub service: Arc<LockService>,
    pub raft: LockRaftHandle,
    raft_task: JoinHandle<()>,
}

impl RegionNode {
    /// Stop the raft node and wait for its task to finish.
    pub async fn shutdown(self) {
        self.raft.shutdown().await;
        if let Err(e) = self.raft_task.await {
            warn!(error = %e, "Raft task ended abnormally");
        }
    }
}

/// Construct store, raft node, quorum manager and service over the given
/// transports, and start the raft node.
pub fn build_region_node_with(
    config: &GeolockConfig,
    raft_rpc: Arc<dyn RaftRpc>,
    region_rpc: Arc<dyn RegionRpc>,
) -> Result<RegionNode> {
    let tokens = Arc::new(FencingTokenGenerator::new());
    let store = Arc::new(LockStore::new(tokens));

    let storage = match &config.node.data_dir {
        Some(dir) => RaftStorage::open_with_sync(dir.join("raft"), config.node.sync_writes)?,
        None => {
            warn!("No data directory configured; raft state will not survive restart");
            RaftStorage::in_memory()
        }
    };

    let (node, raft) = RaftNode::new(
        config.raft_config(),
        storage,
        LockStateMachine::new(Arc::clone(&store)),
        raft_rpc,
    )?;
    let raft_task = tokio::spawn(node.run());

    let members = config
        .raft_peers()
        .into_iter()
        .map(|member| {
            let address = PeerRegion {
                region_id: config.region.region_id.clone(),
                host: member.host,
                port: member.port,
            };
            (member.id, address)
        })
        .collect();
    let quorum = Arc::new(
        QuorumManager::new(
            config.region.region_id.clone(),
            config.peer_regions(),
            Arc::clone(&store),
            raft.clone(),
            region_rpc,
            config.region.quorum_timeout,
        )
        .with_members(members),
    );

    let service = Arc::new(LockService::new(
        config.region.region_id.clone(),
        store,
        raft.clone(),
        quorum,
        config.lock.clone(),
    ));

    Ok(RegionNode {
        service,
        raft,
        raft_task,
    })
}

/// [`build_region_node_with`] over HTTP transports.
pub fn build_region_node(config: &GeolockConfig) -> Result<RegionNode> {
    let raft_rpc = Arc::new(HttpRaftRpc::new(config.raft_config().peers, &config.network));
    let region_rpc = Arc::new(HttpRegionRpc::new(&config.network));
    build_region_node_with(config, raft_rpc, region_rpc)
}

/// Build the router for a running region member.
pub fn router(service: Arc<LockService>) -> Router {
    Router::new()
        // Public lock API
        .route("/locks", get(handle_list))
        .route("/locks/acquire", post(handle_acquire))
        .route("/locks/release", post(handle_release))
        .route("/locks/extend", post(handle_extend))
        .route("/locks/check", post(handle_check))
        .route("/health", get(health_check))
        .route("/status", get(handle_status))
        // Raft RPC endpoints
        .route("/raft/request_vote", post(handle_request_vote))
        .route("/raft/append_entries", post(handle_append_entries))
        // Region endpoints
        .route("/region/vote", post(handle_region_vote))
        .route("/region/acquired", post(handle_region_acquired))
        .route("/region/released", post(handle_region_released))
        .with_state(service)
}

/// Run a region member until `shutdown` fires.
pub async fn run_server(config: GeolockConfig, shutdown: ShutdownCoordinator) -> Result<()> {
    info!(
        node_id = config.node.id,
        region = %config.region.region_id,
        "Starting geolock node"
    );

    let node = build_region_node(&config)?;
    let sweeper = node.service.spawn_sweeper(shutdown.watch());

    let listener = TcpListener::bind(config.node.bind_addr).await?;
    info!(addr = %config.node.bind_addr, "Lock server listening");

    let app = router(Arc::clone(&node.service));
    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { signal.wait_for_shutdown().await })
        .await
        .map_err(|e| GeolockError::Network(e.to_string()))?;

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
    node.shutdown().await;
    info!("Geolock node stopped");
    Ok(())
}

type AppState = State<Arc<LockService>>;

async fn health_check() -> &'static str {
    "OK"
}

async fn handle_acquire(
    State(service): AppState,
    Json(request): Json<AcquireRequest>,
) -> Json<LockResponse> {
    let result = service
        .acquire_lock(&request.lock_id, &request.client_id, request.timeout_ms)
        .await;
    Json(result.into())
}

async fn handle_release(
    State(service): AppState,
    Json(request): Json<ReleaseRequest>,
) -> Json<LockResponse> {
    let result = service
        .release_lock(&request.lock_id, &request.client_id, request.fencing_token)
        .await;
    Json(result.into())
}

async fn handle_extend(
    State(service): AppState,
    Json(request): Json<ExtendRequest>,
) -> Json<LockResponse> {
    let result = service
        .extend_lock(
            &request.lock_id,
            &request.client_id,
            request.fencing_token,
            request.timeout_ms,
        )
        .await;
    Json(result.into())
}

async fn handle_check(
    State(service): AppState,
    Json(request): Json<CheckRequest>,
) -> Json<CheckResponse> {
    Json(service.check_lock(&request.lock_id).into())
}

async fn handle_list(State(service): AppState) -> Json<LockListResponse> {
    Json(LockListResponse {
        locks: service.active_locks(),
    })
}

async fn handle_status(State(service): AppState) -> Json<StatusResponse> {
    Json(StatusResponse {
        region_id: service.region_id().to_string(),
        raft: service.raft().status(),
        active_locks: service.store().get_all_active_locks().len(),
        peer_regions: service
            .quorum()
            .peers()
            .iter()
            .map(|p| p.region_id.clone())
            .collect(),
    })
}

async fn handle_request_vote(
    State(service): AppState,
    Json(request): Json<RequestVoteRequest>,
) -> std::result::Result<Json<RequestVoteResponse>, StatusCode> {
    service
        .raft()
        .request_vote(request)
        .await
        .map(Json)
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)
}

async fn handle_append_entries(
    State(service): AppState,
    Json(request): Json<AppendEntriesRequest>,
) -> std::result::Result<Json<AppendEntriesResponse>, StatusCode> {
    service
        .raft()
        .append_entries(request)
        .await
        .map(Json)
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)
}

// Region traffic is answered by the region's leader. A member that cannot
// reach one answers 503 and the sender treats the region as unreachable.

async fn handle_region_vote(
    State(service): AppState,
    Json(request): Json<LockVoteRequest>,
) -> std::result::Result<Json<LockVoteResponse>, StatusCode> {
    service
        .quorum()
        .handle_lock_vote_request(&request)
        .await
        .map(Json)
        .map_err(|e| region_unavailable("vote", e))
}

async fn handle_region_acquired(
    State(service): AppState,
    Json(notification): Json<LockAcquiredNotification>,
) -> std::result::Result<Json<NotificationAck>, StatusCode> {
    service
        .quorum()
        .handle_lock_acquired_notification(&notification)
        .await
        .map(|applied| Json(NotificationAck { applied }))
        .map_err(|e| region_unavailable("acquired", e))
}

async fn handle_region_released(
    State(service): AppState,
    Json(notification): Json<LockReleasedNotification>,
) -> std::result::Result<Json<NotificationAck>, StatusCode> {
    service
        .quorum()
        .handle_lock_released_notification(&notification)
        .await
        .map(|applied| Json(NotificationAck { applied }))
        .map_err(|e| region_unavailable("released", e))
}

fn region_unavailable(kind: &str, err: GeolockError) -> StatusCode {
    warn!(kind, error = %err, "Region request not handled");
    StatusCode::SERVICE_UNAVAILABLE
}
