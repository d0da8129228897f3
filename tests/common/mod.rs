//! Common test utilities for integration tests.

pub mod network;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub use network::*;

use geolock::config::GeolockConfig;
use geolock::lock::{CommandOutput, LockResult, LockService};
use geolock::server::{build_region_node_with, RegionNode};
use geolock::NodeId;

/// Test error type
pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, Error>;

pub type LockRaftNetwork = RaftNetwork<LockResult<CommandOutput>>;

/// Default wait for elections and replication in tests.
pub const SETTLE: Duration = Duration::from_secs(3);

/// A fresh canonical lock id.
pub fn lock_id() -> String {
    geolock::LockId::new().to_string()
}

/// Configuration for one member with fast timers.
pub fn node_config(
    region: &str,
    node_id: NodeId,
    members: usize,
    regions: &[&str],
) -> GeolockConfig {
    let mut config = GeolockConfig::development();
    config.node.id = node_id;
    config.raft.peers = (1..=members as u64)
        .map(|id| format!("{}:{}", id, member_addr(region, id)))
        .collect::<Vec<_>>()
        .join(",");
    config.raft.election_timeout = Duration::from_millis(50);
    config.raft.heartbeat_interval = Duration::from_millis(15);
    config.raft.rpc_timeout = Duration::from_millis(40);
    config.raft.submit_timeout = Duration::from_secs(2);
    config.region.region_id = region.to_string();
    config.region.peers = regions
        .iter()
        .map(|r| format!("{}:{}", r, entry_addr(r)))
        .collect::<Vec<_>>()
        .join(",");
    config.region.quorum_timeout = Duration::from_millis(300);
    config.lock.min_timeout_ms = 100;
    config
}

/// One region's members and their shared raft network.
pub struct TestRegion {
    pub id: String,
    pub raft_net: Arc<LockRaftNetwork>,
    pub nodes: Vec<RegionNode>,
}

impl TestRegion {
    pub fn services(&self) -> Vec<Arc<LockService>> {
        self.nodes.iter().map(|n| Arc::clone(&n.service)).collect()
    }

    pub fn node(&self, id: NodeId) -> &RegionNode {
        &self.nodes[(id - 1) as usize]
    }

    /// Wait for a leader and return its service.
    pub async fn leader(&self) -> Arc<LockService> {
        let deadline = tokio::time::Instant::now() + SETTLE;
        loop {
            if let Some(node) = self.nodes.iter().find(|n| n.raft.is_leader()) {
                return Arc::clone(&node.service);
            }
            if tokio::time::Instant::now() > deadline {
                panic!("region {} has no leader", self.id);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub fn followers(&self) -> Vec<Arc<LockService>> {
        self.nodes
            .iter()
            .filter(|n| !n.raft.is_leader())
            .map(|n| Arc::clone(&n.service))
            .collect()
    }
}

/// A set of regions wired together through in-process networks.
pub struct TestDeployment {
    pub region_net: Arc<RegionNetwork>,
    pub regions: HashMap<String, TestRegion>,
}

impl TestDeployment {
    /// Start `members` nodes in each named region.
    pub async fn start(regions: &[&str], members: usize) -> Self {
        let region_net = RegionNetwork::new();
        let mut built = HashMap::new();

        for &region in regions {
            let raft_net = LockRaftNetwork::new();
            let mut nodes = Vec::new();
            for id in 1..=members as u64 {
                let config = node_config(region, id, members, regions);
                let node = build_region_node_with(
                    &config,
                    raft_net.rpc_for(id),
                    region_net.rpc_for(region),
                )
                .expect("build region node");
                raft_net.register(node.raft.clone());
                region_net.register(member_addr(region, id), Arc::clone(&node.service));
                nodes.push(node);
            }
            built.insert(
                region.to_string(),
                TestRegion {
                    id: region.to_string(),
                    raft_net,
                    nodes,
                },
            );
        }

        let deployment = Self {
            region_net,
            regions: built,
        };
        for region in deployment.regions.values() {
            region.leader().await;
        }
        deployment
    }

    pub fn region(&self, id: &str) -> &TestRegion {
        &self.regions[id]
    }

    pub async fn leader(&self, region: &str) -> Arc<LockService> {
        self.region(region).leader().await
    }

    pub async fn shutdown(self) {
        for (_, region) in self.regions {
            for node in region.nodes {
                node.shutdown().await;
            }
        }
    }
}

/// Poll `condition` until it holds or `SETTLE` passes.
pub async fn eventually<F: FnMut() -> bool>(mut condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + SETTLE;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
