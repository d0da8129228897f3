// In-process transports with fault injection.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;

use geolock::lock::LockService;
use geolock::quorum::{
    LockAcquiredNotification, LockReleasedNotification, LockVoteRequest, LockVoteResponse,
    RegionRpc,
};
use geolock::raft::{
    AppendEntriesRequest, AppendEntriesResponse, RaftHandle, RaftRpc, RequestVoteRequest,
    RequestVoteResponse,
};
use geolock::{GeolockError, NodeId, PeerRegion, Result};

/// Raft traffic between the members of one region.
pub struct RaftNetwork<R> {
    nodes: RwLock<HashMap<NodeId, RaftHandle<R>>>,
    isolated: RwLock<HashSet<NodeId>>,
}

impl<R: Send + 'static> RaftNetwork<R> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            nodes: RwLock::new(HashMap::new()),
            isolated: RwLock::new(HashSet::new()),
        })
    }

    pub fn register(&self, handle: RaftHandle<R>) {
        self.nodes.write().insert(handle.node_id(), handle);
    }

    /// Transport for `node`'s outbound RPCs.
    pub fn rpc_for(self: &Arc<Self>, node: NodeId) -> Arc<dyn RaftRpc> {
        Arc::new(NodeRpc {
            from: node,
            network: Arc::clone(self),
        })
    }

    /// Cut `node` off from every other member.
    pub fn isolate(&self, node: NodeId) {
        self.isolated.write().insert(node);
    }

    pub fn heal(&self, node: NodeId) {
        self.isolated.write().remove(&node);
    }

    pub fn heal_all(&self) {
        self.isolated.write().clear();
    }

    fn route(&self, from: NodeId, to: NodeId) -> Result<RaftHandle<R>> {
        {
            let isolated = self.isolated.read();
            if isolated.contains(&from) || isolated.contains(&to) {
                return Err(GeolockError::Network(format!("{} -> {} partitioned", from, to)));
            }
        }
        self.nodes
            .read()
            .get(&to)
            .cloned()
            .ok_or(GeolockError::NodeNotFound(to))
    }
}

struct NodeRpc<R> {
    from: NodeId,
    network: Arc<RaftNetwork<R>>,
}

#[async_trait::async_trait]
impl<R: Send + 'static> RaftRpc for NodeRpc<R> {
    async fn request_vote(
        &self,
        target: NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        let handle = self.network.route(self.from, target)?;
        handle.request_vote(request).await
    }

    async fn append_entries(
        &self,
        target: NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let handle = self.network.route(self.from, target)?;
        handle.append_entries(request).await
    }
}

/// Address of member `id` of `region`, as it appears in raft peer lists.
pub fn member_addr(region: &str, id: NodeId) -> String {
    format!("{}-node-{}:{}", region, id, 7000 + id)
}

/// Address other regions use to reach `region`.
pub fn entry_addr(region: &str) -> String {
    format!("{}.internal:7070", region)
}

/// Cross-region traffic, delivered by address like the HTTP transport.
///
/// A region's entry address resolves to exactly one member (the first one
/// registered unless [`RegionNetwork::set_entry`] says otherwise), so a
/// member that is not the leader has to hand the traffic on itself.
#[derive(Default)]
pub struct RegionNetwork {
    members: RwLock<HashMap<String, Arc<LockService>>>,
    entries: RwLock<HashMap<String, String>>,
    partitioned: RwLock<HashSet<String>>,
}

impl RegionNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `service` reachable at `addr`.
    pub fn register(&self, addr: impl Into<String>, service: Arc<LockService>) {
        let addr = addr.into();
        self.entries
            .write()
            .entry(service.region_id().to_string())
            .or_insert_with(|| addr.clone());
        self.members.write().insert(addr, service);
    }

    /// Send traffic for `region`'s entry address to the member at `addr`.
    pub fn set_entry(&self, region: &str, addr: impl Into<String>) {
        self.entries.write().insert(region.to_string(), addr.into());
    }

    /// Transport for a member of `region`.
    pub fn rpc_for(self: &Arc<Self>, region: &str) -> Arc<dyn RegionRpc> {
        Arc::new(MemberRegionRpc {
            from: region.to_string(),
            network: Arc::clone(self),
        })
    }

    /// Make `region` unreachable from every other region.
    pub fn partition(&self, region: &str) {
        self.partitioned.write().insert(region.to_string());
    }

    pub fn heal(&self, region: &str) {
        self.partitioned.write().remove(region);
    }

    fn route(&self, from: &str, target: &PeerRegion) -> Result<Arc<LockService>> {
        if from != target.region_id {
            let partitioned = self.partitioned.read();
            if partitioned.contains(from) || partitioned.contains(&target.region_id) {
                return Err(GeolockError::Network(format!(
                    "{} -> {} partitioned",
                    from, target.region_id
                )));
            }
        }

        let mut addr = target.addr();
        if addr == entry_addr(&target.region_id) {
            if let Some(entry) = self.entries.read().get(&target.region_id) {
                addr = entry.clone();
            }
        }
        self.members
            .read()
            .get(&addr)
            .cloned()
            .ok_or_else(|| GeolockError::RegionNotFound(target.region_id.clone()))
    }
}

struct MemberRegionRpc {
    from: String,
    network: Arc<RegionNetwork>,
}

#[async_trait::async_trait]
impl RegionRpc for MemberRegionRpc {
    async fn request_vote(
        &self,
        target: &PeerRegion,
        request: LockVoteRequest,
    ) -> Result<LockVoteResponse> {
        let member = self.network.route(&self.from, target)?;
        member.quorum().handle_lock_vote_request(&request).await
    }

    async fn notify_acquired(
        &self,
        target: &PeerRegion,
        notification: LockAcquiredNotification,
    ) -> Result<bool> {
        let member = self.network.route(&self.from, target)?;
        member.quorum().handle_lock_acquired_notification(&notification).await
    }

    async fn notify_released(
        &self,
        target: &PeerRegion,
        notification: LockReleasedNotification,
    ) -> Result<bool> {
        let member = self.network.route(&self.from, target)?;
        member.quorum().handle_lock_released_notification(&notification).await
    }
}
