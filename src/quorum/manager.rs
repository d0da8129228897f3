//! Vote collection and shadow-copy bookkeeping.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::messages::*;
use super::RegionRpc;
use crate::error::{GeolockError, Result};
use crate::lock::{
    now_millis, propose, CommandOutput, Lock, LockCommand, LockError, LockRaftHandle, LockResult,
    LockStatus, LockStore,
};
use crate::observability;
use crate::types::{NodeId, PeerRegion};

/// A granted vote reserves the lock id for the requesting region until the
/// requester's quorum round would have timed out.
#[derive(Debug, Clone)]
struct VotePromise {
    region: String,
    fencing_token: u64,
    expires_at: u64,
}

/// Runs quorum rounds for this region and answers peers' rounds.
///
/// Only the region's Raft leader answers peers. Every change the answer makes
/// to the lock table or the fencing counters goes through the log, so all
/// members of the region agree on it and it survives a failover. Promises are
/// leader-local and lapse on their own.
pub struct QuorumManager {
    region_id: String,
    peers: Vec<PeerRegion>,
    /// Other members of this region, by Raft node id.
    members: HashMap<NodeId, PeerRegion>,
    store: Arc<LockStore>,
    raft: LockRaftHandle,
    rpc: Arc<dyn RegionRpc>,
    quorum_timeout: Duration,
    promises: DashMap<String, VotePromise>,
}

impl QuorumManager {
    pub fn new(
        region_id: impl Into<String>,
        peers: Vec<PeerRegion>,
        store: Arc<LockStore>,
        raft: LockRaftHandle,
        rpc: Arc<dyn RegionRpc>,
        quorum_timeout: Duration,
    ) -> Self {
        Self {
            region_id: region_id.into(),
            peers,
            members: HashMap::new(),
            store,
            raft,
            rpc,
            quorum_timeout,
            promises: DashMap::new(),
        }
    }

    /// Addresses of the other members of this region, so that region
    /// traffic reaching a follower can be handed to the leader.
    pub fn with_members(mut self, members: HashMap<NodeId, PeerRegion>) -> Self {
        self.members = members;
        self
    }

    pub fn region_id(&self) -> &str {
        &self.region_id
    }

    pub fn peers(&self) -> &[PeerRegion] {
        &self.peers
    }

    pub fn total_regions(&self) -> usize {
        self.peers.len() + 1
    }

    pub fn quorum_size(&self) -> usize {
        self.total_regions() / 2 + 1
    }

    /// Collect votes for holding `lock_id` with `fencing_token`.
    ///
    /// Our own region's vote is implicit. Returns as soon as a majority
    /// grants or a majority becomes unreachable, and never waits longer
    /// than the quorum timeout.
    pub async fn request_lock_quorum(
        &self,
        lock_id: &str,
        client_id: &str,
        fencing_token: u64,
        timeout_ms: u64,
    ) -> LockResult<QuorumResult> {
        if let Some(current) = self.store.get(lock_id) {
            let ours = current.holder_region == self.region_id
                && current.fencing_token == fencing_token
                && current.holder_id == client_id;
            if !ours {
                return Err(LockError::already_locked(&current));
            }
        }

        // Our own vote follows the same rule as the ones we give out: it
        // cannot go to ourselves while a peer holds our promise.
        if let Some(denial) = self.reserve(lock_id, &self.region_id, fencing_token) {
            observability::record_quorum(false, 0);
            return Err(LockError::new(
                LockStatus::QuorumFailed,
                format!(
                    "lock {} is being acquired by region {}",
                    lock_id,
                    denial.current_holder_region.unwrap_or_default()
                ),
            ));
        }

        let total_regions = self.total_regions();
        let quorum_size = self.quorum_size();
        let mut granting = vec![self.region_id.clone()];
        let mut denial: Option<LockVoteResponse> = None;
        let mut highest_token: Option<u64> = None;

        if granting.len() < quorum_size {
            let request = LockVoteRequest {
                lock_id: lock_id.to_string(),
                requesting_region: self.region_id.clone(),
                client_id: client_id.to_string(),
                timeout_ms,
                fencing_token,
                request_timestamp: now_millis(),
            };

            let mut votes: FuturesUnordered<_> = self
                .peers
                .iter()
                .map(|peer| {
                    let rpc = Arc::clone(&self.rpc);
                    let request = request.clone();
                    async move { (peer, rpc.request_vote(peer, request).await) }
                })
                .collect();

            let mut outstanding = self.peers.len();
            let tally = async {
                while let Some((peer, result)) = votes.next().await {
                    outstanding -= 1;
                    match result {
                        Ok(response) if response.granted => {
                            granting.push(peer.region_id.clone());
                        }
                        Ok(response) => {
                            debug!(
                                lock_id,
                                region = %peer.region_id,
                                reason = ?response.denial_reason,
                                "Vote denied"
                            );
                            if let Some(token) = response.current_fencing_token {
                                highest_token = highest_token.max(Some(token));
                            }
                            denial.get_or_insert(response);
                        }
                        Err(e) => {
                            warn!(
                                lock_id,
                                region = %peer.region_id,
                                error = %e,
                                "Vote request failed"
                            );
                        }
                    }

                    if granting.len() >= quorum_size
                        || granting.len() + outstanding < quorum_size
                    {
                        break;
                    }
                }
            };

            if timeout(self.quorum_timeout, tally).await.is_err() {
                warn!(
                    lock_id,
                    votes = granting.len(),
                    needed = quorum_size,
                    "Quorum round timed out"
                );
            }
        }

        if let Some(token) = highest_token {
            self.observe_token(lock_id, token).await;
        }

        let votes_received = granting.len();
        observability::record_quorum(votes_received >= quorum_size, votes_received);

        if votes_received >= quorum_size {
            debug!(lock_id, votes_received, total_regions, "Quorum reached");
            return Ok(QuorumResult {
                votes_received,
                total_regions,
                quorum_size,
                granting_regions: granting,
            });
        }

        self.promises
            .remove_if(lock_id, |_, p| p.region == self.region_id);

        let mut err = LockError::new(
            LockStatus::QuorumFailed,
            format!(
                "quorum not reached for lock {}: {} of {} votes, need {}",
                lock_id, votes_received, total_regions, quorum_size
            ),
        );
        if let Some(denial) = denial {
            err = err.with_holder(denial.current_holder_client, denial.current_fencing_token);
        }
        Err(err)
    }

    /// Answer a peer region's vote request.
    ///
    /// A follower hands the request to its leader. Fails with `NotLeader`
    /// when no leader is known.
    pub async fn handle_lock_vote_request(
        &self,
        request: &LockVoteRequest,
    ) -> Result<LockVoteResponse> {
        if let Some(leader) = self.leader_route()? {
            return self.rpc.request_vote(&leader, request.clone()).await;
        }

        let current_token = self.store.tokens().current_token(&request.lock_id);
        if request.fencing_token > current_token {
            let command = LockCommand::ObserveToken {
                lock_id: request.lock_id.clone(),
                fencing_token: request.fencing_token,
            };
            if let Err(e) = self.replicate(&command).await {
                warn!(lock_id = %request.lock_id, error = %e, "Could not record requester's token");
                return Ok(LockVoteResponse::denied(&self.region_id, "could not record token"));
            }
        }

        if let Some(current) = self.store.get(&request.lock_id) {
            let same_acquisition = current.holder_region == request.requesting_region
                && current.fencing_token == request.fencing_token;
            if !same_acquisition {
                return Ok(LockVoteResponse::denied(&self.region_id, "lock is held")
                    .with_holder(&current));
            }
        }

        if let Some(denial) =
            self.reserve(&request.lock_id, &request.requesting_region, request.fencing_token)
        {
            return Ok(denial);
        }

        debug!(
            lock_id = %request.lock_id,
            region = %request.requesting_region,
            token = request.fencing_token,
            "Granted vote"
        );
        Ok(LockVoteResponse::granted(&self.region_id))
    }

    /// Promise `lock_id` to `region` unless another region holds an
    /// unexpired promise. Returns the denial in that case.
    fn reserve(
        &self,
        lock_id: &str,
        region: &str,
        fencing_token: u64,
    ) -> Option<LockVoteResponse> {
        let now = now_millis();
        let promise = VotePromise {
            region: region.to_string(),
            fencing_token,
            expires_at: now + self.quorum_timeout.as_millis() as u64,
        };

        match self.promises.entry(lock_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let existing = entry.get();
                if existing.region != region && existing.expires_at > now {
                    let reason = format!(
                        "vote promised to {} for token {}",
                        existing.region, existing.fencing_token
                    );
                    let mut response = LockVoteResponse::denied(&self.region_id, reason);
                    response.current_holder_region = Some(existing.region.clone());
                    response.current_fencing_token = Some(existing.fencing_token);
                    return Some(response);
                }
                entry.insert(promise);
            }
            Entry::Vacant(entry) => {
                entry.insert(promise);
            }
        }
        None
    }

    /// Record a peer's acquisition as a shadow copy in this region's log.
    /// Answers false if the notification was stale.
    pub async fn handle_lock_acquired_notification(
        &self,
        notification: &LockAcquiredNotification,
    ) -> Result<bool> {
        if let Some(leader) = self.leader_route()? {
            return self.rpc.notify_acquired(&leader, notification.clone()).await;
        }

        let command = LockCommand::RecordShadow {
            lock: notification.to_lock(),
            requested_at_ms: now_millis(),
        };
        let recorded = match self.replicate(&command).await? {
            CommandOutput::ShadowRecorded(recorded) => recorded,
            other => return Err(unexpected(other)),
        };
        self.promises
            .remove_if(&notification.lock_id, |_, p| p.region == notification.holder_region);

        if recorded {
            info!(
                lock_id = %notification.lock_id,
                region = %notification.holder_region,
                token = notification.fencing_token,
                "Recorded remote lock"
            );
        } else {
            debug!(lock_id = %notification.lock_id, "Ignored stale acquired notification");
        }
        Ok(recorded)
    }

    /// Drop a peer's shadow copy through this region's log. Answers false if
    /// nothing matched.
    pub async fn handle_lock_released_notification(
        &self,
        notification: &LockReleasedNotification,
    ) -> Result<bool> {
        if let Some(leader) = self.leader_route()? {
            return self.rpc.notify_released(&leader, notification.clone()).await;
        }

        let command = LockCommand::RemoveShadow {
            lock_id: notification.lock_id.clone(),
            holder_region: notification.holder_region.clone(),
            fencing_token: notification.fencing_token,
        };
        let removed = match self.replicate(&command).await? {
            CommandOutput::ShadowRemoved(removed) => removed,
            other => return Err(unexpected(other)),
        };
        self.promises
            .remove_if(&notification.lock_id, |_, p| p.region == notification.holder_region);

        debug!(
            lock_id = %notification.lock_id,
            region = %notification.holder_region,
            removed,
            "Handled released notification"
        );
        Ok(removed)
    }

    /// Tell every peer about `lock`. Delivery is best effort.
    pub fn broadcast_acquired(&self, lock: &Lock) {
        let notification = LockAcquiredNotification::from(lock);
        for peer in &self.peers {
            let rpc = Arc::clone(&self.rpc);
            let peer = peer.clone();
            let notification = notification.clone();
            tokio::spawn(async move {
                if let Err(e) = rpc.notify_acquired(&peer, notification).await {
                    warn!(
                        region = %peer.region_id,
                        error = %e,
                        "Failed to deliver acquired notification"
                    );
                }
            });
        }
    }

    /// Tell every peer that our hold on `lock_id` ended.
    pub fn broadcast_released(&self, lock_id: &str, fencing_token: u64) {
        self.promises
            .remove_if(lock_id, |_, p| p.region == self.region_id);

        let notification = LockReleasedNotification {
            lock_id: lock_id.to_string(),
            holder_region: self.region_id.clone(),
            fencing_token,
        };
        for peer in &self.peers {
            let rpc = Arc::clone(&self.rpc);
            let peer = peer.clone();
            let notification = notification.clone();
            tokio::spawn(async move {
                if let Err(e) = rpc.notify_released(&peer, notification).await {
                    warn!(
                        region = %peer.region_id,
                        error = %e,
                        "Failed to deliver released notification"
                    );
                }
            });
        }
    }

    /// Forget vote promises whose window has passed.
    pub fn purge_expired_promises(&self) -> usize {
        let now = now_millis();
        let before = self.promises.len();
        self.promises.retain(|_, p| p.expires_at > now);
        before.saturating_sub(self.promises.len())
    }

    /// `None` when this node leads the region, otherwise the leader's
    /// address.
    fn leader_route(&self) -> Result<Option<PeerRegion>> {
        let status = self.raft.status();
        if status.state.is_leader() {
            return Ok(None);
        }
        match status.leader_id.and_then(|id| self.members.get(&id)) {
            Some(leader) => Ok(Some(leader.clone())),
            None => Err(GeolockError::NotLeader {
                leader: status.leader_id,
            }),
        }
    }

    /// Absorb a token seen in a peer's answer. Best effort: the next round
    /// sees it again.
    async fn observe_token(&self, lock_id: &str, fencing_token: u64) {
        if fencing_token <= self.store.tokens().current_token(lock_id) {
            return;
        }
        let command = LockCommand::ObserveToken {
            lock_id: lock_id.to_string(),
            fencing_token,
        };
        if let Err(e) = self.replicate(&command).await {
            warn!(lock_id, token = fencing_token, error = %e, "Could not record observed token");
        }
    }

    async fn replicate(&self, command: &LockCommand) -> Result<CommandOutput> {
        propose(&self.raft, command)
            .await?
            .map_err(|e| GeolockError::Internal(format!("{} rejected: {}", command.kind(), e)))
    }
}

fn unexpected(output: CommandOutput) -> GeolockError {
    GeolockError::Internal(format!("unexpected command output: {:?}", output))
}
