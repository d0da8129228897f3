//! HTTP transports for raft and region traffic.

use crate::config::NetworkConfig;
use crate::error::{GeolockError, Result};
use crate::quorum::{
    LockAcquiredNotification, LockReleasedNotification, LockVoteRequest, LockVoteResponse,
    NotificationAck, RegionRpc,
};
use crate::raft::{
    AppendEntriesRequest, AppendEntriesResponse, RaftRpc, RequestVoteRequest, RequestVoteResponse,
};
use crate::types::{NodeId, PeerRegion};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;

fn build_client(config: &NetworkConfig) -> Client {
    Client::builder()
        .connect_timeout(config.connect_timeout)
        .timeout(config.request_timeout)
        .build()
        .unwrap_or_else(|_| Client::new())
}

async fn post_json<Req, Resp>(client: &Client, url: &str, body: &Req) -> Result<Resp>
where
    Req: Serialize + ?Sized,
    Resp: DeserializeOwned,
{
    let response = client
        .post(url)
        .json(body)
        .send()
        .await
        .map_err(|e| GeolockError::Network(e.to_string()))?
        .error_for_status()
        .map_err(|e| GeolockError::Network(e.to_string()))?;

    response
        .json()
        .await
        .map_err(|e| GeolockError::Deserialization(e.to_string()))
}

/// Raft RPCs to the other members of this region.
pub struct HttpRaftRpc {
    peers: HashMap<NodeId, String>,
    client: Client,
}

impl HttpRaftRpc {
    pub fn new(peers: HashMap<NodeId, String>, config: &NetworkConfig) -> Self {
        Self {
            peers,
            client: build_client(config),
        }
    }

    fn peer_url(&self, target: NodeId, endpoint: &str) -> Result<String> {
        self.peers
            .get(&target)
            .map(|addr| format!("http://{}/{}", addr, endpoint))
            .ok_or(GeolockError::NodeNotFound(target))
    }
}

#[async_trait::async_trait]
impl RaftRpc for HttpRaftRpc {
    async fn request_vote(
        &self,
        target: NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        let url = self.peer_url(target, "raft/request_vote")?;
        post_json(&self.client, &url, &request).await
    }

    async fn append_entries(
        &self,
        target: NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let url = self.peer_url(target, "raft/append_entries")?;
        post_json(&self.client, &url, &request).await
    }
}

/// Votes and notifications to peer regions.
pub struct HttpRegionRpc {
    client: Client,
}

impl HttpRegionRpc {
    pub fn new(config: &NetworkConfig) -> Self {
        Self {
            client: build_client(config),
        }
    }
}

#[async_trait::async_trait]
impl RegionRpc for HttpRegionRpc {
    async fn request_vote(
        &self,
        target: &PeerRegion,
        request: LockVoteRequest,
    ) -> Result<LockVoteResponse> {
        let url = format!("http://{}/region/vote", target.addr());
        post_json(&self.client, &url, &request).await
    }

    async fn notify_acquired(
        &self,
        target: &PeerRegion,
        notification: LockAcquiredNotification,
    ) -> Result<bool> {
        let url = format!("http://{}/region/acquired", target.addr());
        let ack: NotificationAck = post_json(&self.client, &url, &notification).await?;
        Ok(ack.applied)
    }

    async fn notify_released(
        &self,
        target: &PeerRegion,
        notification: LockReleasedNotification,
    ) -> Result<bool> {
        let url = format!("http://{}/region/released", target.addr());
        let ack: NotificationAck = post_json(&self.client, &url, &notification).await?;
        Ok(ack.applied)
    }
}
