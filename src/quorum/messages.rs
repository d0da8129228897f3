//! Inter-region message types.

use serde::{Deserialize, Serialize};

use crate::lock::Lock;

/// Ask a peer region to vote for our acquisition of a lock id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockVoteRequest {
    pub lock_id: String,
    pub requesting_region: String,
    pub client_id: String,
    pub timeout_ms: u64,
    pub fencing_token: u64,
    /// Milliseconds since the Unix epoch.
    pub request_timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockVoteResponse {
    pub granted: bool,
    pub responding_region: String,
    #[serde(default)]
    pub denial_reason: Option<String>,
    #[serde(default)]
    pub current_holder_region: Option<String>,
    #[serde(default)]
    pub current_holder_client: Option<String>,
    #[serde(default)]
    pub current_fencing_token: Option<u64>,
}

impl LockVoteResponse {
    pub fn granted(region: &str) -> Self {
        Self {
            granted: true,
            responding_region: region.to_string(),
            denial_reason: None,
            current_holder_region: None,
            current_holder_client: None,
            current_fencing_token: None,
        }
    }

    pub fn denied(region: &str, reason: impl Into<String>) -> Self {
        Self {
            granted: false,
            responding_region: region.to_string(),
            denial_reason: Some(reason.into()),
            current_holder_region: None,
            current_holder_client: None,
            current_fencing_token: None,
        }
    }

    pub fn with_holder(mut self, holder: &Lock) -> Self {
        self.current_holder_region = Some(holder.holder_region.clone());
        self.current_holder_client = Some(holder.holder_id.clone());
        self.current_fencing_token = Some(holder.fencing_token);
        self
    }
}

/// Sent by the winning region once quorum is reached, and again after an
/// extend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockAcquiredNotification {
    pub lock_id: String,
    pub holder_id: String,
    pub holder_region: String,
    pub fencing_token: u64,
    pub acquired_at: u64,
    pub expires_at: u64,
}

impl LockAcquiredNotification {
    pub fn to_lock(&self) -> Lock {
        Lock {
            lock_id: self.lock_id.clone(),
            holder_id: self.holder_id.clone(),
            holder_region: self.holder_region.clone(),
            fencing_token: self.fencing_token,
            acquired_at: self.acquired_at,
            expires_at: self.expires_at,
        }
    }
}

impl From<&Lock> for LockAcquiredNotification {
    fn from(lock: &Lock) -> Self {
        Self {
            lock_id: lock.lock_id.clone(),
            holder_id: lock.holder_id.clone(),
            holder_region: lock.holder_region.clone(),
            fencing_token: lock.fencing_token,
            acquired_at: lock.acquired_at,
            expires_at: lock.expires_at,
        }
    }
}

/// Sent after a release, or after a failed quorum is compensated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockReleasedNotification {
    pub lock_id: String,
    pub holder_region: String,
    pub fencing_token: u64,
}

/// Acknowledges a region notification. `applied` is false for stale ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAck {
    pub applied: bool,
}

/// Outcome of a successful quorum round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumResult {
    /// Includes the implicit vote of the requesting region.
    pub votes_received: usize,
    pub total_regions: usize,
    pub quorum_size: usize,
    pub granting_regions: Vec<String>,
}
