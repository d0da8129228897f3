//! JSON bodies of the public lock API, shared by the server and
//! [`LockClient`](crate::client::LockClient).

use crate::lock::{Lock, LockError, LockInfo, LockResult, LockStatus};
use crate::raft::RaftStatus;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquireRequest {
    pub lock_id: String,
    pub client_id: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseRequest {
    pub lock_id: String,
    pub client_id: String,
    pub fencing_token: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtendRequest {
    pub lock_id: String,
    pub client_id: String,
    pub fencing_token: u64,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRequest {
    pub lock_id: String,
}

/// Outcome of acquire, release and extend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockResponse {
    pub status: LockStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock: Option<Lock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<LockError>,
}

impl LockResponse {
    pub fn into_result(self) -> LockResult<Option<Lock>> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.lock),
        }
    }
}

impl From<LockResult<Lock>> for LockResponse {
    fn from(result: LockResult<Lock>) -> Self {
        match result {
            Ok(lock) => Self { status: LockStatus::Ok, lock: Some(lock), error: None },
            Err(err) => Self { status: err.status, lock: None, error: Some(err) },
        }
    }
}

impl From<LockResult<()>> for LockResponse {
    fn from(result: LockResult<()>) -> Self {
        match result {
            Ok(()) => Self { status: LockStatus::Ok, lock: None, error: None },
            Err(err) => Self { status: err.status, lock: None, error: Some(err) },
        }
    }
}

/// Outcome of a check: the holder snapshot, or why there is none.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResponse {
    pub status: LockStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holder_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holder_region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fencing_token: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<LockError>,
}

impl CheckResponse {
    pub fn into_result(self, lock_id: &str) -> LockResult<LockInfo> {
        if let Some(err) = self.error {
            return Err(err);
        }
        match (self.holder_id, self.holder_region, self.fencing_token) {
            (Some(holder_id), Some(holder_region), Some(fencing_token)) => Ok(LockInfo {
                lock_id: lock_id.to_string(),
                holder_id,
                holder_region,
                fencing_token,
                ttl_ms: self.ttl_ms.unwrap_or(0),
            }),
            _ => Err(LockError::not_found(lock_id)),
        }
    }
}

impl From<LockResult<LockInfo>> for CheckResponse {
    fn from(result: LockResult<LockInfo>) -> Self {
        match result {
            Ok(info) => Self {
                status: LockStatus::Ok,
                holder_id: Some(info.holder_id),
                holder_region: Some(info.holder_region),
                fencing_token: Some(info.fencing_token),
                ttl_ms: Some(info.ttl_ms),
                error: None,
            },
            Err(err) => Self {
                status: err.status,
                holder_id: None,
                holder_region: None,
                fencing_token: None,
                ttl_ms: None,
                error: Some(err),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockListResponse {
    pub locks: Vec<LockInfo>,
}

/// Node and region overview returned by `GET /status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub region_id: String,
    pub raft: RaftStatus,
    pub active_locks: usize,
    pub peer_regions: Vec<String>,
}

pub use crate::quorum::NotificationAck;
