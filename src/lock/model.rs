//! Lock data model and result vocabulary.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::error::GeolockError;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// A granted lock. Replaced wholesale on every state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub lock_id: String,
    pub holder_id: String,
    pub holder_region: String,
    pub fencing_token: u64,
    /// Milliseconds since the Unix epoch.
    pub acquired_at: u64,
    /// Milliseconds since the Unix epoch. Always greater than `acquired_at`.
    pub expires_at: u64,
}

impl Lock {
    pub fn new(
        lock_id: impl Into<String>,
        holder_id: impl Into<String>,
        holder_region: impl Into<String>,
        fencing_token: u64,
        acquired_at: u64,
        timeout_ms: u64,
    ) -> Self {
        Self {
            lock_id: lock_id.into(),
            holder_id: holder_id.into(),
            holder_region: holder_region.into(),
            fencing_token,
            acquired_at,
            expires_at: acquired_at + timeout_ms.max(1),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_millis())
    }

    pub fn is_expired_at(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    /// Remaining lifetime in milliseconds, 0 once expired.
    pub fn ttl(&self) -> u64 {
        self.ttl_at(now_millis())
    }

    pub fn ttl_at(&self, now: u64) -> u64 {
        self.expires_at.saturating_sub(now)
    }

    /// Copy of this lock with a new expiry, as produced by an extend.
    pub fn extended(&self, now: u64, timeout_ms: u64) -> Self {
        Self {
            expires_at: now + timeout_ms.max(1),
            ..self.clone()
        }
    }

    pub fn fencing(&self) -> FencingToken {
        FencingToken {
            value: self.fencing_token,
            lock_id: self.lock_id.clone(),
            issued_at: self.acquired_at,
        }
    }
}

/// A fencing token issued for a lock. Ordered by value only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FencingToken {
    pub value: u64,
    pub lock_id: String,
    pub issued_at: u64,
}

impl PartialEq for FencingToken {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Eq for FencingToken {}

impl PartialOrd for FencingToken {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FencingToken {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.value.cmp(&other.value)
    }
}

/// Outcome status of a lock operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockStatus {
    Ok,
    AlreadyLocked,
    NotFound,
    InvalidToken,
    Expired,
    QuorumFailed,
    Error,
    Timeout,
    NotLeader,
}

impl LockStatus {
    /// Whether a caller may reasonably retry, possibly against another node.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LockStatus::QuorumFailed | LockStatus::Timeout | LockStatus::NotLeader
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LockStatus::Ok => "OK",
            LockStatus::AlreadyLocked => "ALREADY_LOCKED",
            LockStatus::NotFound => "NOT_FOUND",
            LockStatus::InvalidToken => "INVALID_TOKEN",
            LockStatus::Expired => "EXPIRED",
            LockStatus::QuorumFailed => "QUORUM_FAILED",
            LockStatus::Error => "ERROR",
            LockStatus::Timeout => "TIMEOUT",
            LockStatus::NotLeader => "NOT_LEADER",
        }
    }
}

impl fmt::Display for LockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a lock operation, with holder context for conflicts.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{status}: {message}")]
pub struct LockError {
    pub status: LockStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_holder_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_fencing_token: Option<u64>,
}

impl LockError {
    pub fn new(status: LockStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            current_holder_id: None,
            current_fencing_token: None,
        }
    }

    pub fn already_locked(holder: &Lock) -> Self {
        Self {
            status: LockStatus::AlreadyLocked,
            message: format!(
                "lock {} is held by {} in {}",
                holder.lock_id, holder.holder_id, holder.holder_region
            ),
            current_holder_id: Some(holder.holder_id.clone()),
            current_fencing_token: Some(holder.fencing_token),
        }
    }

    pub fn not_found(lock_id: &str) -> Self {
        Self::new(LockStatus::NotFound, format!("lock {} is not held", lock_id))
    }

    pub fn invalid_token(lock_id: &str, current: &Lock) -> Self {
        Self {
            status: LockStatus::InvalidToken,
            message: format!("fencing token does not match for lock {}", lock_id),
            current_holder_id: Some(current.holder_id.clone()),
            current_fencing_token: Some(current.fencing_token),
        }
    }

    pub fn not_leader(leader: Option<u64>) -> Self {
        let message = match leader {
            Some(id) => format!("not the leader; leader is node {}", id),
            None => "not the leader; leader unknown".to_string(),
        };
        Self::new(LockStatus::NotLeader, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(LockStatus::Error, message)
    }

    pub fn with_holder(mut self, holder_id: Option<String>, fencing_token: Option<u64>) -> Self {
        self.current_holder_id = holder_id;
        self.current_fencing_token = fencing_token;
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.status.is_retryable()
    }
}

impl From<GeolockError> for LockError {
    fn from(err: GeolockError) -> Self {
        match err {
            GeolockError::NotLeader { leader } => LockError::not_leader(leader),
            GeolockError::Timeout(ms) => {
                LockError::new(LockStatus::Timeout, format!("operation timed out after {}ms", ms))
            }
            other => LockError::new(LockStatus::Error, other.to_string()),
        }
    }
}

/// Result of every lock operation.
pub type LockResult<T> = Result<T, LockError>;

/// Side-effecting combinators for [`LockResult`].
///
/// `map`, `and_then` and `unwrap_or` come from `Result` itself.
pub trait LockResultExt<T> {
    /// Run `f` on the value if this is a success.
    fn on_success<F: FnOnce(&T)>(self, f: F) -> Self;

    /// Run `f` on the error if this is a failure.
    fn on_failure<F: FnOnce(&LockError)>(self, f: F) -> Self;

    /// Status of this result, `Ok` on success.
    fn status(&self) -> LockStatus;
}

impl<T> LockResultExt<T> for LockResult<T> {
    fn on_success<F: FnOnce(&T)>(self, f: F) -> Self {
        if let Ok(value) = &self {
            f(value);
        }
        self
    }

    fn on_failure<F: FnOnce(&LockError)>(self, f: F) -> Self {
        if let Err(err) = &self {
            f(err);
        }
        self
    }

    fn status(&self) -> LockStatus {
        match self {
            Ok(_) => LockStatus::Ok,
            Err(e) => e.status,
        }
    }
}

/// Snapshot returned by a local lock check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub lock_id: String,
    pub holder_id: String,
    pub holder_region: String,
    pub fencing_token: u64,
    pub ttl_ms: u64,
}

impl From<&Lock> for LockInfo {
    fn from(lock: &Lock) -> Self {
        Self {
            lock_id: lock.lock_id.clone(),
            holder_id: lock.holder_id.clone(),
            holder_region: lock.holder_region.clone(),
            fencing_token: lock.fencing_token,
            ttl_ms: lock.ttl(),
        }
    }
}
