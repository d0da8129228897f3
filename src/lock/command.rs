//! Replicated lock commands.

use serde::{Deserialize, Serialize};

use super::model::{Lock, LockResult};
use crate::error::Result;
use crate::raft::RaftHandle;

/// Handle to the region's Raft node, typed for lock commands.
pub type LockRaftHandle = RaftHandle<LockResult<CommandOutput>>;

/// A command carried in the Raft log.
///
/// The lock table and the fencing counters change only by applying these,
/// so every replica that applies the same log holds the same table. Commands
/// that depend on time carry the leader's clock at proposal time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockCommand {
    Acquire {
        lock_id: String,
        client_id: String,
        region_id: String,
        timeout_ms: u64,
        requested_at_ms: u64,
    },
    Release {
        lock_id: String,
        client_id: String,
        fencing_token: u64,
        requested_at_ms: u64,
    },
    Extend {
        lock_id: String,
        client_id: String,
        fencing_token: u64,
        timeout_ms: u64,
        requested_at_ms: u64,
    },
    /// A lock granted in another region.
    RecordShadow { lock: Lock, requested_at_ms: u64 },
    /// Another region's hold on a lock ended.
    RemoveShadow {
        lock_id: String,
        holder_region: String,
        fencing_token: u64,
    },
    /// A token issued elsewhere; later acquisitions here start above it.
    ObserveToken { lock_id: String, fencing_token: u64 },
    /// Drop every entry expired at `requested_at_ms`.
    Purge { requested_at_ms: u64 },
}

impl LockCommand {
    /// The lock this command touches, if it touches exactly one.
    pub fn lock_id(&self) -> Option<&str> {
        match self {
            LockCommand::Acquire { lock_id, .. }
            | LockCommand::Release { lock_id, .. }
            | LockCommand::Extend { lock_id, .. }
            | LockCommand::RemoveShadow { lock_id, .. }
            | LockCommand::ObserveToken { lock_id, .. } => Some(lock_id),
            LockCommand::RecordShadow { lock, .. } => Some(&lock.lock_id),
            LockCommand::Purge { .. } => None,
        }
    }

    /// Short operation name, used for logs and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            LockCommand::Acquire { .. } => "acquire",
            LockCommand::Release { .. } => "release",
            LockCommand::Extend { .. } => "extend",
            LockCommand::RecordShadow { .. } => "record_shadow",
            LockCommand::RemoveShadow { .. } => "remove_shadow",
            LockCommand::ObserveToken { .. } => "observe_token",
            LockCommand::Purge { .. } => "purge",
        }
    }
}

/// Successful outcome of applying a [`LockCommand`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandOutput {
    Acquired(Lock),
    Released,
    Extended(Lock),
    /// False when a newer acquisition was already recorded.
    ShadowRecorded(bool),
    /// False when nothing matched.
    ShadowRemoved(bool),
    /// The counter's value after absorbing the token.
    TokenObserved(u64),
    Purged(usize),
}

/// Replicate `command` through `raft` and wait for it to be applied.
///
/// The outer error is a consensus or transport failure; the inner result is
/// the state machine's verdict.
pub(crate) async fn propose(
    raft: &LockRaftHandle,
    command: &LockCommand,
) -> Result<LockResult<CommandOutput>> {
    let data = bincode::serialize(command)?;
    raft.submit(data).await
}
