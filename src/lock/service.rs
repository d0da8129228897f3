//! Client-facing lock operations for one region.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::command::{propose, CommandOutput, LockCommand, LockRaftHandle};
use super::model::{
    now_millis, Lock, LockError, LockInfo, LockResult, LockResultExt, LockStatus,
};
use super::store::LockStore;
use crate::config::LockConfig;
use crate::observability;
use crate::quorum::QuorumManager;
use crate::types::LockId;

/// Orchestrates acquire, release, extend and check.
///
/// Writes go through the regional Raft log; acquisitions additionally need
/// a majority of regions before they are reported to the caller.
pub struct LockService {
    region_id: String,
    store: Arc<LockStore>,
    raft: LockRaftHandle,
    quorum: Arc<QuorumManager>,
    config: LockConfig,
}

impl LockService {
    pub fn new(
        region_id: impl Into<String>,
        store: Arc<LockStore>,
        raft: LockRaftHandle,
        quorum: Arc<QuorumManager>,
        config: LockConfig,
    ) -> Self {
        Self {
            region_id: region_id.into(),
            store,
            raft,
            quorum,
            config,
        }
    }

    pub fn region_id(&self) -> &str {
        &self.region_id
    }

    pub fn store(&self) -> &Arc<LockStore> {
        &self.store
    }

    pub fn raft(&self) -> &LockRaftHandle {
        &self.raft
    }

    pub fn quorum(&self) -> &Arc<QuorumManager> {
        &self.quorum
    }

    /// Acquire `lock_id` for `client_id`.
    ///
    /// A malformed id or empty client fails with `ERROR` before anything is
    /// proposed. The lock is committed in this region first, then put to a
    /// cross-region vote; if the vote fails the local commit is released.
    pub async fn acquire_lock(
        &self,
        lock_id: &str,
        client_id: &str,
        timeout_ms: Option<u64>,
    ) -> LockResult<Lock> {
        let result = self.try_acquire(lock_id, client_id, timeout_ms).await;
        observability::record_lock_op("acquire", result.status().as_str());
        result
    }

    async fn try_acquire(
        &self,
        lock_id: &str,
        client_id: &str,
        timeout_ms: Option<u64>,
    ) -> LockResult<Lock> {
        let lock_id = validate(lock_id, client_id)?;
        let timeout_ms = self.config.normalize_timeout(timeout_ms);
        self.require_leader()?;

        if let Some(current) = self.store.get(&lock_id) {
            return Err(LockError::already_locked(&current));
        }

        let command = LockCommand::Acquire {
            lock_id: lock_id.clone(),
            client_id: client_id.to_string(),
            region_id: self.region_id.clone(),
            timeout_ms,
            requested_at_ms: now_millis(),
        };
        let lock = match self.submit(command).await? {
            CommandOutput::Acquired(lock) => lock,
            other => return Err(unexpected(other)),
        };

        match self
            .quorum
            .request_lock_quorum(&lock_id, client_id, lock.fencing_token, timeout_ms)
            .await
        {
            Ok(result) => {
                info!(
                    lock_id = %lock_id,
                    client_id,
                    token = lock.fencing_token,
                    votes = result.votes_received,
                    regions = result.total_regions,
                    "Lock acquired"
                );
                self.quorum.broadcast_acquired(&lock);
                Ok(lock)
            }
            Err(err) => {
                self.compensate(&lock).await;
                Err(err)
            }
        }
    }

    /// Undo a local commit that did not win the cross-region vote. If this
    /// fails the lock still lapses at its expiry.
    async fn compensate(&self, lock: &Lock) {
        let command = LockCommand::Release {
            lock_id: lock.lock_id.clone(),
            client_id: lock.holder_id.clone(),
            fencing_token: lock.fencing_token,
            requested_at_ms: now_millis(),
        };
        match self.submit(command).await {
            Ok(_) => debug!(
                lock_id = %lock.lock_id,
                token = lock.fencing_token,
                "Released lock after failed quorum"
            ),
            Err(e) => warn!(
                lock_id = %lock.lock_id,
                token = lock.fencing_token,
                error = %e,
                "Compensating release failed; lock will expire"
            ),
        }
        self.quorum.broadcast_released(&lock.lock_id, lock.fencing_token);
    }

    /// Release a lock. Only the current fencing token is accepted.
    pub async fn release_lock(
        &self,
        lock_id: &str,
        client_id: &str,
        fencing_token: u64,
    ) -> LockResult<()> {
        let result: LockResult<()> = async {
            let lock_id = validate(lock_id, client_id)?;
            self.require_leader()?;
            let command = LockCommand::Release {
                lock_id: lock_id.clone(),
                client_id: client_id.to_string(),
                fencing_token,
                requested_at_ms: now_millis(),
            };
            match self.submit(command).await? {
                CommandOutput::Released => {
                    info!(lock_id = %lock_id, client_id, token = fencing_token, "Lock released");
                    self.quorum.broadcast_released(&lock_id, fencing_token);
                    Ok(())
                }
                other => Err(unexpected(other)),
            }
        }
        .await;
        observability::record_lock_op("release", result.status().as_str());
        result
    }

    /// Push out the expiry of a held lock.
    pub async fn extend_lock(
        &self,
        lock_id: &str,
        client_id: &str,
        fencing_token: u64,
        timeout_ms: Option<u64>,
    ) -> LockResult<Lock> {
        let result: LockResult<Lock> = async {
            let lock_id = validate(lock_id, client_id)?;
            let timeout_ms = self.config.normalize_timeout(timeout_ms);
            self.require_leader()?;
            let command = LockCommand::Extend {
                lock_id,
                client_id: client_id.to_string(),
                fencing_token,
                timeout_ms,
                requested_at_ms: now_millis(),
            };
            match self.submit(command).await? {
                CommandOutput::Extended(lock) => {
                    debug!(lock_id = %lock.lock_id, expires_at = lock.expires_at, "Lock extended");
                    self.quorum.broadcast_acquired(&lock);
                    Ok(lock)
                }
                other => Err(unexpected(other)),
            }
        }
        .await;
        observability::record_lock_op("extend", result.status().as_str());
        result
    }

    /// Local read; no consensus round.
    pub fn check_lock(&self, lock_id: &str) -> LockResult<LockInfo> {
        let lock_id = LockId::parse(lock_id).map_err(LockError::invalid_argument)?.to_string();
        self.store
            .get(&lock_id)
            .map(|lock| LockInfo::from(&lock))
            .ok_or_else(|| LockError::not_found(&lock_id))
    }

    /// Unexpired locks known to this node, including shadow copies.
    pub fn active_locks(&self) -> Vec<LockInfo> {
        let mut locks: Vec<LockInfo> = self
            .store
            .get_all_active_locks()
            .iter()
            .map(LockInfo::from)
            .collect();
        locks.sort_by(|a, b| a.lock_id.cmp(&b.lock_id));
        locks
    }

    /// Start the periodic expired-lock sweep, unless disabled.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Option<JoinHandle<()>> {
        let period = self.config.sweep_interval;
        if period.is_zero() {
            return None;
        }

        let service = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        service.sweep().await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Expiry sweeper stopped");
        }))
    }

    /// Drop expired vote promises and, on the leader, replicate a purge of
    /// expired locks. Returns the number of locks removed.
    pub async fn sweep(&self) -> usize {
        let promises = self.quorum.purge_expired_promises();
        let mut purged = 0;
        if self.raft.is_leader() && self.store.has_expired() {
            let command = LockCommand::Purge {
                requested_at_ms: now_millis(),
            };
            match propose(&self.raft, &command).await {
                Ok(Ok(CommandOutput::Purged(n))) => purged = n,
                Ok(other) => warn!(result = ?other, "Unexpected purge result"),
                Err(e) => warn!(error = %e, "Purge not replicated"),
            }
        }
        observability::update_lock_metrics(self.store.len(), purged);
        if purged > 0 || promises > 0 {
            debug!(purged, promises, "Swept expired entries");
        }
        purged
    }

    fn require_leader(&self) -> LockResult<()> {
        if self.raft.is_leader() {
            Ok(())
        } else {
            Err(LockError::not_leader(self.raft.leader_id()))
        }
    }

    async fn submit(&self, command: LockCommand) -> LockResult<CommandOutput> {
        propose(&self.raft, &command).await.map_err(LockError::from)?
    }
}

/// Canonicalize the lock id and reject an empty client id.
fn validate(lock_id: &str, client_id: &str) -> LockResult<String> {
    let lock_id = LockId::parse(lock_id).map_err(LockError::invalid_argument)?;
    if client_id.trim().is_empty() {
        return Err(LockError::invalid_argument("client id must not be empty"));
    }
    Ok(lock_id.to_string())
}

fn unexpected(output: CommandOutput) -> LockError {
    LockError::new(
        LockStatus::Error,
        format!("unexpected command output: {:?}", output),
    )
}
