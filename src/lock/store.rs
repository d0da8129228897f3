//! Authoritative in-memory lock table for one region.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

use super::fencing::FencingTokenGenerator;
use super::model::{now_millis, Lock, LockError, LockResult, LockStatus};

/// Lock table keyed by lock id.
///
/// Every mutation runs under the per-key entry lock, so a check and the
/// install that depends on it are atomic for one lock id while unrelated
/// ids proceed in parallel. Expired entries are treated as absent whether
/// or not they have been purged.
#[derive(Debug)]
pub struct LockStore {
    locks: DashMap<String, Lock>,
    tokens: Arc<FencingTokenGenerator>,
}

impl LockStore {
    pub fn new(tokens: Arc<FencingTokenGenerator>) -> Self {
        Self {
            locks: DashMap::new(),
            tokens,
        }
    }

    pub fn tokens(&self) -> &Arc<FencingTokenGenerator> {
        &self.tokens
    }

    pub fn try_acquire(
        &self,
        lock_id: &str,
        client_id: &str,
        region_id: &str,
        timeout_ms: u64,
    ) -> LockResult<Lock> {
        self.try_acquire_at(lock_id, client_id, region_id, timeout_ms, now_millis())
    }

    /// Install a new lock unless an unexpired one exists.
    pub fn try_acquire_at(
        &self,
        lock_id: &str,
        client_id: &str,
        region_id: &str,
        timeout_ms: u64,
        now: u64,
    ) -> LockResult<Lock> {
        match self.locks.entry(lock_id.to_string()) {
            Entry::Occupied(mut entry) => {
                if !entry.get().is_expired_at(now) {
                    return Err(LockError::already_locked(entry.get()));
                }
                let token = self.tokens.next_token(lock_id);
                let lock = Lock::new(lock_id, client_id, region_id, token, now, timeout_ms);
                debug!(
                    lock_id,
                    token,
                    previous = entry.get().fencing_token,
                    "Replaced expired lock"
                );
                entry.insert(lock.clone());
                Ok(lock)
            }
            Entry::Vacant(entry) => {
                let token = self.tokens.next_token(lock_id);
                let lock = Lock::new(lock_id, client_id, region_id, token, now, timeout_ms);
                entry.insert(lock.clone());
                Ok(lock)
            }
        }
    }

    pub fn release(&self, lock_id: &str, client_id: &str, fencing_token: u64) -> LockResult<()> {
        self.release_at(lock_id, client_id, fencing_token, now_millis())
    }

    /// Remove a lock if `fencing_token` matches the stored one.
    ///
    /// Ownership is proven by the token alone; `client_id` is only logged.
    pub fn release_at(
        &self,
        lock_id: &str,
        client_id: &str,
        fencing_token: u64,
        now: u64,
    ) -> LockResult<()> {
        match self.locks.entry(lock_id.to_string()) {
            Entry::Occupied(entry) => {
                if entry.get().is_expired_at(now) {
                    entry.remove();
                    return Err(LockError::not_found(lock_id));
                }
                if entry.get().fencing_token != fencing_token {
                    return Err(LockError::invalid_token(lock_id, entry.get()));
                }
                entry.remove();
                debug!(lock_id, client_id, fencing_token, "Released lock");
                Ok(())
            }
            Entry::Vacant(_) => Err(LockError::not_found(lock_id)),
        }
    }

    pub fn extend(
        &self,
        lock_id: &str,
        client_id: &str,
        fencing_token: u64,
        timeout_ms: u64,
    ) -> LockResult<Lock> {
        self.extend_at(lock_id, client_id, fencing_token, timeout_ms, now_millis())
    }

    /// Push back the expiry of a held lock.
    pub fn extend_at(
        &self,
        lock_id: &str,
        client_id: &str,
        fencing_token: u64,
        timeout_ms: u64,
        now: u64,
    ) -> LockResult<Lock> {
        match self.locks.entry(lock_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let current = entry.get();
                if current.is_expired_at(now) {
                    return Err(LockError::new(
                        LockStatus::Expired,
                        format!("lock {} expired before it could be extended", lock_id),
                    ));
                }
                if current.fencing_token != fencing_token || current.holder_id != client_id {
                    return Err(LockError::invalid_token(lock_id, current));
                }
                let extended = current.extended(now, timeout_ms);
                entry.insert(extended.clone());
                Ok(extended)
            }
            Entry::Vacant(_) => Err(LockError::not_found(lock_id)),
        }
    }

    /// The unexpired lock for `lock_id`, if any.
    pub fn get(&self, lock_id: &str) -> Option<Lock> {
        let now = now_millis();
        self.locks
            .get(lock_id)
            .filter(|lock| !lock.is_expired_at(now))
            .map(|lock| lock.clone())
    }

    pub fn is_locked(&self, lock_id: &str) -> bool {
        self.get(lock_id).is_some()
    }

    /// Snapshot of every unexpired lock.
    pub fn get_all_active_locks(&self) -> Vec<Lock> {
        let now = now_millis();
        self.locks
            .iter()
            .filter(|entry| !entry.value().is_expired_at(now))
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn record_shadow(&self, lock: Lock) -> bool {
        self.record_shadow_at(lock, now_millis())
    }

    /// Record a lock held by another region and absorb its token.
    ///
    /// Returns false when the update is stale: an entry with a higher
    /// fencing token, unexpired at `now`, is already recorded.
    pub fn record_shadow_at(&self, lock: Lock, now: u64) -> bool {
        self.tokens.update_token(&lock.lock_id, lock.fencing_token);
        match self.locks.entry(lock.lock_id.clone()) {
            Entry::Occupied(mut entry) => {
                let existing = entry.get();
                if !existing.is_expired_at(now) && existing.fencing_token > lock.fencing_token {
                    return false;
                }
                entry.insert(lock);
                true
            }
            Entry::Vacant(entry) => {
                entry.insert(lock);
                true
            }
        }
    }

    /// Remove a lock recorded for `holder_region`, unless a newer
    /// acquisition (higher token) has replaced it. The token is absorbed
    /// either way.
    pub fn remove_shadow(&self, lock_id: &str, holder_region: &str, fencing_token: u64) -> bool {
        self.tokens.update_token(lock_id, fencing_token);
        self.locks
            .remove_if(lock_id, |_, lock| {
                lock.holder_region == holder_region && lock.fencing_token <= fencing_token
            })
            .is_some()
    }

    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(now_millis())
    }

    /// Physically drop entries expired at `now`. Returns how many were
    /// removed.
    pub fn purge_expired_at(&self, now: u64) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, lock| !lock.is_expired_at(now));
        before.saturating_sub(self.locks.len())
    }

    /// Whether any entry has expired but is still stored.
    pub fn has_expired(&self) -> bool {
        let now = now_millis();
        self.locks.iter().any(|entry| entry.value().is_expired_at(now))
    }

    /// Number of entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
