//! Applies committed lock commands to the region's lock table.

use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, error};

use super::command::{CommandOutput, LockCommand};
use super::model::{LockError, LockResult, LockStatus};
use super::store::LockStore;
use crate::raft::StateMachine;
use crate::types::LogIndex;

/// How many recent results are kept for replayed indices. A replay of an
/// index older than this answers `ERROR` instead of the original result.
/// The node never re-applies below its own applied index, so only a caller
/// driving the machine by hand can reach that case.
const RESULT_CACHE_SIZE: usize = 1024;

/// State machine over a shared [`LockStore`].
///
/// The store is shared with readers (`check_lock`, quorum voting) but this
/// is its only writer, so the table and the fencing counters are a function
/// of the applied log.
pub struct LockStateMachine {
    store: Arc<LockStore>,
    last_applied: LogIndex,
    recent: VecDeque<(LogIndex, LockResult<CommandOutput>)>,
}

impl LockStateMachine {
    pub fn new(store: Arc<LockStore>) -> Self {
        Self {
            store,
            last_applied: 0,
            recent: VecDeque::with_capacity(RESULT_CACHE_SIZE),
        }
    }

    pub fn store(&self) -> &Arc<LockStore> {
        &self.store
    }

    fn apply_command(&self, command: LockCommand) -> LockResult<CommandOutput> {
        match command {
            LockCommand::Acquire {
                lock_id,
                client_id,
                region_id,
                timeout_ms,
                requested_at_ms,
            } => self
                .store
                .try_acquire_at(&lock_id, &client_id, &region_id, timeout_ms, requested_at_ms)
                .map(CommandOutput::Acquired),
            LockCommand::Release {
                lock_id,
                client_id,
                fencing_token,
                requested_at_ms,
            } => self
                .store
                .release_at(&lock_id, &client_id, fencing_token, requested_at_ms)
                .map(|_| CommandOutput::Released),
            LockCommand::Extend {
                lock_id,
                client_id,
                fencing_token,
                timeout_ms,
                requested_at_ms,
            } => self
                .store
                .extend_at(&lock_id, &client_id, fencing_token, timeout_ms, requested_at_ms)
                .map(CommandOutput::Extended),
            LockCommand::RecordShadow {
                lock,
                requested_at_ms,
            } => Ok(CommandOutput::ShadowRecorded(
                self.store.record_shadow_at(lock, requested_at_ms),
            )),
            LockCommand::RemoveShadow {
                lock_id,
                holder_region,
                fencing_token,
            } => Ok(CommandOutput::ShadowRemoved(self.store.remove_shadow(
                &lock_id,
                &holder_region,
                fencing_token,
            ))),
            LockCommand::ObserveToken {
                lock_id,
                fencing_token,
            } => Ok(CommandOutput::TokenObserved(
                self.store.tokens().update_token(&lock_id, fencing_token),
            )),
            LockCommand::Purge { requested_at_ms } => {
                Ok(CommandOutput::Purged(self.store.purge_expired_at(requested_at_ms)))
            }
        }
    }

    fn replayed(&self, index: LogIndex) -> LockResult<CommandOutput> {
        self.recent
            .iter()
            .find(|(i, _)| *i == index)
            .map(|(_, result)| result.clone())
            .unwrap_or_else(|| {
                Err(LockError::new(
                    LockStatus::Error,
                    format!("log index {} was already applied", index),
                ))
            })
    }
}

impl StateMachine for LockStateMachine {
    type Result = LockResult<CommandOutput>;

    fn apply(&mut self, index: LogIndex, command: &[u8]) -> Self::Result {
        if index <= self.last_applied {
            debug!(
                index,
                last_applied = self.last_applied,
                "Skipping already applied entry"
            );
            return self.replayed(index);
        }

        let result = match bincode::deserialize::<LockCommand>(command) {
            Ok(cmd) => {
                let kind = cmd.kind();
                let result = self.apply_command(cmd);
                debug!(index, kind, ok = result.is_ok(), "Applied lock command");
                result
            }
            Err(e) => {
                error!(index, error = %e, "Failed to deserialize lock command");
                Err(LockError::new(
                    LockStatus::Error,
                    format!("Deserialization error: {}", e),
                ))
            }
        };

        self.last_applied = index;
        if self.recent.len() == RESULT_CACHE_SIZE {
            self.recent.pop_front();
        }
        self.recent.push_back((index, result.clone()));
        result
    }

    fn last_applied(&self) -> LogIndex {
        self.last_applied
    }
}
