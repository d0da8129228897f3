//! Raft consensus for a single region.
//!
//! Each region runs an independent Raft cluster that orders lock commands
//! and applies them to the region's lock table. The node is an actor: one
//! task owns the log, the persistent state and the state machine, and is
//! driven through a [`RaftHandle`].

// unwrap() calls can cause panics that break consensus.
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

mod log;
mod node;
pub mod rpc;
mod state;
mod storage;

pub use log::{EntryType, LogEntry, RaftLog};
pub use node::{RaftConfig, RaftHandle, RaftNode, RaftStatus};
pub use rpc::{
    AppendEntriesRequest, AppendEntriesResponse, RaftRpc, RequestVoteRequest, RequestVoteResponse,
};
pub use state::{NodeState, PersistentState, RaftState};
pub use storage::RaftStorage;

use crate::types::LogIndex;

/// A deterministic state machine driven by committed log entries.
pub trait StateMachine: Send + 'static {
    /// The result type for operations.
    type Result: Send + Clone + 'static;

    /// Apply the committed command at `index`.
    ///
    /// Called exactly once per index in increasing order during normal
    /// operation. Re-application of an index at or below the last applied
    /// one must not change state.
    fn apply(&mut self, index: LogIndex, command: &[u8]) -> Self::Result;

    /// Highest index applied so far.
    fn last_applied(&self) -> LogIndex;
}
