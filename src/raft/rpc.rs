//! Raft RPC message definitions.

use super::LogEntry;
use crate::types::{LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};

/// RequestVote RPC arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    /// Candidate's term.
    pub term: Term,
    /// Candidate requesting vote.
    pub candidate_id: NodeId,
    /// Index of candidate's last log entry.
    pub last_log_index: LogIndex,
    /// Term of candidate's last log entry.
    pub last_log_term: Term,
}

/// RequestVote RPC response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    /// Current term, for candidate to update itself.
    pub term: Term,
    /// True if candidate received vote.
    pub vote_granted: bool,
}

/// AppendEntries RPC arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// Leader's term.
    pub term: Term,
    /// Leader's ID so followers can redirect clients.
    pub leader_id: NodeId,
    /// Index of log entry immediately preceding new ones.
    pub prev_log_index: LogIndex,
    /// Term of prev_log_index entry.
    pub prev_log_term: Term,
    /// Log entries to store (empty for heartbeat).
    pub entries: Vec<LogEntry>,
    /// Leader's commit index.
    pub leader_commit: LogIndex,
}

/// AppendEntries RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// Current term, for leader to update itself.
    pub term: Term,
    /// True if follower contained entry matching prev_log_index and prev_log_term.
    pub success: bool,
    /// Last index known to match the leader's log after this request.
    pub match_index: LogIndex,
    /// Where the leader should retry from after a mismatch.
    pub conflict_index: Option<LogIndex>,
    /// Term of the conflicting entry, if the follower has one.
    pub conflict_term: Option<Term>,
}

/// Transport for intra-region Raft traffic.
#[async_trait::async_trait]
pub trait RaftRpc: Send + Sync {
    /// Send RequestVote to a peer.
    async fn request_vote(
        &self,
        target: NodeId,
        request: RequestVoteRequest,
    ) -> crate::Result<RequestVoteResponse>;

    /// Send AppendEntries to a peer.
    async fn append_entries(
        &self,
        target: NodeId,
        request: AppendEntriesRequest,
    ) -> crate::Result<AppendEntriesResponse>;
}
