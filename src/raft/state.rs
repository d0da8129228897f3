//! Raft node state management.

use crate::types::{LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// The role of a Raft node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Passive, responds to RPCs.
    Follower,
    /// Actively seeking election.
    Candidate,
    /// Accepting submissions and replicating.
    Leader,
}

impl NodeState {
    pub fn is_leader(&self) -> bool {
        matches!(self, NodeState::Leader)
    }

    pub fn is_follower(&self) -> bool {
        matches!(self, NodeState::Follower)
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self, NodeState::Candidate)
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Follower => write!(f, "Follower"),
            NodeState::Candidate => write!(f, "Candidate"),
            NodeState::Leader => write!(f, "Leader"),
        }
    }
}

/// State that must survive restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentState {
    /// Latest term this server has seen.
    pub current_term: Term,
    /// Candidate that received our vote in the current term.
    pub voted_for: Option<NodeId>,
}

/// Replication progress tracked by a leader.
#[derive(Debug, Clone)]
pub struct LeaderState {
    /// For each peer, index of the next log entry to send.
    pub next_index: HashMap<NodeId, LogIndex>,
    /// For each peer, highest index known to be replicated.
    pub match_index: HashMap<NodeId, LogIndex>,
}

impl LeaderState {
    pub fn new(peers: &[NodeId], last_log_index: LogIndex) -> Self {
        Self {
            next_index: peers.iter().map(|&p| (p, last_log_index + 1)).collect(),
            match_index: peers.iter().map(|&p| (p, 0)).collect(),
        }
    }

    /// Record a successful replication. Stale acknowledgements arriving
    /// out of order never move `match_index` backwards.
    pub fn update_match(&mut self, peer: NodeId, match_index: LogIndex) {
        let current = self.match_index.entry(peer).or_insert(0);
        if match_index > *current {
            *current = match_index;
        }
        let floor = *current + 1;
        let next = self.next_index.entry(peer).or_insert(floor);
        if *next < floor {
            *next = floor;
        }
    }

    /// Move `next_index` back after a rejected AppendEntries.
    pub fn back_off(&mut self, peer: NodeId, hint: Option<LogIndex>) {
        let matched = self.match_index.get(&peer).copied().unwrap_or(0);
        if let Some(next) = self.next_index.get_mut(&peer) {
            let target = match hint {
                Some(conflict_index) => conflict_index.min(*next),
                None => next.saturating_sub(1),
            };
            *next = target.max(matched + 1).max(1);
        }
    }
}

/// Complete Raft state for a node.
#[derive(Debug)]
pub struct RaftState {
    pub node_id: NodeId,
    pub state: NodeState,
    pub leader_id: Option<NodeId>,
    pub persistent: PersistentState,
    /// Index of highest log entry known to be committed.
    pub commit_index: LogIndex,
    /// Index of highest log entry applied to the state machine.
    pub last_applied: LogIndex,
    /// Only present while leader.
    pub leader: Option<LeaderState>,
    /// Votes collected while candidate, excluding our own.
    pub votes: HashSet<NodeId>,
    pub peers: Vec<NodeId>,
}

impl RaftState {
    pub fn new(node_id: NodeId, peers: Vec<NodeId>) -> Self {
        Self {
            node_id,
            state: NodeState::Follower,
            leader_id: None,
            persistent: PersistentState::default(),
            commit_index: 0,
            last_applied: 0,
            leader: None,
            votes: HashSet::new(),
            peers,
        }
    }

    /// Transition to follower state.
    pub fn become_follower(&mut self, term: Term, leader_id: Option<NodeId>) {
        if term > self.persistent.current_term {
            self.persistent.voted_for = None;
        }
        self.state = NodeState::Follower;
        self.persistent.current_term = term;
        self.leader_id = leader_id;
        self.leader = None;
        self.votes.clear();

        tracing::info!(
            node_id = self.node_id,
            term = term,
            leader = ?leader_id,
            "Became follower"
        );
    }

    /// Transition to candidate state, voting for ourselves.
    pub fn become_candidate(&mut self) {
        self.state = NodeState::Candidate;
        self.persistent.current_term += 1;
        self.persistent.voted_for = Some(self.node_id);
        self.leader_id = None;
        self.leader = None;
        self.votes.clear();

        tracing::info!(
            node_id = self.node_id,
            term = self.persistent.current_term,
            "Became candidate"
        );
    }

    /// Transition to leader state.
    pub fn become_leader(&mut self, last_log_index: LogIndex) {
        self.state = NodeState::Leader;
        self.leader_id = Some(self.node_id);
        self.leader = Some(LeaderState::new(&self.peers, last_log_index));
        self.votes.clear();

        tracing::info!(
            node_id = self.node_id,
            term = self.persistent.current_term,
            "Became leader"
        );
    }

    pub fn is_leader(&self) -> bool {
        self.state.is_leader()
    }

    pub fn current_term(&self) -> Term {
        self.persistent.current_term
    }

    /// Votes needed to win an election or commit an entry.
    pub fn quorum_size(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    /// Whether the votes collected so far, plus our own, form a majority.
    pub fn has_vote_quorum(&self) -> bool {
        self.votes.len() + 1 >= self.quorum_size()
    }

    /// Highest index stored on a majority, counting the leader's own log.
    /// Returns the current commit index when not leader.
    pub fn majority_match_index(&self, last_log_index: LogIndex) -> LogIndex {
        let leader_state = match (&self.leader, self.is_leader()) {
            (Some(l), true) => l,
            _ => return self.commit_index,
        };

        let mut indices: Vec<LogIndex> = leader_state.match_index.values().copied().collect();
        indices.push(last_log_index);
        indices.sort_unstable_by(|a, b| b.cmp(a));

        // The index at position quorum_size - 1 is held by at least
        // quorum_size servers.
        indices
            .get(self.quorum_size() - 1)
            .copied()
            .unwrap_or(self.commit_index)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let state = RaftState::new(1, vec![2, 3, 4]);
        assert!(state.state.is_follower());
        assert_eq!(state.current_term(), 0);
        assert!(state.leader_id.is_none());
    }

    #[test]
    fn test_become_candidate() {
        let mut state = RaftState::new(1, vec![2, 3]);
        state.become_candidate();

        assert!(state.state.is_candidate());
        assert_eq!(state.current_term(), 1);
        assert_eq!(state.persistent.voted_for, Some(1));
    }

    #[test]
    fn test_higher_term_clears_vote() {
        let mut state = RaftState::new(1, vec![2, 3]);
        state.become_candidate();
        state.become_follower(1, Some(2));
        assert_eq!(state.persistent.voted_for, Some(1));

        state.become_follower(4, None);
        assert_eq!(state.current_term(), 4);
        assert_eq!(state.persistent.voted_for, None);
    }

    #[test]
    fn test_become_leader() {
        let mut state = RaftState::new(1, vec![2, 3]);
        state.become_candidate();
        state.become_leader(5);

        assert!(state.state.is_leader());
        assert_eq!(state.leader_id, Some(1));

        let leader = state.leader.as_ref().unwrap();
        assert_eq!(leader.next_index.get(&2), Some(&6));
        assert_eq!(leader.match_index.get(&2), Some(&0));
    }

    #[test]
    fn test_quorum_size() {
        assert_eq!(RaftState::new(1, vec![]).quorum_size(), 1);
        assert_eq!(RaftState::new(1, vec![2, 3]).quorum_size(), 2);
        assert_eq!(RaftState::new(1, vec![2, 3, 4, 5]).quorum_size(), 3);
    }

    #[test]
    fn test_vote_quorum() {
        let mut state = RaftState::new(1, vec![2, 3, 4, 5]);
        state.become_candidate();
        state.votes.insert(2);
        assert!(!state.has_vote_quorum());
        state.votes.insert(2);
        assert!(!state.has_vote_quorum());
        state.votes.insert(4);
        assert!(state.has_vote_quorum());
    }

    #[test]
    fn test_majority_match_index() {
        let mut state = RaftState::new(1, vec![2, 3, 4, 5]);
        state.become_candidate();
        state.become_leader(10);

        let leader = state.leader.as_mut().unwrap();
        leader.match_index.insert(2, 8);
        leader.match_index.insert(3, 7);
        leader.match_index.insert(4, 9);
        leader.match_index.insert(5, 6);

        // [10, 9, 8, 7, 6], third highest is 8
        assert_eq!(state.majority_match_index(10), 8);
    }

    #[test]
    fn test_match_index_never_regresses() {
        let mut leader = LeaderState::new(&[2], 4);
        leader.update_match(2, 4);
        leader.update_match(2, 2);
        assert_eq!(leader.match_index[&2], 4);
        assert_eq!(leader.next_index[&2], 5);

        leader.back_off(2, Some(1));
        assert_eq!(leader.next_index[&2], 5);
    }

    #[test]
    fn test_back_off_uses_hint() {
        let mut leader = LeaderState::new(&[2], 10);
        leader.back_off(2, Some(4));
        assert_eq!(leader.next_index[&2], 4);
        leader.back_off(2, None);
        assert_eq!(leader.next_index[&2], 3);
    }
}
