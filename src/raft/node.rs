//! Raft node implementation.
//!
//! The node runs as a single task that owns its log, persistent state and
//! state machine. Inbound RPCs and submissions arrive as commands over a
//! channel; outbound RPCs run in spawned tasks and report back as events,
//! so the loop never waits on the network.

use super::rpc::*;
use super::state::*;
use super::{LogEntry, RaftLog, RaftStorage, StateMachine};
use crate::error::{GeolockError, Result};
use crate::observability;
use crate::types::{LogIndex, NodeId, Term};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Raft configuration.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// This node's ID.
    pub node_id: NodeId,
    /// Peer node IDs and addresses.
    pub peers: HashMap<NodeId, String>,
    /// Base election timeout. The actual timeout is drawn from [T, 2T].
    pub election_timeout: Duration,
    /// Heartbeat interval.
    pub heartbeat_interval: Duration,
    /// How long a submission may wait for commit before resolving TIMEOUT.
    pub submit_timeout: Duration,
    /// Timeout for a single outbound RPC.
    pub rpc_timeout: Duration,
    /// Maximum entries per AppendEntries RPC.
    pub max_entries_per_append: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            peers: HashMap::new(),
            election_timeout: Duration::from_millis(150),
            heartbeat_interval: Duration::from_millis(50),
            submit_timeout: Duration::from_secs(5),
            rpc_timeout: Duration::from_millis(100),
            max_entries_per_append: 100,
        }
    }
}

/// Command for the Raft node.
enum RaftCommand<R> {
    /// Append a command and answer once it is applied.
    Submit {
        data: Vec<u8>,
        response: oneshot::Sender<Result<R>>,
    },
    /// Handle incoming RequestVote RPC.
    RequestVote {
        request: RequestVoteRequest,
        response: oneshot::Sender<RequestVoteResponse>,
    },
    /// Handle incoming AppendEntries RPC.
    AppendEntries {
        request: AppendEntriesRequest,
        response: oneshot::Sender<AppendEntriesResponse>,
    },
    Shutdown,
}

/// Responses to RPCs this node sent, tagged with the term they were sent in.
enum RaftEvent {
    Vote {
        peer: NodeId,
        term: Term,
        response: RequestVoteResponse,
    },
    Append {
        peer: NodeId,
        term: Term,
        response: AppendEntriesResponse,
    },
}

/// Externally visible snapshot of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftStatus {
    pub node_id: NodeId,
    pub state: NodeState,
    pub term: Term,
    pub leader_id: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_log_index: LogIndex,
}

type Pending<R> = HashMap<LogIndex, (Term, oneshot::Sender<Result<R>>)>;

/// The Raft node, managing consensus for a replicated state machine.
pub struct RaftNode<S: StateMachine> {
    config: RaftConfig,
    state: RaftState,
    log: RaftLog,
    storage: RaftStorage,
    state_machine: S,
    rpc: Arc<dyn RaftRpc>,
    command_rx: mpsc::Receiver<RaftCommand<S::Result>>,
    event_tx: mpsc::UnboundedSender<RaftEvent>,
    event_rx: mpsc::UnboundedReceiver<RaftEvent>,
    status_tx: watch::Sender<RaftStatus>,
    /// Submissions waiting for their entry to apply, keyed by log index.
    pending: Pending<S::Result>,
    election_deadline: Instant,
}

impl<S: StateMachine> RaftNode<S> {
    /// Create a node, recovering term, vote and log from `storage`.
    pub fn new(
        config: RaftConfig,
        mut storage: RaftStorage,
        state_machine: S,
        rpc: Arc<dyn RaftRpc>,
    ) -> Result<(Self, RaftHandle<S::Result>)> {
        let mut peers: Vec<NodeId> = config.peers.keys().copied().collect();
        peers.sort_unstable();
        let mut raft_state = RaftState::new(config.node_id, peers);

        if let Some(persistent) = storage.load_persistent_state()? {
            raft_state.persistent = persistent;
        }

        let mut log = RaftLog::new();
        for entry in storage.load_log_entries()? {
            log.append(entry)?;
        }

        info!(
            node_id = config.node_id,
            term = raft_state.current_term(),
            log_entries = log.len(),
            "Recovered raft state"
        );

        let (command_tx, command_rx) = mpsc::channel(1000);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let status = RaftStatus {
            node_id: config.node_id,
            state: raft_state.state,
            term: raft_state.current_term(),
            leader_id: None,
            commit_index: 0,
            last_applied: 0,
            last_log_index: log.last_index(),
        };
        let (status_tx, status_rx) = watch::channel(status);

        let handle = RaftHandle {
            node_id: config.node_id,
            command_tx,
            status_rx,
            submit_timeout: config.submit_timeout,
        };

        let election_deadline = Instant::now() + config.election_timeout;
        let node = Self {
            config,
            state: raft_state,
            log,
            storage,
            state_machine,
            rpc,
            command_rx,
            event_tx,
            event_rx,
            status_tx,
            pending: HashMap::new(),
            election_deadline,
        };

        Ok((node, handle))
    }

    /// Run the Raft node event loop until shut down.
    pub async fn run(mut self) {
        let mut heartbeat_interval = interval(self.config.heartbeat_interval);
        heartbeat_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.reset_election_deadline();

        loop {
            let is_leader = self.state.is_leader();

            tokio::select! {
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(RaftCommand::Shutdown) | None => {
                            info!(node_id = self.config.node_id, "Raft node shutting down");
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd),
                    }
                }

                Some(event) = self.event_rx.recv() => {
                    self.handle_event(event);
                }

                // Leader heartbeat
                _ = heartbeat_interval.tick(), if is_leader => {
                    self.replicate_to_all();
                    self.pending.retain(|_, (_, tx)| !tx.is_closed());
                }

                // Election timeout (non-leader only)
                _ = tokio::time::sleep_until(self.election_deadline), if !is_leader => {
                    self.start_election();
                }
            }

            self.apply_committed_entries();
            self.publish_status();
        }

        for (_, (_, tx)) in self.pending.drain() {
            let _ = tx.send(Err(GeolockError::ShuttingDown));
        }
        // A stopped node leads nobody.
        self.status_tx.send_modify(|status| {
            status.state = NodeState::Follower;
            status.leader_id = None;
        });
    }

    fn handle_command(&mut self, cmd: RaftCommand<S::Result>) {
        match cmd {
            RaftCommand::Submit { data, response } => self.handle_submit(data, response),
            RaftCommand::RequestVote { request, response } => {
                let result = self.handle_request_vote(request);
                let _ = response.send(result);
            }
            RaftCommand::AppendEntries { request, response } => {
                let result = self.handle_append_entries(request);
                let _ = response.send(result);
            }
            RaftCommand::Shutdown => {}
        }
    }

    fn handle_submit(&mut self, data: Vec<u8>, response: oneshot::Sender<Result<S::Result>>) {
        if !self.state.is_leader() {
            let _ = response.send(Err(GeolockError::NotLeader {
                leader: self.state.leader_id,
            }));
            return;
        }

        let term = self.state.current_term();
        let index = self.log.last_index() + 1;
        if let Err(e) = self.append_local(LogEntry::command(term, index, data)) {
            let _ = response.send(Err(e));
            return;
        }

        self.pending.insert(index, (term, response));
        self.advance_commit_index();
        self.replicate_to_all();
    }

    /// Persist then append an entry to our own log.
    fn append_local(&mut self, entry: LogEntry) -> Result<()> {
        self.storage.append_log_entries(std::slice::from_ref(&entry))?;
        self.log.append(entry)
    }

    /// Handle RequestVote RPC.
    fn handle_request_vote(&mut self, request: RequestVoteRequest) -> RequestVoteResponse {
        if request.term > self.state.current_term() {
            self.step_down(request.term, None);
        }

        let mut vote_granted = request.term == self.state.current_term()
            && self
                .state
                .persistent
                .voted_for
                .map_or(true, |id| id == request.candidate_id)
            && self.log.is_up_to_date(request.last_log_index, request.last_log_term);

        if vote_granted {
            let previous = self.state.persistent.voted_for;
            self.state.persistent.voted_for = Some(request.candidate_id);
            match self.persist_state() {
                Ok(()) => self.reset_election_deadline(),
                Err(e) => {
                    error!(
                        node_id = self.state.node_id,
                        candidate = request.candidate_id,
                        error = %e,
                        "Failed to persist vote, refusing it"
                    );
                    self.state.persistent.voted_for = previous;
                    vote_granted = false;
                }
            }
        }

        debug!(
            node_id = self.state.node_id,
            candidate = request.candidate_id,
            term = request.term,
            vote_granted,
            "Handled RequestVote"
        );

        RequestVoteResponse {
            term: self.state.current_term(),
            vote_granted,
        }
    }

    /// Handle AppendEntries RPC.
    fn handle_append_entries(&mut self, request: AppendEntriesRequest) -> AppendEntriesResponse {
        let reject = |term: Term, conflict_index: Option<LogIndex>, conflict_term: Option<Term>| {
            AppendEntriesResponse {
                term,
                success: false,
                match_index: 0,
                conflict_index,
                conflict_term,
            }
        };

        if request.term < self.state.current_term() {
            return reject(self.state.current_term(), None, None);
        }

        if request.term > self.state.current_term() || !self.state.state.is_follower() {
            self.step_down(request.term, Some(request.leader_id));
        }
        self.state.leader_id = Some(request.leader_id);
        self.reset_election_deadline();

        let term = self.state.current_term();

        if !self.log.matches(request.prev_log_index, request.prev_log_term) {
            return if request.prev_log_index > self.log.last_index() {
                reject(term, Some(self.log.last_index() + 1), None)
            } else {
                let conflict_term = self.log.term_at(request.prev_log_index);
                let conflict_index = self.log.first_index_of_term(request.prev_log_index);
                reject(term, Some(conflict_index), conflict_term)
            };
        }

        let match_index = request.prev_log_index + request.entries.len() as LogIndex;

        let mut new_entries = Vec::new();
        for entry in request.entries {
            if entry.index <= self.log.last_index() {
                if self.log.term_at(entry.index) == Some(entry.term) {
                    continue;
                }
                if entry.index <= self.state.commit_index {
                    error!(
                        index = entry.index,
                        commit_index = self.state.commit_index,
                        "Leader tried to overwrite a committed entry"
                    );
                    return reject(term, None, None);
                }
                self.log.truncate_from(entry.index);
                if let Err(e) = self.storage.truncate_log_from(entry.index) {
                    error!(error = %e, index = entry.index, "Failed to truncate raft log");
                    return reject(term, None, None);
                }
            }
            new_entries.push(entry);
        }

        if !new_entries.is_empty() {
            if let Err(e) = self.storage.append_log_entries(&new_entries) {
                error!(
                    error = %e,
                    entry_count = new_entries.len(),
                    "Failed to persist log entries, rejecting so the leader retries"
                );
                return reject(term, None, None);
            }
            for entry in new_entries {
                if let Err(e) = self.log.append(entry) {
                    error!(error = %e, "Failed to append replicated entry");
                    return reject(term, None, None);
                }
            }
        }

        if request.leader_commit > self.state.commit_index {
            let new_commit = request.leader_commit.min(match_index);
            if new_commit > self.state.commit_index {
                self.state.commit_index = new_commit;
            }
        }

        AppendEntriesResponse {
            term,
            success: true,
            match_index,
            conflict_index: None,
            conflict_term: None,
        }
    }

    fn handle_event(&mut self, event: RaftEvent) {
        match event {
            RaftEvent::Vote { peer, term, response } => {
                if response.term > self.state.current_term() {
                    self.step_down(response.term, None);
                    return;
                }
                if !self.state.state.is_candidate() || term != self.state.current_term() {
                    return;
                }
                if response.vote_granted {
                    self.state.votes.insert(peer);
                    debug!(
                        node_id = self.config.node_id,
                        voter = peer,
                        votes = self.state.votes.len() + 1,
                        "Received vote"
                    );
                    if self.state.has_vote_quorum() {
                        self.become_leader();
                    }
                }
            }
            RaftEvent::Append { peer, term, response } => {
                if response.term > self.state.current_term() {
                    self.step_down(response.term, None);
                    return;
                }
                if !self.state.is_leader() || term != self.state.current_term() {
                    return;
                }

                let last_index = self.log.last_index();
                let resend = match self.state.leader.as_mut() {
                    Some(leader) => {
                        if response.success {
                            leader.update_match(peer, response.match_index);
                            response.match_index < last_index
                        } else {
                            leader.back_off(peer, response.conflict_index);
                            true
                        }
                    }
                    None => false,
                };

                if response.success {
                    self.advance_commit_index();
                }
                if resend {
                    self.replicate_to(peer);
                }
            }
        }
    }

    /// Start a new election.
    fn start_election(&mut self) {
        let previous = self.state.persistent.clone();
        self.state.become_candidate();
        self.reset_election_deadline();
        if let Err(e) = self.persist_state() {
            error!(
                node_id = self.config.node_id,
                term = self.state.current_term(),
                error = %e,
                "Failed to persist candidacy, skipping election round"
            );
            self.state.become_follower(previous.current_term, None);
            self.state.persistent = previous;
            return;
        }
        observability::record_election();

        let term = self.state.current_term();
        info!(node_id = self.config.node_id, term, "Starting election");

        if self.state.has_vote_quorum() {
            self.become_leader();
            return;
        }

        let request = RequestVoteRequest {
            term,
            candidate_id: self.config.node_id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };

        for &peer in &self.state.peers {
            let rpc = Arc::clone(&self.rpc);
            let events = self.event_tx.clone();
            let req = request.clone();
            let rpc_timeout = self.config.rpc_timeout;
            tokio::spawn(async move {
                match timeout(rpc_timeout, rpc.request_vote(peer, req)).await {
                    Ok(Ok(response)) => {
                        let _ = events.send(RaftEvent::Vote { peer, term, response });
                    }
                    Ok(Err(e)) => debug!(peer, error = %e, "RequestVote failed"),
                    Err(_) => debug!(peer, "RequestVote timed out"),
                }
            });
        }
    }

    fn become_leader(&mut self) {
        self.state.become_leader(self.log.last_index());
        info!(
            node_id = self.config.node_id,
            term = self.state.current_term(),
            "Won election, became leader"
        );

        // Entries from earlier terms only commit once an entry of the
        // current term does.
        let noop = LogEntry::noop(self.state.current_term(), self.log.last_index() + 1);
        if let Err(e) = self.append_local(noop) {
            error!(error = %e, "Failed to append leader no-op, stepping down");
            let term = self.state.current_term();
            self.step_down(term, None);
            return;
        }

        self.advance_commit_index();
        self.replicate_to_all();
    }

    /// Revert to follower. Pending submissions fail with NotLeader.
    fn step_down(&mut self, term: Term, leader_id: Option<NodeId>) {
        let was_leader = self.state.is_leader();
        self.state.become_follower(term, leader_id);
        if let Err(e) = self.persist_state() {
            // Nothing was promised in the new term yet; the next vote or
            // candidacy persists it again.
            error!(node_id = self.config.node_id, term, error = %e, "Failed to persist term");
        }
        self.reset_election_deadline();

        if was_leader && !self.pending.is_empty() {
            warn!(
                node_id = self.config.node_id,
                pending = self.pending.len(),
                "Lost leadership with pending submissions"
            );
            for (_, (_, tx)) in self.pending.drain() {
                let _ = tx.send(Err(GeolockError::NotLeader { leader: leader_id }));
            }
        }
    }

    fn replicate_to_all(&mut self) {
        if !self.state.is_leader() {
            return;
        }
        for peer in self.state.peers.clone() {
            self.replicate_to(peer);
        }
    }

    /// Send one AppendEntries to `peer` from its next_index.
    fn replicate_to(&self, peer: NodeId) {
        let next_index = match &self.state.leader {
            Some(leader) => leader.next_index.get(&peer).copied().unwrap_or(1),
            None => return,
        };

        let prev_log_index = next_index.saturating_sub(1);
        let request = AppendEntriesRequest {
            term: self.state.current_term(),
            leader_id: self.config.node_id,
            prev_log_index,
            prev_log_term: self.log.term_at(prev_log_index).unwrap_or(0),
            entries: self.log.entries_from(next_index, self.config.max_entries_per_append),
            leader_commit: self.state.commit_index,
        };

        let term = request.term;
        let rpc = Arc::clone(&self.rpc);
        let events = self.event_tx.clone();
        let rpc_timeout = self.config.rpc_timeout;
        tokio::spawn(async move {
            match timeout(rpc_timeout, rpc.append_entries(peer, request)).await {
                Ok(Ok(response)) => {
                    let _ = events.send(RaftEvent::Append { peer, term, response });
                }
                Ok(Err(e)) => debug!(peer, error = %e, "AppendEntries failed"),
                Err(_) => debug!(peer, "AppendEntries timed out"),
            }
        });
    }

    /// Commit the highest index held by a majority, if it is from our term.
    fn advance_commit_index(&mut self) {
        if !self.state.is_leader() {
            return;
        }
        let candidate = self.state.majority_match_index(self.log.last_index());
        if candidate > self.state.commit_index
            && self.log.term_at(candidate) == Some(self.state.current_term())
        {
            self.state.commit_index = candidate;
            debug!(
                node_id = self.state.node_id,
                commit_index = candidate,
                "Updated commit index"
            );
        }
    }

    /// Apply committed entries to the state machine in index order.
    fn apply_committed_entries(&mut self) {
        while self.state.last_applied < self.state.commit_index {
            let index = self.state.last_applied + 1;
            let entry = match self.log.get(index) {
                Some(entry) => entry.clone(),
                None => {
                    error!(index, "Committed entry missing from log");
                    return;
                }
            };

            let result = if entry.is_noop() {
                None
            } else {
                Some(self.state_machine.apply(index, entry.data_bytes()))
            };
            self.state.last_applied = index;

            if let Some((term, tx)) = self.pending.remove(&index) {
                let outcome = match result {
                    Some(result) if term == entry.term => Ok(result),
                    Some(_) => Err(GeolockError::NotLeader {
                        leader: self.state.leader_id,
                    }),
                    None => Err(GeolockError::Internal(format!(
                        "entry {} was replaced by a no-op",
                        index
                    ))),
                };
                let _ = tx.send(outcome);
            }
        }
    }

    fn publish_status(&self) {
        let status = RaftStatus {
            node_id: self.config.node_id,
            state: self.state.state,
            term: self.state.current_term(),
            leader_id: self.state.leader_id,
            commit_index: self.state.commit_index,
            last_applied: self.state.last_applied,
            last_log_index: self.log.last_index(),
        };
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            observability::update_raft_metrics(
                status.term,
                status.commit_index,
                status.state.is_leader(),
            );
            *current = status;
            true
        });
    }

    /// Make the current term and vote durable. Nothing that depends on
    /// them may be sent until this succeeds.
    fn persist_state(&mut self) -> Result<()> {
        self.storage.save_persistent_state(&self.state.persistent)
    }

    /// Draw a fresh deadline from [T, 2T].
    fn reset_election_deadline(&mut self) {
        let base = self.config.election_timeout;
        let timeout = rand::thread_rng().gen_range(base..=base * 2);
        self.election_deadline = Instant::now() + timeout;
    }
}

/// Cloneable handle for talking to a running [`RaftNode`].
pub struct RaftHandle<R> {
    node_id: NodeId,
    command_tx: mpsc::Sender<RaftCommand<R>>,
    status_rx: watch::Receiver<RaftStatus>,
    submit_timeout: Duration,
}

impl<R> Clone for RaftHandle<R> {
    fn clone(&self) -> Self {
        Self {
            node_id: self.node_id,
            command_tx: self.command_tx.clone(),
            status_rx: self.status_rx.clone(),
            submit_timeout: self.submit_timeout,
        }
    }
}

impl<R: Send + 'static> RaftHandle<R> {
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Replicate `data` and wait for it to be applied.
    ///
    /// Fails with `NotLeader` on a follower or when leadership is lost
    /// before commit, and with `Timeout` after the configured submit
    /// timeout.
    pub async fn submit(&self, data: Vec<u8>) -> Result<R> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(RaftCommand::Submit { data, response: tx })
            .await
            .map_err(|_| GeolockError::ShuttingDown)?;

        match timeout(self.submit_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(GeolockError::ShuttingDown),
            Err(_) => Err(GeolockError::Timeout(self.submit_timeout.as_millis() as u64)),
        }
    }

    /// Deliver an inbound RequestVote.
    pub async fn request_vote(&self, request: RequestVoteRequest) -> Result<RequestVoteResponse> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(RaftCommand::RequestVote { request, response: tx })
            .await
            .map_err(|_| GeolockError::ShuttingDown)?;
        rx.await.map_err(|_| GeolockError::ShuttingDown)
    }

    /// Deliver an inbound AppendEntries.
    pub async fn append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(RaftCommand::AppendEntries { request, response: tx })
            .await
            .map_err(|_| GeolockError::ShuttingDown)?;
        rx.await.map_err(|_| GeolockError::ShuttingDown)
    }

    pub fn status(&self) -> RaftStatus {
        self.status_rx.borrow().clone()
    }

    pub fn is_leader(&self) -> bool {
        self.status_rx.borrow().state.is_leader()
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.status_rx.borrow().leader_id
    }

    pub fn subscribe(&self) -> watch::Receiver<RaftStatus> {
        self.status_rx.clone()
    }

    /// Wait until the published status satisfies `predicate`.
    pub async fn wait_for<F>(&self, wait: Duration, predicate: F) -> Result<RaftStatus>
    where
        F: FnMut(&RaftStatus) -> bool,
    {
        let mut rx = self.status_rx.clone();
        let waited = timeout(wait, rx.wait_for(predicate)).await;
        match waited {
            Ok(Ok(status)) => Ok(status.clone()),
            Ok(Err(_)) => Err(GeolockError::ShuttingDown),
            Err(_) => Err(GeolockError::Timeout(wait.as_millis() as u64)),
        }
    }

    /// Wait until some node is known to lead. Returns its id.
    pub async fn wait_for_leader(&self, wait: Duration) -> Result<NodeId> {
        let status = self.wait_for(wait, |s| s.leader_id.is_some()).await?;
        status
            .leader_id
            .ok_or_else(|| GeolockError::Internal("leader vanished".into()))
    }

    /// Ask the node to stop. Pending submissions fail with `ShuttingDown`.
    pub async fn shutdown(&self) {
        let _ = self.command_tx.send(RaftCommand::Shutdown).await;
    }
}
