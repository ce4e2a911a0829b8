use crate::raft::config::RaftConfig;
use crate::raft::log::{EntryType, HardState, LogEntry, RaftLog};
use crate::raft::state::{RaftRole, RaftState};
use crate::raft::transport::RaftTransport;
use crate::raft::{RaftError, RaftMessage, RaftResult, StateMachine};
use crate::raftpb::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RequestVoteRequest, RequestVoteResponse,
};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A proposal waiting for its entry to be applied.
struct Waiter<R> {
    term: u64,
    tx: oneshot::Sender<R>,
}

pub struct RaftNode<M: StateMachine> {
    config: Arc<RaftConfig>,
    state: Arc<RaftState>,
    log: Arc<RaftLog>,
    transport: Arc<dyn RaftTransport>,
    fsm: Arc<M>,

    /// Guards role, term, vote and log mutation so each RPC handler and
    /// proposal sees a consistent view.
    core: Mutex<()>,
    /// Serializes state machine access between apply, snapshot and restore.
    apply_lock: Mutex<()>,

    waiters: Mutex<BTreeMap<u64, Waiter<M::Response>>>,
    applied_tx: watch::Sender<u64>,
    /// Index of the no-op appended when this node last won an election.
    term_start_index: AtomicU64,

    election_timer: Mutex<Instant>,
    heartbeat_timer: Mutex<Option<Instant>>,
    inflight: Mutex<HashSet<u64>>,

    // Replication results flow back to the event loop through this queue
    message_tx: mpsc::UnboundedSender<(u64, RaftMessage)>,
    message_rx: Mutex<Option<mpsc::UnboundedReceiver<(u64, RaftMessage)>>>,
    kick: Notify,
}

impl<M: StateMachine> RaftNode<M> {
    pub fn new(
        config: RaftConfig,
        log: Arc<RaftLog>,
        transport: Arc<dyn RaftTransport>,
        fsm: Arc<M>,
    ) -> RaftResult<Self> {
        config.validate()?;

        let state = Arc::new(RaftState::new());
        let hard_state = log.hard_state()?;
        state.restore_hard_state(hard_state.term, hard_state.voted_for);

        // Committed entries past the snapshot are re-applied once a leader
        // re-establishes the commit index.
        if let Some(data) = log.snapshot_data() {
            fsm.restore(&data)?;
            state.set_commit_index(log.snapshot_index());
            state.set_last_applied(log.snapshot_index());
        }

        let (applied_tx, _) = watch::channel(state.last_applied());
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let election_deadline = Instant::now() + random_election_timeout(&config);

        Ok(Self {
            config: Arc::new(config),
            state,
            log,
            transport,
            fsm,
            core: Mutex::new(()),
            apply_lock: Mutex::new(()),
            waiters: Mutex::new(BTreeMap::new()),
            applied_tx,
            term_start_index: AtomicU64::new(0),
            election_timer: Mutex::new(election_deadline),
            heartbeat_timer: Mutex::new(None),
            inflight: Mutex::new(HashSet::new()),
            message_tx,
            message_rx: Mutex::new(Some(message_rx)),
            kick: Notify::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.config.id
    }

    pub fn is_leader(&self) -> bool {
        self.state.is_leader()
    }

    pub fn leader_id(&self) -> Option<u64> {
        self.state.leader_id()
    }

    /// Peer address of the current leader, if known and not this node.
    pub fn leader_address(&self) -> Option<String> {
        let leader = self.state.leader_id()?;
        if leader == self.config.id {
            return None;
        }
        self.config.peer_address(leader).map(str::to_string)
    }

    pub fn current_term(&self) -> u64 {
        self.state.term()
    }

    pub fn get_state(&self) -> Arc<RaftState> {
        self.state.clone()
    }

    pub fn get_log(&self) -> Arc<RaftLog> {
        self.log.clone()
    }

    pub fn get_config(&self) -> Arc<RaftConfig> {
        self.config.clone()
    }

    pub fn state_machine(&self) -> &Arc<M> {
        &self.fsm
    }

    fn peer_ids(&self) -> Vec<u64> {
        self.config.peer_ids()
    }

    fn majority(&self) -> usize {
        (self.peer_ids().len() + 1) / 2 + 1
    }

    fn reset_election_timer(&self) {
        *self.election_timer.lock() = Instant::now() + random_election_timeout(&self.config);
    }

    fn persist_hard_state(&self) -> RaftResult<()> {
        self.log.save_hard_state(HardState {
            term: self.state.term(),
            voted_for: self.state.voted_for(),
        })
    }

    /// Steps down to follower. Must be called with `core` held.
    fn become_follower_locked(&self, term: u64) -> RaftResult<()> {
        let was_leader = self.state.is_leader();
        self.state.become_follower(term);
        self.persist_hard_state()?;

        if was_leader {
            info!(node_id = self.config.id, term, "Stepped down from leader");
            // Dropping the senders tells proposers leadership was lost.
            self.waiters.lock().clear();
            self.inflight.lock().clear();
        }
        Ok(())
    }

    fn step_down(&self, term: u64) -> RaftResult<()> {
        let _guard = self.core.lock();
        if term > self.state.term() {
            self.become_follower_locked(term)?;
        }
        Ok(())
    }

    async fn tick(&self) -> RaftResult<()> {
        let now = Instant::now();

        let election_expired = !self.state.is_leader() && now >= *self.election_timer.lock();
        if election_expired {
            self.reset_election_timer();
            self.start_election().await?;
        }

        if self.state.is_leader() {
            let heartbeat_due = {
                let mut timer = self.heartbeat_timer.lock();
                match *timer {
                    Some(t) if now < t => false,
                    _ => {
                        *timer = Some(now + self.config.heartbeat_interval);
                        true
                    }
                }
            };
            if heartbeat_due {
                self.broadcast(true)?;
            }
        }

        self.apply_committed()?;
        self.maybe_compact()
    }

    async fn start_election(&self) -> RaftResult<()> {
        let (term, request) = {
            let _guard = self.core.lock();
            if self.state.is_leader() {
                return Ok(());
            }
            let term = self.state.become_candidate(self.config.id);
            self.persist_hard_state()?;
            let request = RequestVoteRequest {
                term,
                candidate_id: self.config.id,
                last_log_index: self.log.last_index(),
                last_log_term: self.log.last_term(),
            };
            (term, request)
        };

        let peers = self.peer_ids();
        let majority = self.majority();
        info!(node_id = self.config.id, term, "Starting election");

        if peers.is_empty() {
            return self.become_leader(term);
        }

        let (vote_tx, mut vote_rx) = mpsc::channel::<Option<RequestVoteResponse>>(peers.len());
        for peer_id in peers.iter().copied() {
            let request = request.clone();
            let transport = self.transport.clone();
            let vote_tx = vote_tx.clone();

            tokio::spawn(async move {
                let response = match transport.send_request_vote(peer_id, request).await {
                    Ok(response) => Some(response),
                    Err(e) => {
                        debug!(peer_id, error = %e, "RequestVote failed");
                        None
                    }
                };
                let _ = vote_tx.send(response).await;
            });
        }
        drop(vote_tx); // rx completes when all spawned tasks finish

        // Count votes (self-vote = 1)
        let mut vote_count: usize = 1;
        let deadline = Instant::now() + random_election_timeout(&self.config);
        loop {
            tokio::select! {
                result = vote_rx.recv() => {
                    match result {
                        Some(Some(response)) => {
                            if response.term > term {
                                return self.step_down(response.term);
                            }
                            if response.vote_granted {
                                vote_count += 1;
                            }
                            if vote_count >= majority {
                                info!(node_id = self.config.id, term, votes = vote_count, "Won election");
                                return self.become_leader(term);
                            }
                        }
                        Some(None) => {}
                        None => break,
                    }
                }
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }

        debug!(
            node_id = self.config.id,
            term,
            votes = vote_count,
            total = peers.len() + 1,
            "Election inconclusive"
        );
        Ok(())
    }

    fn become_leader(&self, term: u64) -> RaftResult<()> {
        {
            let _guard = self.core.lock();
            if self.state.term() != term || self.state.role() != RaftRole::Candidate {
                return Ok(());
            }

            let index = self.log.last_index() + 1;
            self.state.become_leader(self.config.id, &self.peer_ids(), index);
            self.log.append(&[LogEntry {
                index,
                term,
                data: Vec::new(),
                entry_type: EntryType::Noop,
            }])?;
            self.term_start_index.store(index, Ordering::Release);
            *self.heartbeat_timer.lock() = Some(Instant::now() + self.config.heartbeat_interval);
            self.inflight.lock().clear();
        }

        info!(node_id = self.config.id, term, "Became leader");
        self.advance_commit()?;
        self.broadcast(true)?;
        self.kick.notify_one();
        Ok(())
    }

    /// Sends AppendEntries (or a snapshot) to every peer without a request in
    /// flight. Without `heartbeat`, peers that are caught up are skipped.
    fn broadcast(&self, heartbeat: bool) -> RaftResult<()> {
        if !self.state.is_leader() {
            return Ok(());
        }
        let last_index = self.log.last_index();
        for peer_id in self.peer_ids() {
            let next = self.state.next_index(peer_id).unwrap_or(last_index + 1);
            if heartbeat || next <= last_index {
                self.send_to(peer_id)?;
            }
        }
        Ok(())
    }

    fn send_to(&self, peer_id: u64) -> RaftResult<()> {
        if !self.inflight.lock().insert(peer_id) {
            return Ok(());
        }

        let result = self.spawn_replication(peer_id);
        if result.is_err() {
            self.inflight.lock().remove(&peer_id);
        }
        result
    }

    fn spawn_replication(&self, peer_id: u64) -> RaftResult<()> {
        let term = self.state.term();
        let next = self.state.next_index(peer_id).unwrap_or(1).max(1);
        let transport = self.transport.clone();
        let message_tx = self.message_tx.clone();

        // If the follower is behind our first log index, send a snapshot instead
        if next < self.log.first_index() {
            if let Some(data) = self.log.snapshot_data() {
                let last_included_index = self.log.snapshot_index();
                let req = InstallSnapshotRequest {
                    term,
                    leader_id: self.config.id,
                    last_included_index,
                    last_included_term: self.log.snapshot_term(),
                    data,
                };

                tokio::spawn(async move {
                    let message = match transport.send_install_snapshot(peer_id, req).await {
                        Ok(response) => RaftMessage::InstallSnapshotResponse {
                            last_included_index,
                            response,
                        },
                        Err(e) => {
                            warn!(peer_id, error = %e, "Failed to send snapshot to follower");
                            RaftMessage::Unreachable
                        }
                    };
                    let _ = message_tx.send((peer_id, message));
                });
                return Ok(());
            }
        }

        let prev_log_index = next - 1;
        let prev_log_term = self.log.term_at(prev_log_index)?.unwrap_or(0);
        let entries = self
            .log
            .get_range(next, next + self.config.max_log_entries_per_request as u64)?
            .into_iter()
            .map(Into::into)
            .collect();

        let request = AppendEntriesRequest {
            term,
            leader_id: self.config.id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.state.commit_index(),
        };

        tokio::spawn(async move {
            let message = match transport.send_append_entries(peer_id, request).await {
                Ok(response) => RaftMessage::AppendEntriesResponse(response),
                Err(e) => {
                    debug!(peer_id, error = %e, "AppendEntries failed");
                    RaftMessage::Unreachable
                }
            };
            let _ = message_tx.send((peer_id, message));
        });
        Ok(())
    }

    fn step(&self, peer_id: u64, msg: RaftMessage) -> RaftResult<()> {
        self.inflight.lock().remove(&peer_id);

        match msg {
            RaftMessage::AppendEntriesResponse(response) => {
                if response.term > self.state.term() {
                    return self.step_down(response.term);
                }
                if !self.state.is_leader() || response.term < self.state.term() {
                    return Ok(());
                }

                if response.success {
                    let matched = self.state.match_index(peer_id).unwrap_or(0);
                    if response.match_index > matched {
                        self.state.set_match_index(peer_id, response.match_index);
                    }
                    let matched = self.state.match_index(peer_id).unwrap_or(0);
                    self.state.set_next_index(peer_id, matched + 1);
                    self.advance_commit()?;
                } else {
                    let next = self.state.next_index(peer_id).unwrap_or(1);
                    let next = if response.conflict_index > 0 {
                        response.conflict_index.min(next.saturating_sub(1)).max(1)
                    } else {
                        next.saturating_sub(1).max(1)
                    };
                    self.state.set_next_index(peer_id, next);
                }
            }
            RaftMessage::InstallSnapshotResponse {
                last_included_index,
                response,
            } => {
                if response.term > self.state.term() {
                    return self.step_down(response.term);
                }
                if !self.state.is_leader() {
                    return Ok(());
                }
                let matched = self
                    .state
                    .match_index(peer_id)
                    .unwrap_or(0)
                    .max(last_included_index);
                self.state.set_match_index(peer_id, matched);
                self.state.set_next_index(peer_id, matched + 1);
                info!(peer_id, snapshot_index = last_included_index, "Sent snapshot to follower");
            }
            RaftMessage::Unreachable => return Ok(()),
        }

        // Keep a lagging peer busy until it catches up.
        let next = self.state.next_index(peer_id).unwrap_or(1);
        if self.state.is_leader() && next <= self.log.last_index() {
            self.send_to(peer_id)?;
        }
        Ok(())
    }

    /// Commits the highest index stored on a majority, as long as it belongs
    /// to the current term.
    fn advance_commit(&self) -> RaftResult<()> {
        if !self.state.is_leader() {
            return Ok(());
        }
        let candidate = self
            .state
            .majority_match_index(&self.peer_ids(), self.log.last_index());
        if candidate <= self.state.commit_index() {
            return Ok(());
        }
        if self.log.term_at(candidate)? == Some(self.state.term()) {
            self.state.set_commit_index(candidate);
            self.kick.notify_one();
        }
        Ok(())
    }

    fn apply_committed(&self) -> RaftResult<()> {
        let _apply = self.apply_lock.lock();
        let commit_index = self.state.commit_index();

        while self.state.last_applied() < commit_index {
            let index = self.state.last_applied() + 1;
            let Some(entry) = self.log.get(index)? else {
                return Err(RaftError::LogError(format!(
                    "Committed entry {} missing from log",
                    index
                )));
            };

            let response = match entry.entry_type {
                EntryType::Normal => Some(self.fsm.apply(index, &entry.data)),
                EntryType::Noop => None,
            };
            self.state.set_last_applied(index);

            let waiter = self.waiters.lock().remove(&index);
            if let (Some(waiter), Some(response)) = (waiter, response) {
                if waiter.term == entry.term {
                    let _ = waiter.tx.send(response);
                }
            }
            self.applied_tx.send_replace(index);
        }
        Ok(())
    }

    fn maybe_compact(&self) -> RaftResult<()> {
        let applied = self.state.last_applied();
        if applied.saturating_sub(self.log.snapshot_index()) < self.config.snapshot_threshold {
            return Ok(());
        }

        let (index, data) = {
            let _apply = self.apply_lock.lock();
            (self.state.last_applied(), self.fsm.snapshot()?)
        };

        let _guard = self.core.lock();
        let term = self.log.term_at(index)?.unwrap_or(0);
        self.log.compact(index, term, data)?;
        info!(node_id = self.config.id, index, term, "Created snapshot");
        Ok(())
    }

    pub async fn handle_append_entries(&self, req: AppendEntriesRequest) -> AppendEntriesResponse {
        match self.append_entries(req) {
            Ok(response) => response,
            Err(e) => {
                warn!(node_id = self.config.id, error = %e, "AppendEntries failed locally");
                AppendEntriesResponse {
                    term: self.state.term(),
                    success: false,
                    match_index: 0,
                    conflict_index: 0,
                }
            }
        }
    }

    fn append_entries(&self, req: AppendEntriesRequest) -> RaftResult<AppendEntriesResponse> {
        let _guard = self.core.lock();
        let current_term = self.state.term();

        // Reply false if term < currentTerm
        if req.term < current_term {
            return Ok(AppendEntriesResponse {
                term: current_term,
                success: false,
                match_index: 0,
                conflict_index: 0,
            });
        }

        if req.term > current_term || !self.state.is_follower() {
            self.become_follower_locked(req.term)?;
        }
        self.state.set_leader_id(Some(req.leader_id));
        self.reset_election_timer();
        let term = self.state.term();

        let reject = |conflict_index: u64| AppendEntriesResponse {
            term,
            success: false,
            match_index: 0,
            conflict_index,
        };

        // Everything up to our commit index is already known to match.
        if req.prev_log_index < self.state.commit_index() {
            return Ok(AppendEntriesResponse {
                term,
                success: true,
                match_index: self.state.commit_index(),
                conflict_index: 0,
            });
        }

        if req.prev_log_index > self.log.last_index() {
            return Ok(reject(self.log.last_index() + 1));
        }

        if !self.log.has_entry(req.prev_log_index, req.prev_log_term) {
            let conflict_term = self.log.term_at(req.prev_log_index)?.unwrap_or(0);

            // Find first index with conflict_term
            let mut conflict_index = req.prev_log_index;
            while conflict_index > self.log.first_index()
                && self.log.term_at(conflict_index - 1)? == Some(conflict_term)
            {
                conflict_index -= 1;
            }
            return Ok(reject(conflict_index.max(1)));
        }

        let last_new_index = req.prev_log_index + req.entries.len() as u64;

        // Skip entries already present, truncate at the first conflict
        let mut new_entries: Vec<LogEntry> = Vec::new();
        for entry in req.entries.into_iter().map(LogEntry::from) {
            if new_entries.is_empty() {
                if entry.index <= self.log.snapshot_index() {
                    continue;
                }
                if entry.index <= self.log.last_index() {
                    if self.log.term_at(entry.index)? == Some(entry.term) {
                        continue;
                    }
                    self.log.truncate_after(entry.index - 1)?;
                }
            }
            new_entries.push(entry);
        }
        self.log.append(&new_entries)?;

        let commit_index = self.state.commit_index();
        if req.leader_commit > commit_index {
            let new_commit = req.leader_commit.min(last_new_index).max(commit_index);
            self.state.set_commit_index(new_commit);
            self.kick.notify_one();
        }

        Ok(AppendEntriesResponse {
            term,
            success: true,
            match_index: last_new_index,
            conflict_index: 0,
        })
    }

    pub async fn handle_request_vote(&self, req: RequestVoteRequest) -> RequestVoteResponse {
        match self.request_vote(req) {
            Ok(response) => response,
            Err(e) => {
                warn!(node_id = self.config.id, error = %e, "RequestVote failed locally");
                RequestVoteResponse {
                    term: self.state.term(),
                    vote_granted: false,
                }
            }
        }
    }

    fn request_vote(&self, req: RequestVoteRequest) -> RaftResult<RequestVoteResponse> {
        let _guard = self.core.lock();
        let current_term = self.state.term();

        // Reply false if term < currentTerm
        if req.term < current_term {
            return Ok(RequestVoteResponse {
                term: current_term,
                vote_granted: false,
            });
        }

        if req.term > current_term {
            self.become_follower_locked(req.term)?;
        }

        // Check if we've already voted
        let voted_for = self.state.voted_for();
        let can_vote = voted_for.is_none() || voted_for == Some(req.candidate_id);

        // Check if candidate's log is at least as up-to-date
        let last_index = self.log.last_index();
        let last_term = self.log.last_term();
        let log_ok = (req.last_log_term > last_term)
            || (req.last_log_term == last_term && req.last_log_index >= last_index);

        let vote_granted = can_vote && log_ok;
        if vote_granted {
            self.state.vote_for(req.candidate_id);
            self.persist_hard_state()?;
            self.reset_election_timer();
        }

        Ok(RequestVoteResponse {
            term: self.state.term(),
            vote_granted,
        })
    }

    pub async fn handle_install_snapshot(
        &self,
        req: InstallSnapshotRequest,
    ) -> InstallSnapshotResponse {
        match self.install_snapshot(req) {
            Ok(response) => response,
            Err(e) => {
                warn!(node_id = self.config.id, error = %e, "Failed to restore snapshot");
                InstallSnapshotResponse {
                    term: self.state.term(),
                }
            }
        }
    }

    fn install_snapshot(&self, req: InstallSnapshotRequest) -> RaftResult<InstallSnapshotResponse> {
        let _guard = self.core.lock();
        let current_term = self.state.term();

        if req.term < current_term {
            return Ok(InstallSnapshotResponse { term: current_term });
        }
        if req.term > current_term || !self.state.is_follower() {
            self.become_follower_locked(req.term)?;
        }
        self.state.set_leader_id(Some(req.leader_id));
        self.reset_election_timer();

        // Already covered by our own log.
        if req.last_included_index <= self.state.commit_index() {
            return Ok(InstallSnapshotResponse {
                term: self.state.term(),
            });
        }

        let _apply = self.apply_lock.lock();
        self.fsm.restore(&req.data)?;
        self.log
            .reset_to_snapshot(req.last_included_index, req.last_included_term, req.data)?;
        self.state.set_commit_index(req.last_included_index);
        self.state.set_last_applied(req.last_included_index);
        self.applied_tx.send_replace(req.last_included_index);

        info!(
            node_id = self.config.id,
            index = req.last_included_index,
            term = req.last_included_term,
            "Restored snapshot"
        );
        Ok(InstallSnapshotResponse {
            term: self.state.term(),
        })
    }

    /// Appends a command to the log and waits until it is applied, returning
    /// the state machine's response.
    pub async fn propose(&self, data: Vec<u8>) -> RaftResult<M::Response> {
        let (tx, rx) = oneshot::channel();
        let index = {
            let _guard = self.core.lock();
            if !self.state.is_leader() {
                return Err(RaftError::NotLeader);
            }

            let term = self.state.term();
            let index = self.log.last_index() + 1;
            self.log.append(&[LogEntry {
                index,
                term,
                data,
                entry_type: EntryType::Normal,
            }])?;
            self.waiters.lock().insert(index, Waiter { term, tx });
            index
        };

        // Single-node clusters commit right here; otherwise the event loop
        // replicates on the kick.
        self.advance_commit()?;
        self.kick.notify_one();

        match tokio::time::timeout(self.config.apply_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(RaftError::LeadershipLost),
            Err(_) => {
                self.waiters.lock().remove(&index);
                Err(RaftError::Timeout)
            }
        }
    }

    /// Confirms with a majority that this node is still the leader for its
    /// term.
    pub async fn verify_leader(&self) -> RaftResult<()> {
        let term = self.state.term();
        if !self.state.is_leader() {
            return Err(RaftError::NotLeader);
        }

        let peers = self.peer_ids();
        let majority = self.majority();
        let mut acks: usize = 1;

        if acks < majority {
            let (ack_tx, mut ack_rx) = mpsc::channel(peers.len());
            let request = AppendEntriesRequest {
                term,
                leader_id: self.config.id,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: Vec::new(),
                leader_commit: self.state.commit_index(),
            };
            for peer_id in peers {
                let transport = self.transport.clone();
                let request = request.clone();
                let ack_tx = ack_tx.clone();
                tokio::spawn(async move {
                    let result = transport.send_append_entries(peer_id, request).await;
                    let _ = ack_tx.send(result).await;
                });
            }
            drop(ack_tx);

            let deadline = Instant::now() + self.config.election_timeout_max;
            while acks < majority {
                tokio::select! {
                    result = ack_rx.recv() => match result {
                        Some(Ok(response)) if response.term > term => {
                            self.step_down(response.term)?;
                            return Err(RaftError::NotLeader);
                        }
                        Some(Ok(response)) if response.term == term => acks += 1,
                        Some(_) => {}
                        None => break,
                    },
                    _ = tokio::time::sleep_until(deadline) => break,
                }
            }
        }

        if acks < majority || self.state.term() != term || !self.state.is_leader() {
            return Err(RaftError::NotLeader);
        }
        Ok(())
    }

    /// Waits until everything committed so far, including the no-op of the
    /// current term, has been applied locally.
    pub async fn barrier(&self) -> RaftResult<()> {
        let target = self
            .state
            .commit_index()
            .max(self.term_start_index.load(Ordering::Acquire));
        self.wait_applied(target).await
    }

    pub async fn wait_applied(&self, index: u64) -> RaftResult<()> {
        let mut rx = self.applied_tx.subscribe();
        let waited = tokio::time::timeout(self.config.apply_timeout, async move {
            rx.wait_for(|applied| *applied >= index).await.map(|_| ())
        })
        .await;

        match waited {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(RaftError::LeadershipLost),
            Err(_) => Err(RaftError::Timeout),
        }
    }

    pub fn run(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let receiver = self.message_rx.lock().take();
            let Some(mut messages) = receiver else {
                warn!(node_id = self.config.id, "Raft event loop already running");
                return;
            };
            info!(node_id = self.config.id, "Raft event loop started");

            // Single-node cluster: no one else can win, elect right away
            if self.peer_ids().is_empty() {
                if let Err(e) = self.start_election().await {
                    warn!(error = %e, "Raft election error");
                }
            }

            let mut interval = tokio::time::interval(Duration::from_millis(10));
            loop {
                let result = tokio::select! {
                    _ = interval.tick() => self.tick().await,
                    _ = self.kick.notified() => {
                        self.broadcast(false).and_then(|_| self.apply_committed())
                    }
                    Some((peer_id, msg)) = messages.recv() => {
                        self.step(peer_id, msg).and_then(|_| self.apply_committed())
                    }
                };
                if let Err(e) = result {
                    warn!(node_id = self.config.id, error = %e, "Raft tick error");
                }
            }
        })
    }
}

fn random_election_timeout(config: &RaftConfig) -> Duration {
    let min = config.election_timeout_min.as_millis() as u64;
    let max = config.election_timeout_max.as_millis() as u64;
    Duration::from_millis(rand::thread_rng().gen_range(min..max.max(min + 1)))
}
