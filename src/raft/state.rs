use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "Follower"),
            RaftRole::Candidate => write!(f, "Candidate"),
            RaftRole::Leader => write!(f, "Leader"),
        }
    }
}

#[derive(Debug)]
pub struct RaftState {
    // Persistent state, mirrored to the log's hard state by the node
    pub current_term: AtomicU64,
    pub voted_for: RwLock<Option<u64>>,

    // Volatile state
    pub role: RwLock<RaftRole>,
    pub commit_index: AtomicU64,
    pub last_applied: AtomicU64,

    // Leader volatile state
    pub next_index: RwLock<HashMap<u64, u64>>,
    pub match_index: RwLock<HashMap<u64, u64>>,

    /// Known leader; subscribers are woken on every change.
    leader_tx: watch::Sender<Option<u64>>,
}

impl RaftState {
    pub fn new() -> Self {
        let (leader_tx, _) = watch::channel(None);
        Self {
            current_term: AtomicU64::new(0),
            voted_for: RwLock::new(None),
            role: RwLock::new(RaftRole::Follower),
            commit_index: AtomicU64::new(0),
            last_applied: AtomicU64::new(0),
            next_index: RwLock::new(HashMap::new()),
            match_index: RwLock::new(HashMap::new()),
            leader_tx,
        }
    }

    pub fn restore_hard_state(&self, term: u64, voted_for: Option<u64>) {
        self.current_term.store(term, Ordering::Release);
        *self.voted_for.write() = voted_for;
    }

    /// Steps down to follower. A higher term also forgets the vote and the
    /// leader of the previous term.
    pub fn become_follower(&self, term: u64) {
        if term > self.term() {
            self.current_term.store(term, Ordering::Release);
            *self.voted_for.write() = None;
            self.set_leader_id(None);
        }
        *self.role.write() = RaftRole::Follower;
    }

    /// Starts a new term voting for `self_id` and returns the term.
    pub fn become_candidate(&self, self_id: u64) -> u64 {
        let new_term = self.current_term.fetch_add(1, Ordering::AcqRel) + 1;
        *self.role.write() = RaftRole::Candidate;
        *self.voted_for.write() = Some(self_id);
        self.set_leader_id(None);
        new_term
    }

    /// Takes leadership for the current term. Peers start replicating from
    /// `next_log_index`.
    pub fn become_leader(&self, self_id: u64, peer_ids: &[u64], next_log_index: u64) {
        *self.role.write() = RaftRole::Leader;

        let mut next_idx = HashMap::new();
        let mut match_idx = HashMap::new();
        for &peer_id in peer_ids {
            next_idx.insert(peer_id, next_log_index);
            match_idx.insert(peer_id, 0);
        }
        *self.next_index.write() = next_idx;
        *self.match_index.write() = match_idx;

        self.set_leader_id(Some(self_id));
    }

    pub fn is_leader(&self) -> bool {
        *self.role.read() == RaftRole::Leader
    }

    pub fn is_candidate(&self) -> bool {
        *self.role.read() == RaftRole::Candidate
    }

    pub fn is_follower(&self) -> bool {
        *self.role.read() == RaftRole::Follower
    }

    pub fn role(&self) -> RaftRole {
        *self.role.read()
    }

    pub fn term(&self) -> u64 {
        self.current_term.load(Ordering::Acquire)
    }

    pub fn voted_for(&self) -> Option<u64> {
        *self.voted_for.read()
    }

    pub fn vote_for(&self, candidate_id: u64) {
        *self.voted_for.write() = Some(candidate_id);
    }

    pub fn leader_id(&self) -> Option<u64> {
        *self.leader_tx.borrow()
    }

    pub fn set_leader_id(&self, leader_id: Option<u64>) {
        self.leader_tx.send_if_modified(|current| {
            if *current == leader_id {
                return false;
            }
            *current = leader_id;
            true
        });
    }

    /// Receiver that observes every leader change.
    pub fn subscribe_leader(&self) -> watch::Receiver<Option<u64>> {
        self.leader_tx.subscribe()
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index.load(Ordering::Acquire)
    }

    pub fn set_commit_index(&self, index: u64) {
        self.commit_index.store(index, Ordering::Release);
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied.load(Ordering::Acquire)
    }

    pub fn set_last_applied(&self, index: u64) {
        self.last_applied.store(index, Ordering::Release);
    }

    pub fn next_index(&self, peer_id: u64) -> Option<u64> {
        self.next_index.read().get(&peer_id).copied()
    }

    pub fn set_next_index(&self, peer_id: u64, index: u64) {
        self.next_index.write().insert(peer_id, index);
    }

    pub fn match_index(&self, peer_id: u64) -> Option<u64> {
        self.match_index.read().get(&peer_id).copied()
    }

    pub fn set_match_index(&self, peer_id: u64, index: u64) {
        self.match_index.write().insert(peer_id, index);
    }

    /// Highest index stored on a majority of the cluster, counting the
    /// leader's own log as `leader_last_index`.
    pub fn majority_match_index(&self, peer_ids: &[u64], leader_last_index: u64) -> u64 {
        let mut indices: Vec<u64> = peer_ids
            .iter()
            .map(|&id| self.match_index(id).unwrap_or(0))
            .collect();
        indices.push(leader_last_index);
        indices.sort_unstable_by(|a, b| b.cmp(a));

        let majority = indices.len() / 2 + 1;
        indices[majority - 1]
    }
}

impl Default for RaftState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_become_leader_keeps_term() {
        let state = RaftState::new();
        let term = state.become_candidate(1);
        assert_eq!(term, 1);
        assert_eq!(state.voted_for(), Some(1));

        state.become_leader(1, &[2, 3], 5);
        assert_eq!(state.term(), 1);
        assert_eq!(state.leader_id(), Some(1));
        assert_eq!(state.next_index(2), Some(5));
        assert_eq!(state.match_index(3), Some(0));
    }

    #[test]
    fn test_become_follower_higher_term_clears_vote() {
        let state = RaftState::new();
        state.become_candidate(1);

        state.become_follower(1);
        assert_eq!(state.voted_for(), Some(1));

        state.become_follower(4);
        assert_eq!(state.term(), 4);
        assert_eq!(state.voted_for(), None);
        assert!(state.is_follower());
    }

    #[test]
    fn test_majority_match_index() {
        let state = RaftState::new();
        state.set_match_index(2, 7);
        state.set_match_index(3, 3);
        assert_eq!(state.majority_match_index(&[2, 3], 9), 7);

        state.set_match_index(4, 2);
        state.set_match_index(5, 1);
        assert_eq!(state.majority_match_index(&[2, 3, 4, 5], 9), 3);

        assert_eq!(state.majority_match_index(&[], 4), 4);
    }

    #[tokio::test]
    async fn test_leader_changes_are_observable() {
        let state = RaftState::new();
        let mut rx = state.subscribe_leader();

        state.set_leader_id(Some(2));
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), Some(2));

        // Same value does not wake subscribers.
        state.set_leader_id(Some(2));
        assert!(!rx.has_changed().unwrap());
    }
}
