//! Core Raft state machine: persistent and volatile node state, the
//! RequestVote/AppendEntries handlers, election transitions, and the
//! leader's commit-index computation.
//!
//! `RaftCore` is synchronous and transport-agnostic. All mutation funnels
//! through one `Arc<Mutex<RaftCore>>` owner (see [`super::raft_node`]), which
//! serializes the five trigger sources against each other: election timeout,
//! heartbeat tick, inbound RequestVote, inbound AppendEntries, and client
//! proposals.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::RaftError;
use crate::metrics::RaftMetrics;
use crate::storage::{Storage, StorageError};

/// Raft node roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftState {
    /// Passive; replicates entries from the leader.
    Follower,
    /// Actively soliciting votes.
    Candidate,
    /// Handles proposals and drives replication.
    Leader,
}

/// A single log entry. Entries are immutable once appended; a later leader
/// may overwrite a conflicting suffix on a follower, never a matched prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Index in the log (1-based, gapless).
    pub index: u64,
    /// Term in which the entry was appended by a leader.
    pub term: u64,
    /// Opaque command payload for the state machine.
    pub command: Vec<u8>,
}

/// RequestVote RPC arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    pub term: u64,
    pub candidate_id: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

/// RequestVote RPC result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResult {
    pub term: u64,
    pub vote_granted: bool,
}

/// AppendEntries RPC arguments. Empty `entries` is a heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    pub term: u64,
    pub leader_id: u64,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

/// AppendEntries RPC result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResult {
    pub term: u64,
    pub success: bool,
}

/// InstallSnapshot RPC arguments. The slot is reserved in the protocol;
/// this node never sends one and answers every incoming one as
/// unimplemented.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotArgs {
    pub term: u64,
    pub leader_id: u64,
    pub last_included_index: u64,
    pub last_included_term: u64,
    #[serde(default)]
    pub data: Vec<u8>,
}

/// InstallSnapshot RPC result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResult {
    pub term: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Core Raft state. Persistent fields are cached in memory and written
/// through to [`Storage`] before any RPC response that depends on them.
pub struct RaftCore {
    storage: Box<dyn Storage>,
    metrics: Arc<RaftMetrics>,

    // Persistent state (durable before responding to RPCs).
    /// Latest term this node has seen. Monotonically non-decreasing.
    pub current_term: u64,
    /// Candidate that received this node's vote in `current_term`.
    pub voted_for: Option<u64>,
    /// Log entries; first index is 1.
    pub log: Vec<LogEntry>,

    // Volatile state.
    /// Highest log index known to be committed.
    pub commit_index: u64,
    /// Highest log index delivered to the state machine (owned by the
    /// apply pipeline; everything else only reads it).
    pub last_applied: u64,
    /// Current role.
    pub state: RaftState,
    /// Last node observed acting as leader for `current_term`.
    pub current_leader: Option<u64>,

    // Leader-only volatile state, rebuilt on election.
    /// Next log index to send to each peer.
    pub next_index: HashMap<u64, u64>,
    /// Highest log index known replicated on each peer.
    pub match_index: HashMap<u64, u64>,

    /// This node's identifier.
    pub id: u64,
    /// The other cluster members.
    pub peers: Vec<u64>,
    /// Peers that granted a vote in the current candidacy (self included).
    votes_received: Vec<u64>,

    /// Origin of the current election timeout window.
    pub timer_reset_at: Instant,
    /// Bumped on every timer reset; a firing that observed an older
    /// generation is stale and must be discarded.
    pub timer_generation: u64,

    /// Publishes `commit_index` advances to the apply pipeline.
    commit_tx: watch::Sender<u64>,
}

impl RaftCore {
    /// Create a core, restoring `current_term`, `voted_for`, and the log
    /// from durable storage. Fails if storage cannot be read: the node must
    /// not run on unpersisted state.
    pub fn new(id: u64, peers: Vec<u64>, storage: Box<dyn Storage>) -> Result<Self, StorageError> {
        let current_term = storage.load_term()?;
        let voted_for = storage.load_voted_for()?;
        let log = storage.load_log()?;
        let (commit_tx, _) = watch::channel(0);

        Ok(RaftCore {
            storage,
            metrics: Arc::new(RaftMetrics::default()),
            current_term,
            voted_for,
            log,
            commit_index: 0,
            last_applied: 0,
            state: RaftState::Follower,
            current_leader: None,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            id,
            peers,
            votes_received: Vec::new(),
            timer_reset_at: Instant::now(),
            timer_generation: 0,
            commit_tx,
        })
    }

    /// Counters shared with the fan-out and API layers.
    pub fn metrics(&self) -> Arc<RaftMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Subscribe to commit-index advances. Used by the apply pipeline.
    pub fn subscribe_commits(&self) -> watch::Receiver<u64> {
        self.commit_tx.subscribe()
    }

    // === Persistence helpers ===

    fn set_term(&mut self, term: u64) -> Result<(), StorageError> {
        self.storage.save_term(term)?;
        self.current_term = term;
        Ok(())
    }

    fn set_voted_for(&mut self, voted_for: Option<u64>) -> Result<(), StorageError> {
        self.storage.save_voted_for(voted_for)?;
        self.voted_for = voted_for;
        Ok(())
    }

    fn persist_log_entry(&mut self, entry: LogEntry) -> Result<(), StorageError> {
        self.storage.append_log_entries(std::slice::from_ref(&entry))?;
        self.log.push(entry);
        Ok(())
    }

    /// Remove entries at and after `from_index`, durably.
    fn persist_truncate_log(&mut self, from_index: u64) -> Result<(), StorageError> {
        let keep = (from_index - 1) as usize;
        if keep < self.log.len() {
            self.storage.truncate_log(from_index)?;
            self.log.truncate(keep);
        }
        Ok(())
    }

    /// Adopt a higher term and revert to follower, clearing the vote and
    /// any leader-only progress state.
    fn step_down(&mut self, term: u64) -> Result<(), StorageError> {
        let old_state = self.state;
        self.set_term(term)?;
        self.set_voted_for(None)?;
        self.state = RaftState::Follower;
        self.current_leader = None;
        self.next_index.clear();
        self.match_index.clear();
        self.votes_received.clear();
        if old_state != RaftState::Follower {
            info!(node = self.id, term, from = ?old_state, "stepped down to follower");
        }
        Ok(())
    }

    // === Log inspection ===

    /// Last log index (0 if the log is empty).
    pub fn last_log_index(&self) -> u64 {
        self.log.last().map(|e| e.index).unwrap_or(0)
    }

    /// Term of the last log entry (0 if the log is empty).
    pub fn last_log_term(&self) -> u64 {
        self.log.last().map(|e| e.term).unwrap_or(0)
    }

    /// Entry at a 1-based index.
    pub fn entry(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.log.get((index - 1) as usize)
    }

    /// Term at a 1-based index; 0 for index 0 or a missing entry.
    pub fn term_at(&self, index: u64) -> u64 {
        self.entry(index).map(|e| e.term).unwrap_or(0)
    }

    /// Entries at and after `from_index`, cloned for dispatch.
    pub fn entries_from(&self, from_index: u64) -> Vec<LogEntry> {
        if from_index == 0 {
            return self.log.clone();
        }
        let start = (from_index - 1) as usize;
        if start >= self.log.len() {
            return Vec::new();
        }
        self.log[start..].to_vec()
    }

    /// Whether a candidate's log is at least as up to date as ours,
    /// compared by `(last_log_term, last_log_index)` lexicographic order.
    pub fn is_log_up_to_date(&self, candidate_last_term: u64, candidate_last_index: u64) -> bool {
        let my_last_term = self.last_log_term();
        let my_last_index = self.last_log_index();
        candidate_last_term > my_last_term
            || (candidate_last_term == my_last_term && candidate_last_index >= my_last_index)
    }

    // === Timer ===

    /// Restart the election timeout window. Any pending firing that
    /// captured the previous generation becomes stale.
    pub fn reset_election_timer(&mut self) {
        self.timer_reset_at = Instant::now();
        self.timer_generation += 1;
    }

    // === RPC handlers ===

    /// Handle an incoming RequestVote.
    pub fn handle_request_vote(
        &mut self,
        req: &RequestVoteArgs,
    ) -> Result<RequestVoteResult, StorageError> {
        if req.term < self.current_term {
            return Ok(RequestVoteResult {
                term: self.current_term,
                vote_granted: false,
            });
        }

        if req.term > self.current_term {
            self.step_down(req.term)?;
        }

        let already_voted_elsewhere =
            self.voted_for.is_some() && self.voted_for != Some(req.candidate_id);
        if already_voted_elsewhere
            || !self.is_log_up_to_date(req.last_log_term, req.last_log_index)
        {
            return Ok(RequestVoteResult {
                term: self.current_term,
                vote_granted: false,
            });
        }

        self.set_voted_for(Some(req.candidate_id))?;
        self.reset_election_timer();
        debug!(node = self.id, term = self.current_term, candidate = req.candidate_id, "vote granted");

        Ok(RequestVoteResult {
            term: self.current_term,
            vote_granted: true,
        })
    }

    /// Handle an incoming AppendEntries (heartbeat or replication).
    pub fn handle_append_entries(
        &mut self,
        req: &AppendEntriesArgs,
    ) -> Result<AppendEntriesResult, StorageError> {
        if req.term > self.current_term {
            self.step_down(req.term)?;
        }

        if req.term < self.current_term {
            // Stale leader; do not reset the election timer.
            return Ok(AppendEntriesResult {
                term: self.current_term,
                success: false,
            });
        }

        // Valid AppendEntries from the current leader.
        self.state = RaftState::Follower;
        self.current_leader = Some(req.leader_id);
        self.reset_election_timer();

        // Consistency check: the log must contain prev_log_index with the
        // matching term. Failure here drives the leader's backtrack.
        if req.prev_log_index > 0
            && (req.prev_log_index > self.last_log_index()
                || self.term_at(req.prev_log_index) != req.prev_log_term)
        {
            return Ok(AppendEntriesResult {
                term: self.current_term,
                success: false,
            });
        }

        // Entries must run contiguously from prev_log_index + 1. The
        // transport accepts arbitrary JSON, so a batch with index 0 or a
        // gap must be refused here, not fed to the log.
        let contiguous = req
            .entries
            .iter()
            .enumerate()
            .all(|(offset, e)| e.index == req.prev_log_index + 1 + offset as u64);
        if !contiguous {
            warn!(node = self.id, leader = req.leader_id, "rejecting append with malformed entry indices");
            return Ok(AppendEntriesResult {
                term: self.current_term,
                success: false,
            });
        }

        self.store_entries(&req.entries)?;

        if req.leader_commit > self.commit_index {
            let new_commit = req.leader_commit.min(self.last_log_index());
            if new_commit > self.commit_index {
                self.set_commit_index(new_commit);
            }
        }

        Ok(AppendEntriesResult {
            term: self.current_term,
            success: true,
        })
    }

    /// Append incoming entries, truncating a conflicting suffix first.
    /// Entries already present with a matching term are left untouched so
    /// retransmissions cause no redundant writes.
    fn store_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        for entry in entries {
            match self.term_at(entry.index) {
                0 if entry.index > self.last_log_index() => {
                    self.persist_log_entry(entry.clone())?;
                    debug!(node = self.id, index = entry.index, term = entry.term, "appended entry");
                }
                existing if existing != entry.term => {
                    self.persist_truncate_log(entry.index)?;
                    self.persist_log_entry(entry.clone())?;
                    debug!(node = self.id, index = entry.index, term = entry.term, "replaced conflicting suffix");
                }
                _ => {} // Same index and term: already have it.
            }
        }
        Ok(())
    }

    /// Handle an incoming InstallSnapshot. Snapshot transfer is a reserved
    /// protocol slot this node does not implement; the log grows unboundedly
    /// and far-behind followers catch up through full log replication.
    pub fn handle_install_snapshot(&self, _req: &InstallSnapshotArgs) -> InstallSnapshotResult {
        InstallSnapshotResult {
            term: self.current_term,
            success: false,
            reason: Some("snapshot transfer not implemented".to_string()),
        }
    }

    // === Election ===

    /// Begin a candidacy: bump the term, vote for self, persist both, and
    /// restart the election timer. Vote solicitation is driven by the
    /// caller.
    pub fn start_election(&mut self) -> Result<(), StorageError> {
        self.set_term(self.current_term + 1)?;
        self.set_voted_for(Some(self.id))?;
        self.state = RaftState::Candidate;
        self.current_leader = None;
        self.votes_received.clear();
        self.votes_received.push(self.id);
        self.reset_election_timer();
        self.metrics.inc_elections();
        info!(node = self.id, term = self.current_term, "became candidate");
        Ok(())
    }

    /// Majority quorum for the full cluster including this node.
    pub fn majority(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    /// Transition to leader: rebuild per-peer progress. The caller must
    /// immediately send an empty AppendEntries to every peer to assert
    /// authority.
    pub fn become_leader(&mut self) {
        self.state = RaftState::Leader;
        self.current_leader = Some(self.id);
        let next = self.last_log_index() + 1;
        for &peer in &self.peers {
            self.next_index.insert(peer, next);
            self.match_index.insert(peer, 0);
        }
        self.metrics.inc_leader_changes();
        info!(node = self.id, term = self.current_term, "became leader");
    }

    /// Fold in a RequestVote response. Returns true if this tally reached a
    /// majority and the node became leader.
    pub fn handle_request_vote_result(
        &mut self,
        peer_id: u64,
        result: &RequestVoteResult,
    ) -> Result<bool, StorageError> {
        if result.term > self.current_term {
            self.step_down(result.term)?;
            return Ok(false);
        }
        if self.state != RaftState::Candidate {
            return Ok(false);
        }

        if result.vote_granted && !self.votes_received.contains(&peer_id) {
            self.votes_received.push(peer_id);
        }

        if self.votes_received.len() >= self.majority() {
            self.become_leader();
            return Ok(true);
        }
        Ok(false)
    }

    // === Replication bookkeeping (leader side) ===

    /// Fold in an AppendEntries response for a dispatch that covered
    /// `prev_log_index + 1 ..= prev_log_index + entries_len`.
    pub fn handle_append_entries_result(
        &mut self,
        peer_id: u64,
        prev_log_index: u64,
        entries_len: u64,
        result: &AppendEntriesResult,
    ) -> Result<(), StorageError> {
        if result.term > self.current_term {
            self.step_down(result.term)?;
            return Ok(());
        }
        if self.state != RaftState::Leader {
            return Ok(());
        }

        if result.success {
            let new_match = prev_log_index + entries_len;
            let current_match = self.match_index.get(&peer_id).copied().unwrap_or(0);
            if new_match > current_match {
                self.match_index.insert(peer_id, new_match);
            }
            let current_next = self.next_index.get(&peer_id).copied().unwrap_or(1);
            if new_match + 1 > current_next {
                self.next_index.insert(peer_id, new_match + 1);
            }
            self.advance_commit_index();
        } else {
            // Log inconsistency: back off and retry with an earlier prefix
            // on the next tick. Repeated failures converge on the matching
            // prefix.
            let current_next = self.next_index.get(&peer_id).copied().unwrap_or(1);
            if current_next > 1 {
                self.next_index.insert(peer_id, current_next - 1);
            }
            debug!(node = self.id, peer = peer_id, next = current_next.saturating_sub(1).max(1),
                "append rejected, backing off");
        }
        Ok(())
    }

    /// Advance `commit_index` to the highest index replicated on a majority
    /// whose entry was appended in the current term. Entries from earlier
    /// terms are never committed by majority count alone; they commit as a
    /// side effect once a current-term entry after them commits.
    pub fn advance_commit_index(&mut self) {
        let majority = self.majority();
        let mut n = self.last_log_index();
        while n > self.commit_index {
            let term = self.term_at(n);
            if term < self.current_term {
                // Terms are non-decreasing in the log; nothing below can
                // carry the current term either.
                break;
            }
            if term == self.current_term {
                let replicas =
                    1 + self.match_index.values().filter(|&&m| m >= n).count();
                if replicas >= majority {
                    debug!(node = self.id, index = n, replicas, "commit index advanced");
                    self.set_commit_index(n);
                    break;
                }
            }
            n -= 1;
        }
    }

    fn set_commit_index(&mut self, index: u64) {
        self.commit_index = index;
        self.commit_tx.send_replace(index);
    }

    // === Client proposals ===

    /// Append a client command to the local log. Returns the assigned index
    /// without waiting for commit; the caller polls the apply-result
    /// registry. Fails immediately when this node is not the leader.
    pub fn propose(&mut self, command: Vec<u8>) -> Result<u64, RaftError> {
        if self.state != RaftState::Leader {
            return Err(RaftError::NotLeader {
                leader_hint: self.current_leader,
            });
        }
        let entry = LogEntry {
            index: self.last_log_index() + 1,
            term: self.current_term,
            command,
        };
        let index = entry.index;
        self.persist_log_entry(entry).map_err(|e| {
            warn!(node = self.id, error = %e, "failed to persist proposal");
            e
        })?;
        self.metrics.inc_proposals();
        debug!(node = self.id, index, term = self.current_term, "proposal appended");
        // A single-node cluster commits on its own majority of one.
        self.advance_commit_index();
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;

    fn new_test_core(id: u64, peers: Vec<u64>) -> RaftCore {
        RaftCore::new(id, peers, Box::new(MemoryStorage::new())).unwrap()
    }

    fn entry(index: u64, term: u64, command: &str) -> LogEntry {
        LogEntry {
            index,
            term,
            command: command.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn new_node_starts_as_follower() {
        let node = new_test_core(1, vec![2, 3]);
        assert_eq!(node.id, 1);
        assert_eq!(node.current_term, 0);
        assert_eq!(node.state, RaftState::Follower);
        assert_eq!(node.commit_index, 0);
        assert_eq!(node.last_applied, 0);
        assert!(node.log.is_empty());
    }

    #[tokio::test]
    async fn start_election_bumps_term_and_votes_for_self() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.start_election().unwrap();
        assert_eq!(node.state, RaftState::Candidate);
        assert_eq!(node.current_term, 1);
        assert_eq!(node.voted_for, Some(1));
    }

    // Scenario: after winning an election with an empty log, the new
    // leader's next_index for every peer is 1.
    #[tokio::test]
    async fn uncontested_election_initializes_peer_progress() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.start_election().unwrap();
        let granted = RequestVoteResult {
            term: 1,
            vote_granted: true,
        };
        let became_leader = node.handle_request_vote_result(2, &granted).unwrap();
        assert!(became_leader);
        assert_eq!(node.state, RaftState::Leader);
        assert_eq!(node.current_term, 1);
        assert_eq!(node.next_index.get(&2), Some(&1));
        assert_eq!(node.next_index.get(&3), Some(&1));
        assert_eq!(node.match_index.get(&2), Some(&0));
        assert_eq!(node.match_index.get(&3), Some(&0));
        assert!(node.log.is_empty(), "no entry is appended on election");
    }

    // === RequestVote handler ===

    #[tokio::test]
    async fn vote_granted_on_fresh_term() {
        let mut node = new_test_core(1, vec![2, 3]);
        let result = node
            .handle_request_vote(&RequestVoteArgs {
                term: 1,
                candidate_id: 2,
                last_log_index: 0,
                last_log_term: 0,
            })
            .unwrap();
        assert!(result.vote_granted);
        assert_eq!(node.voted_for, Some(2));
    }

    #[tokio::test]
    async fn vote_grant_resets_election_timer() {
        let mut node = new_test_core(1, vec![2, 3]);
        let generation = node.timer_generation;
        node.handle_request_vote(&RequestVoteArgs {
            term: 1,
            candidate_id: 2,
            last_log_index: 0,
            last_log_term: 0,
        })
        .unwrap();
        assert!(node.timer_generation > generation);
    }

    #[tokio::test]
    async fn vote_denied_for_stale_term() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.current_term = 5;
        let result = node
            .handle_request_vote(&RequestVoteArgs {
                term: 3,
                candidate_id: 2,
                last_log_index: 0,
                last_log_term: 0,
            })
            .unwrap();
        assert!(!result.vote_granted);
        assert_eq!(result.term, 5);
        assert_eq!(node.voted_for, None);
    }

    // Scenario: a node that already voted for a different candidate in the
    // same term denies the vote and returns the term unchanged.
    #[tokio::test]
    async fn vote_denied_when_already_voted_for_another() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.current_term = 5;
        node.voted_for = Some(2);
        let result = node
            .handle_request_vote(&RequestVoteArgs {
                term: 5,
                candidate_id: 3,
                last_log_index: 0,
                last_log_term: 0,
            })
            .unwrap();
        assert!(!result.vote_granted);
        assert_eq!(result.term, 5);
        assert_eq!(node.voted_for, Some(2));
    }

    #[tokio::test]
    async fn vote_regranted_to_same_candidate() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.current_term = 1;
        node.voted_for = Some(2);
        let result = node
            .handle_request_vote(&RequestVoteArgs {
                term: 1,
                candidate_id: 2,
                last_log_index: 0,
                last_log_term: 0,
            })
            .unwrap();
        assert!(result.vote_granted);
    }

    #[tokio::test]
    async fn vote_denied_when_candidate_log_term_is_older() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.log.push(entry(1, 3, "PUT x 1"));
        let result = node
            .handle_request_vote(&RequestVoteArgs {
                term: 4,
                candidate_id: 2,
                last_log_index: 1,
                last_log_term: 2,
            })
            .unwrap();
        assert!(!result.vote_granted);
        // Term is still adopted.
        assert_eq!(node.current_term, 4);
    }

    #[tokio::test]
    async fn vote_denied_when_candidate_log_is_shorter() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.log.push(entry(1, 2, "PUT x 1"));
        node.log.push(entry(2, 2, "PUT y 2"));
        let result = node
            .handle_request_vote(&RequestVoteArgs {
                term: 3,
                candidate_id: 2,
                last_log_index: 1,
                last_log_term: 2,
            })
            .unwrap();
        assert!(!result.vote_granted);
    }

    #[tokio::test]
    async fn vote_granted_when_candidate_log_term_is_newer() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.log.push(entry(1, 2, "PUT x 1"));
        let result = node
            .handle_request_vote(&RequestVoteArgs {
                term: 4,
                candidate_id: 2,
                last_log_index: 1,
                last_log_term: 3,
            })
            .unwrap();
        assert!(result.vote_granted);
        assert_eq!(node.voted_for, Some(2));
    }

    #[tokio::test]
    async fn candidate_steps_down_and_grants_on_higher_term_vote_request() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.start_election().unwrap();
        assert_eq!(node.voted_for, Some(1));

        let result = node
            .handle_request_vote(&RequestVoteArgs {
                term: 5,
                candidate_id: 2,
                last_log_index: 0,
                last_log_term: 0,
            })
            .unwrap();
        assert!(result.vote_granted);
        assert_eq!(node.state, RaftState::Follower);
        assert_eq!(node.current_term, 5);
        assert_eq!(node.voted_for, Some(2));
    }

    // === AppendEntries handler ===

    #[tokio::test]
    async fn append_entries_appends_and_recognizes_leader() {
        let mut node = new_test_core(1, vec![2, 3]);
        let generation = node.timer_generation;
        let result = node
            .handle_append_entries(&AppendEntriesArgs {
                term: 1,
                leader_id: 2,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![entry(1, 1, "PUT x 1")],
                leader_commit: 0,
            })
            .unwrap();
        assert!(result.success);
        assert_eq!(node.log.len(), 1);
        assert_eq!(node.state, RaftState::Follower);
        assert_eq!(node.current_leader, Some(2));
        assert!(node.timer_generation > generation, "accepted append resets the timer");
    }

    #[tokio::test]
    async fn stale_append_rejected_without_timer_reset() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.current_term = 2;
        let generation = node.timer_generation;
        let result = node
            .handle_append_entries(&AppendEntriesArgs {
                term: 1,
                leader_id: 2,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![],
                leader_commit: 0,
            })
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.term, 2);
        assert_eq!(node.current_leader, None);
        assert_eq!(node.timer_generation, generation);
    }

    #[tokio::test]
    async fn append_rejected_on_missing_prev_entry() {
        let mut node = new_test_core(1, vec![2, 3]);
        let result = node
            .handle_append_entries(&AppendEntriesArgs {
                term: 1,
                leader_id: 2,
                prev_log_index: 1,
                prev_log_term: 1,
                entries: vec![entry(2, 1, "PUT x 1")],
                leader_commit: 0,
            })
            .unwrap();
        assert!(!result.success);
        assert!(node.log.is_empty());
    }

    #[tokio::test]
    async fn append_rejected_on_prev_term_mismatch() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.log.push(entry(1, 1, "PUT x 1"));
        let result = node
            .handle_append_entries(&AppendEntriesArgs {
                term: 2,
                leader_id: 2,
                prev_log_index: 1,
                prev_log_term: 2,
                entries: vec![entry(2, 2, "PUT y 2")],
                leader_commit: 0,
            })
            .unwrap();
        assert!(!result.success);
        assert_eq!(node.log.len(), 1);
    }

    // Scenario: follower holds [(1,t1),(2,t1)]; a term-2 leader sends
    // prev=(1,t1) with a conflicting entry at index 2. The follower
    // truncates its suffix and appends the new entry.
    #[tokio::test]
    async fn conflicting_suffix_is_truncated_and_replaced() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.log.push(entry(1, 1, "PUT x 1"));
        node.log.push(entry(2, 1, "PUT y old"));

        let result = node
            .handle_append_entries(&AppendEntriesArgs {
                term: 2,
                leader_id: 2,
                prev_log_index: 1,
                prev_log_term: 1,
                entries: vec![entry(2, 2, "PUT y new")],
                leader_commit: 0,
            })
            .unwrap();

        assert!(result.success);
        assert_eq!(node.log.len(), 2);
        assert_eq!(node.log[1].term, 2);
        assert_eq!(node.log[1].command, b"PUT y new".to_vec());
    }

    #[tokio::test]
    async fn append_with_malformed_entry_indices_is_rejected_without_mutation() {
        let mut node = new_test_core(1, vec![2, 3]);

        // An entry claiming index 0.
        let result = node
            .handle_append_entries(&AppendEntriesArgs {
                term: 1,
                leader_id: 2,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![entry(0, 1, "PUT x 1")],
                leader_commit: 0,
            })
            .unwrap();
        assert!(!result.success);
        assert!(node.log.is_empty());

        // A batch with a gap after the first entry.
        let result = node
            .handle_append_entries(&AppendEntriesArgs {
                term: 1,
                leader_id: 2,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![entry(1, 1, "PUT x 1"), entry(3, 1, "PUT y 2")],
                leader_commit: 0,
            })
            .unwrap();
        assert!(!result.success);
        assert!(node.log.is_empty());

        // A batch that does not start at prev_log_index + 1.
        let result = node
            .handle_append_entries(&AppendEntriesArgs {
                term: 1,
                leader_id: 2,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![entry(2, 1, "PUT x 1")],
                leader_commit: 0,
            })
            .unwrap();
        assert!(!result.success);
        assert!(node.log.is_empty());
    }

    #[tokio::test]
    async fn retransmitted_append_is_idempotent() {
        let mut node = new_test_core(1, vec![2, 3]);
        let args = AppendEntriesArgs {
            term: 1,
            leader_id: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![entry(1, 1, "PUT x 1")],
            leader_commit: 0,
        };
        assert!(node.handle_append_entries(&args).unwrap().success);
        assert!(node.handle_append_entries(&args).unwrap().success);
        assert_eq!(node.log.len(), 1);
    }

    #[tokio::test]
    async fn follower_adopts_leader_commit_bounded_by_log() {
        let mut node = new_test_core(1, vec![2, 3]);
        let result = node
            .handle_append_entries(&AppendEntriesArgs {
                term: 1,
                leader_id: 2,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![entry(1, 1, "PUT x 1")],
                leader_commit: 5,
            })
            .unwrap();
        assert!(result.success);
        // min(leader_commit, last_log_index)
        assert_eq!(node.commit_index, 1);
    }

    #[tokio::test]
    async fn follower_commit_index_never_decreases() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.handle_append_entries(&AppendEntriesArgs {
            term: 1,
            leader_id: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![entry(1, 1, "PUT x 1"), entry(2, 1, "PUT y 2")],
            leader_commit: 2,
        })
        .unwrap();
        assert_eq!(node.commit_index, 2);

        // A heartbeat advertising an older commit must not regress ours.
        node.handle_append_entries(&AppendEntriesArgs {
            term: 1,
            leader_id: 2,
            prev_log_index: 2,
            prev_log_term: 1,
            entries: vec![],
            leader_commit: 1,
        })
        .unwrap();
        assert_eq!(node.commit_index, 2);
    }

    #[tokio::test]
    async fn candidate_steps_down_on_append_from_same_term_leader() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.start_election().unwrap();
        let result = node
            .handle_append_entries(&AppendEntriesArgs {
                term: 1,
                leader_id: 2,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![],
                leader_commit: 0,
            })
            .unwrap();
        assert!(result.success);
        assert_eq!(node.state, RaftState::Follower);
        assert_eq!(node.current_leader, Some(2));
    }

    // === Step-down on higher-term responses ===

    #[tokio::test]
    async fn leader_steps_down_on_higher_term_vote_response() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.current_term = 1;
        node.state = RaftState::Leader;
        let result = RequestVoteResult {
            term: 5,
            vote_granted: false,
        };
        node.handle_request_vote_result(2, &result).unwrap();
        assert_eq!(node.state, RaftState::Follower);
        assert_eq!(node.current_term, 5);
        assert_eq!(node.voted_for, None);
    }

    #[tokio::test]
    async fn leader_steps_down_on_higher_term_append_response() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.current_term = 1;
        node.state = RaftState::Leader;
        node.next_index.insert(2, 1);
        node.match_index.insert(2, 0);
        let result = AppendEntriesResult {
            term: 5,
            success: false,
        };
        node.handle_append_entries_result(2, 0, 0, &result).unwrap();
        assert_eq!(node.state, RaftState::Follower);
        assert_eq!(node.current_term, 5);
        assert!(node.next_index.is_empty(), "peer progress discarded on step-down");
        assert!(node.match_index.is_empty());
    }

    // === Vote tallying ===

    #[tokio::test]
    async fn majority_required_in_five_node_cluster() {
        let mut node = new_test_core(1, vec![2, 3, 4, 5]);
        node.start_election().unwrap();
        let granted = RequestVoteResult {
            term: 1,
            vote_granted: true,
        };
        let denied = RequestVoteResult {
            term: 1,
            vote_granted: false,
        };

        assert!(!node.handle_request_vote_result(2, &granted).unwrap());
        assert!(!node.handle_request_vote_result(3, &denied).unwrap());
        // Third grant (self + 2 peers) is the majority of five.
        assert!(node.handle_request_vote_result(4, &granted).unwrap());
        assert_eq!(node.state, RaftState::Leader);
    }

    #[tokio::test]
    async fn duplicate_votes_from_one_peer_count_once() {
        let mut node = new_test_core(1, vec![2, 3, 4, 5]);
        node.start_election().unwrap();
        let granted = RequestVoteResult {
            term: 1,
            vote_granted: true,
        };
        assert!(!node.handle_request_vote_result(2, &granted).unwrap());
        assert!(!node.handle_request_vote_result(2, &granted).unwrap());
        assert!(node.handle_request_vote_result(3, &granted).unwrap());
    }

    #[tokio::test]
    async fn split_vote_restarts_at_higher_term() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.start_election().unwrap();
        assert_eq!(node.current_term, 1);
        // No majority arrived; the timer fires again and the candidate
        // restarts with a fresh term.
        node.start_election().unwrap();
        assert_eq!(node.current_term, 2);
        assert_eq!(node.state, RaftState::Candidate);
        assert_eq!(node.voted_for, Some(1));
    }

    // === Replication bookkeeping ===

    #[tokio::test]
    async fn successful_append_advances_progress() {
        let mut leader = new_test_core(1, vec![2, 3]);
        leader.current_term = 1;
        leader.state = RaftState::Leader;
        leader.log.push(entry(1, 1, "PUT x 1"));
        leader.next_index.insert(2, 1);
        leader.match_index.insert(2, 0);

        let ok = AppendEntriesResult {
            term: 1,
            success: true,
        };
        leader.handle_append_entries_result(2, 0, 1, &ok).unwrap();
        assert_eq!(leader.match_index.get(&2), Some(&1));
        assert_eq!(leader.next_index.get(&2), Some(&2));
    }

    #[tokio::test]
    async fn stale_success_does_not_regress_progress() {
        let mut leader = new_test_core(1, vec![2, 3]);
        leader.current_term = 1;
        leader.state = RaftState::Leader;
        leader.match_index.insert(2, 5);
        leader.next_index.insert(2, 6);

        let ok = AppendEntriesResult {
            term: 1,
            success: true,
        };
        leader.handle_append_entries_result(2, 2, 1, &ok).unwrap();
        assert_eq!(leader.match_index.get(&2), Some(&5));
        assert_eq!(leader.next_index.get(&2), Some(&6));
    }

    #[tokio::test]
    async fn rejection_backs_off_next_index_with_floor() {
        let mut leader = new_test_core(1, vec![2, 3]);
        leader.current_term = 1;
        leader.state = RaftState::Leader;
        leader.next_index.insert(2, 5);

        let rejected = AppendEntriesResult {
            term: 1,
            success: false,
        };
        leader.handle_append_entries_result(2, 4, 0, &rejected).unwrap();
        assert_eq!(leader.next_index.get(&2), Some(&4));

        leader.next_index.insert(2, 1);
        leader.handle_append_entries_result(2, 0, 0, &rejected).unwrap();
        assert_eq!(leader.next_index.get(&2), Some(&1));
    }

    // Scenario: five-node cluster; the leader's entry at index 1 is acked
    // by one peer (minority), commit stays 0; the second ack forms a
    // majority and commit advances.
    #[tokio::test]
    async fn commit_waits_for_majority_then_advances() {
        let mut leader = new_test_core(1, vec![2, 3, 4, 5]);
        leader.current_term = 1;
        leader.state = RaftState::Leader;
        leader.become_leader();
        leader.log.push(entry(1, 1, "PUT x 1"));

        let ok = AppendEntriesResult {
            term: 1,
            success: true,
        };
        leader.handle_append_entries_result(2, 0, 1, &ok).unwrap();
        assert_eq!(leader.commit_index, 0, "leader + one peer is a minority of five");

        leader.handle_append_entries_result(3, 0, 1, &ok).unwrap();
        assert_eq!(leader.commit_index, 1);
    }

    #[tokio::test]
    async fn one_ack_commits_in_three_node_cluster() {
        let mut leader = new_test_core(1, vec![2, 3]);
        leader.current_term = 1;
        leader.state = RaftState::Leader;
        leader.become_leader();
        for i in 1..=3 {
            leader.log.push(entry(i, 1, "PUT x 1"));
        }

        let ok = AppendEntriesResult {
            term: 1,
            success: true,
        };
        leader.handle_append_entries_result(2, 0, 3, &ok).unwrap();
        assert_eq!(leader.commit_index, 3);
    }

    #[tokio::test]
    async fn earlier_term_entries_not_committed_by_count_alone() {
        let mut leader = new_test_core(1, vec![2, 3]);
        leader.log.push(entry(1, 1, "PUT x 1"));
        leader.current_term = 2;
        leader.state = RaftState::Leader;
        leader.become_leader();

        let ok = AppendEntriesResult {
            term: 2,
            success: true,
        };
        leader.handle_append_entries_result(2, 0, 1, &ok).unwrap();
        assert_eq!(leader.commit_index, 0, "term-1 entry must not commit in term 2 directly");
    }

    #[tokio::test]
    async fn earlier_term_entries_commit_behind_current_term_entry() {
        let mut leader = new_test_core(1, vec![2, 3]);
        leader.log.push(entry(1, 1, "PUT x 1"));
        leader.current_term = 2;
        leader.state = RaftState::Leader;
        leader.become_leader();
        leader.log.push(entry(2, 2, "PUT y 2"));

        let ok = AppendEntriesResult {
            term: 2,
            success: true,
        };
        leader.handle_append_entries_result(2, 0, 2, &ok).unwrap();
        // Committing the term-2 entry at index 2 commits index 1 with it.
        assert_eq!(leader.commit_index, 2);
    }

    // === Proposals ===

    // Scenario: propose on a non-leader fails immediately with no log
    // mutation.
    #[tokio::test]
    async fn propose_on_follower_is_rejected_without_append() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.current_leader = Some(2);
        let err = node.propose(b"PUT x 1".to_vec()).unwrap_err();
        match err {
            RaftError::NotLeader { leader_hint } => assert_eq!(leader_hint, Some(2)),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(node.log.is_empty());
    }

    #[tokio::test]
    async fn propose_assigns_sequential_indices() {
        let mut leader = new_test_core(1, vec![2, 3]);
        leader.current_term = 1;
        leader.state = RaftState::Leader;
        leader.become_leader();
        assert_eq!(leader.propose(b"PUT x 1".to_vec()).unwrap(), 1);
        assert_eq!(leader.propose(b"PUT y 2".to_vec()).unwrap(), 2);
        assert_eq!(leader.log.len(), 2);
        assert_eq!(leader.commit_index, 0, "commit waits for replication");
    }

    #[tokio::test]
    async fn single_node_cluster_commits_its_own_proposals() {
        let mut node = new_test_core(1, vec![]);
        node.start_election().unwrap();
        assert_eq!(node.majority(), 1);
        node.become_leader();
        let index = node.propose(b"PUT x 1".to_vec()).unwrap();
        assert_eq!(node.commit_index, index);
    }

    // === Restart / persistence ===

    #[tokio::test]
    async fn restart_restores_term_vote_and_log() {
        // Clones of a MemoryStorage share state, standing in for the same
        // files across a process restart.
        let storage = MemoryStorage::new();
        let surviving = storage.clone();
        let mut node = RaftCore::new(1, vec![2, 3], Box::new(storage)).unwrap();
        node.start_election().unwrap();
        node.become_leader();
        node.propose(b"PUT x 1".to_vec()).unwrap();
        drop(node);

        let restarted = RaftCore::new(1, vec![2, 3], Box::new(surviving)).unwrap();
        assert_eq!(restarted.current_term, 1);
        assert_eq!(restarted.voted_for, Some(1));
        assert_eq!(restarted.log.len(), 1);
        assert_eq!(restarted.state, RaftState::Follower);
        assert_eq!(restarted.commit_index, 0, "commit cursor is volatile");
        assert_eq!(restarted.last_applied, 0);
    }

    // === InstallSnapshot ===

    #[tokio::test]
    async fn install_snapshot_is_explicitly_unimplemented() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.current_term = 3;
        let result = node.handle_install_snapshot(&InstallSnapshotArgs {
            term: 4,
            leader_id: 2,
            last_included_index: 10,
            last_included_term: 2,
            data: vec![],
        });
        assert!(!result.success);
        assert_eq!(result.term, 3);
        assert!(result.reason.unwrap().contains("not implemented"));
    }

    #[tokio::test]
    async fn commit_advances_are_published() {
        let mut node = new_test_core(1, vec![2, 3]);
        let rx = node.subscribe_commits();
        node.handle_append_entries(&AppendEntriesArgs {
            term: 1,
            leader_id: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![entry(1, 1, "PUT x 1")],
            leader_commit: 1,
        })
        .unwrap();
        assert_eq!(*rx.borrow(), 1);
    }
}
