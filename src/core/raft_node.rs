//! Async fan-out over a [`Transport`].
//!
//! `RaftNode` wraps the shared core and broadcasts RPCs to all peers
//! concurrently. The core lock is held only to build requests and fold in
//! responses, never across a network call, so a slow peer cannot stall
//! inbound RPC handling.

use std::sync::Arc;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::debug;

use super::raft_core::{AppendEntriesArgs, RaftCore, RaftState, RequestVoteArgs};
use crate::storage::StorageError;
use crate::transport::Transport;

/// Shared handle to the core. One per node; every task clones this.
pub type SharedCore = Arc<Mutex<RaftCore>>;

/// A node bound to a transport.
pub struct RaftNode<T: Transport> {
    core: SharedCore,
    transport: T,
}

impl<T: Transport> RaftNode<T> {
    pub fn new(core: RaftCore, transport: T) -> Self {
        Self {
            core: Arc::new(Mutex::new(core)),
            transport,
        }
    }

    /// Handle for inbound RPC serving, the apply pipeline, and the API.
    pub fn shared_core(&self) -> SharedCore {
        self.core.clone()
    }

    /// Run one candidacy: bump the term, solicit votes from every peer
    /// concurrently, and tally responses as they arrive. Returns true if
    /// this node won. Stops waiting as soon as a majority is in; late
    /// responses are irrelevant to an already-decided election.
    pub async fn run_election(&self) -> Result<bool, StorageError> {
        let (args, peers) = {
            let mut core = self.core.lock().await;
            core.start_election()?;
            let args = RequestVoteArgs {
                term: core.current_term,
                candidate_id: core.id,
                last_log_index: core.last_log_index(),
                last_log_term: core.last_log_term(),
            };
            (args, core.peers.clone())
        };

        if peers.is_empty() {
            // Single-node cluster: the self-vote is already a majority.
            let mut core = self.core.lock().await;
            core.become_leader();
            return Ok(true);
        }

        let metrics = self.core.lock().await.metrics();
        metrics.add_request_votes_sent(peers.len() as u64);

        let mut responses: FuturesUnordered<_> = peers
            .iter()
            .map(|&peer_id| {
                let args = args.clone();
                let transport = &self.transport;
                async move { (peer_id, transport.request_vote(peer_id, args).await) }
            })
            .collect();

        while let Some((peer_id, response)) = responses.next().await {
            match response {
                Ok(result) => {
                    let mut core = self.core.lock().await;
                    if core.handle_request_vote_result(peer_id, &result)? {
                        return Ok(true);
                    }
                    if core.state != RaftState::Candidate {
                        return Ok(false);
                    }
                }
                Err(e) => {
                    metrics.inc_request_votes_failed();
                    debug!(peer = peer_id, error = %e, "vote request failed");
                }
            }
        }
        Ok(false)
    }

    /// One replication round: send AppendEntries to every peer, tailored
    /// to its `next_index`. An up-to-date peer gets an empty heartbeat; a
    /// lagging one gets its missing suffix. Called on every heartbeat tick
    /// and immediately after a proposal.
    pub async fn replicate_once(&self) -> Result<(), StorageError> {
        let (batches, metrics) = {
            let core = self.core.lock().await;
            if core.state != RaftState::Leader {
                return Ok(());
            }

            let mut batches = Vec::with_capacity(core.peers.len());
            for &peer_id in &core.peers {
                let next_index = core.next_index.get(&peer_id).copied().unwrap_or(1);
                let prev_log_index = next_index - 1;
                let args = AppendEntriesArgs {
                    term: core.current_term,
                    leader_id: core.id,
                    prev_log_index,
                    prev_log_term: core.term_at(prev_log_index),
                    entries: core.entries_from(next_index),
                    leader_commit: core.commit_index,
                };
                batches.push((peer_id, args));
            }
            core.metrics().add_append_entries_sent(batches.len() as u64);
            (batches, core.metrics())
        };

        let mut responses: FuturesUnordered<_> = batches
            .into_iter()
            .map(|(peer_id, args)| {
                let transport = &self.transport;
                async move {
                    let prev_log_index = args.prev_log_index;
                    let entries_len = args.entries.len() as u64;
                    let response = transport.append_entries(peer_id, args).await;
                    (peer_id, prev_log_index, entries_len, response)
                }
            })
            .collect();

        while let Some((peer_id, prev_log_index, entries_len, response)) = responses.next().await {
            match response {
                Ok(result) => {
                    let mut core = self.core.lock().await;
                    core.handle_append_entries_result(peer_id, prev_log_index, entries_len, &result)?;
                    if core.state != RaftState::Leader {
                        return Ok(());
                    }
                }
                Err(e) => {
                    metrics.inc_append_entries_failed();
                    debug!(peer = peer_id, error = %e, "append entries failed");
                }
            }
        }
        Ok(())
    }

    pub async fn state(&self) -> RaftState {
        self.core.lock().await.state
    }
}
