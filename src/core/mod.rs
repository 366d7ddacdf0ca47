//! Consensus engine: node state, elections, replication, apply pipeline.

pub mod apply;
pub mod config;
pub mod raft_core;
pub mod raft_node;
pub mod raft_server;

use thiserror::Error;

use crate::storage::StorageError;

/// Errors surfaced to clients of the engine.
#[derive(Debug, Error)]
pub enum RaftError {
    /// This node is not the leader; `leader_hint` names the last known one.
    #[error("not the leader")]
    NotLeader { leader_hint: Option<u64> },
    /// Durable storage failed. Fatal: the node stops accepting operations
    /// rather than answer RPCs from unpersisted state.
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
    /// The server loop has shut down.
    #[error("raft server is shut down")]
    Shutdown,
}
