//! Durable storage for Raft persistent state.
//!
//! `current_term`, `voted_for`, and the log must hit stable storage before
//! the node responds to any RPC that depends on them. The trait is
//! synchronous; the core calls it while holding the state lock.

pub mod file;
pub mod memory;

pub use file::FileStorage;
pub use memory::MemoryStorage;

use thiserror::Error;

use crate::core::raft_core::LogEntry;

/// Storage failures. Any of these is fatal to the node: it must stop
/// rather than answer RPCs from state that may not be durable.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("i/o error: {0}")]
    Io(String),
    #[error("data corruption: {0}")]
    Corruption(String),
}

/// Durable storage for a node's persistent state.
///
/// Every save must be durable (fsynced) before it returns. `Send` is
/// required because the owning mutex is shared across tasks.
pub trait Storage: Send {
    /// Latest persisted term; 0 on a fresh node.
    fn load_term(&self) -> Result<u64, StorageError>;

    fn save_term(&mut self, term: u64) -> Result<(), StorageError>;

    /// Persisted vote for the current term; `None` if no vote was cast.
    fn load_voted_for(&self) -> Result<Option<u64>, StorageError>;

    fn save_voted_for(&mut self, voted_for: Option<u64>) -> Result<(), StorageError>;

    /// The full log, in index order.
    fn load_log(&self) -> Result<Vec<LogEntry>, StorageError>;

    /// Append entries after the existing ones.
    fn append_log_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError>;

    /// Drop every entry with `index >= from_index`. Used when a follower
    /// discards a suffix that conflicts with the leader's log.
    fn truncate_log(&mut self, from_index: u64) -> Result<(), StorageError>;
}
