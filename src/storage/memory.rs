//! In-memory storage for tests.

use std::sync::{Arc, Mutex};

use super::{Storage, StorageError};
use crate::core::raft_core::LogEntry;

#[derive(Debug, Default)]
struct MemoryState {
    term: u64,
    voted_for: Option<u64>,
    log: Vec<LogEntry>,
}

/// Storage backed by shared memory. Clones share the same state, which
/// lets a test hand the "disk" to a second node to simulate a restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MemoryState) -> R) -> Result<R, StorageError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| StorageError::Io("storage mutex poisoned".to_string()))?;
        Ok(f(&mut state))
    }
}

impl Storage for MemoryStorage {
    fn load_term(&self) -> Result<u64, StorageError> {
        self.with_state(|s| s.term)
    }

    fn save_term(&mut self, term: u64) -> Result<(), StorageError> {
        self.with_state(|s| s.term = term)
    }

    fn load_voted_for(&self) -> Result<Option<u64>, StorageError> {
        self.with_state(|s| s.voted_for)
    }

    fn save_voted_for(&mut self, voted_for: Option<u64>) -> Result<(), StorageError> {
        self.with_state(|s| s.voted_for = voted_for)
    }

    fn load_log(&self) -> Result<Vec<LogEntry>, StorageError> {
        self.with_state(|s| s.log.clone())
    }

    fn append_log_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        self.with_state(|s| s.log.extend_from_slice(entries))
    }

    fn truncate_log(&mut self, from_index: u64) -> Result<(), StorageError> {
        self.with_state(|s| s.log.retain(|e| e.index < from_index))
    }
}
