//! Raft consensus node with a replicated key-value store.
//!
//! The consensus engine lives in [`core`]; storage, state machine, and
//! transport are pluggable trait seams so the engine can be exercised
//! in-process (channel transport, in-memory storage) or over HTTP.

pub mod api;
pub mod core;
pub mod metrics;
pub mod state_machine;
pub mod storage;
pub mod transport;
