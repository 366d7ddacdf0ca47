//! Pluggable state machine fed by the apply pipeline.
//!
//! Committed log entries are delivered exactly once, in index order. The
//! state machine decides what a command means; the consensus layer treats
//! commands as opaque bytes.

pub mod kv;

pub use kv::{KeyValueStore, SharedKvStore};

/// Result of applying one command.
///
/// A negative outcome (`ok == false`) is still a successful apply in the
/// consensus sense: the entry is consumed and `last_applied` advances. It
/// reports a domain-level rejection, e.g. a failed compare-and-swap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub ok: bool,
    /// Optional response payload, e.g. the old value of a deleted key or
    /// the conflicting current value of a failed compare-and-swap.
    pub value: Option<Vec<u8>>,
}

impl ApplyOutcome {
    pub fn ok() -> Self {
        ApplyOutcome { ok: true, value: None }
    }

    pub fn ok_with(value: impl Into<Vec<u8>>) -> Self {
        ApplyOutcome {
            ok: true,
            value: Some(value.into()),
        }
    }

    pub fn rejected() -> Self {
        ApplyOutcome { ok: false, value: None }
    }

    pub fn rejected_with(value: impl Into<Vec<u8>>) -> Self {
        ApplyOutcome {
            ok: false,
            value: Some(value.into()),
        }
    }
}

/// A deterministic command interpreter. Applying the same command sequence
/// must yield the same state on every node.
pub trait StateMachine: Send {
    fn apply(&mut self, command: &[u8]) -> ApplyOutcome;
}

/// Test state machine that records every command it is given.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingStateMachine {
    pub applied: Vec<Vec<u8>>,
}

#[cfg(test)]
impl StateMachine for RecordingStateMachine {
    fn apply(&mut self, command: &[u8]) -> ApplyOutcome {
        self.applied.push(command.to_vec());
        ApplyOutcome::ok()
    }
}
