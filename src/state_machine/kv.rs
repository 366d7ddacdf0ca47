//! Key-value store state machine.
//!
//! Commands are UTF-8 text:
//! - `PUT <key> <value>` — set a key; the value may contain spaces
//! - `DEL <key>` — remove a key; returns the removed value
//! - `CAS <key> <expected> <new>` — set only if the current value equals
//!   `expected`; on mismatch the outcome is negative and carries the
//!   current value
//!
//! Reads never go through the log; they hit the store directly via
//! [`SharedKvStore`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{ApplyOutcome, StateMachine};

/// In-memory string map.
#[derive(Debug, Default)]
pub struct KeyValueStore {
    data: HashMap<String, String>,
}

impl KeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct read, bypassing the log.
    pub fn get(&self, key: &str) -> Option<String> {
        self.data.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl StateMachine for KeyValueStore {
    fn apply(&mut self, command: &[u8]) -> ApplyOutcome {
        let text = match std::str::from_utf8(command) {
            Ok(text) => text,
            Err(_) => return ApplyOutcome::rejected_with(&b"command is not utf-8"[..]),
        };

        if let Some(rest) = text.strip_prefix("PUT ") {
            return match rest.split_once(' ') {
                Some((key, value)) => {
                    self.data.insert(key.to_string(), value.to_string());
                    ApplyOutcome::ok()
                }
                None => ApplyOutcome::rejected_with(&b"PUT needs a key and a value"[..]),
            };
        }

        if let Some(key) = text.strip_prefix("DEL ") {
            return match self.data.remove(key) {
                Some(old) => ApplyOutcome::ok_with(old),
                None => ApplyOutcome::rejected_with(&b"key not found"[..]),
            };
        }

        if let Some(rest) = text.strip_prefix("CAS ") {
            let mut parts = rest.splitn(3, ' ');
            return match (parts.next(), parts.next(), parts.next()) {
                (Some(key), Some(expected), Some(new)) => match self.data.get(key) {
                    Some(current) if current == expected => {
                        self.data.insert(key.to_string(), new.to_string());
                        ApplyOutcome::ok()
                    }
                    Some(current) => ApplyOutcome::rejected_with(current.clone()),
                    None => ApplyOutcome::rejected_with(&b"key not found"[..]),
                },
                _ => ApplyOutcome::rejected_with(&b"CAS needs a key, expected, and new value"[..]),
            };
        }

        ApplyOutcome::rejected_with(format!("unknown command: {text}"))
    }
}

/// Shared handle: the apply pipeline mutates through it while the client
/// API reads through it.
#[derive(Debug, Clone, Default)]
pub struct SharedKvStore(Arc<Mutex<KeyValueStore>>);

impl SharedKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.lock().get(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, KeyValueStore> {
        // A poisoned store means an apply panicked; continue with whatever
        // state it left, matching what a restart-and-replay would rebuild.
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl StateMachine for SharedKvStore {
    fn apply(&mut self, command: &[u8]) -> ApplyOutcome {
        self.lock().apply(command)
    }
}
