//! Sequential apply pipeline.
//!
//! A single task drains committed entries into the state machine in index
//! order, exactly once. The command itself is applied outside the core
//! lock so a slow state machine never blocks elections or replication.
//! Outcomes land in a bounded [`ApplyResults`] registry that clients poll
//! by index, since proposals return before commit.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::raft_node::SharedCore;
use crate::metrics::RaftMetrics;
use crate::state_machine::StateMachine;

/// Apply results older than this many entries below the newest are
/// forgotten; clients that poll late get "unknown" instead of an answer.
const RESULT_WINDOW: usize = 4096;

/// Outcome of one applied entry, as reported to clients.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ApplyResult {
    pub index: u64,
    /// False for domain-level rejections, e.g. a failed compare-and-swap.
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// Bounded index-keyed registry of apply outcomes.
#[derive(Debug, Clone, Default)]
pub struct ApplyResults {
    inner: Arc<Mutex<BTreeMap<u64, ApplyResult>>>,
}

impl ApplyResults {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<u64, ApplyResult>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record(&self, result: ApplyResult) {
        let mut results = self.lock();
        results.insert(result.index, result);
        while results.len() > RESULT_WINDOW {
            results.pop_first();
        }
    }

    /// Result for an index, if it has been applied and not yet evicted.
    pub fn get(&self, index: u64) -> Option<ApplyResult> {
        self.lock().get(&index).cloned()
    }

    /// Oldest index still held, if any. Anything below it was evicted.
    pub fn oldest_index(&self) -> Option<u64> {
        self.lock().keys().next().copied()
    }
}

/// The apply task. Owns the state machine; everything else only sees the
/// results registry (and, for the KV store, a shared read handle).
///
/// Holds the core weakly so the commit channel can close: when the last
/// node handle drops, `changed()` errors out and the task exits.
pub struct ApplyPipeline {
    core: Weak<tokio::sync::Mutex<crate::core::raft_core::RaftCore>>,
    commit_rx: watch::Receiver<u64>,
    state_machine: Box<dyn StateMachine>,
    results: ApplyResults,
    metrics: Arc<RaftMetrics>,
}

impl ApplyPipeline {
    pub async fn new(core: SharedCore, state_machine: Box<dyn StateMachine>) -> Self {
        let (commit_rx, metrics) = {
            let core = core.lock().await;
            (core.subscribe_commits(), core.metrics())
        };
        ApplyPipeline {
            core: Arc::downgrade(&core),
            commit_rx,
            state_machine,
            results: ApplyResults::new(),
            metrics,
        }
    }

    pub fn results(&self) -> ApplyResults {
        self.results.clone()
    }

    /// Spawn the drain loop. It exits when the core (and with it the
    /// commit watch channel) is dropped.
    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
            info!("apply pipeline stopped");
        })
    }

    async fn run(&mut self) {
        loop {
            // Pull the next committed-but-unapplied entry under the lock,
            // then apply it with the lock released.
            let next = match self.core.upgrade() {
                None => return,
                Some(core) => {
                    let core = core.lock().await;
                    if core.last_applied < core.commit_index {
                        core.entry(core.last_applied + 1).cloned()
                    } else {
                        None
                    }
                }
            };

            let Some(entry) = next else {
                if self.commit_rx.changed().await.is_err() {
                    return;
                }
                continue;
            };

            let outcome = self.state_machine.apply(&entry.command);
            debug!(index = entry.index, ok = outcome.ok, "applied entry");
            self.results.record(ApplyResult {
                index: entry.index,
                ok: outcome.ok,
                value: outcome
                    .value
                    .map(|v| String::from_utf8_lossy(&v).into_owned()),
            });
            self.metrics.inc_entries_applied();

            match self.core.upgrade() {
                None => return,
                Some(core) => core.lock().await.last_applied = entry.index,
            }
        }
    }
}
