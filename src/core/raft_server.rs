//! The node's event loop.
//!
//! One task owns the clock: it multiplexes the election timeout, the
//! leader heartbeat tick, client proposals, and shutdown over a single
//! `select!`. Everything it does funnels into the shared core, so RPC
//! handlers running on other tasks interleave safely.
//!
//! A storage failure anywhere in the loop is fatal: the loop logs it and
//! exits rather than keep answering RPCs from state that may not be
//! durable.

use std::pin::pin;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, sleep_until, MissedTickBehavior};
use tracing::{error, info};

use super::config::RaftConfig;
use super::raft_core::{RaftCore, RaftState};
use super::raft_node::{RaftNode, SharedCore};
use super::RaftError;
use crate::storage::StorageError;
use crate::transport::Transport;

enum Command {
    Propose {
        command: Vec<u8>,
        reply: oneshot::Sender<Result<u64, RaftError>>,
    },
}

/// Cloneable handle for submitting proposals and stopping the server.
#[derive(Clone)]
pub struct RaftHandle {
    command_tx: mpsc::Sender<Command>,
    shutdown_tx: mpsc::Sender<()>,
}

impl RaftHandle {
    /// Submit a command. Returns the log index the leader assigned; the
    /// command is not yet committed when this returns, poll the apply
    /// results for the outcome.
    pub async fn propose(&self, command: Vec<u8>) -> Result<u64, RaftError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(Command::Propose {
                command,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RaftError::Shutdown)?;
        reply_rx.await.map_err(|_| RaftError::Shutdown)?
    }

    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

/// Owns the event loop for one node.
pub struct RaftServer<T: Transport> {
    node: RaftNode<T>,
    command_rx: mpsc::Receiver<Command>,
    command_tx: mpsc::Sender<Command>,
    shutdown_rx: mpsc::Receiver<()>,
    shutdown_tx: mpsc::Sender<()>,
    config: RaftConfig,
}

impl<T: Transport + 'static> RaftServer<T> {
    /// Build a server and hand back the shared core for the RPC surface.
    pub fn new(core: RaftCore, transport: T, config: RaftConfig) -> (Self, SharedCore) {
        let (command_tx, command_rx) = mpsc::channel(32);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let node = RaftNode::new(core, transport);
        let shared_core = node.shared_core();
        let server = Self {
            node,
            command_rx,
            command_tx,
            shutdown_rx,
            shutdown_tx,
            config,
        };
        (server, shared_core)
    }

    /// Spawn the event loop and return its handle.
    pub fn start(self) -> RaftHandle {
        let handle = RaftHandle {
            command_tx: self.command_tx.clone(),
            shutdown_tx: self.shutdown_tx.clone(),
        };
        tokio::spawn(self.run());
        handle
    }

    async fn run(mut self) {
        let core = self.node.shared_core();
        let mut heartbeat = interval(self.config.heartbeat_interval);
        // Delay, not Burst: missed ticks must not fire back to back and
        // starve the election branch.
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut election_timeout = self.config.random_election_timeout();

        loop {
            // Snapshot the timer. If anything resets it while we sleep,
            // the generation moves on and this firing is discarded.
            let (timer_generation, deadline) = {
                let core = core.lock().await;
                (core.timer_generation, core.timer_reset_at + election_timeout)
            };
            let election_sleep = pin!(sleep_until(deadline));

            let step: Result<(), StorageError> = tokio::select! {
                _ = self.shutdown_rx.recv() => break,

                Some(command) = self.command_rx.recv() => match command {
                    Command::Propose { command, reply } => {
                        let result = core.lock().await.propose(command);
                        let fatal = matches!(result, Err(RaftError::Storage(_)));
                        let accepted = result.is_ok();
                        let _ = reply.send(result);
                        if fatal {
                            error!("proposal hit a storage failure, stopping");
                            break;
                        }
                        // Don't sit on the entry until the next tick.
                        if accepted {
                            self.node.replicate_once().await
                        } else {
                            Ok(())
                        }
                    }
                },

                _ = heartbeat.tick() => {
                    if self.node.state().await == RaftState::Leader {
                        // The leader feeds its own timer; losing quorum
                        // does not make it start elections against itself.
                        core.lock().await.reset_election_timer();
                        self.node.replicate_once().await
                    } else {
                        Ok(())
                    }
                },

                _ = election_sleep => {
                    let stale = {
                        let core = core.lock().await;
                        core.timer_generation != timer_generation
                            || core.state == RaftState::Leader
                    };
                    // Each candidacy draws a fresh randomized timeout so
                    // repeated split votes desynchronize.
                    election_timeout = self.config.random_election_timeout();
                    if stale {
                        Ok(())
                    } else {
                        match self.node.run_election().await {
                            Ok(true) => self.node.replicate_once().await,
                            Ok(false) => Ok(()),
                            Err(e) => Err(e),
                        }
                    }
                },
            };

            if let Err(e) = step {
                error!(error = %e, "storage failure, stopping raft server");
                break;
            }
        }
        info!("raft server stopped");
    }
}
