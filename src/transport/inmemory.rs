//! Channel-based transport for in-process cluster tests.
//!
//! Each node owns an mpsc receiver; peers send requests with a oneshot
//! reply slot. Tests partition a node by pausing its serving task, and
//! heal it by resuming.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use super::{Transport, TransportError};
use crate::core::raft_core::{
    AppendEntriesArgs, AppendEntriesResult, RequestVoteArgs, RequestVoteResult,
};
use crate::core::raft_node::SharedCore;

enum Request {
    RequestVote {
        args: RequestVoteArgs,
        reply: oneshot::Sender<RequestVoteResult>,
    },
    AppendEntries {
        args: AppendEntriesArgs,
        reply: oneshot::Sender<AppendEntriesResult>,
    },
}

/// Transport that delivers RPCs over in-process channels.
pub struct InMemoryTransport {
    senders: HashMap<u64, mpsc::Sender<Request>>,
    timeout: Duration,
}

impl InMemoryTransport {
    async fn roundtrip<R>(
        &self,
        target: u64,
        request: Request,
        reply_rx: oneshot::Receiver<R>,
    ) -> Result<R, TransportError> {
        let sender = self
            .senders
            .get(&target)
            .ok_or(TransportError::UnknownPeer(target))?;
        sender
            .send(request)
            .await
            .map_err(|_| TransportError::ConnectionFailed("peer channel closed".to_string()))?;
        tokio::time::timeout(self.timeout, reply_rx)
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|_| TransportError::ConnectionFailed("reply dropped".to_string()))
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn request_vote(
        &self,
        target: u64,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteResult, TransportError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.roundtrip(target, Request::RequestVote { args, reply: reply_tx }, reply_rx)
            .await
    }

    async fn append_entries(
        &self,
        target: u64,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesResult, TransportError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.roundtrip(target, Request::AppendEntries { args, reply: reply_tx }, reply_rx)
            .await
    }
}

/// Receiving side of a node's channel; feeds requests into its core.
pub struct NodeInbox {
    receiver: mpsc::Receiver<Request>,
}

impl NodeInbox {
    /// Serve one inbound request. Returns false once every sender is gone.
    pub async fn serve_one(&mut self, core: &SharedCore) -> bool {
        let Some(request) = self.receiver.recv().await else {
            return false;
        };
        let mut core = core.lock().await;
        match request {
            Request::RequestVote { args, reply } => match core.handle_request_vote(&args) {
                Ok(result) => {
                    let _ = reply.send(result);
                }
                // Dropping the reply looks like a dead peer to the caller.
                Err(e) => warn!(error = %e, "dropping vote request after storage failure"),
            },
            Request::AppendEntries { args, reply } => match core.handle_append_entries(&args) {
                Ok(result) => {
                    let _ = reply.send(result);
                }
                Err(e) => warn!(error = %e, "dropping append request after storage failure"),
            },
        }
        true
    }
}

/// Build fully-connected transports and inboxes for a set of node ids.
pub fn create_cluster(
    node_ids: &[u64],
    rpc_timeout: Duration,
) -> (HashMap<u64, InMemoryTransport>, HashMap<u64, NodeInbox>) {
    let mut senders = HashMap::new();
    let mut inboxes = HashMap::new();
    for &id in node_ids {
        let (tx, rx) = mpsc::channel(64);
        senders.insert(id, tx);
        inboxes.insert(id, NodeInbox { receiver: rx });
    }

    let transports = node_ids
        .iter()
        .map(|&id| {
            (
                id,
                InMemoryTransport {
                    senders: senders.clone(),
                    timeout: rpc_timeout,
                },
            )
        })
        .collect();
    (transports, inboxes)
}
