//! RPC transport between cluster members.

pub mod http;
pub mod inmemory;

pub use http::HttpTransport;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::raft_core::{
    AppendEntriesArgs, AppendEntriesResult, RequestVoteArgs, RequestVoteResult,
};

/// Transport failures. All of them are transient from the core's point of
/// view: the caller drops the response and retries on a later tick.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("connection to peer failed: {0}")]
    ConnectionFailed(String),
    #[error("request timed out")]
    Timeout,
    #[error("unknown peer {0}")]
    UnknownPeer(u64),
    #[error("peer returned an invalid response: {0}")]
    InvalidResponse(String),
}

/// Outbound RPC channel to peers. Implementations bound every call in
/// time; a partitioned peer must surface as an error, not a hang.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request_vote(
        &self,
        target: u64,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteResult, TransportError>;

    async fn append_entries(
        &self,
        target: u64,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesResult, TransportError>;
}
