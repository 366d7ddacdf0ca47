//! HTTP transport: axum on the serving side, reqwest on the calling side.
//!
//! Peer RPCs are JSON over POST under `/raft/`. The route for snapshot
//! installation exists so peers probing it get a well-formed "not
//! implemented" answer instead of a 404.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::error;

use super::{Transport, TransportError};
use crate::core::raft_core::{
    AppendEntriesArgs, AppendEntriesResult, InstallSnapshotArgs, InstallSnapshotResult,
    RequestVoteArgs, RequestVoteResult,
};
use crate::core::raft_node::SharedCore;
use crate::storage::StorageError;

/// Outbound RPC client over HTTP.
pub struct HttpTransport {
    /// Peer id to address, e.g. `127.0.0.1:7101`.
    peers: HashMap<u64, String>,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(peers: HashMap<u64, String>, rpc_timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(rpc_timeout)
            .build()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        Ok(HttpTransport { peers, client })
    }

    async fn post_json<Req, Resp>(
        &self,
        target: u64,
        path: &str,
        args: &Req,
    ) -> Result<Resp, TransportError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let addr = self
            .peers
            .get(&target)
            .ok_or(TransportError::UnknownPeer(target))?;
        let url = format!("http://{addr}{path}");

        let response = self.client.post(&url).json(args).send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::ConnectionFailed(e.to_string())
            }
        })?;

        if !response.status().is_success() {
            return Err(TransportError::InvalidResponse(format!(
                "{} from {url}",
                response.status()
            )));
        }
        response
            .json::<Resp>()
            .await
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request_vote(
        &self,
        target: u64,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteResult, TransportError> {
        self.post_json(target, "/raft/request_vote", &args).await
    }

    async fn append_entries(
        &self,
        target: u64,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesResult, TransportError> {
        self.post_json(target, "/raft/append_entries", &args).await
    }
}

/// Router for the peer-facing RPC listener.
pub fn raft_router(core: SharedCore) -> Router {
    Router::new()
        .route("/raft/request_vote", post(handle_request_vote))
        .route("/raft/append_entries", post(handle_append_entries))
        .route("/raft/install_snapshot", post(handle_install_snapshot))
        .with_state(core)
}

fn storage_failure(e: StorageError) -> StatusCode {
    // The peer sees a retryable server error; locally this is fatal and
    // the event loop will stop on its next storage touch.
    error!(error = %e, "storage failure while serving raft rpc");
    StatusCode::INTERNAL_SERVER_ERROR
}

async fn handle_request_vote(
    State(core): State<SharedCore>,
    Json(args): Json<RequestVoteArgs>,
) -> Result<Json<RequestVoteResult>, StatusCode> {
    let mut core = core.lock().await;
    core.handle_request_vote(&args)
        .map(Json)
        .map_err(storage_failure)
}

async fn handle_append_entries(
    State(core): State<SharedCore>,
    Json(args): Json<AppendEntriesArgs>,
) -> Result<Json<AppendEntriesResult>, StatusCode> {
    let mut core = core.lock().await;
    core.handle_append_entries(&args)
        .map(Json)
        .map_err(storage_failure)
}

async fn handle_install_snapshot(
    State(core): State<SharedCore>,
    Json(args): Json<InstallSnapshotArgs>,
) -> Json<InstallSnapshotResult> {
    let core = core.lock().await;
    Json(core.handle_install_snapshot(&args))
}
