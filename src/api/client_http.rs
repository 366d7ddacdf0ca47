//! Client-facing HTTP endpoints.
//!
//! - `POST /client/propose` — submit a command, returns the assigned index
//! - `GET /client/result/{index}` — poll the apply outcome for an index
//! - `GET /client/read/{key}` — read the key-value store directly
//! - `GET /client/leader` — who this node thinks the leader is
//! - `GET /client/status` — node state for operators
//! - `GET /metrics` — operational counters
//!
//! Proposals return before commit; clients poll `result/{index}` until the
//! entry is applied. Reads are served from local state and may lag the
//! leader on a follower.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::core::apply::{ApplyResult, ApplyResults};
use crate::core::raft_node::SharedCore;
use crate::core::raft_server::RaftHandle;
use crate::core::RaftError;
use crate::metrics::{MetricsSnapshot, RaftMetrics};
use crate::state_machine::SharedKvStore;

/// Everything the client handlers need.
#[derive(Clone)]
pub struct ClientState {
    pub handle: RaftHandle,
    pub core: SharedCore,
    pub results: ApplyResults,
    pub store: SharedKvStore,
    pub metrics: Arc<RaftMetrics>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposeRequest {
    pub command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposeResponse {
    /// Log index the command was assigned. Poll `result/{index}` for the
    /// outcome.
    pub index: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    /// Last known leader, so clients can redirect.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leader_hint: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadResponse {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderResponse {
    pub node_id: u64,
    pub leader_id: Option<u64>,
    pub is_leader: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub node_id: u64,
    pub state: String,
    pub term: u64,
    pub leader_id: Option<u64>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub log_length: u64,
}

/// Build the client router.
pub fn client_router(state: ClientState) -> Router {
    Router::new()
        .route("/client/propose", post(handle_propose))
        .route("/client/result/{index}", get(handle_result))
        .route("/client/read/{key}", get(handle_read))
        .route("/client/leader", get(handle_leader))
        .route("/client/status", get(handle_status))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

fn error_response(
    status: StatusCode,
    error: impl Into<String>,
    leader_hint: Option<u64>,
) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            leader_hint,
        }),
    )
}

async fn handle_propose(
    State(state): State<ClientState>,
    Json(request): Json<ProposeRequest>,
) -> Result<Json<ProposeResponse>, (StatusCode, Json<ErrorResponse>)> {
    match state.handle.propose(request.command.into_bytes()).await {
        Ok(index) => Ok(Json(ProposeResponse { index })),
        Err(RaftError::NotLeader { leader_hint }) => Err(error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "not the leader",
            leader_hint,
        )),
        Err(RaftError::Shutdown) => Err(error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "node is shutting down",
            None,
        )),
        Err(RaftError::Storage(e)) => Err(error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("storage failure: {e}"),
            None,
        )),
    }
}

/// Poll the outcome for a proposed index. 200 with the result once the
/// entry is applied, 202 while it is still in flight, 404 for an index
/// that was never assigned, 410 once the result aged out of the window.
async fn handle_result(
    State(state): State<ClientState>,
    Path(index): Path<u64>,
) -> Result<Json<ApplyResult>, (StatusCode, Json<ErrorResponse>)> {
    // Cursor first, registry second. The pipeline records a result before
    // it advances `last_applied`, so with this order a registry miss for
    // an index at or below the cursor means the result truly expired; the
    // reverse order could answer GONE for an entry applied in between.
    let (last_applied, last_log_index) = {
        let core = state.core.lock().await;
        (core.last_applied, core.last_log_index())
    };
    if let Some(result) = state.results.get(index) {
        return Ok(Json(result));
    }

    if index <= last_applied {
        return Err(error_response(
            StatusCode::GONE,
            "result expired from the retention window",
            None,
        ));
    }
    if index > last_log_index {
        return Err(error_response(
            StatusCode::NOT_FOUND,
            "no entry at this index",
            None,
        ));
    }
    Err(error_response(
        StatusCode::ACCEPTED,
        "not yet applied",
        None,
    ))
}

async fn handle_read(
    State(state): State<ClientState>,
    Path(key): Path<String>,
) -> Result<Json<ReadResponse>, (StatusCode, Json<ErrorResponse>)> {
    match state.store.get(&key) {
        Some(value) => Ok(Json(ReadResponse { key, value })),
        None => Err(error_response(StatusCode::NOT_FOUND, "key not found", None)),
    }
}

async fn handle_leader(State(state): State<ClientState>) -> Json<LeaderResponse> {
    let core = state.core.lock().await;
    Json(LeaderResponse {
        node_id: core.id,
        leader_id: core.current_leader,
        is_leader: core.current_leader == Some(core.id),
    })
}

async fn handle_status(State(state): State<ClientState>) -> Json<StatusResponse> {
    let core = state.core.lock().await;
    Json(StatusResponse {
        node_id: core.id,
        state: format!("{:?}", core.state),
        term: core.current_term,
        leader_id: core.current_leader,
        commit_index: core.commit_index,
        last_applied: core.last_applied,
        log_length: core.last_log_index(),
    })
}

async fn handle_metrics(State(state): State<ClientState>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}
