//! Raft key-value server binary.
//!
//! Runs one node with two listeners: the transport port serves `/raft/*`
//! RPCs from peers, the API port serves `/client/*` and `/metrics`.
//!
//! Example three-node cluster:
//!   raft-kv-server --id 1 --transport-port 8001 --api-port 9001 \
//!       --data-dir /tmp/raft1 --peers 2=127.0.0.1:8002,3=127.0.0.1:8003

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use raft_kv::api::{client_router, ClientState};
use raft_kv::core::apply::ApplyPipeline;
use raft_kv::core::config::RaftConfig;
use raft_kv::core::raft_core::RaftCore;
use raft_kv::core::raft_server::RaftServer;
use raft_kv::state_machine::SharedKvStore;
use raft_kv::storage::FileStorage;
use raft_kv::transport::http::raft_router;
use raft_kv::transport::HttpTransport;

fn parse_peer(spec: &str) -> Result<(u64, String), String> {
    let (id, addr) = spec
        .split_once('=')
        .ok_or_else(|| format!("expected <id>=<host:port>, got {spec:?}"))?;
    let id = id.parse().map_err(|_| format!("invalid peer id {id:?}"))?;
    Ok((id, addr.to_string()))
}

#[derive(Debug, Parser)]
#[command(name = "raft-kv-server", about = "Raft consensus node with a replicated key-value store")]
struct Args {
    /// This node's id. Must be unique in the cluster.
    #[arg(long)]
    id: u64,

    /// Port for peer RPCs (`/raft/*`).
    #[arg(long)]
    transport_port: u16,

    /// Port for the client API (`/client/*`, `/metrics`).
    #[arg(long)]
    api_port: u16,

    /// Directory for persistent state. Created if missing.
    #[arg(long)]
    data_dir: PathBuf,

    /// Peers as comma-separated `<id>=<host:port>`.
    #[arg(long, value_delimiter = ',', value_parser = parse_peer)]
    peers: Vec<(u64, String)>,

    /// Leader heartbeat interval in milliseconds.
    #[arg(long, env = "HEARTBEAT_MS", default_value_t = 150)]
    heartbeat_ms: u64,

    /// Lower bound of the randomized election timeout in milliseconds.
    #[arg(long, env = "ELECTION_TIMEOUT_MIN_MS", default_value_t = 300)]
    election_timeout_min_ms: u64,

    /// Upper bound of the randomized election timeout in milliseconds.
    #[arg(long, env = "ELECTION_TIMEOUT_MAX_MS", default_value_t = 500)]
    election_timeout_max_ms: u64,

    /// Timeout for each outbound peer RPC in milliseconds.
    #[arg(long, env = "RPC_TIMEOUT_MS", default_value_t = 2000)]
    rpc_timeout_ms: u64,
}

impl Args {
    fn raft_config(&self) -> anyhow::Result<RaftConfig> {
        if self.election_timeout_min_ms >= self.election_timeout_max_ms {
            bail!(
                "election timeout min ({}) must be below max ({})",
                self.election_timeout_min_ms,
                self.election_timeout_max_ms
            );
        }
        if self.heartbeat_ms >= self.election_timeout_min_ms {
            bail!(
                "heartbeat interval ({}) must be below the election timeout minimum ({})",
                self.heartbeat_ms,
                self.election_timeout_min_ms
            );
        }
        Ok(RaftConfig::default()
            .with_heartbeat_interval(Duration::from_millis(self.heartbeat_ms))
            .with_election_timeout(
                Duration::from_millis(self.election_timeout_min_ms),
                Duration::from_millis(self.election_timeout_max_ms),
            )
            .with_rpc_timeout(Duration::from_millis(self.rpc_timeout_ms)))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = args.raft_config()?;
    let peers: HashMap<u64, String> = args.peers.iter().cloned().collect();
    if peers.contains_key(&args.id) {
        bail!("peer list must not contain this node's own id {}", args.id);
    }

    info!(id = args.id, peers = ?peers, data_dir = %args.data_dir.display(), "starting node");

    let storage = FileStorage::new(&args.data_dir)
        .with_context(|| format!("opening data dir {}", args.data_dir.display()))?;
    let peer_ids: Vec<u64> = peers.keys().copied().collect();
    let transport = HttpTransport::new(peers, config.rpc_timeout)?;
    let core = RaftCore::new(args.id, peer_ids, Box::new(storage))
        .context("restoring persistent state")?;
    let metrics = core.metrics();

    let (server, shared_core) = RaftServer::new(core, transport, config);
    let handle = server.start();

    let store = SharedKvStore::new();
    let pipeline = ApplyPipeline::new(shared_core.clone(), Box::new(store.clone())).await;
    let results = pipeline.results();
    pipeline.spawn();

    let transport_addr = SocketAddr::from(([0, 0, 0, 0], args.transport_port));
    let transport_listener = tokio::net::TcpListener::bind(transport_addr)
        .await
        .with_context(|| format!("binding transport listener on {transport_addr}"))?;
    info!(%transport_addr, "raft rpc listener ready");
    let rpc_router = raft_router(shared_core.clone());
    tokio::spawn(async move {
        if let Err(e) = axum::serve(transport_listener, rpc_router).await {
            tracing::error!(error = %e, "raft rpc listener failed");
        }
    });

    let state = ClientState {
        handle: handle.clone(),
        core: shared_core,
        results,
        store,
        metrics,
    };
    let api_addr = SocketAddr::from(([0, 0, 0, 0], args.api_port));
    let api_listener = tokio::net::TcpListener::bind(api_addr)
        .await
        .with_context(|| format!("binding api listener on {api_addr}"))?;
    info!(%api_addr, "client api listener ready");

    axum::serve(api_listener, client_router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .context("client api listener failed")?;

    handle.shutdown().await;
    Ok(())
}
