//! Node-level operational counters, exposed on `GET /metrics`.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Monotonic counters shared across the core, fan-out, and API layers.
/// Relaxed ordering is enough; these are observability, not coordination.
#[derive(Debug, Default)]
pub struct RaftMetrics {
    elections_started: AtomicU64,
    leader_changes: AtomicU64,
    proposals_accepted: AtomicU64,
    entries_applied: AtomicU64,
    append_entries_sent: AtomicU64,
    append_entries_failed: AtomicU64,
    request_votes_sent: AtomicU64,
    request_votes_failed: AtomicU64,
}

/// Point-in-time copy of the counters, serialized for the metrics endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub elections_started: u64,
    pub leader_changes: u64,
    pub proposals_accepted: u64,
    pub entries_applied: u64,
    pub append_entries_sent: u64,
    pub append_entries_failed: u64,
    pub request_votes_sent: u64,
    pub request_votes_failed: u64,
}

impl RaftMetrics {
    pub fn inc_elections(&self) {
        self.elections_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_leader_changes(&self) {
        self.leader_changes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_proposals(&self) {
        self.proposals_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_entries_applied(&self) {
        self.entries_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_append_entries_sent(&self, count: u64) {
        self.append_entries_sent.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_append_entries_failed(&self) {
        self.append_entries_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_request_votes_sent(&self, count: u64) {
        self.request_votes_sent.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_request_votes_failed(&self) {
        self.request_votes_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            elections_started: self.elections_started.load(Ordering::Relaxed),
            leader_changes: self.leader_changes.load(Ordering::Relaxed),
            proposals_accepted: self.proposals_accepted.load(Ordering::Relaxed),
            entries_applied: self.entries_applied.load(Ordering::Relaxed),
            append_entries_sent: self.append_entries_sent.load(Ordering::Relaxed),
            append_entries_failed: self.append_entries_failed.load(Ordering::Relaxed),
            request_votes_sent: self.request_votes_sent.load(Ordering::Relaxed),
            request_votes_failed: self.request_votes_failed.load(Ordering::Relaxed),
        }
    }
}
