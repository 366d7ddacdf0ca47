//! Raft timing parameters.

use std::time::Duration;

/// Timing configuration for a Raft node.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Interval between leader replication ticks (heartbeats).
    pub heartbeat_interval: Duration,
    /// Minimum election timeout.
    pub election_timeout_min: Duration,
    /// Maximum election timeout (exclusive bound of the random draw).
    pub election_timeout_max: Duration,
    /// Per-RPC timeout for outbound RequestVote/AppendEntries calls.
    pub rpc_timeout: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(150),
            election_timeout_min: Duration::from_millis(300),
            election_timeout_max: Duration::from_millis(500),
            rpc_timeout: Duration::from_secs(2),
        }
    }
}

impl RaftConfig {
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_election_timeout(mut self, min: Duration, max: Duration) -> Self {
        self.election_timeout_min = min;
        self.election_timeout_max = max;
        self
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    /// Draw a random election timeout uniformly from `[min, max)`.
    /// Randomization is what breaks repeated split votes.
    pub fn random_election_timeout(&self) -> Duration {
        use rand::Rng;
        let min_ms = self.election_timeout_min.as_millis() as u64;
        let max_ms = self.election_timeout_max.as_millis() as u64;
        if max_ms <= min_ms {
            return self.election_timeout_min;
        }
        let timeout_ms = rand::rng().random_range(min_ms..max_ms);
        Duration::from_millis(timeout_ms)
    }
}
