//! Engine tuning knobs.

use std::time::Duration;

/// Timing and sizing options for a Raft engine instance.
#[derive(Debug, Clone)]
pub struct RaftOptions {
    /// Fixed floor of the randomized election timeout.
    pub election_timeout_base: Duration,
    /// Width of the random range added to the floor.
    pub election_timeout_range: Duration,
    /// Interval between leader heartbeats.
    pub heartbeat_interval: Duration,
    /// Maximum size of one InstallSnapshot chunk, in bytes.
    pub snapshot_chunk_size: usize,
    /// Applied entries retained in the log before `should_snapshot`
    /// starts reporting true.
    pub snapshot_threshold: u64,
}

impl Default for RaftOptions {
    fn default() -> Self {
        Self {
            election_timeout_base: Duration::from_millis(1024),
            election_timeout_range: Duration::from_millis(1024),
            heartbeat_interval: Duration::from_millis(1024 / 3),
            snapshot_chunk_size: 4096,
            snapshot_threshold: 10_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = RaftOptions::default();
        assert!(opts.heartbeat_interval < opts.election_timeout_base);
        assert_eq!(opts.snapshot_chunk_size, 4096);
    }
}
