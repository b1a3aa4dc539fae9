//! Process-wide counters surfaced through `/health` and logged at
//! shutdown. None of these gate behavior; they are purely observational,
//! per the error handling design's "all other errors are counted and
//! exposed."

use std::sync::atomic::{AtomicU64, Ordering};

/// Shared, lock-free counters incremented from any thread.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    malformed_packets: AtomicU64,
    timestamp_underflows: AtomicU64,
    splices: AtomicU64,
    reconnects: AtomicU64,
}

impl RelayMetrics {
    /// Builds a fresh, zeroed counter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a dropped malformed packet.
    pub fn record_malformed_packet(&self) {
        self.malformed_packets.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a clamped PTS/PCR rebasing underflow.
    pub fn record_timestamp_underflow(&self) {
        self.timestamp_underflows.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a completed splice to a new active source.
    pub fn record_splice(&self) {
        self.splices.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a source pipe reconnect attempt.
    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Current malformed-packet count.
    pub fn malformed_packets(&self) -> u64 {
        self.malformed_packets.load(Ordering::Relaxed)
    }

    /// Current timestamp-underflow count.
    pub fn timestamp_underflows(&self) -> u64 {
        self.timestamp_underflows.load(Ordering::Relaxed)
    }

    /// Current splice count.
    pub fn splices(&self) -> u64 {
        self.splices.load(Ordering::Relaxed)
    }

    /// Current reconnect count.
    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_increment() {
        let m = RelayMetrics::new();
        assert_eq!(m.malformed_packets(), 0);
        m.record_malformed_packet();
        m.record_malformed_packet();
        assert_eq!(m.malformed_packets(), 2);
        m.record_splice();
        assert_eq!(m.splices(), 1);
    }
}
