//! Pacer statistics.
//!
//! Counters for everything the driver puts on the wire, designed for JSON
//! serialization and metrics export.

use serde::Serialize;

/// Aggregate pacer-side statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PacerStats {
    /// Media packets released to the transport.
    pub packets_sent: u64,
    /// Media bytes released to the transport (overhead included when
    /// overhead accounting is on).
    pub bytes_sent: u64,
    /// Padding packets released.
    pub padding_packets_sent: u64,
    /// Padding bytes released.
    pub padding_bytes_sent: u64,
    /// Retransmission packets released.
    pub retransmissions_sent: u64,
    /// Transport send calls that returned an error.
    pub transport_failures: u64,
    /// Probe clusters run to completion.
    pub probe_clusters_completed: u64,
    /// Ticks on which the emergency drain lifted the pacing rate.
    pub drain_ticks: u64,
}

impl PacerStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share of send attempts that failed at the transport.
    pub fn failure_rate(&self) -> f64 {
        let attempts = self.packets_sent + self.padding_packets_sent + self.transport_failures;
        if attempts == 0 {
            0.0
        } else {
            self.transport_failures as f64 / attempts as f64
        }
    }

    /// Padding bytes as a fraction of all bytes sent.
    pub fn padding_ratio(&self) -> f64 {
        let total = self.bytes_sent + self.padding_bytes_sent;
        if total == 0 {
            0.0
        } else {
            self.padding_bytes_sent as f64 / total as f64
        }
    }
}
