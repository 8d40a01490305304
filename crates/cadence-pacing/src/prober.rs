//! Bandwidth probe clusters.
//!
//! Bandwidth estimation occasionally asks the pacer to emit a short burst
//! well above the current pacing rate to measure headroom. Each request is a
//! cluster: a target rate and a packet count. While a cluster is active the
//! driver bypasses the media budget; the cluster is consumed once exactly
//! its packet count has been sent, whatever mix of media and padding that
//! turned out to be.
//!
//! Probing never starts before real traffic has been seen — probing an idle
//! sender would measure nothing.

use quanta::Instant;
use std::collections::VecDeque;
use tracing::debug;

/// Spacing goal between probe batches; one batch should carry about twice
/// this much data at the cluster's target rate.
const MIN_PROBE_DELTA_US: u128 = 2_000;

/// A requested probe burst.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeCluster {
    pub id: u32,
    pub target_bps: u64,
    pub packet_count: usize,
}

#[derive(Debug)]
struct ActiveCluster {
    cluster: ProbeCluster,
    packets_sent: usize,
    bytes_sent: usize,
}

/// FIFO of pending probe clusters with per-cluster progress accounting.
#[derive(Debug)]
pub struct BitrateProber {
    enabled: bool,
    /// No probing until the first media packet has passed through.
    traffic_seen: bool,
    clusters: VecDeque<ActiveCluster>,
    next_cluster_id: u32,
}

impl BitrateProber {
    pub fn new(enabled: bool) -> Self {
        BitrateProber {
            enabled,
            traffic_seen: false,
            clusters: VecDeque::new(),
            next_cluster_id: 0,
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.clusters.clear();
        }
    }

    /// Queue a probe cluster. Returns the cluster id, or `None` when
    /// probing is disabled.
    pub fn create_probe_cluster(&mut self, target_bps: u64, packet_count: usize) -> Option<u32> {
        if !self.enabled || target_bps == 0 || packet_count == 0 {
            return None;
        }
        let id = self.next_cluster_id;
        self.next_cluster_id = self.next_cluster_id.wrapping_add(1);
        debug!(id, target_bps, packet_count, "probe cluster queued");
        self.clusters.push_back(ActiveCluster {
            cluster: ProbeCluster { id, target_bps, packet_count },
            packets_sent: 0,
            bytes_sent: 0,
        });
        Some(id)
    }

    /// Note a packet entering the pacer. The first one arms probing.
    pub fn on_incoming_packet(&mut self, size_bytes: usize) {
        if size_bytes > 0 {
            self.traffic_seen = true;
        }
    }

    /// Whether a cluster is ready to drive the current tick.
    pub fn is_probing(&self) -> bool {
        self.enabled && self.traffic_seen && !self.clusters.is_empty()
    }

    /// The cluster driving the current tick, if any.
    pub fn current_cluster(&self) -> Option<ProbeCluster> {
        if !self.is_probing() {
            return None;
        }
        self.clusters.front().map(|active| active.cluster)
    }

    /// Minimum bytes one probing tick should put on the wire to hold the
    /// cluster's target rate between batches.
    pub fn recommended_min_probe_size(&self) -> usize {
        self.clusters
            .front()
            .map(|active| {
                (active.cluster.target_bps as u128 * 2 * MIN_PROBE_DELTA_US / 8_000_000) as usize
            })
            .unwrap_or(0)
    }

    /// Record the outcome of a probing tick. Returns `true` when this
    /// completed the current cluster.
    pub fn probe_sent(&mut self, now: Instant, bytes: usize, packets: usize) -> bool {
        let Some(active) = self.clusters.front_mut() else {
            return false;
        };
        active.bytes_sent += bytes;
        active.packets_sent += packets;
        if active.packets_sent >= active.cluster.packet_count {
            debug!(
                id = active.cluster.id,
                bytes = active.bytes_sent,
                packets = active.packets_sent,
                ?now,
                "probe cluster complete"
            );
            self.clusters.pop_front();
            return true;
        }
        false
    }

    /// Number of clusters waiting, current one included.
    pub fn pending_clusters(&self) -> usize {
        self.clusters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_prober_rejects_clusters() {
        let mut prober = BitrateProber::new(false);
        assert_eq!(prober.create_probe_cluster(900_000, 5), None);
        assert!(!prober.is_probing());
    }

    #[test]
    fn probing_waits_for_traffic() {
        let mut prober = BitrateProber::new(true);
        prober.create_probe_cluster(900_000, 5).unwrap();
        assert!(!prober.is_probing());

        prober.on_incoming_packet(1200);
        assert!(prober.is_probing());
    }

    #[test]
    fn cluster_consumed_after_packet_count() {
        let mut prober = BitrateProber::new(true);
        prober.on_incoming_packet(1200);
        let id = prober.create_probe_cluster(900_000, 3).unwrap();
        assert_eq!(prober.current_cluster().unwrap().id, id);

        let now = Instant::now();
        assert!(!prober.probe_sent(now, 1200, 1));
        assert!(!prober.probe_sent(now, 1200, 1));
        assert!(prober.probe_sent(now, 1200, 1));
        assert!(!prober.is_probing());
    }

    #[test]
    fn clusters_run_in_fifo_order() {
        let mut prober = BitrateProber::new(true);
        prober.on_incoming_packet(1200);
        let first = prober.create_probe_cluster(900_000, 1).unwrap();
        let second = prober.create_probe_cluster(1_800_000, 1).unwrap();

        assert_eq!(prober.current_cluster().unwrap().id, first);
        prober.probe_sent(Instant::now(), 1200, 1);
        assert_eq!(prober.current_cluster().unwrap().id, second);
    }

    #[test]
    fn recommended_size_scales_with_rate() {
        let mut prober = BitrateProber::new(true);
        prober.on_incoming_packet(1200);
        prober.create_probe_cluster(1_000_000, 5).unwrap();
        // 1 Mbps over 4 ms = 500 bytes.
        assert_eq!(prober.recommended_min_probe_size(), 500);
    }

    #[test]
    fn disabling_drops_pending_clusters() {
        let mut prober = BitrateProber::new(true);
        prober.on_incoming_packet(1200);
        prober.create_probe_cluster(900_000, 5).unwrap();
        prober.set_enabled(false);
        assert!(!prober.is_probing());
        assert_eq!(prober.pending_clusters(), 0);
    }
}
