//! Paced-sender driver.
//!
//! Producers enqueue packets from any thread; a single driver thread calls
//! [`PacedSender::process`] on a fixed tick. Each tick converts elapsed time
//! into byte budget at the target rate and drains the queue while the budget
//! allows, releasing packets to the [`PacketTransport`]. Nothing here
//! blocks, sleeps, or touches a socket — the transport callback is the only
//! boundary, and it is invoked with the pacer lock held, so it must not call
//! back into the pacer.
//!
//! Rate decisions follow three overrides, in order: an active probe cluster
//! ignores the budget entirely, the emergency drain lifts the target rate
//! when queued packets grow old, and unpaced audio skips the budget check.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Result;
use cadence_media::packet::{PacketKind, PacketToSend};
use crossbeam_channel::Sender;
use quanta::Instant;
use tracing::{debug, info, warn};

use crate::budget::IntervalBudget;
use crate::config::PacerConfig;
use crate::prober::BitrateProber;
use crate::queue::{EnqueueError, PacketView, QueuedPacket, RoundRobinPacketQueue};
use crate::stats::PacerStats;

/// Longest gap between ticks converted into budget; beyond this the clock
/// is assumed to have stalled.
const MAX_ELAPSED_TIME: Duration = Duration::from_secs(2);

/// Cap on budget growth per tick, bounding the burst after a late tick.
const MAX_BUDGET_INTERVAL: Duration = Duration::from_millis(30);

/// Floor for the emergency-drain time window.
const MIN_DRAIN_TIME: Duration = Duration::from_millis(1);

/// Where the pacer hands packets off. Implementations send on the wire (or
/// record, in tests); `generate_padding` is only needed when a padding rate
/// is configured.
pub trait PacketTransport {
    /// Deliver one packet. An error head-requeues the packet: the next tick
    /// retries it before any later packet of its stream.
    fn send_packet(&self, packet: &PacketView) -> Result<()>;

    /// Produce padding packets totalling roughly `target_bytes`. The
    /// default produces none, which disables padding regardless of rate.
    fn generate_padding(&self, target_bytes: usize) -> Vec<PacketToSend> {
        let _ = target_bytes;
        Vec::new()
    }
}

/// Out-of-band conditions surfaced to the owner. The pacer never drops
/// packets on its own; these events exist so the owner can.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacerStatus {
    /// A stream's transport sends keep failing back-to-back.
    TransportFailing { ssrc: u32, consecutive_failures: u32 },
    /// Queued bytes crossed the configured high-water mark.
    QueuePressure { size_bytes: usize, high_water_mark: usize },
}

struct Inner {
    config: PacerConfig,
    queue: RoundRobinPacketQueue,
    media_budget: IntervalBudget,
    padding_budget: IntervalBudget,
    prober: BitrateProber,
    /// Rates staged by `set_pacing_rates`, applied at the next tick.
    pending_rates: Option<(u64, u64)>,
    pacing_rate_bps: u64,
    padding_rate_bps: u64,
    last_process_time: Instant,
    /// Monotonic guard: the largest time this pacer has ever seen.
    last_observed_time: Instant,
    packet_counter: u64,
    paused: bool,
    first_sent_packet_time: Option<Instant>,
    consecutive_failures: HashMap<u32, u32>,
    status_tx: Option<Sender<PacerStatus>>,
    stats: PacerStats,
}

/// The send-side pacer.
pub struct PacedSender<T: PacketTransport + ?Sized> {
    transport: Arc<T>,
    inner: Mutex<Inner>,
}

impl<T: PacketTransport + ?Sized> PacedSender<T> {
    pub fn new(config: PacerConfig, transport: Arc<T>) -> Self {
        let now = Instant::now();
        let queue = RoundRobinPacketQueue::new(now)
            .with_max_leading_bytes(config.max_leading_bytes);
        let inner = Inner {
            media_budget: IntervalBudget::new(config.pacing_rate_bps, false),
            padding_budget: IntervalBudget::new(config.padding_rate_bps, false),
            prober: BitrateProber::new(config.enable_probing),
            pacing_rate_bps: config.pacing_rate_bps,
            padding_rate_bps: config.padding_rate_bps,
            pending_rates: None,
            last_process_time: now,
            last_observed_time: now,
            packet_counter: 0,
            paused: false,
            first_sent_packet_time: None,
            consecutive_failures: HashMap::new(),
            status_tx: None,
            stats: PacerStats::new(),
            queue,
            config,
        };
        PacedSender {
            transport,
            inner: Mutex::new(inner),
        }
    }

    /// Install a channel for out-of-band status events.
    pub fn set_status_sender(&self, tx: Sender<PacerStatus>) {
        self.lock().status_tx = Some(tx);
    }

    /// Admit a packet, stamping its enqueue time and order. Thread-safe;
    /// producers call this from anywhere.
    pub fn enqueue(&self, now: Instant, packet: PacketToSend) -> Result<(), EnqueueError> {
        let mut inner = self.lock();
        let now = inner.clamped_now(now);

        inner.prober.on_incoming_packet(packet.wire_size());
        let priority = priority_for_kind(packet.kind, inner.config.prioritize_audio);
        let order = inner.packet_counter;
        inner.packet_counter += 1;

        let mut queued = QueuedPacket::new(priority, now, order, packet);
        if inner.config.send_side_bwe_overhead {
            queued = queued.with_transport_overhead(inner.config.overhead_bytes_per_packet);
        }
        inner.queue.enqueue(queued)?;

        if let Some(high_water_mark) = inner.config.queue_high_water_mark_bytes {
            let size_bytes = inner.queue.size_in_bytes();
            if size_bytes > high_water_mark {
                inner.emit_status(PacerStatus::QueuePressure {
                    size_bytes,
                    high_water_mark,
                });
            }
        }
        Ok(())
    }

    /// Stage new pacing and padding rates; they take effect at the next
    /// `process` call.
    pub fn set_pacing_rates(&self, pacing_rate_bps: u64, padding_rate_bps: u64) {
        if pacing_rate_bps == 0 {
            debug_assert!(false, "pacing rate must be non-zero");
            warn!("ignoring attempt to set a zero pacing rate");
            return;
        }
        self.lock().pending_rates = Some((pacing_rate_bps, padding_rate_bps));
    }

    /// Halt or resume emission. Queued packets are retained and their ages
    /// freeze while paused.
    pub fn set_paused(&self, paused: bool, now: Instant) {
        let mut inner = self.lock();
        let now = inner.clamped_now(now);
        if inner.paused != paused {
            info!(paused, "pacer pause state changed");
        }
        inner.paused = paused;
        inner.queue.set_pause_state(paused, now);
    }

    /// Request a probe burst of `packet_count` packets at `target_bps`.
    /// Returns the cluster id, or `None` when probing is disabled.
    pub fn create_probe_cluster(&self, target_bps: u64, packet_count: usize) -> Option<u32> {
        let mut inner = self.lock();
        if !inner.config.enable_probing {
            return None;
        }
        inner.prober.create_probe_cluster(target_bps, packet_count)
    }

    /// One pacing tick: replenish budgets for the time elapsed and release
    /// packets while they last. Returns the number of packets released.
    ///
    /// Must be called from a single thread.
    pub fn process(&self, now: Instant) -> usize {
        let mut inner = self.lock();
        let now = inner.clamped_now(now);

        if let Some((pacing, padding)) = inner.pending_rates.take() {
            inner.pacing_rate_bps = pacing;
            inner.padding_rate_bps = padding;
            inner.padding_budget.set_target_rate_bps(padding);
            debug!(pacing_bps = pacing, padding_bps = padding, "pacing rates updated");
        }

        let mut elapsed = now.duration_since(inner.last_process_time);
        inner.last_process_time = now;
        if elapsed > MAX_ELAPSED_TIME {
            warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                "tick gap longer than expected, clamping"
            );
            elapsed = MAX_ELAPSED_TIME;
        }

        inner.queue.update_queue_time(now);
        if inner.paused {
            return 0;
        }

        if !elapsed.is_zero() {
            let mut target_rate = inner.pacing_rate_bps;
            let queue_bytes = inner.queue.size_in_bytes();
            if inner.config.drain_large_queues && queue_bytes > 0 {
                // Rate needed to empty the queue before the average packet
                // crosses the delay ceiling. Past the ceiling the window
                // floors at 1 ms and the rate spikes until the backlog is
                // gone.
                let time_left = inner
                    .config
                    .max_queue_delay
                    .saturating_sub(inner.queue.average_queue_time(now))
                    .max(MIN_DRAIN_TIME);
                let min_rate_needed =
                    ((queue_bytes as u128 * 8 * 1_000_000) / time_left.as_micros().max(1)) as u64;
                if min_rate_needed > target_rate {
                    target_rate = min_rate_needed;
                    inner.stats.drain_ticks += 1;
                    debug!(target_rate_bps = target_rate, "queue too old, draining");
                }
            }
            inner.media_budget.set_target_rate_bps(target_rate);
            let budget_delta = elapsed.min(MAX_BUDGET_INTERVAL);
            inner.media_budget.increase_budget(budget_delta);
            inner.padding_budget.increase_budget(budget_delta);
        }

        let probe = inner.prober.current_cluster();
        let recommended_probe_size = probe.map(|_| inner.prober.recommended_min_probe_size());

        let mut data_sent = 0usize;
        let mut packets_sent = 0usize;

        loop {
            let Some(view) = inner.queue.begin_pop() else {
                // Queue idle; consider padding.
                let padding_target = inner.padding_to_add(recommended_probe_size, data_sent);
                if padding_target == 0 {
                    break;
                }
                let padding = self.transport.generate_padding(padding_target);
                if padding.is_empty() {
                    break;
                }
                let mut admitted = 0usize;
                for packet in padding {
                    let priority =
                        priority_for_kind(PacketKind::Padding, inner.config.prioritize_audio);
                    let order = inner.packet_counter;
                    inner.packet_counter += 1;
                    let mut queued = QueuedPacket::new(priority, now, order, packet);
                    if inner.config.send_side_bwe_overhead {
                        queued =
                            queued.with_transport_overhead(inner.config.overhead_bytes_per_packet);
                    }
                    match inner.queue.enqueue(queued) {
                        Ok(()) => admitted += 1,
                        Err(err) => warn!(%err, "generated padding packet rejected"),
                    }
                }
                if admitted == 0 {
                    break;
                }
                continue;
            };

            let pace_this = view.kind != PacketKind::Audio || inner.config.pace_audio;
            if pace_this && probe.is_none() && inner.media_budget.bytes_remaining() == 0 {
                inner.queue.cancel_pop();
                break;
            }

            match self.transport.send_packet(&view) {
                Ok(()) => {
                    inner.queue.finalize_pop();
                    inner.on_packet_sent(&view, now);
                    data_sent += view.size_bytes;
                    packets_sent += 1;
                    if let Some(min_probe) = recommended_probe_size {
                        if data_sent >= min_probe {
                            break;
                        }
                    }
                }
                Err(err) => {
                    inner.queue.cancel_pop();
                    inner.stats.transport_failures += 1;
                    let entry = inner.consecutive_failures.entry(view.ssrc).or_insert(0);
                    *entry += 1;
                    let failures = *entry;
                    warn!(ssrc = view.ssrc, failures, %err, "transport send failed, head-requeued");
                    if failures >= inner.config.transport_failure_threshold {
                        inner.emit_status(PacerStatus::TransportFailing {
                            ssrc: view.ssrc,
                            consecutive_failures: failures,
                        });
                    }
                    break;
                }
            }
        }

        if probe.is_some() && data_sent > 0 && inner.prober.probe_sent(now, data_sent, packets_sent)
        {
            inner.stats.probe_clusters_completed += 1;
        }

        packets_sent
    }

    // ─── Queries ────────────────────────────────────────────────────────

    pub fn queue_size_packets(&self) -> usize {
        self.lock().queue.size_in_packets()
    }

    pub fn queue_size_bytes(&self) -> usize {
        self.lock().queue.size_in_bytes()
    }

    pub fn is_queue_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    /// Unpaused age of the oldest queued packet.
    pub fn oldest_packet_wait_time(&self, now: Instant) -> Duration {
        match self.lock().queue.oldest_enqueue_time() {
            Some(oldest) => now.duration_since(oldest),
            None => Duration::ZERO,
        }
    }

    /// Time to empty the queue at the applied pacing rate.
    pub fn expected_queue_time(&self) -> Duration {
        let inner = self.lock();
        let rate = inner.pacing_rate_bps.max(1);
        Duration::from_millis(inner.queue.size_in_bytes() as u64 * 8 * 1000 / rate)
    }

    /// The pacing rate currently applied (staged rates land on the next
    /// `process`).
    pub fn pacing_rate_bps(&self) -> u64 {
        self.lock().pacing_rate_bps
    }

    /// The padding rate currently applied.
    pub fn padding_rate_bps(&self) -> u64 {
        self.lock().padding_rate_bps
    }

    pub fn first_sent_packet_time(&self) -> Option<Instant> {
        self.lock().first_sent_packet_time
    }

    pub fn stats(&self) -> PacerStats {
        self.lock().stats.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Inner {
    /// Clamp `now` against the largest time seen so a misbehaving caller
    /// clock cannot run the pacer backwards.
    fn clamped_now(&mut self, now: Instant) -> Instant {
        if now < self.last_observed_time {
            warn!("non-monotonic time observed, clamping");
            self.last_observed_time
        } else {
            self.last_observed_time = now;
            now
        }
    }

    fn on_packet_sent(&mut self, view: &PacketView, now: Instant) {
        if self.first_sent_packet_time.is_none() {
            self.first_sent_packet_time = Some(now);
        }
        self.consecutive_failures.remove(&view.ssrc);

        let account = view.kind != PacketKind::Audio || self.config.account_for_audio;
        if account {
            self.media_budget.use_budget(view.size_bytes);
            self.padding_budget.use_budget(view.size_bytes);
        }

        match view.kind {
            PacketKind::Padding => {
                self.stats.padding_packets_sent += 1;
                self.stats.padding_bytes_sent += view.size_bytes as u64;
            }
            PacketKind::Retransmission => {
                self.stats.packets_sent += 1;
                self.stats.bytes_sent += view.size_bytes as u64;
                self.stats.retransmissions_sent += 1;
            }
            _ => {
                self.stats.packets_sent += 1;
                self.stats.bytes_sent += view.size_bytes as u64;
            }
        }
    }

    /// Padding bytes to request once the queue has drained this tick.
    fn padding_to_add(&self, recommended_probe_size: Option<usize>, data_sent: usize) -> usize {
        if !self.queue.is_empty() {
            return 0;
        }
        if self.packet_counter == 0 {
            // Padding before any media confuses receive-side timestamp
            // tracking.
            return 0;
        }
        if let Some(probe_size) = recommended_probe_size {
            return probe_size.saturating_sub(data_sent);
        }
        self.padding_budget.bytes_remaining()
    }

    fn emit_status(&self, status: PacerStatus) {
        if let Some(tx) = &self.status_tx {
            let _ = tx.send(status);
        }
    }
}

/// Priority class per packet kind: audio first (when prioritized),
/// retransmissions before new media, FEC alongside video, padding last.
fn priority_for_kind(kind: PacketKind, prioritize_audio: bool) -> u8 {
    match kind {
        PacketKind::Audio if prioritize_audio => 0,
        PacketKind::Retransmission => 1,
        PacketKind::Audio | PacketKind::Video | PacketKind::ForwardErrorCorrection => 2,
        PacketKind::Padding => 3,
    }
}
