//! Round-robin packet queue.
//!
//! Holds every packet awaiting pacing and decides which one goes out next:
//! strictly by priority class across streams, byte-fair weighted round-robin
//! between streams of the same class. Each SSRC is a stream; a stream's
//! position within its priority class is its fairness clock — the bytes it
//! has released since scheduling began. The stream that has sent the least
//! goes first.
//!
//! Packets live in a slab arena; per-stream pending sets are min-heaps of
//! `(priority, enqueue_order)` entries holding arena handles, and the global
//! schedule is an ordered map keyed `(priority, accumulated_bytes, ssrc)`
//! containing exactly the streams with something to send. Selection and
//! rescheduling are O(log n).
//!
//! Popping is two-phase so the driver can inspect the head packet, hand it
//! to the transport, and only then commit — or put it back untouched if the
//! budget ran out or the send failed.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::time::Duration;

use bytes::Bytes;
use cadence_media::packet::{PacketKind, PacketToSend};
use quanta::Instant;
use slab::Slab;
use thiserror::Error;
use tracing::{error, trace};

/// SSRC 0 marks "unset" throughout the stack and is never a valid stream.
pub const RESERVED_SSRC: u32 = 0;

/// How far one stream's fairness clock may run ahead of the scheduled
/// minimum before the queue rebalances. Bounds the unfairness a stream can
/// build up while peers are quiet.
pub const DEFAULT_MAX_LEADING_BYTES: u64 = 1400;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("packet size must be non-zero")]
    ZeroSize,
    #[error("ssrc {0:#010x} is reserved")]
    ReservedSsrc(u32),
}

/// A packet admitted to the queue, wrapping the producer's record with
/// scheduling metadata.
#[derive(Debug, Clone)]
pub struct QueuedPacket {
    /// Priority class; lower value wins.
    pub priority: u8,
    /// On-wire size used for all byte accounting, transport overhead
    /// included when the caller accounts for it.
    pub size_bytes: usize,
    /// Admission time. Once admitted, the queue keeps this net of pause
    /// time so reported ages exclude paused intervals.
    pub enqueue_time: Instant,
    /// Monotonic tiebreaker within a stream and priority.
    pub enqueue_order: u64,
    pub packet: PacketToSend,
}

impl QueuedPacket {
    pub fn new(
        priority: u8,
        enqueue_time: Instant,
        enqueue_order: u64,
        packet: PacketToSend,
    ) -> Self {
        let size_bytes = packet.wire_size();
        QueuedPacket {
            priority,
            size_bytes,
            enqueue_time,
            enqueue_order,
            packet,
        }
    }

    /// Count additional per-packet overhead (UDP/IP headers and the like)
    /// toward this packet's size.
    pub fn with_transport_overhead(mut self, overhead_bytes: usize) -> Self {
        self.size_bytes += overhead_bytes;
        self
    }

    pub fn ssrc(&self) -> u32 {
        self.packet.ssrc
    }

    pub fn kind(&self) -> PacketKind {
        self.packet.kind
    }
}

/// Non-owning snapshot of the packet selected by [`RoundRobinPacketQueue::begin_pop`].
///
/// The payload is a reference-counted clone; the queue still owns the packet
/// until `finalize_pop`.
#[derive(Debug, Clone)]
pub struct PacketView {
    pub kind: PacketKind,
    pub ssrc: u32,
    pub sequence_number: u16,
    pub capture_time: Instant,
    pub size_bytes: usize,
    pub enqueue_order: u64,
    pub payload: Bytes,
}

/// Schedule position of a stream: priority class first, then fairness
/// clock, then SSRC as a deterministic tiebreaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct StreamKey {
    priority: u8,
    accumulated_bytes: u64,
    ssrc: u32,
}

/// Heap entry ordering a stream's pending packets by priority, then
/// admission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct PendingEntry {
    priority: u8,
    enqueue_order: u64,
    handle: usize,
}

#[derive(Debug)]
struct Stream {
    accumulated_bytes: u64,
    pending: BinaryHeap<Reverse<PendingEntry>>,
    /// Present iff the stream is currently in the schedule.
    schedule_key: Option<StreamKey>,
}

impl Stream {
    fn new() -> Self {
        Stream {
            accumulated_bytes: 0,
            pending: BinaryHeap::new(),
            schedule_key: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PopContext {
    ssrc: u32,
    handle: usize,
}

/// Multi-stream, priority-weighted, byte-fair packet scheduler.
#[derive(Debug)]
pub struct RoundRobinPacketQueue {
    packets: Slab<QueuedPacket>,
    /// Stream records persist after a stream drains so its fairness clock
    /// survives bursts.
    streams: HashMap<u32, Stream>,
    schedule: BTreeMap<StreamKey, u32>,
    /// Multiset of admitted packets' (pause-adjusted) enqueue times.
    enqueue_times: BTreeMap<Instant, usize>,
    size_packets: usize,
    size_bytes: usize,
    max_leading_bytes: u64,
    /// Time-integrated occupancy: Σ packets × wall time, pause excluded.
    queue_time_sum: Duration,
    pause_time_sum: Duration,
    time_last_updated: Instant,
    paused: bool,
    pop_context: Option<PopContext>,
}

impl RoundRobinPacketQueue {
    pub fn new(start_time: Instant) -> Self {
        RoundRobinPacketQueue {
            packets: Slab::new(),
            streams: HashMap::new(),
            schedule: BTreeMap::new(),
            enqueue_times: BTreeMap::new(),
            size_packets: 0,
            size_bytes: 0,
            max_leading_bytes: DEFAULT_MAX_LEADING_BYTES,
            queue_time_sum: Duration::ZERO,
            pause_time_sum: Duration::ZERO,
            time_last_updated: start_time,
            paused: false,
            pop_context: None,
        }
    }

    pub fn with_max_leading_bytes(mut self, max_leading_bytes: u64) -> Self {
        self.max_leading_bytes = max_leading_bytes;
        self
    }

    /// Admit a packet. The packet's stream is created on first use; if the
    /// packet outranks the stream's current schedule position, the stream
    /// is promoted.
    pub fn enqueue(&mut self, packet: QueuedPacket) -> Result<(), EnqueueError> {
        if packet.size_bytes == 0 {
            return Err(EnqueueError::ZeroSize);
        }
        let ssrc = packet.ssrc();
        if ssrc == RESERVED_SSRC {
            return Err(EnqueueError::ReservedSsrc(ssrc));
        }

        let priority = packet.priority;
        let order = packet.enqueue_order;
        let size = packet.size_bytes;

        // Advance the occupancy integral to the admission time, then store
        // the enqueue time net of pause so far: subtracting the pause total
        // again at pop leaves exactly the unpaused residence time.
        let admit_time = packet.enqueue_time.max(self.time_last_updated);
        self.update_queue_time(admit_time);
        let stored_time = admit_time - self.pause_time_sum;

        let mut packet = packet;
        packet.enqueue_time = stored_time;

        let min_scheduled = self.min_scheduled_accumulated();
        let max_leading = self.max_leading_bytes;

        let handle = self.packets.insert(packet);
        let stream = self.streams.entry(ssrc).or_insert_with(Stream::new);
        stream.pending.push(Reverse(PendingEntry {
            priority,
            enqueue_order: order,
            handle,
        }));

        match stream.schedule_key {
            Some(key) if priority < key.priority => {
                // A higher-priority packet promotes the whole stream.
                self.schedule.remove(&key);
                let new_key = StreamKey { priority, ..key };
                stream.schedule_key = Some(new_key);
                self.schedule.insert(new_key, ssrc);
            }
            Some(_) => {}
            None => {
                // A stream (re)entering the schedule is pinned near the
                // scheduled minimum: it gets no catch-up advantage over
                // live peers, and a clock left far ahead by a past
                // rebalance is pulled back within the leading bound.
                if let Some(min) = min_scheduled {
                    stream.accumulated_bytes = stream
                        .accumulated_bytes
                        .clamp(min, min.saturating_add(max_leading));
                }
                let key = StreamKey {
                    priority,
                    accumulated_bytes: stream.accumulated_bytes,
                    ssrc,
                };
                stream.schedule_key = Some(key);
                self.schedule.insert(key, ssrc);
            }
        }

        self.size_packets += 1;
        self.size_bytes += size;
        *self.enqueue_times.entry(stored_time).or_insert(0) += 1;
        trace!(ssrc, priority, size, "packet enqueued");
        Ok(())
    }

    /// Select the next packet without removing it. Returns `None` on an
    /// empty queue. Until `cancel_pop` or `finalize_pop` is called, no
    /// other `begin_pop` may run.
    pub fn begin_pop(&mut self) -> Option<PacketView> {
        if self.pop_context.is_some() {
            debug_assert!(false, "begin_pop while a pop is in progress");
            error!("begin_pop called while a pop is already in progress");
            return None;
        }
        let (_, &ssrc) = self.schedule.first_key_value()?;
        let stream = self.streams.get(&ssrc)?;
        let Some(&Reverse(entry)) = stream.pending.peek() else {
            debug_assert!(false, "scheduled stream has no pending packets");
            error!(ssrc, "scheduled stream has no pending packets");
            return None;
        };
        let packet = self.packets.get(entry.handle)?;

        self.pop_context = Some(PopContext {
            ssrc,
            handle: entry.handle,
        });
        Some(PacketView {
            kind: packet.packet.kind,
            ssrc: packet.packet.ssrc,
            sequence_number: packet.packet.sequence_number,
            capture_time: packet.packet.capture_time,
            size_bytes: packet.size_bytes,
            enqueue_order: packet.enqueue_order,
            payload: packet.packet.payload.clone(),
        })
    }

    /// Abandon the pop in progress; the next `begin_pop` yields the same
    /// packet again.
    pub fn cancel_pop(&mut self) {
        if self.pop_context.take().is_none() {
            debug_assert!(false, "cancel_pop without begin_pop");
            error!("cancel_pop called without a preceding begin_pop");
        }
    }

    /// Commit the pop in progress: the packet leaves the queue, its bytes
    /// advance the stream's fairness clock, and the stream is rescheduled
    /// if it still has packets.
    pub fn finalize_pop(&mut self) {
        let Some(ctx) = self.pop_context.take() else {
            debug_assert!(false, "finalize_pop without begin_pop");
            error!("finalize_pop called without a preceding begin_pop");
            return;
        };
        let Some(stream) = self.streams.get_mut(&ctx.ssrc) else {
            error!(ssrc = ctx.ssrc, "finalize_pop for unknown stream");
            return;
        };
        let Some(Reverse(entry)) = stream.pending.pop() else {
            error!(ssrc = ctx.ssrc, "finalize_pop on empty stream");
            return;
        };
        debug_assert_eq!(entry.handle, ctx.handle, "pop target changed mid-pop");
        let Some(packet) = self.packets.try_remove(entry.handle) else {
            error!(ssrc = ctx.ssrc, "finalize_pop lost its packet");
            return;
        };

        if let Some(count) = self.enqueue_times.get_mut(&packet.enqueue_time) {
            *count -= 1;
            if *count == 0 {
                self.enqueue_times.remove(&packet.enqueue_time);
            }
        } else {
            debug_assert!(false, "popped packet missing from enqueue-time multiset");
        }

        // Residence time net of pause; the stored enqueue time already
        // excludes pause accumulated before admission.
        let resident = self.time_last_updated.duration_since(packet.enqueue_time);
        self.queue_time_sum = self
            .queue_time_sum
            .saturating_sub(resident.saturating_sub(self.pause_time_sum));

        self.size_packets -= 1;
        self.size_bytes -= packet.size_bytes;

        if let Some(key) = stream.schedule_key.take() {
            self.schedule.remove(&key);
        } else {
            debug_assert!(false, "popped stream had no schedule entry");
        }
        stream.accumulated_bytes += packet.size_bytes as u64;
        if let Some(&Reverse(next)) = stream.pending.peek() {
            let key = StreamKey {
                priority: next.priority,
                accumulated_bytes: stream.accumulated_bytes,
                ssrc: ctx.ssrc,
            };
            stream.schedule_key = Some(key);
            self.schedule.insert(key, ctx.ssrc);
        }

        let accumulated = self
            .streams
            .get(&ctx.ssrc)
            .map(|s| s.accumulated_bytes)
            .unwrap_or(0);
        if let Some(min) = self.min_scheduled_accumulated() {
            let limit = min.saturating_add(self.max_leading_bytes);
            if accumulated > limit {
                self.shift_accumulated(accumulated - limit);
            }
        }
    }

    /// Freeze or unfreeze the queue. While paused, packet ages and the
    /// occupancy integral stop growing.
    pub fn set_pause_state(&mut self, paused: bool, now: Instant) {
        if self.paused == paused {
            return;
        }
        self.update_queue_time(now);
        self.paused = paused;
    }

    /// Advance the occupancy integral. The driver calls this every tick.
    pub fn update_queue_time(&mut self, now: Instant) {
        if now <= self.time_last_updated {
            return;
        }
        let delta = now.duration_since(self.time_last_updated);
        if self.paused {
            self.pause_time_sum += delta;
        } else if self.size_packets > 0 {
            self.queue_time_sum += delta * self.size_packets as u32;
        }
        self.time_last_updated = now;
    }

    /// Effective enqueue time of the oldest packet, pause time excluded —
    /// `now - oldest_enqueue_time()` is the head packet's unpaused age.
    pub fn oldest_enqueue_time(&self) -> Option<Instant> {
        self.enqueue_times
            .keys()
            .next()
            .map(|&t| t + self.pause_time_sum)
    }

    /// Mean unpaused residence time of the packets currently queued.
    pub fn average_queue_time(&self, now: Instant) -> Duration {
        if self.size_packets == 0 {
            return Duration::ZERO;
        }
        let mut sum = self.queue_time_sum;
        if !self.paused && now > self.time_last_updated {
            sum += now.duration_since(self.time_last_updated) * self.size_packets as u32;
        }
        sum / self.size_packets as u32
    }

    pub fn size_in_packets(&self) -> usize {
        self.size_packets
    }

    pub fn size_in_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.size_packets == 0
    }

    fn min_scheduled_accumulated(&self) -> Option<u64> {
        self.schedule.keys().map(|k| k.accumulated_bytes).min()
    }

    /// Pull every stream's fairness clock back by `shift` bytes and re-key
    /// the schedule. Keeps the clocks bounded when one stream runs far
    /// ahead of its peers.
    fn shift_accumulated(&mut self, shift: u64) {
        trace!(shift, "rebalancing stream fairness clocks");
        for stream in self.streams.values_mut() {
            stream.accumulated_bytes = stream.accumulated_bytes.saturating_sub(shift);
        }
        let entries: Vec<(StreamKey, u32)> =
            std::mem::take(&mut self.schedule).into_iter().collect();
        for (key, ssrc) in entries {
            let accumulated = self
                .streams
                .get(&ssrc)
                .map(|s| s.accumulated_bytes)
                .unwrap_or(key.accumulated_bytes);
            let new_key = StreamKey {
                accumulated_bytes: accumulated,
                ..key
            };
            if let Some(stream) = self.streams.get_mut(&ssrc) {
                stream.schedule_key = Some(new_key);
            }
            self.schedule.insert(new_key, ssrc);
        }
    }
}
