//! Property-based tests for the round-robin packet queue.
//!
//! A mirror model tracks every admitted packet; after each operation the
//! queue's aggregate counters, oldest-age bookkeeping, and pop ordering
//! rules (priority dominance, per-stream FIFO) are checked against it.

use std::time::Duration;

use bytes::Bytes;
use cadence_media::packet::{PacketKind, PacketToSend};
use cadence_pacing::queue::{QueuedPacket, RoundRobinPacketQueue};
use proptest::prelude::*;
use quanta::Instant;

const SSRCS: [u32; 4] = [1111, 2222, 3333, 4444];
const KINDS: [(PacketKind, u8); 5] = [
    (PacketKind::Audio, 0),
    (PacketKind::Retransmission, 1),
    (PacketKind::Video, 2),
    (PacketKind::ForwardErrorCorrection, 2),
    (PacketKind::Padding, 3),
];

#[derive(Debug, Clone)]
enum Op {
    Enqueue {
        ssrc_index: usize,
        kind_index: usize,
        size: usize,
    },
    Pop,
    CancelledPop,
    Advance {
        ms: u64,
    },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0usize..SSRCS.len(), 0usize..KINDS.len(), 1usize..1500).prop_map(
            |(ssrc_index, kind_index, size)| Op::Enqueue { ssrc_index, kind_index, size }
        ),
        3 => Just(Op::Pop),
        1 => Just(Op::CancelledPop),
        1 => (1u64..20).prop_map(|ms| Op::Advance { ms }),
    ]
}

#[derive(Debug)]
struct MirrorPacket {
    ssrc: u32,
    priority: u8,
    order: u64,
    size: usize,
    enqueue_time: Instant,
}

proptest! {
    #[test]
    fn queue_invariants_hold(ops in prop::collection::vec(op_strategy(), 1..80)) {
        let base = Instant::now();
        let mut now = base;
        let mut queue = RoundRobinPacketQueue::new(base);
        let mut mirror: Vec<MirrorPacket> = Vec::new();
        let mut next_order = 0u64;

        for op in ops {
            match op {
                Op::Enqueue { ssrc_index, kind_index, size } => {
                    let ssrc = SSRCS[ssrc_index];
                    let (kind, priority) = KINDS[kind_index];
                    let order = next_order;
                    next_order += 1;
                    let packet = QueuedPacket::new(
                        priority,
                        now,
                        order,
                        PacketToSend::new(kind, ssrc, order as u16, now, Bytes::from(vec![0u8; size])),
                    );
                    queue.enqueue(packet).unwrap();
                    mirror.push(MirrorPacket { ssrc, priority, order, size, enqueue_time: now });
                }
                Op::Pop => {
                    let view = queue.begin_pop();
                    prop_assert_eq!(view.is_some(), !mirror.is_empty());
                    if let Some(view) = view {
                        queue.finalize_pop();
                        let position = mirror
                            .iter()
                            .position(|p| p.order == view.enqueue_order)
                            .expect("popped packet must exist in the mirror");
                        let popped = mirror.remove(position);
                        prop_assert_eq!(popped.ssrc, view.ssrc);
                        prop_assert_eq!(popped.size, view.size_bytes);

                        // Priority dominance: nothing of a strictly better
                        // class may remain queued.
                        if let Some(best_queued) = mirror.iter().map(|p| p.priority).min() {
                            prop_assert!(popped.priority <= best_queued);
                        }
                        // Per-stream FIFO: within (ssrc, priority), pops
                        // follow admission order.
                        let overtaken = mirror.iter().any(|p| {
                            p.ssrc == popped.ssrc
                                && p.priority == popped.priority
                                && p.order < popped.order
                        });
                        prop_assert!(!overtaken, "pop overtook an older same-class packet");
                    }
                }
                Op::CancelledPop => {
                    let before_packets = queue.size_in_packets();
                    if let Some(first) = queue.begin_pop() {
                        queue.cancel_pop();
                        prop_assert_eq!(queue.size_in_packets(), before_packets);
                        // The cancelled pop must be repeatable.
                        let again = queue.begin_pop().expect("packet must still be there");
                        queue.cancel_pop();
                        prop_assert_eq!(first.enqueue_order, again.enqueue_order);
                    }
                }
                Op::Advance { ms } => {
                    now += Duration::from_millis(ms);
                    queue.update_queue_time(now);
                }
            }

            // Aggregate counters match the mirror after every operation.
            prop_assert_eq!(queue.size_in_packets(), mirror.len());
            prop_assert_eq!(
                queue.size_in_bytes(),
                mirror.iter().map(|p| p.size).sum::<usize>()
            );
            prop_assert_eq!(queue.is_empty(), mirror.is_empty());

            // Oldest-packet bookkeeping matches the true minimum (no pause
            // in this scenario, so reported and real times coincide).
            let expected_oldest = mirror.iter().map(|p| p.enqueue_time).min();
            prop_assert_eq!(queue.oldest_enqueue_time(), expected_oldest);
        }

        // Drain completely: every remaining packet comes out, honoring
        // priority dominance to the last one.
        while let Some(view) = queue.begin_pop() {
            queue.finalize_pop();
            let position = mirror
                .iter()
                .position(|p| p.order == view.enqueue_order)
                .expect("popped packet must exist in the mirror");
            let popped = mirror.remove(position);
            if let Some(best_queued) = mirror.iter().map(|p| p.priority).min() {
                prop_assert!(popped.priority <= best_queued);
            }
        }
        prop_assert!(mirror.is_empty());
        prop_assert_eq!(queue.size_in_bytes(), 0);
    }
}
