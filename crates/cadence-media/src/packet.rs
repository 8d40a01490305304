//! Packet classification and the owning record producers hand to the pacer.
//!
//! A [`PacketToSend`] carries a fully serialized RTP packet plus the minimal
//! metadata the scheduler needs. Payloads are `bytes::Bytes`, so clones taken
//! across the pacer's two-phase pop are reference-counted, not copied.

use bytes::Bytes;
use quanta::Instant;

/// Classification of an RTP packet awaiting transmission.
///
/// The scheduler maps each kind to a priority class: audio above
/// retransmissions, retransmissions above new media, padding last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    /// Encoded audio. May be prioritized above all other classes.
    Audio,
    /// Fresh encoded video.
    Video,
    /// Retransmitted media. Sent before new media so the receiver can
    /// repair as early as possible.
    Retransmission,
    /// Forward error correction. Paced alongside video; FEC that arrives
    /// late has a lower chance of being useful.
    ForwardErrorCorrection,
    /// Filler traffic, only sent to keep bandwidth estimation alive.
    Padding,
}

impl PacketKind {
    /// Whether this packet repeats media already sent once.
    pub fn is_retransmission(self) -> bool {
        matches!(self, PacketKind::Retransmission)
    }
}

/// A serialized RTP packet submitted to the pacer by a producer.
#[derive(Debug, Clone)]
pub struct PacketToSend {
    /// Packet classification, drives the priority class.
    pub kind: PacketKind,
    /// RTP synchronization source. Partitions packets into streams.
    pub ssrc: u32,
    /// Per-stream RTP sequence number, assigned by the producer.
    pub sequence_number: u16,
    /// Monotonic time the frame was captured.
    pub capture_time: Instant,
    /// Serialized packet, RTP header included.
    pub payload: Bytes,
}

impl PacketToSend {
    pub fn new(
        kind: PacketKind,
        ssrc: u32,
        sequence_number: u16,
        capture_time: Instant,
        payload: Bytes,
    ) -> Self {
        PacketToSend {
            kind,
            ssrc,
            sequence_number,
            capture_time,
            payload,
        }
    }

    /// On-wire size of the serialized packet in bytes.
    pub fn wire_size(&self) -> usize {
        self.payload.len()
    }
}
