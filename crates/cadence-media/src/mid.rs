//! MID header-extension suppression tracking.
//!
//! A remote peer cannot demultiplex an SSRC it has never seen, so outgoing
//! packets must carry the MID extension until the peer proves it can map the
//! SSRC — by naming it in an RTCP report block. From that point the extension
//! is dead weight on every packet and is suppressed. Assigning a new SSRC
//! restarts the cycle.
//!
//! One tracker instance exists per RTP sender.

use tracing::debug;

/// Whether the sender is currently attaching the MID extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MidState {
    /// No SSRC assigned yet, or the peer has acknowledged the current one.
    Dormant,
    /// The current SSRC has not been acknowledged; MID must be sent.
    Sending,
}

/// Per-sender MID suppression state machine.
#[derive(Debug, Clone)]
pub struct MidTracker {
    /// The MID value attached while sending. Immutable for the lifetime of
    /// the tracker.
    mid: String,
    /// SSRC currently in use by this sender's stream.
    ssrc: Option<u32>,
    state: MidState,
}

impl MidTracker {
    /// Create a dormant tracker for the given MID value.
    pub fn new(mid: impl Into<String>) -> Self {
        MidTracker {
            mid: mid.into(),
            ssrc: None,
            state: MidState::Dormant,
        }
    }

    /// The MID value this tracker attaches.
    pub fn mid(&self) -> &str {
        &self.mid
    }

    /// SSRC currently associated with the sender, if any.
    pub fn ssrc(&self) -> Option<u32> {
        self.ssrc
    }

    /// Assign the sender's SSRC. Always re-arms MID emission: even if the
    /// SSRC value is unchanged, the caller signalled a (re)binding and the
    /// extension must be attached until the peer acknowledges it again.
    pub fn set_ssrc(&mut self, ssrc: u32) {
        self.ssrc = Some(ssrc);
        if self.state != MidState::Sending {
            debug!(mid = %self.mid, ssrc, "mid emission armed");
        }
        self.state = MidState::Sending;
    }

    /// Feed the source SSRCs of incoming RTCP report blocks. A block naming
    /// the current SSRC proves the peer can demultiplex it, so the MID
    /// extension is suppressed from here on. Unknown SSRCs are ignored.
    pub fn on_report_blocks(&mut self, source_ssrcs: &[u32]) {
        if self.state != MidState::Sending {
            return;
        }
        let Some(current) = self.ssrc else {
            return;
        };
        if source_ssrcs.contains(&current) {
            debug!(mid = %self.mid, ssrc = current, "mid acknowledged, suppressing");
            self.state = MidState::Dormant;
        }
    }

    /// Whether the MID extension must be attached to outgoing packets.
    pub fn send_mid(&self) -> bool {
        self.state == MidState::Sending
    }
}
