//! Leaky-bucket byte budgets.
//!
//! A budget accrues bytes at its target rate as time passes and is drained
//! as packets go out. The balance is capped to one window's worth of bytes
//! in both directions: overuse is repaid before new sends, underuse builds
//! up only when explicitly allowed.

use std::time::Duration;

/// How much accrued credit (or debt) a budget may hold.
const WINDOW: Duration = Duration::from_millis(500);

/// Byte budget replenished at a target bitrate.
#[derive(Debug, Clone)]
pub struct IntervalBudget {
    target_rate_bps: u64,
    max_bytes_in_budget: i64,
    bytes_remaining: i64,
    can_build_up_underuse: bool,
}

impl IntervalBudget {
    pub fn new(target_rate_bps: u64, can_build_up_underuse: bool) -> Self {
        let mut budget = IntervalBudget {
            target_rate_bps: 0,
            max_bytes_in_budget: 0,
            bytes_remaining: 0,
            can_build_up_underuse,
        };
        budget.set_target_rate_bps(target_rate_bps);
        budget
    }

    /// Change the target rate. The current balance is clamped into the new
    /// window so a rate drop cannot leave a stale burst allowance behind.
    pub fn set_target_rate_bps(&mut self, target_rate_bps: u64) {
        self.target_rate_bps = target_rate_bps;
        self.max_bytes_in_budget =
            (target_rate_bps as i64).saturating_mul(WINDOW.as_millis() as i64) / 8_000;
        self.bytes_remaining = self
            .bytes_remaining
            .clamp(-self.max_bytes_in_budget, self.max_bytes_in_budget);
    }

    /// Accrue credit for `elapsed` time at the target rate.
    pub fn increase_budget(&mut self, elapsed: Duration) {
        let bytes = (self.target_rate_bps as i128 * elapsed.as_micros() as i128 / 8_000_000) as i64;
        if self.bytes_remaining < 0 || self.can_build_up_underuse {
            // Repay debt first; accumulated underuse may carry over.
            self.bytes_remaining = (self.bytes_remaining + bytes).min(self.max_bytes_in_budget);
        } else {
            // Underuse does not accumulate: the fresh interval replaces
            // whatever credit was left unspent.
            self.bytes_remaining = bytes.min(self.max_bytes_in_budget);
        }
    }

    /// Spend budget for bytes put on the wire. May drive the balance
    /// negative (overuse), down to minus one window.
    pub fn use_budget(&mut self, bytes: usize) {
        self.bytes_remaining =
            (self.bytes_remaining - bytes as i64).max(-self.max_bytes_in_budget);
    }

    /// Spendable bytes right now. Zero while repaying overuse.
    pub fn bytes_remaining(&self) -> usize {
        self.bytes_remaining.max(0) as usize
    }

    pub fn target_rate_bps(&self) -> u64 {
        self.target_rate_bps
    }
}
