use std::time::Duration;

use crate::rtp::{Bitrate, DataSize};

/// Leaky bucket budget tracker over a fixed time window.
///
/// The pacer grants itself `target_rate * elapsed` bytes of budget per
/// process tick and charges every emitted byte against it. The 500 ms
/// window caps how much history we credit so that a long silence cannot
/// produce an instantaneous burst.
#[derive(Debug, Clone)]
pub struct IntervalBudget {
    target_rate: Bitrate,
    max_bytes_in_budget: DataSize,
    /// Bytes remaining. Negative values are debt from over-spending.
    bytes_remaining: DataSize,
    /// Whether underuse may accumulate as credit across intervals.
    can_build_up_underuse: bool,
}

impl IntervalBudget {
    /// Window bounding both credit and debt.
    const WINDOW: Duration = Duration::from_millis(500);

    pub fn new(target_rate: Bitrate, can_build_up_underuse: bool) -> Self {
        Self {
            target_rate,
            max_bytes_in_budget: target_rate * Self::WINDOW,
            bytes_remaining: DataSize::ZERO,
            can_build_up_underuse,
        }
    }

    /// Update the target rate, clamping any accumulated credit or debt into
    /// the new window.
    pub fn set_target_rate(&mut self, target_rate: Bitrate) {
        self.target_rate = target_rate;
        self.max_bytes_in_budget = target_rate * Self::WINDOW;
        self.bytes_remaining = self
            .bytes_remaining
            .clamp(-self.max_bytes_in_budget, self.max_bytes_in_budget);
    }

    pub fn target_rate(&self) -> Bitrate {
        self.target_rate
    }

    /// Grant budget for elapsed time.
    ///
    /// If the previous interval over-spent (debt) the new credit first pays
    /// that back. Credit from underuse only carries over when
    /// `can_build_up_underuse` is set; otherwise each interval starts from
    /// its own allotment.
    pub fn increase_budget(&mut self, elapsed: Duration) {
        let granted = self.target_rate * elapsed;

        if self.bytes_remaining < DataSize::ZERO || self.can_build_up_underuse {
            self.bytes_remaining = (self.bytes_remaining + granted).min(self.max_bytes_in_budget);
        } else {
            self.bytes_remaining = granted.min(self.max_bytes_in_budget);
        }
    }

    /// Charge sent bytes against the budget. May go into debt, bounded by
    /// the window.
    pub fn use_budget(&mut self, bytes: DataSize) {
        self.bytes_remaining = (self.bytes_remaining - bytes).max(-self.max_bytes_in_budget);
    }

    /// Bytes that can be spent right now. Never negative.
    pub fn bytes_remaining(&self) -> DataSize {
        self.bytes_remaining.max(DataSize::ZERO)
    }

    /// Fill level of the budget in percent of the window. Negative when in
    /// debt.
    pub fn level_percent(&self) -> i32 {
        let max = self.max_bytes_in_budget.as_bytes_i64();
        if max == 0 {
            return 0;
        }

        (self.bytes_remaining.as_bytes_i64() * 100 / max) as i32
    }
}
