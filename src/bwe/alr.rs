use std::time::Instant;

use crate::pacer::IntervalBudget;
use crate::rtp::{Bitrate, DataSize};

/// Fraction of the estimate we expect to be sending when not limited.
const BANDWIDTH_USAGE_RATIO: f64 = 0.65;

/// Budget level above which we declare ALR (sustained low usage).
const START_BUDGET_LEVEL: i32 = 80;

/// Budget level below which we leave ALR (usage picked back up).
const STOP_BUDGET_LEVEL: i32 = 50;

/// Application Limited Region detector.
///
/// The encoder is application limited when it sends well below what the
/// estimate allows (muted video, static scene, screen share idle). An
/// [`IntervalBudget`] at 65% of the estimate smooths bursty encoder output
/// over its 500 ms window; sustained underuse accumulates credit and flips
/// the state, with hysteresis between the enter and exit levels.
#[derive(Debug)]
pub(crate) struct AlrDetector {
    budget: IntervalBudget,
    alr_started_at: Option<Instant>,
    last_send_time: Option<Instant>,
}

impl AlrDetector {
    pub(crate) fn new() -> Self {
        AlrDetector {
            // Underuse credit must build up for detection to work.
            budget: IntervalBudget::new(Bitrate::ZERO, true),
            alr_started_at: None,
            last_send_time: None,
        }
    }

    /// Account bytes put on the wire (media only, not padding or probes).
    pub(crate) fn on_bytes_sent(&mut self, bytes: DataSize, now: Instant) {
        let Some(last) = self.last_send_time else {
            self.last_send_time = Some(now);
            return;
        };

        let elapsed = now.saturating_duration_since(last);
        self.last_send_time = Some(now);

        self.budget.use_budget(bytes);
        self.budget.increase_budget(elapsed);

        let level = self.budget.level_percent();
        match self.alr_started_at {
            None if level > START_BUDGET_LEVEL => {
                self.alr_started_at = Some(now);
                debug!("AlrDetector: entered ALR (budget level {level}%)");
            }
            Some(_) if level < STOP_BUDGET_LEVEL => {
                self.alr_started_at = None;
                debug!("AlrDetector: left ALR (budget level {level}%)");
            }
            _ => {}
        }
    }

    pub(crate) fn set_estimated_bitrate(&mut self, estimate: Bitrate) {
        self.budget
            .set_target_rate(estimate * BANDWIDTH_USAGE_RATIO);
    }

    /// When ALR started, if currently application limited.
    pub(crate) fn alr_start_time(&self) -> Option<Instant> {
        self.alr_started_at
    }
}
