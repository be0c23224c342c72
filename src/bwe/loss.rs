use std::time::{Duration, Instant};

use crate::rtp::Bitrate;

/// Below 2% loss the estimate ramps up.
const LOW_LOSS_THRESHOLD: f64 = 0.02;

/// Above 10% loss the estimate backs off.
const HIGH_LOSS_THRESHOLD: f64 = 0.10;

/// Multiplier applied on low loss.
const INCREASE_FACTOR: f64 = 1.08;

/// Faster multiplier used before the first feedback arrives.
const STARTUP_INCREASE_FACTOR: f64 = 1.5;

/// The loss-based estimate never backs off below this.
const DECREASE_FLOOR: Bitrate = Bitrate::kbps(50);

/// Floor for the interval between consecutive increases.
const MIN_INCREASE_INTERVAL: Duration = Duration::from_secs(1);

/// Loss-based bandwidth estimation.
///
/// Packet loss reports move the estimate in coarse steps: negligible loss
/// permits growth, moderate loss holds, and heavy loss cuts the rate in
/// proportion to the loss fraction. The delay-based estimate caps growth,
/// so this controller only rules when losses say less than delay does.
pub(super) struct LossController {
    estimate: Bitrate,
    min_bitrate: Bitrate,
    max_bitrate: Bitrate,

    /// Cap from the delay-based estimator. Also marks the end of the
    /// startup phase: until the first cap arrives we ramp faster.
    delay_based_cap: Option<Bitrate>,

    last_increase: Option<Instant>,
    last_fraction_loss: f64,

    /// Whether the faster startup ramp is enabled at all.
    startup_ramp: bool,
}

impl LossController {
    pub(super) fn new(
        initial_bitrate: Bitrate,
        min_bitrate: Bitrate,
        max_bitrate: Bitrate,
        startup_ramp: bool,
    ) -> Self {
        LossController {
            estimate: initial_bitrate,
            min_bitrate,
            max_bitrate,
            delay_based_cap: None,
            last_increase: None,
            last_fraction_loss: 0.0,
            startup_ramp,
        }
    }

    /// Feed a loss report. `fraction_loss` is in `[0, 1]`; RTT stretches
    /// the interval between increases.
    pub(super) fn update(&mut self, fraction_loss: f64, rtt: Option<Duration>, now: Instant) {
        let fraction_loss = fraction_loss.clamp(0.0, 1.0);
        self.last_fraction_loss = fraction_loss;
        log_loss!(fraction_loss);

        if fraction_loss < LOW_LOSS_THRESHOLD {
            self.maybe_increase(rtt, now);
        } else if fraction_loss > HIGH_LOSS_THRESHOLD {
            // target * (1 - 0.5 * loss), floored.
            let decreased = self.estimate * (1.0 - 0.5 * fraction_loss);
            self.estimate = decreased.max(DECREASE_FLOOR);
            self.clamp();
            log_loss_based_estimate!(self.estimate.as_f64());
            debug!(
                "LossController: backing off to {} on {:.1}% loss",
                self.estimate,
                fraction_loss * 100.0
            );
        }
        // Between the thresholds: hold.
    }

    /// The delay-based estimate acts as a safety cap on growth.
    pub(super) fn set_delay_based_cap(&mut self, cap: Bitrate) {
        self.delay_based_cap = Some(cap);
    }

    /// Adopt an externally validated rate (startup alignment, probes).
    pub(super) fn set_estimate(&mut self, bitrate: Bitrate) {
        self.estimate = bitrate;
        self.clamp();
    }

    pub(super) fn set_bounds(&mut self, min: Bitrate, max: Bitrate) {
        self.min_bitrate = min;
        self.max_bitrate = max;
        self.clamp();
    }

    pub(super) fn estimate(&self) -> Bitrate {
        self.estimate
    }

    pub(super) fn last_fraction_loss(&self) -> f64 {
        self.last_fraction_loss
    }

    fn maybe_increase(&mut self, rtt: Option<Duration>, now: Instant) {
        // Increases are spaced at least a second apart, more on slow paths.
        let interval = MIN_INCREASE_INTERVAL.max(rtt.unwrap_or(Duration::ZERO) * 2);
        if let Some(last) = self.last_increase {
            if now.saturating_duration_since(last) < interval {
                return;
            }
        }

        let factor = if self.startup_ramp && self.delay_based_cap.is_none() {
            // No feedback yet: probe upward aggressively.
            STARTUP_INCREASE_FACTOR
        } else {
            INCREASE_FACTOR
        };

        let mut increased = self.estimate * factor;
        if let Some(cap) = self.delay_based_cap {
            increased = increased.min(cap);
        }
        // Growth only; the cap must not pull an already higher estimate
        // down here (the combiner takes the min anyway).
        self.estimate = self.estimate.max(increased);
        self.clamp();

        self.last_increase = Some(now);
        log_loss_based_estimate!(self.estimate.as_f64());
    }

    fn clamp(&mut self) {
        self.estimate = self.estimate.clamp(self.min_bitrate, self.max_bitrate);
    }
}
