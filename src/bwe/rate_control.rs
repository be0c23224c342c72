use std::fmt;
use std::time::{Duration, Instant};

use crate::rtp::Bitrate;

use super::BandwidthUsage;

/// Smoothing for the moving average of observed bitrates while decreasing.
const OBSERVED_BITRATE_SMOOTHING: f64 = 0.95;

/// Multiplicative decrease factor applied to the acknowledged rate.
const BETA: f64 = 0.85;

/// Multiplicative increase per second while far from convergence.
const MULTIPLICATIVE_INCREASE_COEF: f64 = 1.08;

/// The estimate may not exceed this ratio of the observed bitrate.
const MAX_ESTIMATE_RATIO: f64 = 1.5;

/// Minimum spacing between two multiplicative decreases, plus one RTT.
const DECREASE_INTERVAL: Duration = Duration::from_millis(200);

/// Additive-increase / multiplicative-decrease rate controller.
///
/// Driven by the delay detector state: overuse decreases the estimate to a
/// fraction of the acknowledged rate, sustained normal operation increases
/// it (multiplicatively while far from the last decrease, additively once
/// near), underuse holds.
pub(super) struct RateControl {
    state: State,

    estimated_bitrate: Bitrate,
    min_bitrate: Bitrate,
    max_bitrate: Bitrate,

    /// The last observed (acknowledged) bitrate from feedback.
    last_observed_bitrate: Option<Bitrate>,
    /// Average observed bitrate around decreases, for convergence checks.
    averaged_observed_bitrate: MovingAverage,

    last_estimate_update: Option<Instant>,
    /// When the estimate was last decreased. Decreases are spaced at least
    /// `DECREASE_INTERVAL + rtt` apart to let feedback catch up.
    last_decrease: Option<Instant>,
    last_rtt: Option<Duration>,
}

impl RateControl {
    pub(super) fn new(start_bitrate: Bitrate, min_bitrate: Bitrate, max_bitrate: Bitrate) -> Self {
        log_rate_control_state!(State::Increase as i8);

        Self {
            state: State::Increase,
            estimated_bitrate: start_bitrate,
            min_bitrate,
            max_bitrate,
            last_observed_bitrate: None,
            averaged_observed_bitrate: MovingAverage::new(OBSERVED_BITRATE_SMOOTHING),
            last_estimate_update: None,
            last_decrease: None,
            last_rtt: None,
        }
    }

    /// Feed one detector signal with the currently observed bitrate.
    pub(super) fn update(
        &mut self,
        usage: BandwidthUsage,
        observed_bitrate: Bitrate,
        rtt: Option<Duration>,
        now: Instant,
    ) {
        self.last_observed_bitrate = Some(observed_bitrate);
        if let Some(rtt) = rtt {
            self.last_rtt = Some(rtt);
        }

        self.state = self.state.transition(usage);

        match self.state {
            State::Increase => self.increase(observed_bitrate, now),
            State::Decrease => self.decrease(observed_bitrate, now),
            State::Hold => {}
        }
    }

    pub(super) fn estimated_bitrate(&self) -> Bitrate {
        self.estimated_bitrate
    }

    /// Adopt an externally validated rate, e.g. a probe result.
    pub(super) fn set_estimate(&mut self, bitrate: Bitrate, now: Instant) {
        self.update_estimate(bitrate, now);
    }

    pub(super) fn set_bounds(&mut self, min: Bitrate, max: Bitrate) {
        self.min_bitrate = min;
        self.max_bitrate = max;
        self.estimated_bitrate = self.estimated_bitrate.clamp(min, max);
    }

    fn increase(&mut self, observed_bitrate: Bitrate, now: Instant) {
        let last_update = *self.last_estimate_update.get_or_insert(now);

        if self
            .averaged_observed_bitrate
            .upper_range(3.0)
            .map(|upper| observed_bitrate.as_f64() > upper)
            .unwrap_or(false)
        {
            // The link changed; old convergence statistics no longer apply.
            self.averaged_observed_bitrate.reset();
        }

        let since_last_update = now.saturating_duration_since(last_update);

        let mut new_estimate = if self.is_near_convergence() {
            log_rate_control_applied_change!("increase_additive");
            // Approach the previous trouble spot gently, roughly one packet
            // per response time.
            let response_time = self.last_rtt.unwrap_or(Duration::ZERO) + Duration::from_millis(100);
            let alpha =
                0.5 * (since_last_update.as_secs_f64() / response_time.as_secs_f64()).min(1.0);

            self.estimated_bitrate.as_f64() + (alpha * self.estimated_packet_size()).max(1000.0)
        } else {
            log_rate_control_applied_change!("increase_multiplicative");
            let eta = MULTIPLICATIVE_INCREASE_COEF.powf(since_last_update.as_secs_f64().min(1.0));
            let increase = ((eta - 1.0) * self.estimated_bitrate.as_f64()).max(1000.0);

            self.estimated_bitrate.as_f64() + increase
        };

        // Never run ahead of what the path demonstrably delivers.
        new_estimate = new_estimate.min(observed_bitrate.as_f64() * MAX_ESTIMATE_RATIO);

        self.update_estimate(new_estimate.into(), now);
    }

    fn decrease(&mut self, observed_bitrate: Bitrate, now: Instant) {
        // One decrease per 200 ms + RTT: the previous decrease has not had
        // a chance to show up in feedback yet.
        let spacing = DECREASE_INTERVAL + self.last_rtt.unwrap_or(Duration::ZERO);
        if let Some(last_decrease) = self.last_decrease {
            if now.saturating_duration_since(last_decrease) < spacing {
                self.state = State::Hold;
                return;
            }
        }

        log_rate_control_applied_change!("decrease");

        if self
            .averaged_observed_bitrate
            .lower_range(3.0)
            .map(|lower| observed_bitrate.as_f64() < lower)
            .unwrap_or(false)
        {
            self.averaged_observed_bitrate.reset();
        }

        let mut new_estimate = observed_bitrate * BETA;
        if self.estimated_bitrate < new_estimate {
            // Never increase on overuse.
            new_estimate = self.estimated_bitrate;
        }

        self.averaged_observed_bitrate.update(observed_bitrate.as_f64());
        self.last_decrease = Some(now);

        // Move to hold right away rather than waiting for the detector to
        // report underuse.
        self.state = State::Hold;
        log_rate_control_state!(self.state as i8);
        debug!("RateControl: decreased estimate, moving to hold");

        self.update_estimate(new_estimate, now);
    }

    fn is_near_convergence(&self) -> bool {
        if !self.averaged_observed_bitrate.valid() {
            return false;
        }
        let Some(last_observed) = self.last_observed_bitrate else {
            return false;
        };

        // Near convergence when the observed bitrate sits within 3 standard
        // deviations of where previous decreases happened.
        self.averaged_observed_bitrate
            .within_std(last_observed.as_f64(), 3.0)
    }

    fn update_estimate(&mut self, bitrate: Bitrate, now: Instant) {
        self.estimated_bitrate = bitrate.clamp(self.min_bitrate, self.max_bitrate);
        self.last_estimate_update = Some(now);
    }

    fn estimated_packet_size(&self) -> f64 {
        // Assume 30 fps video dominates the send rate.
        let bits_per_frame = self.estimated_bitrate.as_f64() / 30.0;
        let packets_per_frame = (bits_per_frame / (1200.0 * 8.0)).ceil().max(1.0);

        bits_per_frame / packets_per_frame
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum State {
    Increase = 1,
    Hold = 0,
    #[default]
    Decrease = -1,
}

impl State {
    fn transition(&self, usage: BandwidthUsage) -> Self {
        let new_state = match (self, usage) {
            (_, BandwidthUsage::Overuse) => Self::Decrease,
            (_, BandwidthUsage::Underuse) => Self::Hold,
            (Self::Decrease, BandwidthUsage::Normal) => Self::Hold,
            (Self::Hold | Self::Increase, BandwidthUsage::Normal) => Self::Increase,
        };

        if new_state != *self {
            log_rate_control_state!(new_state as i8);
            debug!("RateControl: {self} -> {new_state} on {usage}");
        }

        new_state
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Hold => write!(f, "hold"),
            State::Increase => write!(f, "increase"),
            State::Decrease => write!(f, "decrease"),
        }
    }
}

/// Exponentially weighted moving average with variance tracking.
#[derive(Debug)]
pub(super) struct MovingAverage {
    smoothing_factor: f64,
    average: Option<f64>,
    variance: f64,
    std: f64,
}

impl MovingAverage {
    pub(super) fn new(smoothing_factor: f64) -> Self {
        Self {
            smoothing_factor,
            average: None,
            variance: 0.0,
            std: 0.0,
        }
    }

    fn within_std(&self, value: f64, num_std: f64) -> bool {
        let Some(average) = self.average else {
            return false;
        };

        let floor = average - self.std * num_std;
        let ceil = average + self.std * num_std;

        floor <= value && value <= ceil
    }

    fn upper_range(&self, num_std: f64) -> Option<f64> {
        if self.std == 0.0 {
            return None;
        }
        self.average.map(|avg| avg + num_std * self.std)
    }

    fn lower_range(&self, num_std: f64) -> Option<f64> {
        if self.std == 0.0 {
            return None;
        }
        self.average.map(|avg| avg - num_std * self.std)
    }

    pub(super) fn update(&mut self, value: f64) {
        let average = match self.average {
            Some(average) => {
                let delta = value - average;
                let new_average = average + self.smoothing_factor * delta;
                let new_variance = (1.0 - self.smoothing_factor)
                    * (self.variance + self.smoothing_factor * delta.powi(2));

                self.variance = new_variance;
                self.std = new_variance.sqrt();

                new_average
            }
            None => value,
        };

        self.average = Some(average);
    }

    pub(super) fn average(&self) -> Option<f64> {
        self.average
    }

    fn valid(&self) -> bool {
        self.average.is_some()
    }

    fn reset(&mut self) {
        self.average = None;
        self.std = 0.0;
        self.variance = 0.0;
    }
}
