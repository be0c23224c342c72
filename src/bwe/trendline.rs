use std::collections::VecDeque;
use std::time::Instant;

use crate::config::Config;

use super::arrival_group::InterGroupDelta;
use super::BandwidthUsage;

/// Exponential smoothing factor for the accumulated delay.
const SMOOTHING_COEF: f64 = 0.9;

/// Starting value for the adaptive threshold, in milliseconds.
const THRESHOLD_DEFAULT_MS: f64 = 12.5;

/// Threshold clamp bounds.
const THRESHOLD_RANGE_MS: (f64, f64) = (6.0, 600.0);

/// Samples further above the threshold than this do not adapt it; a sudden
/// capacity drop would otherwise drag the threshold up with it.
const MAX_ADAPT_OFFSET_MS: f64 = 15.0;

/// The modified trend scales with the sample count, capped here.
const DELAY_COUNT_CAP: usize = 60;

/// Upper bound kept on the sample counter to avoid overflow concerns.
const DELAY_COUNT_MAX: usize = 1000;

/// Detects overuse from the slope of the accumulated inter-group delay.
///
/// Each completed packet group contributes `arrival_delta - send_delta` to
/// an accumulated delay; the least-squares slope of the smoothed
/// accumulation over arrival time is the "trend". A rising trend sustained
/// past an adaptive threshold means queues are building: overuse.
pub(super) struct TrendlineEstimator {
    /// Number of samples in the sliding window.
    window_size: usize,

    /// Gain applied to the trend before comparing against the threshold.
    threshold_gain: f64,

    /// Adaptive threshold coefficients (rise slowly, fall faster).
    k_up: f64,
    k_down: f64,

    /// Accumulated time over threshold required to signal overuse, in ms.
    overuse_time_threshold_ms: f64,

    /// The first remote arrival, used as the time zero point.
    zero_time: Option<Instant>,

    /// Window of (arrival time, smoothed delay) samples.
    history: VecDeque<Timing>,

    /// Total delay variations seen, capped at `DELAY_COUNT_MAX`.
    num_deltas: usize,

    accumulated_delay: f64,
    smoothed_delay: f64,

    /// The adaptive delay threshold in milliseconds.
    threshold: f64,

    previous_trend: f64,

    /// Tracking of a tentative overuse episode.
    overuse: Option<Overuse>,

    last_threshold_update: Option<Instant>,

    hypothesis: BandwidthUsage,
}

#[derive(Debug)]
struct Timing {
    /// Remote arrival relative to `zero_time`, in ms.
    remote_recv_time_ms: f64,
    smoothed_delay_ms: f64,
}

struct Overuse {
    count: usize,
    time_overusing_ms: f64,
}

impl TrendlineEstimator {
    pub(super) fn new(config: &Config) -> Self {
        Self {
            window_size: config.trendline_window,
            threshold_gain: config.threshold_gain,
            k_up: config.threshold_up,
            k_down: config.threshold_down,
            overuse_time_threshold_ms: config.overuse_time_threshold.as_secs_f64() * 1000.0,
            zero_time: None,
            history: VecDeque::default(),
            num_deltas: 0,
            accumulated_delay: 0.0,
            smoothed_delay: 0.0,
            threshold: THRESHOLD_DEFAULT_MS,
            previous_trend: 0.0,
            overuse: None,
            last_threshold_update: None,
            hypothesis: BandwidthUsage::Normal,
        }
    }

    pub(super) fn add_delay_observation(&mut self, delta: InterGroupDelta, now: Instant) {
        self.add_to_history(delta, now);
        while self.history.len() > self.window_size {
            self.history.pop_front();
        }

        if self.history.len() == self.window_size {
            self.update_trendline(delta, now);
        }
    }

    pub(super) fn hypothesis(&self) -> BandwidthUsage {
        self.hypothesis
    }

    fn add_to_history(&mut self, delta: InterGroupDelta, _now: Instant) {
        let zero_time = *self.zero_time.get_or_insert(delta.last_remote_recv_time);

        self.num_deltas = (self.num_deltas + 1).min(DELAY_COUNT_MAX);

        let variation = delta.arrival_delta.as_millis_f64() - delta.send_delta.as_millis_f64();
        self.accumulated_delay += variation;
        self.smoothed_delay =
            self.smoothed_delay * SMOOTHING_COEF + (1.0 - SMOOTHING_COEF) * self.accumulated_delay;

        log_delay_variation!(variation);

        let remote_recv_time_ms = delta
            .last_remote_recv_time
            .saturating_duration_since(zero_time)
            .as_secs_f64()
            * 1000.0;

        self.history.push_back(Timing {
            remote_recv_time_ms,
            smoothed_delay_ms: self.smoothed_delay,
        });
    }

    fn update_trendline(&mut self, delta: InterGroupDelta, now: Instant) {
        let trend = self.linear_fit().unwrap_or(self.previous_trend);
        log_trendline_estimate!(trend);

        self.detect(trend, delta, now);
    }

    /// Least-squares slope of smoothed delay over arrival time.
    fn linear_fit(&self) -> Option<f64> {
        debug_assert!(self.history.len() >= 2);

        let len = self.history.len() as f64;
        let (sum_x, sum_y) = self.history.iter().fold((0.0, 0.0), |acc, t| {
            (acc.0 + t.remote_recv_time_ms, acc.1 + t.smoothed_delay_ms)
        });
        let avg_x = sum_x / len;
        let avg_y = sum_y / len;

        let (numerator, denominator) = self.history.iter().fold((0.0, 0.0), |acc, t| {
            let x = t.remote_recv_time_ms;
            let y = t.smoothed_delay_ms;

            (
                acc.0 + (x - avg_x) * (y - avg_y),
                acc.1 + (x - avg_x).powi(2),
            )
        });

        if denominator == 0.0 {
            return None;
        }

        Some(numerator / denominator)
    }

    fn detect(&mut self, trend: f64, delta: InterGroupDelta, now: Instant) {
        if self.num_deltas < 2 {
            // Not enough samples for any classification.
            return;
        }

        let modified_trend =
            self.num_deltas.min(DELAY_COUNT_CAP) as f64 * trend * self.threshold_gain;

        log_trendline_modified_trend!(modified_trend, self.threshold);

        if modified_trend > self.threshold {
            let send_delta_ms = delta.send_delta.as_millis_f64();
            match &mut self.overuse {
                Some(o) => o.time_overusing_ms += send_delta_ms,
                None => {
                    // Assume we have been overusing half of the time since
                    // the previous sample.
                    self.overuse = Some(Overuse {
                        count: 0,
                        time_overusing_ms: send_delta_ms / 2.0,
                    });
                }
            }

            let overuse = self.overuse.as_mut().expect("overuse tracked above");
            overuse.count += 1;

            if overuse.time_overusing_ms > self.overuse_time_threshold_ms
                && overuse.count > 1
                && trend >= self.previous_trend
            {
                self.overuse = None;
                self.update_hypothesis(BandwidthUsage::Overuse);
            }
        } else if modified_trend < -self.threshold {
            self.overuse = None;
            self.update_hypothesis(BandwidthUsage::Underuse);
        } else {
            self.overuse = None;
            self.update_hypothesis(BandwidthUsage::Normal);
        }

        self.previous_trend = trend;
        self.update_threshold(modified_trend, now);
    }

    fn update_threshold(&mut self, modified_trend: f64, now: Instant) {
        let last_update = *self.last_threshold_update.get_or_insert(now);

        if modified_trend.abs() > self.threshold + MAX_ADAPT_OFFSET_MS {
            // Ignore spikes entirely when adapting.
            self.last_threshold_update = Some(now);
            return;
        }

        let k = if modified_trend.abs() < self.threshold {
            self.k_down
        } else {
            self.k_up
        };

        let elapsed_ms = now.saturating_duration_since(last_update).as_secs_f64() * 1000.0;
        self.threshold += k * (modified_trend.abs() - self.threshold) * elapsed_ms.min(100.0);
        self.threshold = self
            .threshold
            .clamp(THRESHOLD_RANGE_MS.0, THRESHOLD_RANGE_MS.1);
        self.last_threshold_update = Some(now);
    }

    fn update_hypothesis(&mut self, new_hypothesis: BandwidthUsage) {
        if self.hypothesis == new_hypothesis {
            return;
        }

        debug!("TrendlineEstimator: hypothesis {new_hypothesis}");
        self.hypothesis = new_hypothesis;
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::super::time::TimeDelta;
    use super::*;

    fn estimator() -> TrendlineEstimator {
        TrendlineEstimator::new(&Config::default())
    }

    fn delta(send_ms: i64, arrival_ms: i64, at: Instant) -> InterGroupDelta {
        InterGroupDelta {
            send_delta: TimeDelta::from_millis(send_ms),
            arrival_delta: TimeDelta::from_millis(arrival_ms),
            last_remote_recv_time: at,
        }
    }

    #[test]
    fn starts_normal_and_stays_with_flat_delay() {
        let mut est = estimator();
        let base = Instant::now();

        for i in 0..40_u64 {
            let at = base + Duration::from_millis(i * 10);
            est.add_delay_observation(delta(10, 10, at), at);
        }

        assert_eq!(est.hypothesis(), BandwidthUsage::Normal);
    }

    #[test]
    fn rising_delay_detects_overuse() {
        let mut est = estimator();
        let base = Instant::now();

        // Every group takes 1 ms longer to arrive than to send: a steadily
        // building queue.
        let mut detected_at = None;
        for i in 0..60_u64 {
            let at = base + Duration::from_millis(i * 11);
            est.add_delay_observation(delta(10, 11, at), at);
            if est.hypothesis() == BandwidthUsage::Overuse && detected_at.is_none() {
                detected_at = Some(i);
            }
        }

        let detected_at = detected_at.expect("overuse detected");
        // The window needs to fill (20) before any detection can happen,
        // then detection should be prompt.
        assert!(
            (20..40).contains(&detected_at),
            "detected at sample {detected_at}"
        );
    }

    #[test]
    fn draining_queue_detects_underuse() {
        let mut est = estimator();
        let base = Instant::now();

        // Build up a queue first.
        for i in 0..30_u64 {
            let at = base + Duration::from_millis(i * 11);
            est.add_delay_observation(delta(10, 11, at), at);
        }

        // Then drain: arrivals consistently faster than sends.
        for i in 30..80_u64 {
            let at = base + Duration::from_millis(i * 11);
            est.add_delay_observation(delta(10, 7, at), at);
        }

        assert_eq!(est.hypothesis(), BandwidthUsage::Underuse);
    }

    #[test]
    fn threshold_stays_within_bounds() {
        let mut est = estimator();
        let base = Instant::now();

        // Feed wild positive and negative swings; the adaptive threshold
        // must stay clamped.
        for i in 0..500_u64 {
            let at = base + Duration::from_millis(i * 5);
            let arrival = if i % 2 == 0 { 200 } else { -190 };
            est.add_delay_observation(delta(5, arrival, at), at);

            assert!(est.threshold >= THRESHOLD_RANGE_MS.0);
            assert!(est.threshold <= THRESHOLD_RANGE_MS.1);
        }
    }

    #[test]
    fn no_classification_before_two_deltas() {
        let mut est = estimator();
        let base = Instant::now();

        est.add_delay_observation(delta(10, 30, base), base);
        assert_eq!(est.hypothesis(), BandwidthUsage::Normal);
    }
}
