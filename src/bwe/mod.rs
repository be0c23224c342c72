//! Send-side bandwidth estimation.
//!
//! Transport-wide feedback drives two parallel estimators: a delay-based
//! one (packet grouping, trendline slope, AIMD rate control) and a
//! loss-based one. The produced target is the smaller of the two, clamped
//! to the configured range. Probe cluster results short-circuit the slow
//! ramp by validating a rate directly.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::feedback::PacketFeedback;
use crate::rtp::{Bitrate, DataSize, SeqNo};
use crate::util::already_happened;

mod acked_bitrate;
mod alr;
mod arrival_group;
mod loss;
mod probe_estimator;
mod pushback;
mod rate_control;
mod time;
mod trendline;

use acked_bitrate::AckedBitrateEstimator;
use alr::AlrDetector;
use arrival_group::ArrivalGroupAccumulator;
use loss::LossController;
use probe_estimator::ProbeBitrateEstimator;
use rate_control::RateControl;
use trendline::TrendlineEstimator;

pub use pushback::CongestionWindowPushback;

/// Window for the very first acknowledged-bitrate estimate.
const INITIAL_BITRATE_WINDOW: Duration = Duration::from_millis(500);

/// Window for subsequent acknowledged-bitrate estimates.
const BITRATE_WINDOW: Duration = Duration::from_millis(150);

/// During startup the loss-based estimate follows the delay-based one.
const STARTUP_PHASE: Duration = Duration::from_secs(2);

/// How many per-report max RTTs the RTT average spans.
const MAX_RTT_HISTORY_WINDOW: usize = 32;

/// Periodic update interval for the delay controller between reports.
const UPDATE_INTERVAL: Duration = Duration::from_millis(25);

/// Negligible loss for the startup alignment check.
const NEGLIGIBLE_LOSS: f64 = 0.001;

/// The produced rate target, pushed to the pacer and the encoder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetTransferRate {
    pub target: Bitrate,
    /// Smoothed variant for consumers that should not chase every wiggle
    /// (e.g. simulcast layer allocation).
    pub stable_target: Bitrate,
    pub at_time: Instant,
}

/// The delay detector's view of the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BandwidthUsage {
    Overuse,
    Normal,
    Underuse,
}

impl fmt::Display for BandwidthUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BandwidthUsage::Overuse => write!(f, "overuse"),
            BandwidthUsage::Normal => write!(f, "normal"),
            BandwidthUsage::Underuse => write!(f, "underuse"),
        }
    }
}

/// A packet that was sent and acknowledged as received in feedback.
#[derive(Debug, Copy, Clone)]
pub(crate) struct AckedPacket {
    pub seq_no: SeqNo,
    pub size: DataSize,
    pub local_send_time: Instant,
    /// Remote arrival. Only comparable with other remote arrivals.
    pub remote_recv_time: Instant,
    /// When the covering feedback reached us.
    pub local_recv_time: Instant,
}

impl AckedPacket {
    fn rtt(&self) -> Duration {
        self.local_recv_time
            .saturating_duration_since(self.local_send_time)
    }

    fn order_by_receive_time(lhs: &Self, rhs: &Self) -> Ordering {
        lhs.remote_recv_time
            .cmp(&rhs.remote_recv_time)
            .then(lhs.local_send_time.cmp(&rhs.local_send_time))
            .then(lhs.seq_no.cmp(&rhs.seq_no))
    }
}

impl TryFrom<&PacketFeedback> for AckedPacket {
    type Error = ();

    fn try_from(value: &PacketFeedback) -> Result<Self, Self::Error> {
        let Some(remote_recv_time) = value.remote_recv_time else {
            return Err(());
        };

        Ok(AckedPacket {
            seq_no: value.transport_seq,
            size: value.size,
            local_send_time: value.send_time,
            remote_recv_time,
            local_recv_time: value.local_recv_time,
        })
    }
}

/// Delay-based bandwidth estimation: arrival groups feed the trendline
/// detector, whose hypothesis drives AIMD rate control.
struct DelayController {
    arrival_group_accumulator: ArrivalGroupAccumulator,
    trendline_estimator: TrendlineEstimator,
    rate_control: RateControl,
    /// Last produced estimate. Stays populated once the first exists.
    last_estimate: Option<Bitrate>,
    /// Max RTT per feedback report, averaged over a recent window.
    max_rtt_history: VecDeque<Duration>,
    mean_max_rtt: Option<Duration>,
    next_timeout: Instant,
    last_feedback: Instant,
}

impl DelayController {
    fn new(config: &Config) -> Self {
        DelayController {
            arrival_group_accumulator: ArrivalGroupAccumulator::default(),
            trendline_estimator: TrendlineEstimator::new(config),
            rate_control: RateControl::new(
                config.initial_bitrate,
                config.min_bitrate,
                config.max_bitrate,
            ),
            last_estimate: None,
            max_rtt_history: VecDeque::default(),
            mean_max_rtt: None,
            next_timeout: already_happened(),
            last_feedback: already_happened(),
        }
    }

    fn update(
        &mut self,
        acked: &[AckedPacket],
        acked_bitrate: Option<Bitrate>,
        probe_bitrate: Option<Bitrate>,
        now: Instant,
    ) -> Option<Bitrate> {
        let mut max_rtt = None;

        for packet in acked {
            max_rtt = max_rtt.max(Some(packet.rtt()));
            if let Some(delta) = self.arrival_group_accumulator.accumulate_packet(packet) {
                self.trendline_estimator.add_delay_observation(delta, now);
            }
        }

        if let Some(rtt) = max_rtt {
            self.add_max_rtt(rtt);
        }

        if let Some(probe) = probe_bitrate {
            // A validated probe result replaces the slow ramp.
            self.rate_control.set_estimate(probe, now);
        }

        self.update_estimate(acked_bitrate, now);
        self.last_feedback = now;

        self.last_estimate
    }

    fn handle_timeout(&mut self, acked_bitrate: Option<Bitrate>, now: Instant) {
        if now.saturating_duration_since(self.last_feedback) > UPDATE_INTERVAL * 2 {
            // Without fresh feedback the hypothesis is stale; wait for the
            // next report rather than acting on it. The timeout must still
            // move forward or we spin.
            self.next_timeout = now + UPDATE_INTERVAL;
            return;
        }

        self.update_estimate(acked_bitrate, now);
    }

    fn poll_timeout(&self) -> Instant {
        self.next_timeout
    }

    fn is_overusing(&self) -> bool {
        self.trendline_estimator.hypothesis() == BandwidthUsage::Overuse
    }

    fn set_bounds(&mut self, min: Bitrate, max: Bitrate) {
        self.rate_control.set_bounds(min, max);
    }

    fn last_estimate(&self) -> Option<Bitrate> {
        self.last_estimate
    }

    fn mean_max_rtt(&self) -> Option<Duration> {
        self.mean_max_rtt
    }

    fn add_max_rtt(&mut self, rtt: Duration) {
        while self.max_rtt_history.len() > MAX_RTT_HISTORY_WINDOW {
            self.max_rtt_history.pop_front();
        }
        self.max_rtt_history.push_back(rtt);

        let sum: Duration = self.max_rtt_history.iter().sum();
        self.mean_max_rtt = Some(sum / self.max_rtt_history.len() as u32);
    }

    fn update_estimate(&mut self, acked_bitrate: Option<Bitrate>, now: Instant) {
        if let Some(observed) = acked_bitrate {
            self.rate_control.update(
                self.trendline_estimator.hypothesis(),
                observed,
                self.mean_max_rtt,
                now,
            );
            let estimate = self.rate_control.estimated_bitrate();
            log_bitrate_estimate!(estimate.as_f64());
            self.last_estimate = Some(estimate);
        }

        // Advance even without an update, or poll/handle loops starve.
        self.next_timeout = now + UPDATE_INTERVAL;
    }
}

/// Combines the delay-based and loss-based estimates into the target rate.
pub struct SendSideBandwidthEstimator {
    config: Config,
    delay_controller: DelayController,
    acked_bitrate_estimator: AckedBitrateEstimator,
    probe_estimator: ProbeBitrateEstimator,
    loss_controller: LossController,
    alr_detector: AlrDetector,
    started_at: Option<Instant>,
    /// EWMA of emitted targets, for `stable_target`.
    stable_estimate: Option<f64>,
    last_target: Option<TargetTransferRate>,
}

impl SendSideBandwidthEstimator {
    pub fn new(config: Config) -> Self {
        let mut alr_detector = AlrDetector::new();
        alr_detector.set_estimated_bitrate(config.initial_bitrate);

        SendSideBandwidthEstimator {
            config,
            delay_controller: DelayController::new(&config),
            acked_bitrate_estimator: AckedBitrateEstimator::new(
                INITIAL_BITRATE_WINDOW,
                BITRATE_WINDOW,
            ),
            probe_estimator: ProbeBitrateEstimator::new(),
            loss_controller: LossController::new(
                config.initial_bitrate,
                config.min_bitrate,
                config.max_bitrate,
                config.use_loss_based_bwe_startup,
            ),
            alr_detector,
            started_at: None,
            stable_estimate: None,
            last_target: None,
        }
    }

    /// Process one feedback vector. Returns a new target when the
    /// estimators have enough data.
    pub fn update(&mut self, feedback: &[PacketFeedback], now: Instant) -> Option<TargetTransferRate> {
        let _ = self.started_at.get_or_insert(now);

        let mut probe_result = None;
        for fb in feedback {
            if let Some(rate) = self.probe_estimator.handle_probe_and_estimate(fb, now) {
                probe_result = Some(rate);
            }
        }

        let mut count = 0_u64;
        let mut lost = 0_u64;
        let mut acked: Vec<AckedPacket> = Vec::with_capacity(feedback.len());

        for fb in feedback {
            count += 1;
            match AckedPacket::try_from(fb) {
                Ok(packet) => acked.push(packet),
                Err(()) => lost += 1,
            }
        }
        acked.sort_by(AckedPacket::order_by_receive_time);

        for packet in &acked {
            self.acked_bitrate_estimator
                .update(packet.remote_recv_time, packet.size);
        }
        let acked_bitrate = self.acked_bitrate_estimator.current_estimate();

        let delay_estimate =
            self.delay_controller
                .update(&acked, acked_bitrate, probe_result, now)?;

        let loss_fraction = if count == 0 {
            0.0
        } else {
            lost as f64 / count as f64
        };

        if (self.in_startup_phase(now) && loss_fraction <= NEGLIGIBLE_LOSS)
            || probe_result.is_some()
        {
            // Follow the delay-based rate directly while ramping up or when
            // a probe validated it.
            self.loss_controller.set_estimate(delay_estimate);
        }

        self.loss_controller.set_delay_based_cap(delay_estimate);
        self.loss_controller
            .update(loss_fraction, self.delay_controller.mean_max_rtt(), now);

        Some(self.combine(delay_estimate, now))
    }

    /// Feed a loss report arriving outside the TWCC path (e.g. RTCP RR).
    /// `fraction_lost` is the RFC 3550 8-bit fixed point value.
    pub fn on_loss_report(&mut self, fraction_lost: u8, rtt: Option<Duration>, now: Instant) {
        self.loss_controller
            .update(fraction_lost as f64 / 255.0, rtt, now);
    }

    /// Periodic tick between feedback reports.
    pub fn handle_timeout(&mut self, now: Instant) -> Option<TargetTransferRate> {
        self.delay_controller
            .handle_timeout(self.acked_bitrate_estimator.current_estimate(), now);

        let delay_estimate = self.delay_controller.last_estimate()?;
        Some(self.combine(delay_estimate, now))
    }

    pub fn poll_timeout(&self) -> Instant {
        self.delay_controller.poll_timeout()
    }

    /// Account media bytes put on the wire, for ALR detection. Padding and
    /// probe bytes are intentionally excluded.
    pub fn on_media_sent(&mut self, size: DataSize, is_padding: bool, now: Instant) {
        if !is_padding {
            self.alr_detector.on_bytes_sent(size, now);
        }
    }

    /// When the sender became application limited, if it currently is.
    pub fn alr_start_time(&self) -> Option<Instant> {
        self.alr_detector.alr_start_time()
    }

    /// Whether the delay detector currently signals overuse. Useful for
    /// gating probes that would re-excite a congested path.
    pub fn is_overusing(&self) -> bool {
        self.delay_controller.is_overusing()
    }

    pub fn last_target(&self) -> Option<TargetTransferRate> {
        self.last_target
    }

    /// Loss fraction the loss controller last acted on.
    pub fn last_fraction_loss(&self) -> f64 {
        self.loss_controller.last_fraction_loss()
    }

    /// Re-clamp all estimates into a new configured range.
    pub fn set_bitrate_range(&mut self, min: Bitrate, max: Bitrate) {
        self.config.min_bitrate = min;
        self.config.max_bitrate = max;
        self.delay_controller.set_bounds(min, max);
        self.loss_controller.set_bounds(min, max);
    }

    fn in_startup_phase(&self, now: Instant) -> bool {
        self.started_at
            .map(|s| now.saturating_duration_since(s) <= STARTUP_PHASE)
            .unwrap_or(false)
    }

    fn combine(&mut self, delay_estimate: Bitrate, now: Instant) -> TargetTransferRate {
        let target = delay_estimate
            .min(self.loss_controller.estimate())
            .clamp(self.config.min_bitrate, self.config.max_bitrate);

        let stable = match self.stable_estimate {
            Some(prev) => prev * 0.95 + target.as_f64() * 0.05,
            None => target.as_f64(),
        };
        self.stable_estimate = Some(stable);

        self.alr_detector.set_estimated_bitrate(target);

        let result = TargetTransferRate {
            target,
            stable_target: Bitrate::from(stable).min(target),
            at_time: now,
        };
        self.last_target = Some(result);

        result
    }
}
