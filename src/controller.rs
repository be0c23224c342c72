//! Thin owner wiring the feedback adapter, the bandwidth estimator and the
//! pacer-facing outputs together in topological order.
//!
//! The components themselves are deliberately unaware of each other; this
//! controller is the single place where feedback flows into estimation and
//! estimation flows back into pacing and encoder targets. It also decides
//! when to probe: a two-step ramp at startup, again when leaving the
//! application-limited region, and on raised bitrate caps.

use std::time::Instant;

use crate::bwe::{CongestionWindowPushback, SendSideBandwidthEstimator, TargetTransferRate};
use crate::config::Config;
use crate::feedback::TransportFeedbackAdapter;
use crate::rtp::{Bitrate, DataSize};
use crate::util::{already_happened, not_happening, Soonest};
use crate::Error;

/// Startup probes at these multiples of the initial bitrate.
const STARTUP_PROBE_FACTORS: [f64; 2] = [3.0, 6.0];

/// Probe at this multiple of the current target when leaving ALR.
const ALR_EXIT_PROBE_FACTOR: f64 = 2.0;

/// Floor for the pushback mechanism's encoder target.
const MIN_PUSHBACK_BITRATE: Bitrate = Bitrate::kbps(30);

/// A probe the pacer should run: pass to
/// [`PacedSender::create_probe_cluster`][crate::pacer::PacedSender::create_probe_cluster].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeRequest {
    pub cluster_id: u32,
    pub target_rate: Bitrate,
}

/// Owns the network-receive side of the control loop.
pub struct SendSideController {
    config: Config,
    adapter: TransportFeedbackAdapter,
    bwe: SendSideBandwidthEstimator,
    pushback: CongestionWindowPushback,

    next_cluster_id: u32,
    pending_probes: Vec<ProbeRequest>,
    was_in_alr: bool,
}

impl SendSideController {
    pub fn new(config: Config) -> Self {
        let mut controller = SendSideController {
            config,
            adapter: TransportFeedbackAdapter::new(),
            bwe: SendSideBandwidthEstimator::new(config),
            pushback: CongestionWindowPushback::new(MIN_PUSHBACK_BITRATE, true),
            next_cluster_id: 0,
            pending_probes: Vec::new(),
            was_in_alr: false,
        };

        // Startup ramp: two clusters above the configured starting rate.
        for factor in STARTUP_PROBE_FACTORS {
            let rate = config.initial_bitrate * factor;
            controller.schedule_probe(rate);
        }

        controller
    }

    /// The send window join point. The transport callback uses this to
    /// allocate transport-wide sequence numbers, register packets and
    /// report wire send times.
    pub fn feedback_adapter(&self) -> &TransportFeedbackAdapter {
        &self.adapter
    }

    /// Feed an incoming RTCP packet. Returns a new rate target when the
    /// contained feedback moved the estimate.
    pub fn incoming_rtcp(
        &mut self,
        bytes: &[u8],
        now: Instant,
    ) -> Result<Option<TargetTransferRate>, Error> {
        let feedback = self.adapter.incoming_rtcp(bytes, now)?;
        if feedback.is_empty() {
            return Ok(None);
        }

        let target = self.bwe.update(&feedback, now);
        self.after_update(now);

        Ok(target)
    }

    /// Feed a loss report from a non-TWCC RTCP path (receiver reports).
    pub fn on_loss_report(&mut self, fraction_lost: u8, now: Instant) {
        self.bwe.on_loss_report(fraction_lost, self.adapter.rtt(), now);
    }

    /// Periodic tick; drives the estimator between feedback arrivals.
    pub fn handle_timeout(&mut self, now: Instant) -> Option<TargetTransferRate> {
        let target = self.bwe.handle_timeout(now);
        self.after_update(now);
        target
    }

    pub fn poll_timeout(&self) -> Instant {
        let bwe = (Some(self.bwe.poll_timeout()), "bwe");
        let probe = (
            // Pending probes want to reach the pacer right away.
            (!self.pending_probes.is_empty()).then(already_happened),
            "probe",
        );

        let (when, _what) = bwe.soonest(probe);
        when.unwrap_or_else(not_happening)
    }

    /// Account media bytes the pacer put on the wire.
    pub fn on_media_sent(&mut self, size: DataSize, is_padding: bool, now: Instant) {
        self.bwe.on_media_sent(size, is_padding, now);
    }

    /// Next probe the pacer should run, if any was decided.
    pub fn poll_probe(&mut self) -> Option<ProbeRequest> {
        if self.pending_probes.is_empty() {
            return None;
        }
        Some(self.pending_probes.remove(0))
    }

    /// Bytes in flight, for the pacer's congestion window accounting.
    pub fn outstanding_data(&self) -> DataSize {
        self.adapter.outstanding_data()
    }

    /// Pacing rate for a target, per the configured pacing factor.
    pub fn pacing_rate(&self, target: TargetTransferRate) -> Bitrate {
        target.target * self.config.pacing_factor
    }

    /// Encoder target for a rate target, after congestion window pushback.
    pub fn encoder_target(&mut self, target: TargetTransferRate) -> Bitrate {
        self.pushback
            .update_outstanding_data(self.adapter.outstanding_data());
        self.pushback.update_target_bitrate(target.target)
    }

    /// Update the congestion window used for pushback.
    pub fn set_data_window(&mut self, window: DataSize) {
        self.pushback.set_data_window(window);
    }

    /// Report the pacer queue size for pushback accounting.
    pub fn update_pacing_queue(&mut self, queued: DataSize) {
        self.pushback.update_pacing_queue(queued);
    }

    /// Raise or lower the bitrate cap, optionally probing the new headroom.
    pub fn set_max_bitrate(&mut self, max: Bitrate) {
        let raised = max > self.config.max_bitrate;
        self.config.max_bitrate = max;
        self.bwe.set_bitrate_range(self.config.min_bitrate, max);

        if raised && self.config.probe_on_max_bitrate_change {
            let target = self
                .bwe
                .last_target()
                .map(|t| t.target)
                .unwrap_or(self.config.initial_bitrate);
            self.schedule_probe((target * ALR_EXIT_PROBE_FACTOR).min(max));
        }
    }

    /// Explicitly request a probe cluster.
    pub fn schedule_probe(&mut self, target_rate: Bitrate) {
        let cluster_id = self.next_cluster_id;
        self.next_cluster_id += 1;
        self.pending_probes.push(ProbeRequest {
            cluster_id,
            target_rate,
        });
        debug!("Scheduling probe cluster {cluster_id} at {target_rate}");
    }

    fn after_update(&mut self, _now: Instant) {
        // Probe when leaving the application limited region: while limited
        // the estimate went stale, and the encoder is about to need rate.
        let in_alr = self.bwe.alr_start_time().is_some();
        if self.was_in_alr && !in_alr && !self.bwe.is_overusing() {
            if let Some(target) = self.bwe.last_target() {
                self.schedule_probe(target.target * ALR_EXIT_PROBE_FACTOR);
            }
        }
        self.was_in_alr = in_alr;
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::pacer::PacedPacketInfo;
    use crate::rtcp::TwccRecvRegister;

    #[test]
    fn startup_probes_are_scheduled() {
        let config = Config::default();
        let mut controller = SendSideController::new(config);

        let first = controller.poll_probe().expect("first startup probe");
        let second = controller.poll_probe().expect("second startup probe");
        assert!(controller.poll_probe().is_none());

        assert_eq!(first.target_rate, config.initial_bitrate * 3.0);
        assert_eq!(second.target_rate, config.initial_bitrate * 6.0);
        assert_ne!(first.cluster_id, second.cluster_id);
    }

    #[test]
    fn feedback_round_trip_produces_target() {
        let mut controller = SendSideController::new(Config::default());
        let base = Instant::now();
        let mut recv = TwccRecvRegister::new(1000);

        // Send a steady 1100 B / 10 ms stream and loop receiver feedback
        // back every 50 ms.
        let mut target = None;
        for i in 0..400_u64 {
            let at = base + Duration::from_millis(i * 10);
            let seq = controller.feedback_adapter().allocate_seq();
            controller.feedback_adapter().add_packet(
                1.into(),
                seq,
                DataSize::bytes(1100),
                PacedPacketInfo::default(),
                false,
                false,
                false,
                at,
            );
            controller.feedback_adapter().on_sent_packet(seq, at);
            controller.on_media_sent(DataSize::bytes(1100), false, at);
            recv.update_seq(seq, at + Duration::from_millis(2));

            if i % 5 == 4 {
                let twcc = recv.build_report(1000).unwrap();
                let mut buf = vec![0_u8; 1500];
                let n = twcc.write_to(&mut buf);
                buf.truncate(n);

                let report_at = at + Duration::from_millis(40);
                target = controller
                    .incoming_rtcp(&buf, report_at)
                    .expect("valid rtcp")
                    .or(target);
            }
        }

        let target = target.expect("target after feedback");
        assert!(target.target >= Config::default().min_bitrate);
        assert!(controller.pacing_rate(target) > target.target);
    }

    #[test]
    fn raised_max_bitrate_triggers_probe() {
        let config = Config::default();
        let mut controller = SendSideController::new(config);
        // Drain startup probes.
        while controller.poll_probe().is_some() {}

        controller.set_max_bitrate(config.max_bitrate * 2.0);
        assert!(controller.poll_probe().is_some());
    }

    #[test]
    fn lowered_max_bitrate_does_not_probe() {
        let config = Config::default();
        let mut controller = SendSideController::new(config);
        while controller.poll_probe().is_some() {}

        controller.set_max_bitrate(Bitrate::kbps(500));
        assert!(controller.poll_probe().is_none());
    }

    #[test]
    fn encoder_target_respects_pushback() {
        let mut controller = SendSideController::new(Config::default());
        controller.set_data_window(DataSize::bytes(60_000));

        let target = TargetTransferRate {
            target: Bitrate::kbps(500),
            stable_target: Bitrate::kbps(500),
            at_time: Instant::now(),
        };

        // Nothing outstanding: full rate.
        assert_eq!(controller.encoder_target(target), Bitrate::kbps(500));
    }

    #[test]
    fn malformed_rtcp_is_rejected_without_state_change() {
        let mut controller = SendSideController::new(Config::default());
        assert!(controller.incoming_rtcp(&[0x80, 0xcd], Instant::now()).is_err());
    }
}
