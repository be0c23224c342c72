use std::time::Duration;

use crate::rtp::Bitrate;

/// Static configuration for the pacing and estimation core.
///
/// Every tunable the components consult is enumerated here and passed at
/// construction. There is no global state; two instances with different
/// configs coexist happily in one process.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Minimum interval between pacer process ticks.
    pub min_packet_limit: Duration,

    /// Whether the pacer may exceed the pacing rate to drain queues whose
    /// average queue time approaches [`Config::queue_time_limit`].
    pub drain_large_queues: bool,

    /// Send a 1-byte keepalive every 500 ms even when neither paused nor
    /// congested.
    pub send_padding_in_silence: bool,

    /// Whether audio packets are subject to pacing. When `false` (default)
    /// audio bypasses budget gating and is released immediately.
    pub pace_audio: bool,

    /// Whether audio packets are charged to the media budget even when they
    /// bypass pacing.
    pub account_for_audio: bool,

    /// Factor applied to the target bitrate to produce the pacing rate.
    pub pacing_factor: f64,

    /// The longest the average packet may sit in the pacer queue before the
    /// drain boost kicks in.
    pub queue_time_limit: Duration,

    /// Initial send estimate before any feedback has arrived.
    pub initial_bitrate: Bitrate,

    /// Lower clamp for every produced estimate.
    pub min_bitrate: Bitrate,

    /// Upper clamp for every produced estimate.
    pub max_bitrate: Bitrate,

    /// Gain applied to the trendline slope before threshold comparison.
    pub threshold_gain: f64,

    /// Adaptive threshold rise coefficient, applied when the modified trend
    /// is above the threshold. Empirical reference value.
    pub threshold_up: f64,

    /// Adaptive threshold fall coefficient, applied when the modified trend
    /// is below the threshold. Empirical reference value.
    pub threshold_down: f64,

    /// Accumulated overuse time required before the detector signals
    /// overuse.
    pub overuse_time_threshold: Duration,

    /// Number of delay samples in the trendline window.
    pub trendline_window: usize,

    /// Retransmission history capacity, per SSRC.
    pub history_capacity: usize,

    /// Max times the receiver NACKs one missing sequence number before
    /// giving up and requesting a keyframe.
    pub max_nack_retries: u8,

    /// Batch interval for receiver-side NACK generation.
    pub nack_batch_interval: Duration,

    /// Request a probe cluster when the configured max bitrate is raised.
    pub probe_on_max_bitrate_change: bool,

    /// Let the loss-based estimator ramp faster until the first feedback
    /// caps it.
    pub use_loss_based_bwe_startup: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            min_packet_limit: Duration::from_millis(5),
            drain_large_queues: true,
            send_padding_in_silence: false,
            pace_audio: false,
            account_for_audio: false,
            pacing_factor: 2.5,
            queue_time_limit: Duration::from_millis(2000),
            initial_bitrate: Bitrate::kbps(300),
            min_bitrate: Bitrate::kbps(40),
            max_bitrate: Bitrate::gbps(10),
            threshold_gain: 4.0,
            threshold_up: 0.0087,
            threshold_down: 0.039,
            overuse_time_threshold: Duration::from_millis(10),
            trendline_window: 20,
            history_capacity: 600,
            max_nack_retries: 10,
            nack_batch_interval: Duration::from_millis(20),
            probe_on_max_bitrate_change: true,
            use_loss_based_bwe_startup: true,
        }
    }
}

impl Config {
    pub fn with_initial_bitrate(mut self, v: Bitrate) -> Self {
        self.initial_bitrate = v;
        self
    }

    pub fn with_bitrate_range(mut self, min: Bitrate, max: Bitrate) -> Self {
        self.min_bitrate = min;
        self.max_bitrate = max;
        self
    }

    pub fn with_pacing_factor(mut self, v: f64) -> Self {
        self.pacing_factor = v;
        self
    }

    pub fn with_pace_audio(mut self, v: bool) -> Self {
        self.pace_audio = v;
        self
    }

    pub fn with_send_padding_in_silence(mut self, v: bool) -> Self {
        self.send_padding_in_silence = v;
        self
    }

    pub fn with_queue_time_limit(mut self, v: Duration) -> Self {
        self.queue_time_limit = v;
        self
    }
}
