use crate::rtp::{Bitrate, DataSize};

/// Smoothing of the encoder rate ratio: 95% history, 5% new sample.
const EASING: f64 = 0.95;

/// The fill ratio saturates here; beyond 150% full is just "very full".
const MAX_FILL_RATIO: f64 = 1.5;

/// The encoder rate ratio never drops below this; video should degrade,
/// not stop.
const MIN_RATE_RATIO: f64 = 0.1;

/// Pushes the encoder target down when in-flight data approaches the
/// congestion window.
///
/// Without this, a filling window first shows up as a growing pacer queue
/// and then as delay. Scaling the encoder target by how full the window is
/// throttles the source before the queue explodes. A minimum pushback
/// bitrate prevents pausing video outright.
#[derive(Debug)]
pub struct CongestionWindowPushback {
    data_window: Option<DataSize>,
    outstanding_bytes: DataSize,
    pacing_bytes: DataSize,
    /// Whether queued pacer bytes count against the window too.
    add_pacing: bool,
    min_pushback_bitrate: Bitrate,
    encoding_rate_ratio: f64,
}

impl CongestionWindowPushback {
    pub fn new(min_pushback_bitrate: Bitrate, add_pacing: bool) -> Self {
        CongestionWindowPushback {
            data_window: None,
            outstanding_bytes: DataSize::ZERO,
            pacing_bytes: DataSize::ZERO,
            add_pacing,
            min_pushback_bitrate,
            encoding_rate_ratio: 1.0,
        }
    }

    pub fn set_data_window(&mut self, window: DataSize) {
        self.data_window = Some(window);
    }

    pub fn update_outstanding_data(&mut self, outstanding_bytes: DataSize) {
        self.outstanding_bytes = outstanding_bytes;
    }

    pub fn update_pacing_queue(&mut self, pacing_bytes: DataSize) {
        self.pacing_bytes = pacing_bytes;
    }

    /// Scale a target bitrate by the eased window fill ratio.
    pub fn update_target_bitrate(&mut self, bitrate: Bitrate) -> Bitrate {
        let Some(window) = self.data_window else {
            return bitrate;
        };
        if !window.is_positive() {
            return bitrate;
        }

        let mut in_flight = self.outstanding_bytes;
        if self.add_pacing {
            in_flight += self.pacing_bytes;
        }

        let fill_ratio =
            (in_flight.as_bytes_f64() / window.as_bytes_f64()).clamp(0.0, MAX_FILL_RATIO);

        self.encoding_rate_ratio =
            (self.encoding_rate_ratio * EASING + (1.0 - fill_ratio) * (1.0 - EASING))
                .clamp(MIN_RATE_RATIO, 1.0);

        let adjusted = bitrate * self.encoding_rate_ratio;

        if adjusted < self.min_pushback_bitrate {
            // Hold the floor, but never push the target above its input.
            return self.min_pushback_bitrate.min(bitrate);
        }

        adjusted
    }
}
