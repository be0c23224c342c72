use std::time::{Duration, Instant};

use crate::rtp::{Bitrate, DataSize};

/// Windowed estimate of the bitrate the network actually delivered,
/// derived from remote arrival times in feedback.
pub(super) struct AckedBitrateEstimator {
    /// Window used until the first estimate exists; larger for stability.
    initial_window: Duration,
    /// Window for subsequent estimates.
    window: Duration,
    estimate: Option<Bitrate>,
    /// Bytes accumulated in the current window.
    sum: DataSize,
    /// How much of the current window has elapsed.
    current_window: Duration,
    last_update: Option<Instant>,
}

impl AckedBitrateEstimator {
    pub(super) fn new(initial_window: Duration, window: Duration) -> Self {
        Self {
            initial_window,
            window,
            estimate: None,
            sum: DataSize::ZERO,
            current_window: Duration::ZERO,
            last_update: None,
        }
    }

    pub(super) fn update(&mut self, receive_time: Instant, packet_size: DataSize) {
        let window = if self.estimate.is_none() {
            self.initial_window
        } else {
            self.window
        };

        if let Some(estimate) = self.update_window(receive_time, packet_size, window) {
            self.estimate = Some(estimate);
        }
    }

    pub(super) fn current_estimate(&self) -> Option<Bitrate> {
        self.estimate
    }

    fn update_window(
        &mut self,
        receive_time: Instant,
        packet_size: DataSize,
        window: Duration,
    ) -> Option<Bitrate> {
        if self.last_update.map(|l| receive_time < l).unwrap_or(false) {
            // Arrival time moved backwards; reset and start over.
            self.sum = DataSize::ZERO;
            self.current_window = Duration::ZERO;
            self.last_update = Some(receive_time);
            return None;
        }

        if let Some(last) = self.last_update {
            let elapsed = receive_time - last;
            self.current_window += elapsed;
            if elapsed >= window {
                // Nothing arrived for a whole window; the accumulated sum
                // no longer describes a contiguous window.
                self.sum = DataSize::ZERO;
                self.current_window = Duration::from_micros(
                    (self.current_window.as_micros() % window.as_micros()) as u64,
                );
            }
        }

        self.last_update = Some(receive_time);

        let mut estimate = None;
        if self.current_window >= window {
            estimate = Some(self.sum / window);
            self.sum = DataSize::ZERO;
            self.current_window -= window;
        }

        self.sum += packet_size;

        estimate
    }
}
