use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::feedback::PacketFeedback;
use crate::rtp::{Bitrate, DataSize};

/// Feedback for at least this many probe packets before a cluster can
/// produce an estimate.
const MIN_PROBES: usize = 5;

/// Send or receive intervals longer than this are not probe-like.
const MAX_PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// Receive/send rate ratios above this mean the timestamps are nonsense.
const MAX_VALID_RATIO: f64 = 2.0;

/// Below this receive/send ratio the link is considered saturated.
const MIN_RATIO_FOR_UNSATURATED_LINK: f64 = 0.9;

/// Fraction of the receive rate to target when the link was saturated.
const TARGET_UTILIZATION_FRACTION: f64 = 0.95;

/// Clusters untouched for this long are erased lazily.
const CLUSTER_HISTORY: Duration = Duration::from_secs(5);

/// Infers the achieved bitrate of probe clusters from feedback.
///
/// Packets tagged with a probe cluster id are aggregated per cluster; once
/// enough of them have feedback, the send and receive rates over the
/// cluster are computed and the smaller of the two is the estimate. Lost
/// probe packets carry no receive time and are ignored.
#[derive(Debug, Default)]
pub(super) struct ProbeBitrateEstimator {
    clusters: HashMap<u32, AggregatedCluster>,
    last_estimate: Option<Bitrate>,
}

#[derive(Debug)]
struct AggregatedCluster {
    num_probes: usize,
    first_send: Instant,
    last_send: Instant,
    first_receive: Instant,
    last_receive: Instant,
    /// Size of the last-sent packet; it has not finished transmitting
    /// within `last_send - first_send`, so it is excluded from send rate.
    size_last_send: DataSize,
    /// Size of the first-received packet; its reception precedes the
    /// measured receive interval, so it is excluded from receive rate.
    size_first_receive: DataSize,
    size_total: DataSize,
    last_update: Instant,
}

impl ProbeBitrateEstimator {
    pub(super) fn new() -> Self {
        Self::default()
    }

    /// Feed one feedback record. Returns a new estimate when this record
    /// completes a cluster measurement.
    pub(super) fn handle_probe_and_estimate(
        &mut self,
        feedback: &PacketFeedback,
        now: Instant,
    ) -> Option<Bitrate> {
        let cluster_id = feedback.pacing_info.probe_cluster_id?;
        // Lost probe packets don't participate.
        let recv_time = feedback.remote_recv_time?;

        self.erase_old_clusters(now);

        let send_time = feedback.send_time;
        let size = feedback.size;

        let cluster = self
            .clusters
            .entry(cluster_id)
            .or_insert_with(|| AggregatedCluster {
                num_probes: 0,
                first_send: send_time,
                last_send: send_time,
                first_receive: recv_time,
                last_receive: recv_time,
                size_last_send: size,
                size_first_receive: size,
                size_total: DataSize::ZERO,
                last_update: now,
            });

        cluster.num_probes += 1;
        cluster.size_total += size;
        cluster.last_update = now;

        cluster.first_send = cluster.first_send.min(send_time);
        if send_time >= cluster.last_send {
            cluster.last_send = send_time;
            cluster.size_last_send = size;
        }
        if recv_time <= cluster.first_receive {
            cluster.first_receive = recv_time;
            cluster.size_first_receive = size;
        }
        cluster.last_receive = cluster.last_receive.max(recv_time);

        if cluster.num_probes < MIN_PROBES {
            return None;
        }

        let send_interval = cluster.last_send.saturating_duration_since(cluster.first_send);
        let receive_interval = cluster
            .last_receive
            .saturating_duration_since(cluster.first_receive);

        if send_interval.is_zero()
            || send_interval > MAX_PROBE_INTERVAL
            || receive_interval.is_zero()
            || receive_interval > MAX_PROBE_INTERVAL
        {
            return None;
        }

        // The last sent packet is still in flight during the send interval
        // and the first received packet predates the receive interval, so
        // both are excluded from their respective rates.
        let send_size = cluster.size_total.saturating_sub(cluster.size_last_send);
        let receive_size = cluster.size_total.saturating_sub(cluster.size_first_receive);
        if !send_size.is_positive() || !receive_size.is_positive() {
            return None;
        }

        let send_rate = send_size / send_interval;
        let receive_rate = receive_size / receive_interval;

        let ratio = receive_rate.as_f64() / send_rate.as_f64();
        if ratio > MAX_VALID_RATIO {
            warn!(
                "Probe cluster {cluster_id} discarded: receive/send ratio {ratio:.2} > {MAX_VALID_RATIO}"
            );
            self.clusters.remove(&cluster_id);
            return None;
        }

        debug!(
            "Probe cluster {cluster_id}: send {send_rate}, receive {receive_rate} over {} probes",
            cluster.num_probes
        );

        let mut result = send_rate.min(receive_rate);

        // Receiving noticeably slower than sending means the probe
        // saturated the link; aim slightly below what was received so we
        // don't immediately overuse.
        if receive_rate.as_f64() < MIN_RATIO_FOR_UNSATURATED_LINK * send_rate.as_f64() {
            result = receive_rate * TARGET_UTILIZATION_FRACTION;
        }

        self.last_estimate = Some(result);

        Some(result)
    }

    /// Latest estimate, cleared on read.
    pub(super) fn fetch_and_reset_last_estimate(&mut self) -> Option<Bitrate> {
        self.last_estimate.take()
    }

    fn erase_old_clusters(&mut self, now: Instant) {
        self.clusters
            .retain(|_, c| now.saturating_duration_since(c.last_update) <= CLUSTER_HISTORY);
    }
}
