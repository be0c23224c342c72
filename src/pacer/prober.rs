use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::rtp::{Bitrate, DataSize};

use super::PacedPacketInfo;

/// Minimum time the probe burst must span to yield a measurable rate.
const MIN_PROBE_DURATION: Duration = Duration::from_millis(15);

/// Minimum number of probe packets per cluster.
const MIN_PROBE_PACKETS: usize = 5;

/// A cluster that has not seen a probe for this long is abandoned.
const CLUSTER_TIMEOUT: Duration = Duration::from_secs(5);

/// Queued media must be at least this big before probing starts; tiny
/// packets cannot saturate the probe rate.
const MIN_PACKET_SIZE: DataSize = DataSize::bytes(200);

/// If a probe slot is missed by more than this, delay rather than burst.
const MAX_PROBE_DELAY: Duration = Duration::from_millis(3);

/// Schedules probe clusters: short sequences of packets timed so their
/// aggregate send rate probes a target bitrate above the current estimate.
/// The receiver's feedback over a cluster then reveals achievable capacity.
#[derive(Debug)]
pub(crate) struct BitrateProber {
    clusters: VecDeque<ProbeCluster>,
    /// Set once media is flowing and probing may start.
    active: bool,
    /// When the next probe should go out. Meaningless unless active.
    next_probe_time: Option<Instant>,
}

#[derive(Debug)]
pub(crate) struct ProbeCluster {
    pub id: u32,
    pub target_rate: Bitrate,
    pub min_bytes: DataSize,
    pub min_packets: usize,
    pub sent_bytes: DataSize,
    pub sent_packets: usize,
    pub created_at: Instant,
    pub started_at: Option<Instant>,
}

impl ProbeCluster {
    fn new(id: u32, target_rate: Bitrate, now: Instant) -> Self {
        ProbeCluster {
            id,
            target_rate,
            min_bytes: target_rate * MIN_PROBE_DURATION,
            min_packets: MIN_PROBE_PACKETS,
            sent_bytes: DataSize::ZERO,
            sent_packets: 0,
            created_at: now,
            started_at: None,
        }
    }

    fn is_done(&self) -> bool {
        self.sent_bytes >= self.min_bytes && self.sent_packets >= self.min_packets
    }

    fn pacing_info(&self) -> PacedPacketInfo {
        PacedPacketInfo {
            probe_cluster_id: Some(self.id),
            probe_cluster_min_bytes: self.min_bytes,
            send_bitrate: self.target_rate,
        }
    }
}

impl BitrateProber {
    pub fn new() -> Self {
        BitrateProber {
            clusters: VecDeque::new(),
            active: false,
            next_probe_time: None,
        }
    }

    /// Enqueue a probe cluster configuration.
    pub fn create_cluster(&mut self, target_rate: Bitrate, cluster_id: u32, now: Instant) {
        debug!(
            "BitrateProber: New probe cluster {} at {}",
            cluster_id, target_rate
        );
        self.clusters
            .push_back(ProbeCluster::new(cluster_id, target_rate, now));
    }

    /// A media packet was queued in the pacer. Probing only starts when
    /// enough real data is flowing.
    pub fn on_incoming_packet(&mut self, size: DataSize, now: Instant) {
        if !self.active && !self.clusters.is_empty() && size >= MIN_PACKET_SIZE {
            self.active = true;
            self.next_probe_time = Some(now);
        }
    }

    pub fn is_probing(&self) -> bool {
        self.active && !self.clusters.is_empty()
    }

    /// Metadata to tag onto packets emitted for the current cluster.
    pub fn current_cluster(&self) -> Option<PacedPacketInfo> {
        if !self.is_probing() {
            return None;
        }
        self.clusters.front().map(|c| c.pacing_info())
    }

    /// Minimum bytes each probe spurt should emit.
    ///
    /// Twice the per-slot allotment: a spurt smaller than this gives the
    /// receiver too little signal per feedback interval.
    pub fn recommended_min_probe_size(&self) -> DataSize {
        let Some(cluster) = self.clusters.front() else {
            return DataSize::ZERO;
        };

        cluster.target_rate * (2 * MIN_PROBE_DURATION)
    }

    /// Time until the next probe slot. `None` when not probing.
    ///
    /// Zero means "send now". Expired clusters are discarded here.
    pub fn time_until_next_probe(&mut self, now: Instant) -> Option<Duration> {
        self.drop_expired(now);

        if !self.is_probing() {
            return None;
        }

        let next = self.next_probe_time?;
        let until = next.saturating_duration_since(now);

        if now > next && now - next > MAX_PROBE_DELAY {
            trace!("BitrateProber: Probe slot missed by more than {MAX_PROBE_DELAY:?}");
        }

        Some(until)
    }

    /// Bookkeeping after a probe spurt was emitted. Retires the cluster
    /// once it has sent enough.
    pub fn probe_sent(&mut self, now: Instant, bytes: DataSize) {
        debug_assert!(bytes > DataSize::ZERO);

        let Some(cluster) = self.clusters.front_mut() else {
            return;
        };

        let started = *cluster.started_at.get_or_insert(now);
        cluster.sent_bytes += bytes;
        cluster.sent_packets += 1;

        if cluster.is_done() {
            debug!(
                "BitrateProber: Probe cluster {} done, sent {} in {} packets",
                cluster.id, cluster.sent_bytes, cluster.sent_packets
            );
            self.clusters.pop_front();
            // The next cluster, if any, starts on its own schedule.
            self.next_probe_time = Some(now);
        } else {
            // Space slots so the cluster averages its target rate.
            let elapsed_at_target = cluster.sent_bytes / cluster.target_rate;
            self.next_probe_time = Some(started + elapsed_at_target);
        }

        if self.clusters.is_empty() {
            self.active = false;
            self.next_probe_time = None;
        }
    }

    /// Completed cluster ids, so the estimator can stop waiting for them.
    pub fn retired_before(&mut self, now: Instant) -> Vec<u32> {
        let mut retired = Vec::new();
        while let Some(front) = self.clusters.front() {
            if now.saturating_duration_since(front.created_at) > CLUSTER_TIMEOUT {
                retired.push(front.id);
                self.clusters.pop_front();
            } else {
                break;
            }
        }
        retired
    }

    fn drop_expired(&mut self, now: Instant) {
        for id in self.retired_before(now) {
            debug!("BitrateProber: Dropping expired probe cluster {}", id);
        }
        if self.clusters.is_empty() {
            self.active = false;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn inactive_without_clusters() {
        let mut prober = BitrateProber::new();
        let now = Instant::now();

        assert!(!prober.is_probing());
        prober.on_incoming_packet(DataSize::bytes(1200), now);
        assert!(!prober.is_probing());
        assert_eq!(prober.time_until_next_probe(now), None);
    }

    #[test]
    fn activates_on_large_enough_packet() {
        let mut prober = BitrateProber::new();
        let now = Instant::now();

        prober.create_cluster(Bitrate::mbps(1), 1, now);
        assert!(!prober.is_probing());

        // Too small to start probing.
        prober.on_incoming_packet(DataSize::bytes(100), now);
        assert!(!prober.is_probing());

        prober.on_incoming_packet(DataSize::bytes(1000), now);
        assert!(prober.is_probing());
        assert_eq!(prober.time_until_next_probe(now), Some(Duration::ZERO));

        let info = prober.current_cluster().unwrap();
        assert_eq!(info.probe_cluster_id, Some(1));
        assert_eq!(info.send_bitrate, Bitrate::mbps(1));
    }

    #[test]
    fn recommended_size_covers_two_slots() {
        let mut prober = BitrateProber::new();
        let now = Instant::now();

        prober.create_cluster(Bitrate::mbps(1), 1, now);

        // 1 Mbps * 30 ms = 3750 bytes.
        assert_eq!(
            prober.recommended_min_probe_size(),
            DataSize::bytes(3750)
        );
    }

    #[test]
    fn slots_pace_at_target_rate() {
        let mut prober = BitrateProber::new();
        let now = Instant::now();

        prober.create_cluster(Bitrate::mbps(1), 1, now);
        prober.on_incoming_packet(DataSize::bytes(1200), now);

        // 1250 bytes at 1 Mbps = 10 ms worth.
        prober.probe_sent(now, DataSize::bytes(1250));
        assert_eq!(
            prober.time_until_next_probe(now),
            Some(Duration::from_millis(10))
        );
    }

    #[test]
    fn cluster_retires_on_bytes_and_packets() {
        let mut prober = BitrateProber::new();
        let now = Instant::now();

        // min_bytes = 1 Mbps * 15ms = 1875 bytes, min_packets = 5.
        prober.create_cluster(Bitrate::mbps(1), 1, now);
        prober.on_incoming_packet(DataSize::bytes(1200), now);

        // Bytes threshold reached early, but not the packet count.
        prober.probe_sent(now, DataSize::bytes(1875));
        assert!(prober.is_probing());

        for i in 0..3 {
            prober.probe_sent(now + Duration::from_millis(i), DataSize::bytes(10));
            assert!(prober.is_probing());
        }

        prober.probe_sent(now + Duration::from_millis(4), DataSize::bytes(10));
        assert!(!prober.is_probing());
        assert_eq!(prober.time_until_next_probe(now), None);
    }

    #[test]
    fn clusters_run_back_to_back() {
        let mut prober = BitrateProber::new();
        let now = Instant::now();

        prober.create_cluster(Bitrate::mbps(1), 1, now);
        prober.create_cluster(Bitrate::mbps(2), 2, now);
        prober.on_incoming_packet(DataSize::bytes(1200), now);

        for i in 0..5 {
            prober.probe_sent(now + Duration::from_millis(i * 3), DataSize::bytes(400));
        }

        // First cluster done (2000 >= 1875 bytes, 5 packets), second active.
        assert!(prober.is_probing());
        assert_eq!(prober.current_cluster().unwrap().probe_cluster_id, Some(2));
    }

    #[test]
    fn stale_cluster_expires() {
        let mut prober = BitrateProber::new();
        let now = Instant::now();

        prober.create_cluster(Bitrate::mbps(1), 1, now);
        prober.on_incoming_packet(DataSize::bytes(1200), now);
        assert!(prober.is_probing());

        let later = now + Duration::from_secs(6);
        assert_eq!(prober.time_until_next_probe(later), None);
        assert!(!prober.is_probing());
    }
}
