//! End-to-end pacing behavior: steady-state rate conformance, ordering
//! guarantees and padding, driven through the public API with a simulated
//! clock.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use sendside::pacer::{PacedPacketInfo, PacedSender, PacketPriority, PacketTransport};
use sendside::rtp::{Bitrate, DataSize, Ssrc};
use sendside::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wire {
    Media { ssrc: u32, rtp_seq: u16, bytes: i64 },
    Padding { bytes: i64 },
}

impl Wire {
    fn bytes(&self) -> i64 {
        match self {
            Wire::Media { bytes, .. } | Wire::Padding { bytes } => *bytes,
        }
    }
}

/// Records everything the pacer emits. Packet sizes are fixed per test
/// since the transport looks payloads up by (ssrc, seq) in real use.
struct WireLog {
    sent: Mutex<Vec<Wire>>,
    packet_size: i64,
}

impl WireLog {
    fn new(packet_size: i64) -> Self {
        WireLog {
            sent: Mutex::new(Vec::new()),
            packet_size,
        }
    }

    fn sent(&self) -> Vec<Wire> {
        self.sent.lock().unwrap().clone()
    }

    fn media_bytes(&self) -> i64 {
        self.sent()
            .iter()
            .filter(|w| matches!(w, Wire::Media { .. }))
            .map(Wire::bytes)
            .sum()
    }
}

impl PacketTransport for &WireLog {
    fn send(
        &self,
        ssrc: Ssrc,
        rtp_seq: u16,
        _capture_time: Instant,
        _is_retransmit: bool,
        _info: PacedPacketInfo,
    ) -> bool {
        self.sent.lock().unwrap().push(Wire::Media {
            ssrc: *ssrc,
            rtp_seq,
            bytes: self.packet_size,
        });
        true
    }

    fn send_padding(&self, requested: DataSize, _info: PacedPacketInfo) -> DataSize {
        self.sent.lock().unwrap().push(Wire::Padding {
            bytes: requested.as_bytes_i64(),
        });
        requested
    }
}

#[test]
fn steady_state_pacing_conforms_to_rate() {
    let wire = WireLog::new(1000);
    let pacer = PacedSender::new(Config::default(), &wire);
    pacer.set_pacing_rates(Bitrate::bps(1_000_000), Bitrate::ZERO);

    let start = Instant::now();
    let mut now = start;
    let mut seq = 0_u16;

    // Offer 1000-byte packets at exactly the pacing rate (one per 8 ms)
    // for one second, ticking the pacer every millisecond.
    for ms in 0..1000_u64 {
        now = start + Duration::from_millis(ms);

        if ms % 8 == 0 {
            pacer.insert_packet(
                PacketPriority::Normal,
                1.into(),
                seq,
                now,
                DataSize::bytes(1000),
                false,
                now,
            );
            seq = seq.wrapping_add(1);
        }

        if pacer.time_until_next_process(now).is_zero() {
            pacer.process(now);
        }
    }

    // ~125 kB in one second at 1 Mbps, within 5%.
    let sent = wire.media_bytes();
    assert!(
        (118_750..=131_250).contains(&sent),
        "sent {sent} bytes, expected about 125000"
    );

    // The queue keeps up with the offered load.
    assert!(
        pacer.queue_size_packets() <= 2,
        "queue did not drain: {} packets left",
        pacer.queue_size_packets()
    );
}

#[test]
fn fifo_order_is_preserved_per_stream() {
    let wire = WireLog::new(500);
    let pacer = PacedSender::new(Config::default(), &wire);
    pacer.set_pacing_rates(Bitrate::mbps(5), Bitrate::ZERO);

    let start = Instant::now();

    for seq in 0..20_u16 {
        pacer.insert_packet(
            PacketPriority::Normal,
            7.into(),
            seq,
            start,
            DataSize::bytes(500),
            false,
            start,
        );
    }

    let mut now = start;
    for _ in 0..50 {
        pacer.process(now);
        now += Duration::from_millis(5);
    }

    let seqs: Vec<u16> = wire
        .sent()
        .iter()
        .filter_map(|w| match w {
            Wire::Media { rtp_seq, .. } => Some(*rtp_seq),
            _ => None,
        })
        .collect();

    assert_eq!(seqs, (0..20).collect::<Vec<u16>>());
}

#[test]
fn audio_is_always_dequeued_before_video() {
    let wire = WireLog::new(500);
    let pacer = PacedSender::new(Config::default(), &wire);
    pacer.set_pacing_rates(Bitrate::mbps(5), Bitrate::ZERO);

    let start = Instant::now();

    for seq in 0..5_u16 {
        pacer.insert_packet(
            PacketPriority::Normal,
            1.into(),
            seq,
            start,
            DataSize::bytes(500),
            false,
            start,
        );
        pacer.insert_packet(
            PacketPriority::Audio,
            2.into(),
            seq,
            start,
            DataSize::bytes(500),
            false,
            start,
        );
    }

    let mut now = start;
    for _ in 0..20 {
        pacer.process(now);
        now += Duration::from_millis(5);
    }

    let ssrcs: Vec<u32> = wire
        .sent()
        .iter()
        .filter_map(|w| match w {
            Wire::Media { ssrc, .. } => Some(*ssrc),
            _ => None,
        })
        .collect();

    // All five audio packets lead, the video follows.
    assert_eq!(&ssrcs[..5], &[2, 2, 2, 2, 2]);
    assert_eq!(&ssrcs[5..], &[1, 1, 1, 1, 1]);
}

#[test]
fn probe_cluster_packets_share_cluster_id() {
    let wire = WireLog::new(1200);
    let infos: Mutex<Vec<PacedPacketInfo>> = Mutex::new(Vec::new());

    struct InfoLog<'a> {
        inner: &'a WireLog,
        infos: &'a Mutex<Vec<PacedPacketInfo>>,
    }

    impl<'a> PacketTransport for InfoLog<'a> {
        fn send(
            &self,
            ssrc: Ssrc,
            rtp_seq: u16,
            capture_time: Instant,
            is_retransmit: bool,
            info: PacedPacketInfo,
        ) -> bool {
            self.infos.lock().unwrap().push(info);
            (&self.inner).send(ssrc, rtp_seq, capture_time, is_retransmit, info)
        }

        fn send_padding(&self, requested: DataSize, info: PacedPacketInfo) -> DataSize {
            (&self.inner).send_padding(requested, info)
        }
    }

    let transport = InfoLog {
        inner: &wire,
        infos: &infos,
    };
    let config = Config::default().with_initial_bitrate(Bitrate::kbps(100));
    let pacer = PacedSender::new(config, transport);

    let start = Instant::now();
    pacer.create_probe_cluster(Bitrate::mbps(1), 42, start);

    for seq in 0..10_u16 {
        pacer.insert_packet(
            PacketPriority::Normal,
            1.into(),
            seq,
            start,
            DataSize::bytes(1200),
            false,
            start,
        );
    }

    let mut now = start;
    for _ in 0..10 {
        pacer.process(now);
        now += Duration::from_millis(5);
    }

    let infos = infos.lock().unwrap();
    let probe_tagged: Vec<_> = infos
        .iter()
        .filter(|i| i.probe_cluster_id.is_some())
        .collect();

    assert!(
        probe_tagged.len() >= 4,
        "expected a probe burst, got {} tagged packets",
        probe_tagged.len()
    );
    assert!(probe_tagged.iter().all(|i| i.probe_cluster_id == Some(42)));
    assert!(probe_tagged
        .iter()
        .all(|i| i.send_bitrate == Bitrate::mbps(1)));
}

#[test]
fn queue_time_boost_beats_slow_pacing_rate() {
    let wire = WireLog::new(1200);
    let config = Config::default().with_queue_time_limit(Duration::from_millis(1000));
    let pacer = PacedSender::new(config, &wire);
    // Pathologically slow: 40 kbps for 60 kB of queue.
    pacer.set_pacing_rates(Bitrate::kbps(40), Bitrate::ZERO);

    let start = Instant::now();
    for seq in 0..50_u16 {
        pacer.insert_packet(
            PacketPriority::Normal,
            1.into(),
            seq,
            start,
            DataSize::bytes(1200),
            false,
            start,
        );
    }

    // Drive for 2x the queue time limit: the drain boost must have pushed
    // everything out even though the nominal rate would take 12 seconds.
    let mut now = start;
    while now < start + Duration::from_millis(2000) {
        pacer.process(now);
        now += Duration::from_millis(5);
    }

    assert_eq!(pacer.queue_size_packets(), 0);
}
