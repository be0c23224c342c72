//! Receiver NACKs feeding the send-side history, which resubmits packets
//! through the pacer with the retransmit flag set.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use sendside::pacer::{PacedPacketInfo, PacedSender, PacketPriority, PacketTransport};
use sendside::rtp::{Bitrate, DataSize, Ssrc};
use sendside::streams::{NackModule, RtpPacketHistory, StorageMode, StoredPacket};
use sendside::Config;

#[derive(Default)]
struct Wire {
    sent: Mutex<Vec<(u16, bool)>>,
}

impl PacketTransport for &Wire {
    fn send(
        &self,
        _ssrc: Ssrc,
        rtp_seq: u16,
        _capture_time: Instant,
        is_retransmit: bool,
        _info: PacedPacketInfo,
    ) -> bool {
        self.sent.lock().unwrap().push((rtp_seq, is_retransmit));
        true
    }

    fn send_padding(&self, requested: DataSize, _info: PacedPacketInfo) -> DataSize {
        requested
    }
}

#[test]
fn nack_round_trip_retransmits_through_pacer() {
    let rtt = Duration::from_millis(40);
    let start = Instant::now();

    let wire = Wire::default();
    let pacer = PacedSender::new(Config::default(), &wire);
    pacer.set_pacing_rates(Bitrate::mbps(2), Bitrate::ZERO);

    let mut history = RtpPacketHistory::new(StorageMode::Store, 600);
    history.set_rtt(rtt);

    let mut receiver = NackModule::new(&Config::default());
    receiver.set_rtt(rtt);

    // Send packets 0..10; packet 4 is lost on the wire.
    let mut now = start;
    for seq in 0..10_u16 {
        pacer.insert_packet(
            PacketPriority::Normal,
            1.into(),
            seq,
            now,
            DataSize::bytes(1200),
            false,
            now,
        );
        history.put_packet(
            StoredPacket::new((seq as u64).into(), 1.into(), now, now, vec![0; 1200]),
            now,
        );

        pacer.process(now);
        now += Duration::from_millis(5);

        if seq != 4 {
            receiver.on_received(seq, now);
        }
    }

    // The receiver noticed the gap and NACKs it.
    let batch = receiver.handle_timeout(now).expect("nack batch");
    assert_eq!(batch.seqs, vec![4]);
    assert!(!batch.request_keyframe);

    // Sender resolves the NACK against its history. The original went out
    // ~30 ms ago which is inside 5 ms + rtt, so nothing yet.
    let too_early = history.on_received_nack(batch.seqs.clone(), rtt, now);
    assert!(too_early.is_empty());

    // A later retry passes the interval and produces a retransmission.
    now += Duration::from_millis(45);
    receiver.set_rtt(rtt);
    let retry = receiver.handle_timeout(now).expect("retry batch");
    let retransmissions = history.on_received_nack(retry.seqs, rtt, now);
    assert_eq!(retransmissions.len(), 1);

    // Resubmit through the pacer with the retransmit flag.
    let before = wire.sent.lock().unwrap().len();
    for rtx in retransmissions {
        pacer.insert_packet(
            PacketPriority::Normal,
            rtx.ssrc,
            rtx.seq_no.as_u16(),
            rtx.capture_time,
            rtx.size,
            true,
            now,
        );
    }
    for _ in 0..5 {
        pacer.process(now);
        now += Duration::from_millis(5);
    }

    let sent = wire.sent.lock().unwrap();
    let rtx_entry = sent[before..]
        .iter()
        .find(|(seq, _)| *seq == 4)
        .expect("retransmission on the wire");
    assert!(rtx_entry.1, "retransmit flag must be set");

    // The repaired packet clears the receiver's gap tracking.
    drop(sent);
    receiver.on_received(4, now);
    assert!(receiver.handle_timeout(now + Duration::from_millis(20)).is_none());
}
