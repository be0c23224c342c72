use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::rtp::{extend_u16, DataSize, SeqNo, Ssrc};

/// Entries younger than this are always kept, regardless of RTT.
const MIN_PACKET_AGE: Duration = Duration::from_secs(1);

/// Age limit as a multiple of the RTT.
const PACKET_AGE_RTT_FACTOR: u32 = 3;

/// Base of the per-packet minimum retransmit interval; one RTT is added.
const MIN_RETRANSMIT_BASE: Duration = Duration::from_millis(5);

/// Whether the history stores packets at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    /// Nothing is stored; NACKs cannot be answered.
    Disabled,
    /// Sent packets are stored for retransmission.
    Store,
}

/// A packet kept for potential retransmission.
#[derive(Debug, Clone)]
pub struct StoredPacket {
    pub seq_no: SeqNo,
    pub ssrc: Ssrc,
    pub capture_time: Instant,
    pub send_time: Instant,
    pub size: DataSize,
    pub payload: Vec<u8>,
    pub times_retransmitted: u8,
    /// Last retransmit send, gating the per-packet minimum interval.
    last_retransmitted: Option<Instant>,
}

impl StoredPacket {
    pub fn new(
        seq_no: SeqNo,
        ssrc: Ssrc,
        capture_time: Instant,
        send_time: Instant,
        payload: Vec<u8>,
    ) -> Self {
        StoredPacket {
            seq_no,
            ssrc,
            capture_time,
            send_time,
            size: DataSize::from(payload.len()),
            payload,
            times_retransmitted: 0,
            last_retransmitted: None,
        }
    }
}

/// What a NACK resolved to: re-submit this to the pacer with Normal
/// priority and the retransmit flag set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retransmission {
    pub ssrc: Ssrc,
    pub seq_no: SeqNo,
    pub capture_time: Instant,
    pub size: DataSize,
}

/// Send-side packet history for one SSRC.
///
/// Keeps recently sent packets so NACKed sequence numbers can be
/// retransmitted. Entries are evicted by count and by age
/// (`max(1 s, 3 x RTT)`), and each packet honors a minimum interval of
/// `5 ms + RTT` between retransmits so a NACK burst cannot duplicate the
/// same packet on the wire.
#[derive(Debug)]
pub struct RtpPacketHistory {
    mode: StorageMode,
    capacity: usize,
    rtt: Duration,
    /// Keyed by extended sequence number.
    packets: BTreeMap<u64, StoredPacket>,
}

impl RtpPacketHistory {
    pub fn new(mode: StorageMode, capacity: usize) -> Self {
        RtpPacketHistory {
            mode,
            capacity,
            rtt: Duration::ZERO,
            packets: BTreeMap::new(),
        }
    }

    pub fn set_rtt(&mut self, rtt: Duration) {
        self.rtt = rtt;
    }

    /// Store a sent packet. No-op when disabled.
    pub fn put_packet(&mut self, packet: StoredPacket, now: Instant) {
        if self.mode == StorageMode::Disabled {
            return;
        }

        self.packets.insert(*packet.seq_no, packet);
        self.cull(now);
    }

    /// Look up a packet by sequence number, honoring the age limit.
    pub fn get_packet(&mut self, seq_no: SeqNo, now: Instant) -> Option<&StoredPacket> {
        self.cull(now);
        self.packets.get(&*seq_no)
    }

    /// Resolve a NACK list to the retransmissions that should be queued.
    ///
    /// Sequence numbers are the wire u16 values; they are extended against
    /// the newest stored packet. Packets inside their minimum retransmit
    /// interval are skipped silently.
    pub fn on_received_nack(
        &mut self,
        seqs: impl IntoIterator<Item = u16>,
        avg_rtt: Duration,
        now: Instant,
    ) -> Vec<Retransmission> {
        self.rtt = avg_rtt;
        self.cull(now);

        let newest = self.packets.keys().next_back().copied();
        let min_interval = MIN_RETRANSMIT_BASE + avg_rtt;

        let mut out = Vec::new();

        for seq in seqs {
            let ext = extend_u16(newest, seq);
            let Some(packet) = self.packets.get_mut(&ext) else {
                trace!("NACK for unknown or evicted seq {seq}");
                continue;
            };

            // The interval counts from the latest time the packet was on
            // the wire; a freshly sent packet may still be in flight.
            let last_on_wire = packet.last_retransmitted.unwrap_or(packet.send_time);
            if now.saturating_duration_since(last_on_wire) < min_interval {
                continue;
            }

            packet.last_retransmitted = Some(now);
            packet.times_retransmitted = packet.times_retransmitted.saturating_add(1);

            out.push(Retransmission {
                ssrc: packet.ssrc,
                seq_no: packet.seq_no,
                capture_time: packet.capture_time,
                size: packet.size,
            });
        }

        out
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    fn max_age(&self) -> Duration {
        MIN_PACKET_AGE.max(self.rtt * PACKET_AGE_RTT_FACTOR)
    }

    fn cull(&mut self, now: Instant) {
        let max_age = self.max_age();

        while let Some((&seq, oldest)) = self.packets.iter().next() {
            let too_old = now.saturating_duration_since(oldest.send_time) > max_age;
            let over_capacity = self.packets.len() > self.capacity;

            if too_old || over_capacity {
                self.packets.remove(&seq);
            } else {
                break;
            }
        }
    }
}
