//! Join transport-wide feedback with send records.
//!
//! The adapter keeps a sliding window of packets we sent, keyed by the
//! transport-wide sequence number, and resolves incoming TWCC feedback
//! against it. The result is an ordered vector of [`PacketFeedback`] that
//! drives the bandwidth estimator, plus the outstanding-bytes accounting the
//! congestion window needs.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::pacer::PacedPacketInfo;
use crate::rtcp::{RtcpHeader, Twcc};
use crate::rtp::{DataSize, SeqNo, Ssrc};
use crate::Error;

/// Send records older than this are evicted.
const WINDOW_DURATION: Duration = Duration::from_secs(60);

/// Hard cap on send records kept.
const MAX_WINDOW_PACKETS: usize = 10_000;

/// A packet released by the pacer, tracked until feedback covers it.
#[derive(Debug, Clone)]
pub struct SentPacket {
    pub transport_seq: SeqNo,
    pub ssrc: Ssrc,
    pub size: DataSize,
    /// When the packet was handed to the pacer.
    pub creation_time: Instant,
    /// When the packet actually went out on the wire. `None` until
    /// [`TransportFeedbackAdapter::on_sent_packet`].
    pub send_time: Option<Instant>,
    pub pacing_info: PacedPacketInfo,
    pub is_retransmit: bool,
    pub is_padding: bool,
    pub is_audio: bool,
    /// Set once feedback has covered this packet (received or lost).
    pub acknowledged: bool,
    /// Arrival time reported by the remote, if it was received.
    pub remote_recv_time: Option<Instant>,
    /// Local time the covering feedback arrived.
    pub feedback_time: Option<Instant>,
}

/// One send record joined with its feedback status.
#[derive(Debug, Clone, Copy)]
pub struct PacketFeedback {
    pub transport_seq: SeqNo,
    pub size: DataSize,
    pub send_time: Instant,
    /// `None` means the remote reported the packet as not received.
    pub remote_recv_time: Option<Instant>,
    /// Local time the feedback arrived. Send-to-feedback time bounds RTT.
    pub local_recv_time: Instant,
    pub pacing_info: PacedPacketInfo,
}

impl PacketFeedback {
    pub fn received(&self) -> bool {
        self.remote_recv_time.is_some()
    }
}

/// Maps sent packet ids to feedback arrival reports.
///
/// Carries its own lock: the send path registers packets while the network
/// receive context resolves feedback.
#[derive(Debug)]
pub struct TransportFeedbackAdapter {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    window: BTreeMap<u64, SentPacket>,
    /// Highest transport seq handed out, seeds base_seq unwrapping.
    next_seq: SeqNo,
    /// Anchors the feedback sender's reference times on the local timeline.
    time_zero: Option<Instant>,
    /// Bytes sent but not yet covered by feedback.
    outstanding: DataSize,
}

impl TransportFeedbackAdapter {
    pub fn new() -> Self {
        TransportFeedbackAdapter {
            inner: Mutex::new(Inner {
                window: BTreeMap::new(),
                next_seq: SeqNo::default(),
                time_zero: None,
                outstanding: DataSize::ZERO,
            }),
        }
    }

    /// Allocate the next transport-wide sequence number.
    pub fn allocate_seq(&self) -> SeqNo {
        let mut inner = self.inner.lock().unwrap();
        inner.next_seq.inc()
    }

    /// Register a packet about to be sent.
    #[allow(clippy::too_many_arguments)]
    pub fn add_packet(
        &self,
        ssrc: Ssrc,
        transport_seq: SeqNo,
        size: DataSize,
        pacing_info: PacedPacketInfo,
        is_retransmit: bool,
        is_padding: bool,
        is_audio: bool,
        creation_time: Instant,
    ) {
        let mut inner = self.inner.lock().unwrap();

        if *transport_seq >= *inner.next_seq {
            inner.next_seq = (*transport_seq + 1).into();
        }

        let prev = inner.window.insert(
            *transport_seq,
            SentPacket {
                transport_seq,
                ssrc,
                size,
                creation_time,
                send_time: None,
                pacing_info,
                is_retransmit,
                is_padding,
                is_audio,
                acknowledged: false,
                remote_recv_time: None,
                feedback_time: None,
            },
        );

        if prev.is_some() {
            warn!("Duplicate transport seq registered: {}", transport_seq);
        }

        inner.evict(creation_time);
    }

    /// Record the wire send time for a registered packet.
    pub fn on_sent_packet(&self, transport_seq: SeqNo, send_time: Instant) {
        let mut inner = self.inner.lock().unwrap();

        let Some(entry) = inner.window.get_mut(&*transport_seq) else {
            trace!("Send time for unknown transport seq: {}", transport_seq);
            return;
        };

        if entry.send_time.is_none() {
            entry.send_time = Some(send_time);
            let size = entry.size;
            inner.outstanding += size;
        }

        inner.evict(send_time);
    }

    /// Resolve an incoming RTCP packet.
    ///
    /// Transport-wide feedback (RTPFB fmt 15) is joined against the send
    /// window; any other RTCP type yields an empty vector. Malformed
    /// feedback returns an error without mutating state.
    pub fn incoming_rtcp(&self, bytes: &[u8], now: Instant) -> Result<Vec<PacketFeedback>, Error> {
        let header = RtcpHeader::parse(bytes)?;

        if !header.is_transport_wide_feedback() {
            trace!("Ignoring non-TWCC rtcp, pt={}", header.packet_type);
            return Ok(Vec::new());
        }

        let twcc = Twcc::parse(&bytes[4..header.length_bytes()])?;

        Ok(self.process_feedback(twcc, now))
    }

    /// Join a parsed feedback packet against the send window.
    ///
    /// The result is sorted by `(arrival_time, send_time, sequence)`, losses
    /// last. Packets never sent or already evicted are logged and skipped;
    /// already-processed packets are ignored.
    pub fn process_feedback(&self, twcc: Twcc, now: Instant) -> Vec<PacketFeedback> {
        let mut inner = self.inner.lock().unwrap();

        let time_zero = *inner.time_zero.get_or_insert(now);
        let extend_from = inner.next_seq;

        let mut out = Vec::with_capacity(twcc.status_count as usize);

        for (seq, _status, arrival) in twcc.into_iter(time_zero, extend_from) {
            let Some(entry) = inner.window.get_mut(&*seq) else {
                trace!("Feedback for unknown transport seq: {}", seq);
                continue;
            };

            let Some(send_time) = entry.send_time else {
                warn!("Feedback for never-sent transport seq: {}", seq);
                continue;
            };

            if entry.acknowledged {
                // Out-of-order feedback revisiting an older base seq.
                continue;
            }

            entry.acknowledged = true;
            entry.remote_recv_time = arrival;
            entry.feedback_time = Some(now);

            let size = entry.size;
            let pacing_info = entry.pacing_info;
            inner.outstanding -= size;

            out.push(PacketFeedback {
                transport_seq: seq,
                size,
                send_time,
                remote_recv_time: arrival,
                local_recv_time: now,
                pacing_info,
            });
        }

        out.sort_by(|a, b| {
            let arrival = match (a.remote_recv_time, b.remote_recv_time) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            };
            arrival
                .then(a.send_time.cmp(&b.send_time))
                .then(a.transport_seq.cmp(&b.transport_seq))
        });

        out
    }

    /// Bytes sent but not yet covered by feedback.
    pub fn outstanding_data(&self) -> DataSize {
        self.inner.lock().unwrap().outstanding
    }

    /// Egress loss ratio over a trailing window of send times.
    ///
    /// Only considers packets that feedback has covered: if the feedback
    /// packets themselves are lost we'd otherwise report phantom loss.
    pub fn loss(&self, window: Duration, now: Instant) -> Option<f32> {
        let inner = self.inner.lock().unwrap();
        let lower_bound = now.checked_sub(window)?;

        let mut total = 0_u64;
        let mut lost = 0_u64;

        for p in inner.window.values().rev() {
            if !p.acknowledged {
                continue;
            }
            let Some(send_time) = p.send_time else {
                continue;
            };
            if send_time < lower_bound {
                break;
            }
            total += 1;
            lost += u64::from(p.remote_recv_time.is_none());
        }

        (total > 0).then_some(lost as f32 / total as f32)
    }

    /// RTT of the most recently acknowledged packet, as the time from wire
    /// send to feedback arrival.
    pub fn rtt(&self) -> Option<Duration> {
        let inner = self.inner.lock().unwrap();

        inner.window.values().rev().find_map(|p| {
            let feedback = p.feedback_time?;
            let sent = p.send_time?;
            Some(feedback.saturating_duration_since(sent))
        })
    }
}

impl Inner {
    fn evict(&mut self, now: Instant) {
        while self.window.len() > MAX_WINDOW_PACKETS {
            self.pop_oldest();
        }

        loop {
            let Some((_, oldest)) = self.window.iter().next() else {
                break;
            };
            if now.saturating_duration_since(oldest.creation_time) <= WINDOW_DURATION {
                break;
            }
            self.pop_oldest();
        }
    }

    fn pop_oldest(&mut self) {
        let Some((&seq, _)) = self.window.iter().next() else {
            return;
        };
        let entry = self.window.remove(&seq).expect("entry present");

        // Evicted in-flight packets must not leak outstanding bytes.
        if entry.send_time.is_some() && !entry.acknowledged {
            self.outstanding -= entry.size;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::rtcp::TwccRecvRegister;

    fn register_sent(adapter: &TransportFeedbackAdapter, seq: u64, size: i64, at: Instant) {
        adapter.add_packet(
            1.into(),
            seq.into(),
            DataSize::bytes(size),
            PacedPacketInfo::default(),
            false,
            false,
            false,
            at,
        );
        adapter.on_sent_packet(seq.into(), at);
    }

    #[test]
    fn outstanding_tracks_unacked_sends() {
        let adapter = TransportFeedbackAdapter::new();
        let now = Instant::now();

        register_sent(&adapter, 0, 1000, now);
        register_sent(&adapter, 1, 500, now + Duration::from_millis(1));

        assert_eq!(adapter.outstanding_data(), DataSize::bytes(1500));

        // Receiver observed only seq 0.
        let mut recv = TwccRecvRegister::new(100);
        recv.update_seq(0.into(), now + Duration::from_millis(30));
        let twcc = recv.build_report(1000).unwrap();

        let feedback = adapter.process_feedback(twcc, now + Duration::from_millis(60));
        assert_eq!(feedback.len(), 1);
        assert!(feedback[0].received());
        assert_eq!(adapter.outstanding_data(), DataSize::bytes(500));
    }

    #[test]
    fn losses_are_reported_and_sorted_last() {
        let adapter = TransportFeedbackAdapter::new();
        let now = Instant::now();

        for seq in 0..4_u64 {
            register_sent(&adapter, seq, 1200, now + Duration::from_millis(seq));
        }

        let mut recv = TwccRecvRegister::new(100);
        recv.update_seq(0.into(), now + Duration::from_millis(20));
        recv.update_seq(1.into(), now + Duration::from_millis(25));
        // 2 lost.
        recv.update_seq(3.into(), now + Duration::from_millis(31));
        let twcc = recv.build_report(1000).unwrap();

        let feedback = adapter.process_feedback(twcc, now + Duration::from_millis(50));

        assert_eq!(feedback.len(), 4);
        assert!(feedback[..3].iter().all(|f| f.received()));
        assert!(!feedback[3].received());
        assert_eq!(*feedback[3].transport_seq, 2);
    }

    #[test]
    fn repeated_feedback_is_ignored() {
        let adapter = TransportFeedbackAdapter::new();
        let now = Instant::now();

        register_sent(&adapter, 0, 1000, now);

        let mut recv = TwccRecvRegister::new(100);
        recv.update_seq(0.into(), now + Duration::from_millis(10));
        let twcc = recv.build_report(1000).unwrap();

        let first = adapter.process_feedback(twcc.clone(), now + Duration::from_millis(20));
        assert_eq!(first.len(), 1);

        let second = adapter.process_feedback(twcc, now + Duration::from_millis(40));
        assert!(second.is_empty());
        assert_eq!(adapter.outstanding_data(), DataSize::ZERO);
    }

    #[test]
    fn unknown_seqs_are_skipped() {
        let adapter = TransportFeedbackAdapter::new();
        let now = Instant::now();

        let mut recv = TwccRecvRegister::new(100);
        recv.update_seq(7.into(), now);
        let twcc = recv.build_report(1000).unwrap();

        let feedback = adapter.process_feedback(twcc, now + Duration::from_millis(10));
        assert!(feedback.is_empty());
    }

    #[test]
    fn loss_and_rtt_derivation() {
        let adapter = TransportFeedbackAdapter::new();
        let now = Instant::now();

        for seq in 0..10_u64 {
            register_sent(&adapter, seq, 1000, now + Duration::from_millis(seq));
        }

        let mut recv = TwccRecvRegister::new(100);
        for seq in 0..10_u64 {
            if seq == 4 {
                continue;
            }
            recv.update_seq(seq.into(), now + Duration::from_millis(40 + seq));
        }
        let twcc = recv.build_report(1000).unwrap();
        let feedback_at = now + Duration::from_millis(80);
        adapter.process_feedback(twcc, feedback_at);

        let loss = adapter.loss(Duration::from_secs(1), feedback_at).unwrap();
        assert!((loss - 0.1).abs() < 1e-6);

        // RTT from last sent packet (9, at +9ms) to feedback (+80ms).
        assert_eq!(adapter.rtt(), Some(Duration::from_millis(71)));
    }

    #[test]
    fn capacity_eviction_keeps_outstanding_consistent() {
        let adapter = TransportFeedbackAdapter::new();
        let now = Instant::now();

        for seq in 0..(MAX_WINDOW_PACKETS as u64 + 10) {
            register_sent(&adapter, seq, 100, now + Duration::from_micros(seq));
        }

        // 10 oldest were evicted; their bytes must not linger.
        assert_eq!(
            adapter.outstanding_data(),
            DataSize::bytes(MAX_WINDOW_PACKETS as i64 * 100)
        );
    }

    #[test]
    fn non_twcc_rtcp_is_ignored() {
        let adapter = TransportFeedbackAdapter::new();
        // A receiver report (PT 201), structurally valid header.
        let mut buf = vec![0_u8; 8];
        buf[0] = 0b10_0_00001;
        buf[1] = 201;
        buf[2..4].copy_from_slice(&1_u16.to_be_bytes());

        let out = adapter.incoming_rtcp(&buf, Instant::now()).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn malformed_rtcp_is_an_error() {
        let adapter = TransportFeedbackAdapter::new();
        assert!(adapter.incoming_rtcp(&[0x80], Instant::now()).is_err());
    }
}
