//! Transport-Wide Congestion Control feedback wire format.
//!
//! The receiver records arrival times per transport-wide sequence number and
//! periodically emits a feedback packet describing a contiguous range of
//! sequence numbers: which arrived, which did not, and the arrival time
//! deltas in 250 microsecond units. The sender joins this against its send
//! records to drive bandwidth estimation.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use crate::rtp::{extend_u16, SeqNo, Ssrc};
use crate::Error;

use super::{RtcpHeader, RTPFB, TRANSPORT_WIDE_CC};

/// Max run length representable in a 13-bit run-length chunk.
const MAX_RUN: u16 = 8191;

/// Deltas are expressed in units of 250 microseconds.
const DELTA_UNIT_US: i64 = 250;

/// The reference time field is in units of 64 milliseconds.
const REF_TIME_UNIT_US: u64 = 64_000;

/// A parsed or under-construction transport-wide feedback packet.
#[derive(Clone, PartialEq, Eq)]
pub struct Twcc {
    /// Sender of this feedback. Part of the RTCP wire format, otherwise
    /// irrelevant here.
    pub sender_ssrc: Ssrc,
    /// Media source the feedback nominally belongs to.
    pub ssrc: Ssrc,
    /// First sequence number covered by this feedback.
    pub base_seq: u16,
    /// Number of reported statuses.
    pub status_count: u16,
    /// Arrival time of the first received packet, in 64 ms units from an
    /// arbitrary epoch chosen by the feedback sender. 24 bits on the wire.
    pub reference_time: u32,
    /// Increasing counter, for deduplication of feedback packets.
    pub feedback_count: u8,
    /// Status chunks covering `status_count` sequence numbers.
    pub chunks: VecDeque<PacketChunk>,
    /// One arrival delta per received status, in order.
    pub delta: VecDeque<Delta>,
}

/// Reception status for one sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketStatus {
    NotReceived = 0b00,
    ReceivedSmallDelta = 0b01,
    ReceivedLargeOrNegativeDelta = 0b10,
    Unknown = 0b11,
}

/// An arrival time delta, relative to the previous received packet (or the
/// reference time, for the first).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delta {
    /// 1 byte, 0..=63.75 ms in 250 us units.
    Small(u8),
    /// 2 bytes signed, for large or negative deltas.
    Large(i16),
}

/// One status chunk: either a run of identical statuses or a bit vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketChunk {
    /// 13-bit run length of one status.
    Run(PacketStatus, u16),
    /// 14 one-bit statuses (received-small-delta or not).
    VectorSingle(u16, u16),
    /// 7 two-bit statuses.
    VectorDouble(u16, u16),
}

impl Twcc {
    fn chunks_byte_len(&self) -> usize {
        self.chunks.len() * 2
    }

    fn delta_byte_len(&self) -> usize {
        self.delta.iter().map(|d| d.byte_len()).sum()
    }

    /// Total wire size in bytes including the RTCP header and padding.
    pub fn byte_len(&self) -> usize {
        // header + sender ssrc + ssrc + base/count + reftime/fbcount.
        let mut total = 20 + self.chunks_byte_len() + self.delta_byte_len();

        let pad = 4 - total % 4;
        if pad < 4 {
            total += pad;
        }

        total
    }

    fn header(&self) -> RtcpHeader {
        RtcpHeader {
            has_padding: false,
            fmt: TRANSPORT_WIDE_CC,
            packet_type: RTPFB,
            words_less_one: (self.byte_len() / 4 - 1) as u16,
        }
    }

    /// Serialize as a complete RTCP packet. Returns bytes written.
    ///
    /// The buffer must hold at least [`Twcc::byte_len`] bytes.
    pub fn write_to(&self, buf: &mut [u8]) -> usize {
        self.header().write_to(buf);

        buf[4..8].copy_from_slice(&self.sender_ssrc.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        buf[12..14].copy_from_slice(&self.base_seq.to_be_bytes());
        buf[14..16].copy_from_slice(&self.status_count.to_be_bytes());

        let ref_time = self.reference_time.to_be_bytes();
        buf[16..19].copy_from_slice(&ref_time[1..4]);
        buf[19] = self.feedback_count;

        let mut offset = 20;
        for c in &self.chunks {
            c.write_to(&mut buf[offset..]);
            offset += 2;
        }
        for d in &self.delta {
            offset += d.write_to(&mut buf[offset..]);
        }

        let pad = 4 - offset % 4;
        if pad < 4 {
            for i in 0..pad {
                buf[offset + i] = 0;
            }
            buf[offset + pad - 1] = pad as u8;
            offset += pad;
            // Toggle the padding bit.
            buf[0] |= 0b0010_0000;
        }

        offset
    }

    /// Parse the feedback body (the bytes after the 4-byte RTCP header).
    pub fn parse(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < 16 {
            return Err(Error::TooShort("twcc fixed fields"));
        }

        let sender_ssrc = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]).into();
        let ssrc = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]).into();
        let base_seq = u16::from_be_bytes([buf[8], buf[9]]);
        let status_count = u16::from_be_bytes([buf[10], buf[11]]);
        let reference_time = u32::from_be_bytes([0, buf[12], buf[13], buf[14]]);
        let feedback_count = buf[15];

        let mut twcc = Twcc {
            sender_ssrc,
            ssrc,
            base_seq,
            status_count,
            reference_time,
            feedback_count,
            chunks: VecDeque::new(),
            delta: VecDeque::new(),
        };

        let mut todo = status_count as isize;
        let mut buf = &buf[16..];
        while todo > 0 {
            let chunk = PacketChunk::parse(buf)?;
            todo -= chunk.max_status_count() as isize;
            twcc.chunks.push_back(chunk);
            buf = &buf[2..];
        }

        for c in &twcc.chunks {
            buf = c.parse_deltas(buf, &mut twcc.delta)?;
        }

        Ok(twcc)
    }

    /// Iterate over the reported sequence numbers with absolute arrival
    /// instants.
    ///
    /// `time_zero` anchors the feedback sender's arbitrary epoch onto the
    /// local timeline; `extend_from` seeds the 16 -> 64 bit unwrap of
    /// `base_seq`.
    pub fn into_iter(self, time_zero: Instant, extend_from: SeqNo) -> TwccIter {
        let offset = Duration::from_micros(self.reference_time as u64 * REF_TIME_UNIT_US);
        let base_seq = extend_u16(Some(*extend_from), self.base_seq);

        TwccIter {
            base_seq,
            last_seq: base_seq + self.status_count as u64,
            time_base: time_zero + offset,
            index: 0,
            twcc: self,
        }
    }
}

/// Iterator over `(seq, status, arrival)` triples of a [`Twcc`].
pub struct TwccIter {
    base_seq: u64,
    last_seq: u64,
    time_base: Instant,
    index: usize,
    twcc: Twcc,
}

impl Iterator for TwccIter {
    type Item = (SeqNo, PacketStatus, Option<Instant>);

    fn next(&mut self) -> Option<Self::Item> {
        let seq: SeqNo = (self.base_seq + self.index as u64).into();

        if *seq == self.last_seq {
            return None;
        }

        let head = self.twcc.chunks.front()?;

        let (status, amount) = match head {
            PacketChunk::Run(s, n) => {
                use PacketStatus::*;
                let status = match s {
                    NotReceived | Unknown => NotReceived,
                    ReceivedSmallDelta => ReceivedSmallDelta,
                    ReceivedLargeOrNegativeDelta => ReceivedLargeOrNegativeDelta,
                };
                (status, *n)
            }
            PacketChunk::VectorSingle(v, n) => {
                let status = if (1 << (13 - self.index)) & v > 0 {
                    PacketStatus::ReceivedSmallDelta
                } else {
                    PacketStatus::NotReceived
                };
                (status, *n)
            }
            PacketChunk::VectorDouble(v, n) => {
                let e = ((v >> (12 - self.index * 2)) & 0b11) as u8;
                (PacketStatus::from(e), *n)
            }
        };

        let instant = match status {
            PacketStatus::NotReceived => None,
            PacketStatus::ReceivedSmallDelta => match self.twcc.delta.pop_front()? {
                Delta::Small(v) => {
                    Some(self.time_base + Duration::from_micros(DELTA_UNIT_US as u64 * v as u64))
                }
                Delta::Large(_) => return None,
            },
            PacketStatus::ReceivedLargeOrNegativeDelta => match self.twcc.delta.pop_front()? {
                Delta::Small(_) => return None,
                Delta::Large(v) => {
                    let dur = Duration::from_micros((DELTA_UNIT_US * v.unsigned_abs() as i64) as u64);
                    if v < 0 {
                        self.time_base.checked_sub(dur)
                    } else {
                        Some(self.time_base + dur)
                    }
                }
            },
            PacketStatus::Unknown => None,
        };

        // Each delta is relative to the previous arrival.
        if let Some(new_base) = instant {
            self.time_base = new_base;
        }

        self.index += 1;
        if self.index == amount as usize {
            self.twcc.chunks.pop_front();
            self.base_seq = *seq + 1;
            self.index = 0;
        }

        Some((seq, status, instant))
    }
}

impl PacketChunk {
    fn parse(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < 2 {
            return Err(Error::TooShort("status chunk"));
        }

        let x = u16::from_be_bytes([buf[0], buf[1]]);
        let is_vector = x & 0b1000_0000_0000_0000 > 0;

        let chunk = if is_vector {
            let is_double = x & 0b0100_0000_0000_0000 > 0;
            let bits = x & 0b0011_1111_1111_1111;
            if is_double {
                PacketChunk::VectorDouble(bits, 7)
            } else {
                PacketChunk::VectorSingle(bits, 14)
            }
        } else {
            let status: PacketStatus = ((x >> 13) as u8).into();
            let n = x & 0b0001_1111_1111_1111;
            PacketChunk::Run(status, n)
        };

        Ok(chunk)
    }

    fn parse_deltas<'b>(
        &self,
        mut buf: &'b [u8],
        out: &mut VecDeque<Delta>,
    ) -> Result<&'b [u8], Error> {
        fn small<'b>(buf: &'b [u8], n: usize, out: &mut VecDeque<Delta>) -> Result<&'b [u8], Error> {
            if buf.len() < n {
                return Err(Error::TooShort("small deltas"));
            }
            out.extend((0..n).map(|i| Delta::Small(buf[i])));
            Ok(&buf[n..])
        }

        fn large<'b>(buf: &'b [u8], n: usize, out: &mut VecDeque<Delta>) -> Result<&'b [u8], Error> {
            if buf.len() < n * 2 {
                return Err(Error::TooShort("large deltas"));
            }
            out.extend(
                (0..n * 2)
                    .step_by(2)
                    .map(|i| Delta::Large(i16::from_be_bytes([buf[i], buf[i + 1]]))),
            );
            Ok(&buf[n * 2..])
        }

        match self {
            PacketChunk::Run(PacketStatus::ReceivedSmallDelta, n) => {
                buf = small(buf, *n as usize, out)?;
            }
            PacketChunk::Run(PacketStatus::ReceivedLargeOrNegativeDelta, n) => {
                buf = large(buf, *n as usize, out)?;
            }
            PacketChunk::VectorSingle(v, _) => {
                buf = small(buf, v.count_ones() as usize, out)?;
            }
            PacketChunk::VectorDouble(v, _) => {
                for shift in (0..=12).step_by(2) {
                    let status = PacketStatus::from(((*v >> (12 - shift)) & 0b11) as u8);
                    match status {
                        PacketStatus::ReceivedSmallDelta => {
                            buf = small(buf, 1, out)?;
                        }
                        PacketStatus::ReceivedLargeOrNegativeDelta => {
                            buf = large(buf, 1, out)?;
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }

        Ok(buf)
    }

    fn max_status_count(&self) -> usize {
        match self {
            PacketChunk::Run(_, n) => *n as usize,
            PacketChunk::VectorSingle(_, _) => 14,
            PacketChunk::VectorDouble(_, _) => 7,
        }
    }

    fn write_to(&self, buf: &mut [u8]) {
        let x = match self {
            // |T| S |       Run Length        |  T=0
            PacketChunk::Run(s, n) => {
                debug_assert!(*n <= MAX_RUN);
                ((*s as u16) << 13) | n
            }
            // |T|S|       symbol list         |  T=1, S=0: 14 one-bit symbols
            PacketChunk::VectorSingle(bits, fill) => {
                debug_assert!(*fill == 14);
                (1 << 15) | *bits
            }
            // T=1, S=1: 7 two-bit symbols
            PacketChunk::VectorDouble(bits, fill) => {
                debug_assert!(*fill == 7);
                (1 << 15) | (1 << 14) | *bits
            }
        };
        buf[..2].copy_from_slice(&x.to_be_bytes());
    }
}

impl Delta {
    fn write_to(&self, buf: &mut [u8]) -> usize {
        match self {
            Delta::Small(v) => {
                buf[0] = *v;
                1
            }
            Delta::Large(v) => {
                buf[..2].copy_from_slice(&v.to_be_bytes());
                2
            }
        }
    }

    fn byte_len(&self) -> usize {
        match self {
            Delta::Small(_) => 1,
            Delta::Large(_) => 2,
        }
    }
}

impl From<u8> for PacketStatus {
    fn from(v: u8) -> Self {
        match v {
            0b00 => Self::NotReceived,
            0b01 => Self::ReceivedSmallDelta,
            0b10 => Self::ReceivedLargeOrNegativeDelta,
            _ => Self::Unknown,
        }
    }
}

/// Receiver-side register producing [`Twcc`] feedback from observed packet
/// arrivals.
#[derive(Debug)]
pub struct TwccRecvRegister {
    /// How many reported packets to keep around. Out-of-order arrivals can
    /// force the next report to go "backwards" in base_seq.
    keep_reported: usize,

    /// Arrivals, ordered by sequence number.
    queue: VecDeque<Arrival>,

    /// Index into `queue` from where the next report starts.
    report_from: usize,

    /// The point in time we consider 0 for reference times. Set on the first
    /// built report.
    time_start: Option<Instant>,

    /// Counts generated reports, for the feedback_count field.
    generated_reports: u64,

    /// Interval loss accounting.
    loss_counter: LossCounter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Arrival {
    seq: SeqNo,
    time: Instant,
}

/// One unreported arrival resolved against the report timeline: its status
/// and arrival delta in 250 us ticks relative to the previous reported
/// packet. Missing sequence numbers are implicit in the seq jumps between
/// consecutive marks.
#[derive(Debug, Clone, Copy)]
struct Mark {
    seq: SeqNo,
    status: PacketStatus,
    ticks: i16,
}

impl Mark {
    fn delta(&self) -> Delta {
        match self.status {
            PacketStatus::ReceivedSmallDelta => Delta::Small(self.ticks as u8),
            PacketStatus::ReceivedLargeOrNegativeDelta => Delta::Large(self.ticks),
            _ => unreachable!("marks are always received"),
        }
    }
}

/// Interval loss per RFC 3550 appendix A, applied to the transport-wide
/// sequence space rather than a single stream.
#[derive(Debug, Default)]
struct LossCounter {
    first_seq: Option<SeqNo>,
    highest_seq: Option<SeqNo>,
    received_total: u64,
    /// (expected, received) snapshot taken at the previous poll.
    prior: (u64, u64),
}

impl LossCounter {
    fn on_arrival(&mut self, seq: SeqNo) {
        self.first_seq.get_or_insert(seq);
        self.highest_seq = self.highest_seq.max(Some(seq));
        self.received_total += 1;
    }

    /// Loss fraction since the previous poll.
    fn poll(&mut self) -> Option<f32> {
        let expected = *self.highest_seq? - *self.first_seq? + 1;

        let (expected_prior, received_prior) = self.prior;
        self.prior = (expected, self.received_total);

        let expected_delta = expected - expected_prior;
        let received_delta = self.received_total - received_prior;

        (expected_delta != 0).then(|| {
            expected_delta.saturating_sub(received_delta) as f32 / expected_delta as f32
        })
    }
}

impl TwccRecvRegister {
    pub fn new(keep_reported: usize) -> Self {
        TwccRecvRegister {
            keep_reported,
            queue: VecDeque::new(),
            report_from: 0,
            time_start: None,
            generated_reports: 0,
            loss_counter: LossCounter::default(),
        }
    }

    /// The highest sequence number seen so far.
    pub fn max_seq(&self) -> SeqNo {
        self.queue.back().map(|r| r.seq).unwrap_or_else(|| 0.into())
    }

    /// Record the arrival of a packet.
    pub fn update_seq(&mut self, seq: SeqNo, time: Instant) {
        self.loss_counter.on_arrival(seq);

        match self.queue.binary_search_by_key(&seq, |r| r.seq) {
            Ok(_) => {
                // Duplicate sequence number. The sender reused a transport
                // seq, ignore.
            }
            Err(idx) => {
                if let Some(time_start) = self.time_start {
                    // Reference times cannot go backwards more than 8192 ms
                    // from our chosen zero. Drop such arrivals.
                    if time < time_start
                        && time_start - time >= Duration::from_millis(8192)
                    {
                        return;
                    }
                }

                self.queue.insert(idx, Arrival { seq, time });

                if idx < self.report_from {
                    self.report_from = idx;
                }
            }
        }
    }

    /// Build the next feedback packet covering unreported arrivals, bounded
    /// by `max_byte_size` on the wire.
    pub fn build_report(&mut self, max_byte_size: usize) -> Option<Twcc> {
        if max_byte_size > 10_000 {
            warn!("Refusing to build oversized TWCC report");
            return None;
        }

        let first = *self.queue.get(self.report_from)?;
        let time_start = *self.time_start.get_or_insert(first.time);

        // The reference time truncates to 64 ms steps; the first delta then
        // bridges the truncation at 250 us resolution.
        let first_time_rel = first.time.saturating_duration_since(time_start);
        let reference_time = (first_time_rel.as_micros() as u64 / REF_TIME_UNIT_US) as u32;
        let base_time = time_start + Duration::from_micros(reference_time as u64 * REF_TIME_UNIT_US);

        let marks = self.collect_marks(base_time);

        let mut twcc = Twcc {
            sender_ssrc: 0.into(),
            ssrc: 0.into(),
            feedback_count: self.generated_reports as u8,
            base_seq: first.seq.as_u16(),
            reference_time,
            status_count: 0,
            chunks: VecDeque::new(),
            delta: VecDeque::new(),
        };

        // 20 bytes of fixed fields, up to 3 bytes of trailing padding.
        let budget = max_byte_size.saturating_sub(20 + 3);
        let reported = encode_status_chunks(&marks, first.seq, budget, &mut twcc);

        // Peers refuse feedback without at least one chunk.
        if twcc.chunks.is_empty() {
            return None;
        }

        self.report_from += reported;
        self.generated_reports += 1;

        if self.report_from > self.keep_reported {
            let to_remove = self.report_from - self.keep_reported;
            self.queue.drain(..to_remove);
            self.report_from -= to_remove;
        }

        Some(twcc)
    }

    /// Whether arrivals are waiting to be reported.
    pub fn has_unreported(&self) -> bool {
        self.queue.len() > self.report_from
    }

    /// Fraction of packets lost since the last call.
    ///
    /// To get periodic stats, call at fixed intervals.
    pub fn loss(&mut self) -> Option<f32> {
        self.loss_counter.poll()
    }

    /// Resolve the unreported arrivals into [`Mark`]s on the report
    /// timeline.
    ///
    /// Stops at the first delta the wire format cannot represent; the next
    /// report then starts a fresh timeline from that packet.
    fn collect_marks(&self, base_time: Instant) -> Vec<Mark> {
        let mut marks = Vec::with_capacity(self.queue.len() - self.report_from);
        let mut prev_time = base_time;

        for arrival in self.queue.iter().skip(self.report_from) {
            let delta_us = if arrival.time >= prev_time {
                (arrival.time - prev_time).as_micros() as i64
            } else {
                -((prev_time - arrival.time).as_micros() as i64)
            };

            let ticks = delta_us / DELTA_UNIT_US;
            if !(i16::MIN as i64..=i16::MAX as i64).contains(&ticks) {
                break;
            }

            let status = if (0..=u8::MAX as i64).contains(&ticks) {
                PacketStatus::ReceivedSmallDelta
            } else {
                PacketStatus::ReceivedLargeOrNegativeDelta
            };

            marks.push(Mark {
                seq: arrival.seq,
                status,
                ticks: ticks as i16,
            });
            prev_time = arrival.time;
        }

        marks
    }
}

/// One-bit statuses per vector chunk.
const SINGLE_SLOTS: u64 = 14;

/// Two-bit statuses per vector chunk.
const DOUBLE_SLOTS: u64 = 7;

/// Encode marks into status chunks and deltas, spending at most `budget`
/// bytes. Returns how many marks were reported.
///
/// The encoder walks the sequence space from `base_seq` with a cursor.
/// At each position it measures the uniform stretch ahead: stretches a
/// vector could not hold become run-length chunks, everything else is
/// packed into bit vectors (one-bit when the window is free of large
/// deltas, two-bit otherwise). The report never extends past the last
/// received packet; vector chunks ending there pad with zero bits that
/// don't count toward `status_count`.
fn encode_status_chunks(
    marks: &[Mark],
    base_seq: SeqNo,
    mut budget: usize,
    twcc: &mut Twcc,
) -> usize {
    let Some(last) = marks.last() else {
        return 0;
    };
    let last_seq = *last.seq;

    let mut cursor = *base_seq;
    let mut idx = 0;

    while idx < marks.len() {
        // Slots left until the final mark, inclusive.
        let remaining = last_seq - cursor + 1;

        let (status, run_len) = uniform_run(marks, idx, cursor);

        // A run chunk wins once the stretch outgrows the densest vector
        // that could hold its status, or when it covers the whole rest of
        // the report.
        let vector_capacity = if status == PacketStatus::ReceivedLargeOrNegativeDelta {
            DOUBLE_SLOTS
        } else {
            SINGLE_SLOTS
        };

        let (chunk, covered) = if run_len >= vector_capacity || run_len == remaining {
            let n = run_len.min(MAX_RUN as u64);
            (PacketChunk::Run(status, n as u16), n)
        } else {
            vector_chunk(marks, idx, cursor, remaining)
        };

        // Marks falling inside this chunk contribute their deltas.
        let consumed = marks[idx..]
            .iter()
            .take_while(|m| *m.seq < cursor + covered)
            .count();
        let delta_bytes: usize = marks[idx..idx + consumed]
            .iter()
            .map(|m| m.delta().byte_len())
            .sum();

        let cost = 2 + delta_bytes;
        if cost > budget || twcc.status_count as u64 + covered > u16::MAX as u64 {
            break;
        }
        budget -= cost;

        twcc.chunks.push_back(chunk);
        twcc.delta
            .extend(marks[idx..idx + consumed].iter().map(Mark::delta));
        twcc.status_count += covered as u16;

        cursor += covered;
        idx += consumed;
    }

    idx
}

/// The status at `cursor` and the length of the uniform stretch starting
/// there: either the gap up to the next mark, or the consecutive marks
/// sharing one status.
fn uniform_run(marks: &[Mark], idx: usize, cursor: u64) -> (PacketStatus, u64) {
    let next = &marks[idx];

    if cursor < *next.seq {
        return (PacketStatus::NotReceived, *next.seq - cursor);
    }

    let status = next.status;
    let mut len = 1_u64;
    while let Some(m) = marks.get(idx + len as usize) {
        if *m.seq != cursor + len || m.status != status {
            break;
        }
        len += 1;
    }

    (status, len)
}

/// Pack one vector chunk worth of slots starting at `cursor`.
fn vector_chunk(marks: &[Mark], idx: usize, cursor: u64, remaining: u64) -> (PacketChunk, u64) {
    // Statuses for the next 14 slots; anything past the last mark stays
    // missing and only pads the chunk.
    let mut slots = [PacketStatus::NotReceived; SINGLE_SLOTS as usize];
    let mut scan = idx;
    for (i, slot) in slots.iter_mut().enumerate() {
        if i as u64 >= remaining {
            break;
        }
        if let Some(m) = marks.get(scan) {
            if *m.seq == cursor + i as u64 {
                *slot = m.status;
                scan += 1;
            }
        }
    }

    let window = remaining.min(SINGLE_SLOTS) as usize;
    let one_bit_fits = slots[..window]
        .iter()
        .all(|s| *s != PacketStatus::ReceivedLargeOrNegativeDelta);

    if one_bit_fits {
        let covered = remaining.min(SINGLE_SLOTS);
        let mut bits = 0_u16;
        for (i, slot) in slots.iter().enumerate().take(covered as usize) {
            if *slot == PacketStatus::ReceivedSmallDelta {
                bits |= 1 << (13 - i);
            }
        }
        (PacketChunk::VectorSingle(bits, SINGLE_SLOTS as u16), covered)
    } else {
        let covered = remaining.min(DOUBLE_SLOTS);
        let mut bits = 0_u16;
        for slot in slots.iter().take(DOUBLE_SLOTS as usize) {
            bits = (bits << 2) | (*slot as u16);
        }
        (PacketChunk::VectorDouble(bits, DOUBLE_SLOTS as u16), covered)
    }
}

impl fmt::Debug for Twcc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Twcc")
            .field("base_seq", &self.base_seq)
            .field("status_count", &self.status_count)
            .field("reference_time", &self.reference_time)
            .field("feedback_count", &self.feedback_count)
            .field("chunks", &self.chunks)
            .field("delta", &self.delta.len())
            .finish()
    }
}
