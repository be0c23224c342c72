//! Minimal RTCP plumbing for the transport-wide feedback path.
//!
//! Only the parts needed to produce and consume Transport-Wide Congestion
//! Control feedback live here. Full RTCP (SR/RR/SDES/..) is the embedding
//! stack's concern.

use crate::Error;

mod twcc;
pub use twcc::{Delta, PacketChunk, PacketStatus, Twcc, TwccIter, TwccRecvRegister};

/// RTCP packet type for transport layer feedback messages (RTPFB).
pub const RTPFB: u8 = 205;

/// RTPFB feedback message type for transport-wide feedback.
pub const TRANSPORT_WIDE_CC: u8 = 15;

/// The common RTCP header.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|   FMT   |       PT      |             length            |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtcpHeader {
    pub has_padding: bool,
    /// Feedback message type (FMT) for feedback packets.
    pub fmt: u8,
    /// Packet type (PT).
    pub packet_type: u8,
    /// Packet length in 32-bit words, not counting the header word.
    pub words_less_one: u16,
}

impl RtcpHeader {
    /// Total packet length in bytes, including this header.
    pub fn length_bytes(&self) -> usize {
        (self.words_less_one as usize + 1) * 4
    }

    /// Whether this header announces a transport-wide feedback packet.
    pub fn is_transport_wide_feedback(&self) -> bool {
        self.packet_type == RTPFB && self.fmt == TRANSPORT_WIDE_CC
    }

    pub fn parse(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < 4 {
            return Err(Error::TooShort("rtcp header"));
        }

        let version = buf[0] >> 6;
        if version != 2 {
            return Err(Error::InvalidFeedback("rtcp version != 2"));
        }

        let header = RtcpHeader {
            has_padding: buf[0] & 0b0010_0000 != 0,
            fmt: buf[0] & 0b0001_1111,
            packet_type: buf[1],
            words_less_one: u16::from_be_bytes([buf[2], buf[3]]),
        };

        if buf.len() < header.length_bytes() {
            return Err(Error::TooShort("rtcp body"));
        }

        Ok(header)
    }

    pub(crate) fn write_to(&self, buf: &mut [u8]) {
        buf[0] = 0b10_0_00000 | (self.fmt & 0b0001_1111);
        if self.has_padding {
            buf[0] |= 0b0010_0000;
        }
        buf[1] = self.packet_type;
        buf[2..4].copy_from_slice(&self.words_less_one.to_be_bytes());
    }
}
