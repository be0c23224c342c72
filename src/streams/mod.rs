//! Per-stream send and receive helpers around the pacing core: the
//! retransmission history feeding the pacer on NACKs, and the receiver-side
//! NACK generator.

mod history;
mod nack;

pub use history::{Retransmission, RtpPacketHistory, StorageMode, StoredPacket};
pub use nack::{NackBatch, NackModule};
