//! Send-side bandwidth estimation and pacing core for real-time media
//! transport.
//!
//! This crate implements the feedback control loop that makes a WebRTC-style
//! media stack work: a delay-gradient bandwidth estimator driven by
//! transport-wide congestion control (TWCC) feedback, a leaky-bucket pacer
//! with probe-cluster support, and the retransmission path that feeds the
//! pacer from a send-side packet history.
//!
//! The crate is sans-IO: nothing here opens sockets or spawns threads. The
//! embedding application drives the components with `Instant`-stamped calls
//! and owns the actual transport. The data flow is:
//!
//! ```text
//! encoder -> PacedSender::insert_packet
//!              |  (on process tick, gated by IntervalBudget / BitrateProber)
//!              v
//!         PacketTransport::send  ->  network  ->  peer
//!                                                   |
//!             TWCC RTCP feedback  <-----------------+
//!                    |
//!                    v
//!         TransportFeedbackAdapter (send window join)
//!                    |
//!                    v
//!         SendSideBandwidthEstimator (delay-based min loss-based)
//!                    |
//!                    v
//!         PacedSender::set_pacing_rates / encoder target
//! ```
//!
//! Two components carry internal locks because they are touched from more
//! than one context ([`PacedSender`][pacer::PacedSender] and
//! [`TransportFeedbackAdapter`][feedback::TransportFeedbackAdapter]); the
//! estimators are single-context and lock free.

#![forbid(unsafe_code)]
#![allow(clippy::new_without_default)]

#[macro_use]
extern crate tracing;

use thiserror::Error;

#[macro_use]
mod macros;

mod config;
mod util;

pub mod bwe;
pub mod controller;
pub mod feedback;
pub mod pacer;
pub mod rtcp;
pub mod rtp;
pub mod streams;

pub use config::Config;
pub use controller::SendSideController;
pub use rtp::{Bitrate, DataSize, SeqNo, Ssrc};

/// Errors surfaced by this crate.
///
/// Per the error design, only boundary parsing is fallible. "Not enough
/// samples", "budget exhausted" and "transport refused the packet" are all
/// modelled as `Option`/`bool` returns on the respective components; they
/// are expected operating conditions, not errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The RTCP input was shorter than its headers claim.
    #[error("rtcp packet truncated: {0}")]
    TooShort(&'static str),

    /// The RTCP input was structurally invalid. The offending block is
    /// dropped without mutating any state.
    #[error("invalid transport-wide feedback: {0}")]
    InvalidFeedback(&'static str),
}
