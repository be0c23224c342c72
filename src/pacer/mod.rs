//! Leaky-bucket packet pacing with probe-cluster support.
//!
//! The pacer smooths the bursts an encoder produces into a steady
//! transmission schedule. Packets are queued with a priority and released on
//! periodic process ticks, gated by an [`IntervalBudget`] refilled at the
//! pacing rate. A [`BitrateProber`] can temporarily override the schedule to
//! emit clusters of packets at a higher rate for capacity probing, and
//! padding fills the schedule up to a configured padding rate when media
//! runs dry.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::rtp::{Bitrate, DataSize, Ssrc};

mod budget;
mod prober;
mod queue;

pub use budget::IntervalBudget;
pub use queue::QueuedPacket;

pub(crate) use prober::BitrateProber;
pub(crate) use queue::RoundRobinPacketQueue;

/// Process ticks happen at least this often while congested or paused, so a
/// keepalive can escape even when nothing else may be sent.
const CONGESTED_PROCESS_INTERVAL: Duration = Duration::from_millis(500);

/// Budget refill per tick is capped to this much elapsed time. A long
/// scheduling hiatus must not turn into a burst.
const MAX_BUDGET_REFILL: Duration = Duration::from_millis(30);

/// Packet priority. Lower values are served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PacketPriority {
    /// Audio is always sent first (and by default bypasses pacing).
    Audio = 0,
    /// Video and retransmissions.
    Normal = 2,
    /// Padding and other filler.
    Low = 3,
}

/// Pacing metadata tagged onto every emitted packet.
///
/// `probe_cluster_id == None` marks a regular (non-probe) packet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PacedPacketInfo {
    pub probe_cluster_id: Option<u32>,
    pub probe_cluster_min_bytes: DataSize,
    pub send_bitrate: Bitrate,
}

impl Default for PacedPacketInfo {
    fn default() -> Self {
        PacedPacketInfo {
            probe_cluster_id: None,
            probe_cluster_min_bytes: DataSize::ZERO,
            send_bitrate: Bitrate::ZERO,
        }
    }
}

/// The wire side of the pacer.
///
/// Implementations look up the actual payload by `(ssrc, rtp_seq)`, stamp
/// the transport-wide sequence number and put the packet on the network.
/// The pacer never holds its lock across these calls, so they may block
/// briefly without stalling producers.
pub trait PacketTransport {
    /// Send one packet. `true` on wire success; on `false` the pacer
    /// restores queue order and retries the packet next tick.
    fn send(
        &self,
        ssrc: Ssrc,
        rtp_seq: u16,
        capture_time: Instant,
        is_retransmit: bool,
        info: PacedPacketInfo,
    ) -> bool;

    /// Generate and send up to `requested` bytes of padding. Returns the
    /// bytes actually put on the wire.
    fn send_padding(&self, requested: DataSize, info: PacedPacketInfo) -> DataSize;
}

/// The paced sender.
///
/// All mutable state sits behind one internal lock ("the pacer lock").
/// Producers call [`PacedSender::insert_packet`] from their own contexts, a
/// timer context drives [`PacedSender::time_until_next_process`] /
/// [`PacedSender::process`], and the estimator context adjusts rates. Two
/// `process` calls must not run concurrently; everything else may.
pub struct PacedSender<T> {
    transport: T,
    inner: Mutex<PacerInner>,
}

struct PacerInner {
    config: Config,

    media_budget: IntervalBudget,
    padding_budget: IntervalBudget,
    queue: RoundRobinPacketQueue,
    prober: BitrateProber,

    /// Pacing rate for media, normally `target * pacing_factor`.
    pacing_rate: Bitrate,

    congestion_window: Option<DataSize>,
    outstanding: DataSize,

    paused: bool,
    probing_send_failure: bool,

    last_process_time: Option<Instant>,
    last_send_time: Option<Instant>,
    first_sent_packet_time: Option<Instant>,

    /// Count of packets ever inserted, also used as insertion order.
    packet_counter: u64,

    clock: MonotonicGuard,
}

/// Clamps non-monotonic time samples to the last observed value, logging
/// once per episode.
#[derive(Debug, Default)]
struct MonotonicGuard {
    last: Option<Instant>,
    warned: bool,
}

impl MonotonicGuard {
    fn clamp(&mut self, now: Instant) -> Instant {
        match self.last {
            Some(last) if now < last => {
                if !self.warned {
                    warn!("Non-monotonic clock sample observed, clamping");
                    self.warned = true;
                }
                last
            }
            _ => {
                self.last = Some(now);
                self.warned = false;
                now
            }
        }
    }
}

impl<T: PacketTransport> PacedSender<T> {
    pub fn new(config: Config, transport: T) -> Self {
        let pacing_rate = config.initial_bitrate * config.pacing_factor;

        PacedSender {
            transport,
            inner: Mutex::new(PacerInner {
                config,
                media_budget: IntervalBudget::new(pacing_rate, false),
                padding_budget: IntervalBudget::new(Bitrate::ZERO, false),
                queue: RoundRobinPacketQueue::new(),
                prober: BitrateProber::new(),
                pacing_rate,
                congestion_window: None,
                outstanding: DataSize::ZERO,
                paused: false,
                probing_send_failure: false,
                last_process_time: None,
                last_send_time: None,
                first_sent_packet_time: None,
                packet_counter: 0,
                clock: MonotonicGuard::default(),
            }),
        }
    }

    /// Enqueue a packet. Never rejects; the queue grows until the drain
    /// boost or the caller's own limits kick in.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_packet(
        &self,
        priority: PacketPriority,
        ssrc: Ssrc,
        rtp_seq: u16,
        capture_time: Instant,
        size: DataSize,
        is_retransmit: bool,
        now: Instant,
    ) {
        let mut inner = self.inner.lock().unwrap();
        let now = inner.clock.clamp(now);

        inner.prober.on_incoming_packet(size, now);
        inner.packet_counter += 1;
        inner
            .queue
            .push(priority, ssrc, rtp_seq, capture_time, size, is_retransmit, now);
    }

    /// Update the media pacing rate and the padding rate.
    pub fn set_pacing_rates(&self, pacing_rate: Bitrate, padding_rate: Bitrate) {
        let mut inner = self.inner.lock().unwrap();
        inner.pacing_rate = pacing_rate;
        inner.padding_budget.set_target_rate(padding_rate);
        trace!(
            "PacedSender: rates updated, pacing={} padding={}",
            pacing_rate,
            padding_rate
        );
    }

    /// Set or clear the congestion window.
    pub fn set_congestion_window(&self, window: Option<DataSize>) {
        self.inner.lock().unwrap().congestion_window = window;
    }

    /// Outstanding (sent but unacknowledged) bytes, as accounted by the
    /// feedback path.
    pub fn update_outstanding_data(&self, outstanding: DataSize) {
        self.inner.lock().unwrap().outstanding = outstanding;
    }

    /// Queue a probe cluster at the given rate.
    pub fn create_probe_cluster(&self, target_rate: Bitrate, cluster_id: u32, now: Instant) {
        let mut inner = self.inner.lock().unwrap();
        let now = inner.clock.clamp(now);
        inner.prober.create_cluster(target_rate, cluster_id, now);
    }

    pub fn pause(&self, now: Instant) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.paused {
            debug!("PacedSender: paused");
        }
        inner.paused = true;
        inner.queue.set_pause_state(true, now);
    }

    pub fn resume(&self, now: Instant) {
        let mut inner = self.inner.lock().unwrap();
        if inner.paused {
            debug!("PacedSender: resumed");
        }
        inner.paused = false;
        inner.queue.set_pause_state(false, now);
    }

    pub fn queue_size_packets(&self) -> usize {
        self.inner.lock().unwrap().queue.size_packets()
    }

    pub fn queue_size_bytes(&self) -> DataSize {
        self.inner.lock().unwrap().queue.size_bytes()
    }

    /// How long the oldest queued packet has waited.
    pub fn oldest_queue_time(&self, now: Instant) -> Duration {
        let inner = self.inner.lock().unwrap();
        inner
            .queue
            .oldest_enqueue_time()
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or(Duration::ZERO)
    }

    pub fn first_sent_packet_time(&self) -> Option<Instant> {
        self.inner.lock().unwrap().first_sent_packet_time
    }

    /// When the next [`PacedSender::process`] call is due.
    pub fn time_until_next_process(&self, now: Instant) -> Duration {
        let mut inner = self.inner.lock().unwrap();

        let Some(last_process) = inner.last_process_time else {
            // Never processed: due immediately.
            return Duration::ZERO;
        };
        let elapsed = now.saturating_duration_since(last_process);

        // While paused or congested only the keepalive slot matters.
        if inner.paused || inner.congested() {
            return CONGESTED_PROCESS_INTERVAL.saturating_sub(elapsed);
        }

        if inner.prober.is_probing() {
            if let Some(until) = inner.prober.time_until_next_probe(now) {
                if !until.is_zero() || !inner.probing_send_failure {
                    return until.min(inner.config.min_packet_limit);
                }
            }
        }

        inner.config.min_packet_limit.saturating_sub(elapsed)
    }

    /// The main pacing tick. See the module docs for the schedule; the
    /// transport is always called with the pacer lock released.
    pub fn process(&self, now: Instant) {
        let mut inner = self.inner.lock().unwrap();
        let now = inner.clock.clamp(now);

        let elapsed = inner.update_process_time(now);

        if inner.should_send_keepalive(now) {
            drop(inner);
            let sent = self
                .transport
                .send_padding(DataSize::bytes(1), PacedPacketInfo::default());
            inner = self.inner.lock().unwrap();
            inner.on_padding_sent(sent, now);
        }

        if inner.paused {
            return;
        }

        if !elapsed.is_zero() {
            inner.refill_budgets(elapsed, now);
        }

        let is_probing = inner.prober.is_probing();
        let mut pacing_info = PacedPacketInfo::default();
        let mut recommended_probe_size = DataSize::ZERO;
        if is_probing {
            pacing_info = inner.prober.current_cluster().unwrap_or_default();
            recommended_probe_size = inner.prober.recommended_min_probe_size();
        }

        let mut bytes_sent = DataSize::ZERO;

        while !inner.queue.is_empty() && !inner.paused {
            let Some(packet) = inner.next_packet(is_probing) else {
                break;
            };

            drop(inner);
            let ok = self.transport.send(
                packet.ssrc,
                packet.rtp_seq,
                packet.capture_time,
                packet.is_retransmit,
                pacing_info,
            );
            inner = self.inner.lock().unwrap();

            if ok {
                inner.on_packet_sent(&packet, now);
                bytes_sent += packet.size;
                if is_probing && bytes_sent > recommended_probe_size {
                    break;
                }
            } else {
                // Transport refused; restore order and stop draining.
                inner.queue.cancel_pop();
                break;
            }
        }

        // Padding can only follow media: without a first media packet the
        // receiver cannot make sense of the stream.
        if inner.queue.is_empty() && !inner.congested() && inner.last_send_time.is_some() {
            let padding_needed = if is_probing {
                recommended_probe_size - bytes_sent
            } else {
                inner.padding_budget.bytes_remaining()
            };

            if padding_needed > DataSize::ZERO {
                drop(inner);
                let sent = self.transport.send_padding(padding_needed, pacing_info);
                inner = self.inner.lock().unwrap();
                bytes_sent += sent;
                inner.on_padding_sent(sent, now);
            }
        }

        if is_probing {
            inner.probing_send_failure = bytes_sent == DataSize::ZERO;
            if !inner.probing_send_failure {
                inner.prober.probe_sent(now, bytes_sent);
            }
        }
    }
}

impl PacerInner {
    fn congested(&self) -> bool {
        let Some(window) = self.congestion_window else {
            return false;
        };
        self.outstanding >= window
    }

    /// Advance `last_process_time`, returning elapsed time capped for
    /// budget refill.
    fn update_process_time(&mut self, now: Instant) -> Duration {
        let elapsed = self
            .last_process_time
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or(Duration::ZERO);
        self.last_process_time = Some(now);

        elapsed.min(MAX_BUDGET_REFILL)
    }

    fn should_send_keepalive(&self, now: Instant) -> bool {
        if !(self.config.send_padding_in_silence || self.paused || self.congested()) {
            return false;
        }

        let Some(last_send) = self.last_send_time else {
            // Padding before the first media packet confuses receivers.
            return false;
        };

        now.saturating_duration_since(last_send) >= CONGESTED_PROCESS_INTERVAL
    }

    fn refill_budgets(&mut self, elapsed: Duration, now: Instant) {
        let mut target = self.pacing_rate;

        if !self.queue.is_empty() {
            self.queue.update_queue_time(now);

            if self.config.drain_large_queues {
                // Boost the rate so the average queued packet still makes it
                // out within the queue time limit.
                let avg_time_left = Duration::from_millis(1).max(
                    self.config
                        .queue_time_limit
                        .saturating_sub(self.queue.average_queue_time()),
                );
                let min_rate_needed = self.queue.size_bytes() / avg_time_left;
                if min_rate_needed > target {
                    target = min_rate_needed;
                    trace!("PacedSender: draining long queue at {}", target);
                }
            }
        }

        self.media_budget.set_target_rate(target);
        self.media_budget.increase_budget(elapsed);
        self.padding_budget.increase_budget(elapsed);
        log_pacer_media_budget!(self.media_budget.level_percent());
        log_pacer_padding_budget!(self.padding_budget.level_percent());
    }

    /// Begin popping the next sendable packet, or gate on budget/window.
    fn next_packet(&mut self, is_probing: bool) -> Option<QueuedPacket> {
        let packet = self.queue.begin_pop()?;

        let unpaced_audio = packet.priority == PacketPriority::Audio && !self.config.pace_audio;

        if !unpaced_audio {
            let budget_exhausted = self.media_budget.bytes_remaining() == DataSize::ZERO;
            // A probe may overshoot the media budget by up to one
            // recommended probe size; the cluster is useless at a lower
            // rate.
            if self.congested() || (budget_exhausted && !is_probing) {
                self.queue.cancel_pop();
                return None;
            }
        }

        Some(packet)
    }

    fn on_packet_sent(&mut self, packet: &QueuedPacket, now: Instant) {
        self.first_sent_packet_time.get_or_insert(now);

        let audio = packet.priority == PacketPriority::Audio;
        if !audio || self.config.account_for_audio {
            self.media_budget.use_budget(packet.size);
            self.padding_budget.use_budget(packet.size);
            self.outstanding += packet.size;
        }
        self.last_send_time = Some(now);
        self.queue.finalize_pop(now);
    }

    fn on_padding_sent(&mut self, sent: DataSize, now: Instant) {
        if sent > DataSize::ZERO {
            self.media_budget.use_budget(sent);
            self.padding_budget.use_budget(sent);
            self.outstanding += sent;
        }
        self.last_send_time = Some(now);
    }
}
