use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use crate::rtp::{DataSize, Ssrc};

use super::PacketPriority;

/// A packet queued in the pacer. Metadata only; payloads stay with the
/// per-SSRC senders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedPacket {
    pub priority: PacketPriority,
    pub ssrc: Ssrc,
    pub rtp_seq: u16,
    pub capture_time: Instant,
    pub enqueue_time: Instant,
    pub size: DataSize,
    pub is_retransmit: bool,
    pub(crate) insert_order: u64,
    /// Pause time accumulated when this packet was enqueued. Queue time for
    /// the packet excludes pauses that happened while it waited.
    pub(crate) pause_time_at_enqueue: Duration,
}

/// Priority plus round-robin per-SSRC packet queue.
///
/// Packets are bucketed by `(priority, ssrc)`. Within a bucket, strict FIFO
/// by insertion order. Across buckets of the same priority, SSRCs take
/// round-robin turns so no stream starves. Lower priorities are only
/// considered when every higher-priority bucket is empty.
///
/// Popping is a two-phase protocol: [`RoundRobinPacketQueue::begin_pop`]
/// peeks the next packet, and exactly one of
/// [`RoundRobinPacketQueue::cancel_pop`] or
/// [`RoundRobinPacketQueue::finalize_pop`] must follow. Between the calls
/// the packet is still observably in the queue for size and time queries.
#[derive(Debug)]
pub(crate) struct RoundRobinPacketQueue {
    buckets: BTreeMap<(PacketPriority, Ssrc), VecDeque<QueuedPacket>>,
    /// Per-priority SSRC turn order. An SSRC is listed iff its bucket is
    /// non-empty.
    rotation: BTreeMap<PacketPriority, VecDeque<Ssrc>>,
    size_packets: usize,
    size_bytes: DataSize,
    /// Sum of queue time across queued packets, advanced by
    /// `update_queue_time`. Paused intervals do not accumulate.
    queue_time_sum: Duration,
    /// Total time spent paused, for per-packet queue time adjustment.
    pause_time_sum: Duration,
    last_update: Option<Instant>,
    paused: bool,
    insert_counter: u64,
    in_flight: Option<(PacketPriority, Ssrc)>,
}

impl RoundRobinPacketQueue {
    pub fn new() -> Self {
        RoundRobinPacketQueue {
            buckets: BTreeMap::new(),
            rotation: BTreeMap::new(),
            size_packets: 0,
            size_bytes: DataSize::ZERO,
            queue_time_sum: Duration::ZERO,
            pause_time_sum: Duration::ZERO,
            last_update: None,
            paused: false,
            insert_counter: 0,
            in_flight: None,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn push(
        &mut self,
        priority: PacketPriority,
        ssrc: Ssrc,
        rtp_seq: u16,
        capture_time: Instant,
        size: DataSize,
        is_retransmit: bool,
        now: Instant,
    ) {
        self.update_queue_time(now);

        let packet = QueuedPacket {
            priority,
            ssrc,
            rtp_seq,
            capture_time,
            enqueue_time: now,
            size,
            is_retransmit,
            insert_order: self.insert_counter,
            pause_time_at_enqueue: self.pause_time_sum,
        };
        self.insert_counter += 1;

        let bucket = self.buckets.entry((priority, ssrc)).or_default();
        if bucket.is_empty() {
            self.rotation.entry(priority).or_default().push_back(ssrc);
        }
        bucket.push_back(packet);

        self.size_packets += 1;
        self.size_bytes += size;
    }

    /// Peek the packet that would be sent next.
    ///
    /// Panics if a previous `begin_pop` has not been resolved; that is a
    /// caller bug, not a recoverable condition.
    pub fn begin_pop(&mut self) -> Option<QueuedPacket> {
        assert!(
            self.in_flight.is_none(),
            "begin_pop while a pop is already in flight"
        );

        let (&priority, ssrcs) = self.rotation.iter().find(|(_, ssrcs)| !ssrcs.is_empty())?;
        let ssrc = *ssrcs.front()?;

        let packet = *self
            .buckets
            .get(&(priority, ssrc))
            .and_then(|b| b.front())
            .expect("rotation entry implies non-empty bucket");

        self.in_flight = Some((priority, ssrc));

        Some(packet)
    }

    /// Abort an in-flight pop, leaving the queue untouched.
    pub fn cancel_pop(&mut self) {
        assert!(
            self.in_flight.take().is_some(),
            "cancel_pop without begin_pop"
        );
    }

    /// Commit an in-flight pop, removing the packet and advancing the
    /// round-robin turn for its priority.
    pub fn finalize_pop(&mut self, now: Instant) -> QueuedPacket {
        let key = self.in_flight.take().expect("finalize_pop without begin_pop");

        self.update_queue_time(now);

        let bucket = self.buckets.get_mut(&key).expect("in-flight bucket");
        let packet = bucket.pop_front().expect("in-flight packet");

        self.size_packets -= 1;
        self.size_bytes -= packet.size;

        let time_in_queue = now
            .saturating_duration_since(packet.enqueue_time)
            .saturating_sub(self.pause_time_sum - packet.pause_time_at_enqueue);
        self.queue_time_sum = self.queue_time_sum.saturating_sub(time_in_queue);

        let bucket_empty = bucket.is_empty();
        if bucket_empty {
            self.buckets.remove(&key);
        }

        let ssrcs = self.rotation.get_mut(&key.0).expect("rotation for priority");
        let front = ssrcs.pop_front().expect("ssrc at rotation front");
        debug_assert_eq!(front, key.1);
        if !bucket_empty {
            ssrcs.push_back(front);
        }
        if ssrcs.is_empty() {
            self.rotation.remove(&key.0);
        }

        packet
    }

    pub fn is_empty(&self) -> bool {
        self.size_packets == 0
    }

    pub fn size_packets(&self) -> usize {
        self.size_packets
    }

    pub fn size_bytes(&self) -> DataSize {
        self.size_bytes
    }

    /// Enqueue time of the oldest queued packet.
    pub fn oldest_enqueue_time(&self) -> Option<Instant> {
        // Bucket fronts are the oldest per bucket (FIFO), so the global
        // oldest is the min over fronts.
        self.buckets
            .values()
            .filter_map(|b| b.front())
            .map(|p| p.enqueue_time)
            .min()
    }

    /// Advance the queue-time accumulator to `now`.
    pub fn update_queue_time(&mut self, now: Instant) {
        let Some(last) = self.last_update else {
            self.last_update = Some(now);
            return;
        };

        let elapsed = now.saturating_duration_since(last);
        if self.paused {
            self.pause_time_sum += elapsed;
        } else {
            self.queue_time_sum += elapsed * self.size_packets as u32;
        }
        self.last_update = Some(now);
    }

    /// Average time the queued packets have waited so far.
    pub fn average_queue_time(&self) -> Duration {
        if self.size_packets == 0 {
            return Duration::ZERO;
        }

        self.queue_time_sum / self.size_packets as u32
    }

    pub fn set_pause_state(&mut self, paused: bool, now: Instant) {
        if self.paused == paused {
            return;
        }
        self.update_queue_time(now);
        self.paused = paused;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn push(
        queue: &mut RoundRobinPacketQueue,
        priority: PacketPriority,
        ssrc: u32,
        rtp_seq: u16,
        now: Instant,
    ) {
        queue.push(
            priority,
            ssrc.into(),
            rtp_seq,
            now,
            DataSize::bytes(1000),
            false,
            now,
        );
    }

    fn pop_seq(queue: &mut RoundRobinPacketQueue, now: Instant) -> (u32, u16) {
        let p = queue.begin_pop().expect("packet");
        let p2 = queue.finalize_pop(now);
        assert_eq!(p, p2);
        (*p.ssrc, p.rtp_seq)
    }

    #[test]
    fn fifo_within_bucket() {
        let now = Instant::now();
        let mut queue = RoundRobinPacketQueue::new();

        for seq in 0..5 {
            push(&mut queue, PacketPriority::Normal, 1, seq, now);
        }

        for seq in 0..5 {
            assert_eq!(pop_seq(&mut queue, now), (1, seq));
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn audio_preempts_video() {
        let now = Instant::now();
        let mut queue = RoundRobinPacketQueue::new();

        push(&mut queue, PacketPriority::Normal, 1, 0, now);
        push(&mut queue, PacketPriority::Audio, 2, 0, now);
        push(&mut queue, PacketPriority::Low, 3, 0, now);

        assert_eq!(pop_seq(&mut queue, now).0, 2);
        assert_eq!(pop_seq(&mut queue, now).0, 1);
        assert_eq!(pop_seq(&mut queue, now).0, 3);
    }

    #[test]
    fn round_robin_between_ssrcs() {
        let now = Instant::now();
        let mut queue = RoundRobinPacketQueue::new();

        for seq in 0..3 {
            push(&mut queue, PacketPriority::Normal, 1, seq, now);
            push(&mut queue, PacketPriority::Normal, 2, seq, now);
        }

        let order: Vec<u32> = (0..6).map(|_| pop_seq(&mut queue, now).0).collect();
        assert_eq!(order, vec![1, 2, 1, 2, 1, 2]);
    }

    #[test]
    fn cancel_pop_keeps_packet() {
        let now = Instant::now();
        let mut queue = RoundRobinPacketQueue::new();

        push(&mut queue, PacketPriority::Normal, 1, 7, now);

        let peeked = queue.begin_pop().unwrap();
        assert_eq!(peeked.rtp_seq, 7);
        // Still observable while in flight.
        assert_eq!(queue.size_packets(), 1);
        queue.cancel_pop();

        assert_eq!(pop_seq(&mut queue, now), (1, 7));
    }

    #[test]
    #[should_panic(expected = "begin_pop while a pop is already in flight")]
    fn double_begin_pop_panics() {
        let now = Instant::now();
        let mut queue = RoundRobinPacketQueue::new();
        push(&mut queue, PacketPriority::Normal, 1, 0, now);
        push(&mut queue, PacketPriority::Normal, 1, 1, now);

        let _ = queue.begin_pop();
        let _ = queue.begin_pop();
    }

    #[test]
    fn average_queue_time_accumulates() {
        let now = Instant::now();
        let mut queue = RoundRobinPacketQueue::new();

        push(&mut queue, PacketPriority::Normal, 1, 0, now);
        push(&mut queue, PacketPriority::Normal, 1, 1, now);

        queue.update_queue_time(now + Duration::from_millis(100));
        assert_eq!(queue.average_queue_time(), Duration::from_millis(100));

        // Pop one packet at +100ms; the remaining packet keeps aging.
        let _ = queue.begin_pop();
        let _ = queue.finalize_pop(now + Duration::from_millis(100));
        queue.update_queue_time(now + Duration::from_millis(200));
        assert_eq!(queue.average_queue_time(), Duration::from_millis(200));
    }

    #[test]
    fn paused_time_does_not_accumulate() {
        let now = Instant::now();
        let mut queue = RoundRobinPacketQueue::new();

        push(&mut queue, PacketPriority::Normal, 1, 0, now);

        queue.set_pause_state(true, now);
        queue.update_queue_time(now + Duration::from_millis(500));
        queue.set_pause_state(false, now + Duration::from_millis(500));
        queue.update_queue_time(now + Duration::from_millis(600));

        assert_eq!(queue.average_queue_time(), Duration::from_millis(100));

        // Queue time for the popped packet likewise excludes the pause.
        let _ = queue.begin_pop();
        let p = queue.finalize_pop(now + Duration::from_millis(600));
        let in_queue = (now + Duration::from_millis(600))
            .saturating_duration_since(p.enqueue_time)
            .saturating_sub(Duration::from_millis(500));
        assert_eq!(in_queue, Duration::from_millis(100));
        assert_eq!(queue.average_queue_time(), Duration::ZERO);
    }

    #[test]
    fn oldest_enqueue_time_is_global_min() {
        let now = Instant::now();
        let mut queue = RoundRobinPacketQueue::new();

        queue.push(
            PacketPriority::Normal,
            1.into(),
            0,
            now,
            DataSize::bytes(100),
            false,
            now + Duration::from_millis(10),
        );
        queue.push(
            PacketPriority::Audio,
            2.into(),
            0,
            now,
            DataSize::bytes(100),
            false,
            now + Duration::from_millis(20),
        );

        assert_eq!(
            queue.oldest_enqueue_time(),
            Some(now + Duration::from_millis(10))
        );
    }
}
