use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::rtp::{extend_u16, SeqNo};
use crate::util::{already_happened, not_happening};

/// Gaps further behind the newest received seq than this are dropped.
const MAX_TRACKED_DISTANCE: u64 = 10_000;

/// Floor for the retry backoff; retrying faster than the wire can answer
/// only duplicates traffic.
const MIN_RETRY_INTERVAL: Duration = Duration::from_millis(20);

/// Give up on a gap after this many RTTs; the retransmission window on the
/// send side is long gone anyway.
const ABANDON_RTT_FACTOR: u32 = 10;

/// One batch of sequence numbers to put in a NACK feedback message.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NackBatch {
    /// Wire sequence numbers to NACK, ascending.
    pub seqs: Vec<u16>,
    /// Set when a gap was abandoned: the stream cannot be repaired by
    /// retransmission and needs a keyframe.
    pub request_keyframe: bool,
}

#[derive(Debug, Clone, Copy)]
struct NackInfo {
    first_seen: Instant,
    sent_at: Option<Instant>,
    retries: u8,
}

/// Receiver-side NACK generation.
///
/// Tracks gaps in the observed sequence numbers (wrap aware) and produces
/// batched NACK lists with retry backoff. A gap is NACKed immediately when
/// first seen, then retried no faster than `max(RTT, 20 ms)` until either
/// repaired, retried out, or older than 10 RTTs.
#[derive(Debug)]
pub struct NackModule {
    /// Missing extended seqs and their retry state.
    missing: BTreeMap<u64, NackInfo>,
    /// Highest extended seq received.
    last_received: Option<u64>,
    rtt: Duration,
    max_retries: u8,
    batch_interval: Duration,
    /// Next scheduled batch; pulled earlier when a new gap appears.
    next_batch_at: Instant,
}

impl NackModule {
    pub fn new(config: &Config) -> Self {
        NackModule {
            missing: BTreeMap::new(),
            last_received: None,
            rtt: Duration::from_millis(100),
            max_retries: config.max_nack_retries,
            batch_interval: config.nack_batch_interval,
            next_batch_at: not_happening(),
        }
    }

    pub fn set_rtt(&mut self, rtt: Duration) {
        self.rtt = rtt;
    }

    /// Record an arrived packet. Returns `true` when this opened a new gap
    /// (the caller should process a batch soon).
    pub fn on_received(&mut self, seq: u16, now: Instant) -> bool {
        let ext = extend_u16(self.last_received, seq);

        let Some(last) = self.last_received else {
            self.last_received = Some(ext);
            return false;
        };

        let mut new_gap = false;

        if ext > last {
            // Everything between the previous newest and this one is now
            // missing. Bound the tracked range so a sender restart cannot
            // explode the map.
            let from = (last + 1).max(ext.saturating_sub(MAX_TRACKED_DISTANCE));
            for s in from..ext {
                self.missing.insert(
                    s,
                    NackInfo {
                        first_seen: now,
                        sent_at: None,
                        retries: 0,
                    },
                );
                new_gap = true;
            }
            self.last_received = Some(ext);
        }

        // Either a retransmission or a reordered packet filled a gap.
        if self.missing.remove(&ext).is_some() {
            trace!("Gap {seq} repaired");
        }

        // Safety bound on stragglers.
        let cutoff = self.last_received.unwrap_or(0).saturating_sub(MAX_TRACKED_DISTANCE);
        self.missing.retain(|&s, _| s >= cutoff);

        if new_gap {
            self.next_batch_at = already_happened();
        }

        new_gap
    }

    /// When the next batch should be processed.
    pub fn poll_timeout(&self) -> Instant {
        if self.missing.is_empty() {
            return not_happening();
        }
        self.next_batch_at
    }

    /// Produce the next NACK batch, if anything is due.
    pub fn handle_timeout(&mut self, now: Instant) -> Option<NackBatch> {
        if now < self.next_batch_at {
            return None;
        }
        self.next_batch_at = now + self.batch_interval;

        let retry_interval = self.rtt.max(MIN_RETRY_INTERVAL);
        let abandon_after = self.rtt * ABANDON_RTT_FACTOR;

        let mut batch = NackBatch::default();
        let mut abandoned = Vec::new();

        for (&seq, info) in self.missing.iter_mut() {
            if now.saturating_duration_since(info.first_seen) > abandon_after
                || info.retries >= self.max_retries
            {
                abandoned.push(seq);
                continue;
            }

            let due = match info.sent_at {
                None => true,
                Some(sent) => now.saturating_duration_since(sent) >= retry_interval,
            };
            if !due {
                continue;
            }

            info.sent_at = Some(now);
            info.retries += 1;
            batch.seqs.push(SeqNo::from(seq).as_u16());
        }

        for seq in abandoned {
            debug!("Giving up on missing seq {seq}, requesting keyframe");
            self.missing.remove(&seq);
            batch.request_keyframe = true;
        }

        (!batch.seqs.is_empty() || batch.request_keyframe).then_some(batch)
    }

    #[cfg(test)]
    fn missing_count(&self) -> usize {
        self.missing.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn module() -> NackModule {
        let mut m = NackModule::new(&Config::default());
        m.set_rtt(Duration::from_millis(40));
        m
    }

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn no_nacks_for_contiguous_stream() {
        let now = Instant::now();
        let mut nack = module();

        for seq in 0..100_u16 {
            assert!(!nack.on_received(seq, now + ms(seq as u64)));
        }

        assert_eq!(nack.poll_timeout(), not_happening());
        assert!(nack.handle_timeout(now + ms(200)).is_none());
    }

    #[test]
    fn gap_produces_immediate_nack() {
        let now = Instant::now();
        let mut nack = module();

        nack.on_received(10, now);
        assert!(nack.on_received(13, now + ms(1)));

        let batch = nack.handle_timeout(now + ms(1)).expect("batch");
        assert_eq!(batch.seqs, vec![11, 12]);
        assert!(!batch.request_keyframe);
    }

    #[test]
    fn repaired_gap_is_not_nacked() {
        let now = Instant::now();
        let mut nack = module();

        nack.on_received(10, now);
        nack.on_received(13, now + ms(1));
        // 11 arrives late (reorder), 12 still missing.
        nack.on_received(11, now + ms(2));

        let batch = nack.handle_timeout(now + ms(2)).expect("batch");
        assert_eq!(batch.seqs, vec![12]);
    }

    #[test]
    fn retries_back_off_by_rtt() {
        let now = Instant::now();
        let mut nack = module();

        nack.on_received(10, now);
        nack.on_received(12, now);

        let first = nack.handle_timeout(now).expect("first batch");
        assert_eq!(first.seqs, vec![11]);

        // Next batch interval, but inside the 40 ms retry backoff.
        assert!(nack.handle_timeout(now + ms(20)).is_none());

        let second = nack.handle_timeout(now + ms(45)).expect("retry");
        assert_eq!(second.seqs, vec![11]);
    }

    #[test]
    fn wraparound_gap() {
        let now = Instant::now();
        let mut nack = module();

        nack.on_received(65_534, now);
        nack.on_received(1, now + ms(1));

        let batch = nack.handle_timeout(now + ms(1)).expect("batch");
        assert_eq!(batch.seqs, vec![65_535, 0]);
    }

    #[test]
    fn exhausted_retries_request_keyframe() {
        let now = Instant::now();
        let mut nack = module();
        // Large RTT so the 10 x RTT abandonment doesn't fire first.
        nack.set_rtt(ms(100));

        nack.on_received(10, now);
        nack.on_received(12, now);

        let max = Config::default().max_nack_retries as u64;
        for i in 0..max {
            let at = now + ms(i * 110);
            let batch = nack.handle_timeout(at).expect("retry batch");
            assert_eq!(batch.seqs, vec![11]);
        }

        // Retries exhausted: next batch abandons and asks for a keyframe.
        let last = nack.handle_timeout(now + ms(max * 110)).expect("abandon");
        assert!(last.seqs.is_empty());
        assert!(last.request_keyframe);
        assert_eq!(nack.missing_count(), 0);
    }

    #[test]
    fn old_gap_is_abandoned_after_ten_rtts() {
        let now = Instant::now();
        let mut nack = module();

        nack.on_received(10, now);
        nack.on_received(12, now);
        let _ = nack.handle_timeout(now);

        // 10 x 40 ms = 400 ms; after that the gap is hopeless.
        let batch = nack.handle_timeout(now + ms(450)).expect("abandon");
        assert!(batch.request_keyframe);
        assert_eq!(nack.missing_count(), 0);
    }

    #[test]
    fn distant_stragglers_are_dropped() {
        let now = Instant::now();
        let mut nack = module();

        nack.on_received(0, now);
        nack.on_received(2, now);
        assert_eq!(nack.missing_count(), 1);

        // Jump far ahead; the old gap plus everything outside the tracked
        // distance goes away.
        for seq in [20_000_u16, 40_000, 60_000] {
            nack.on_received(seq, now + ms(10));
        }

        let last = 60_000_u64;
        assert!(nack
            .missing
            .keys()
            .all(|&s| s >= last - MAX_TRACKED_DISTANCE));
    }
}
