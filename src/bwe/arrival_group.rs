use std::mem;
use std::time::{Duration, Instant};

use super::time::{TimeDelta, Timestamp};
use super::AckedPacket;

/// Packets sent within this of the group start belong to the same burst.
const SEND_TIME_GROUP_LENGTH: Duration = Duration::from_millis(5);

/// Packets arriving within this of the previous arrival can still join the
/// group if their propagation delta shrank (queue draining on the path).
const BURST_TIME_INTERVAL: Duration = Duration::from_millis(5);

/// Hard bound on how long a single group can stretch on the arrival side.
const MAX_BURST_DURATION: Duration = Duration::from_millis(100);

/// A group of packets sent close together, treated as one sample by the
/// delay detector.
#[derive(Debug, Default)]
pub(super) struct ArrivalGroup {
    first: Option<(Instant, Instant)>,
    last_send: Option<Instant>,
    last_arrival: Option<Instant>,
    size: usize,
}

/// Whether a packet belongs to the group under construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Membership {
    /// Part of this group.
    Member,
    /// Starts the next group.
    NewGroup,
    /// Out of order; not usable for either group.
    Skipped,
}

impl ArrivalGroup {
    /// Maybe add a packet. Returns `true` if a new group must be started.
    fn add_packet(&mut self, packet: &AckedPacket) -> bool {
        match self.membership(packet) {
            Membership::NewGroup => return true,
            Membership::Skipped => return false,
            Membership::Member => {}
        }

        if self.first.is_none() {
            self.first = Some((packet.local_send_time, packet.remote_recv_time));
        }

        self.last_send = self.last_send.max(Some(packet.local_send_time));
        self.last_arrival = self.last_arrival.max(Some(packet.remote_recv_time));
        self.size += 1;

        false
    }

    fn membership(&self, packet: &AckedPacket) -> Membership {
        let Some((first_send, first_arrival)) = self.first else {
            // Any packet starts an empty group.
            return Membership::Member;
        };

        let Some(send_delta_from_first) = packet
            .local_send_time
            .checked_duration_since(first_send)
        else {
            // Sent before the group started: reordered on our side.
            return Membership::Skipped;
        };

        let send_delta = Timestamp::from(packet.local_send_time) - Timestamp::from(self.send_time());
        if send_delta == TimeDelta::ZERO {
            return Membership::Member;
        }

        let arrival_delta = Timestamp::from(packet.remote_recv_time) - Timestamp::from(self.arrival_time());
        let propagation_delta = arrival_delta - send_delta;

        if propagation_delta < TimeDelta::ZERO
            && arrival_delta <= BURST_TIME_INTERVAL
            && packet.remote_recv_time - first_arrival < MAX_BURST_DURATION
        {
            Membership::Member
        } else if send_delta_from_first > SEND_TIME_GROUP_LENGTH {
            Membership::NewGroup
        } else {
            Membership::Member
        }
    }

    /// Send time delta between self and a subsequent group.
    fn departure_delta(&self, other: &Self) -> TimeDelta {
        Timestamp::from(other.send_time()) - Timestamp::from(self.send_time())
    }

    /// Arrival time delta between self and a subsequent group.
    fn arrival_delta(&self, other: &Self) -> TimeDelta {
        Timestamp::from(other.arrival_time()) - Timestamp::from(self.arrival_time())
    }

    /// Departure time for the group. Panics on an empty group.
    fn send_time(&self) -> Instant {
        self.last_send.expect("send_time on non-empty group")
    }

    /// Arrival time for the group. Panics on an empty group.
    fn arrival_time(&self) -> Instant {
        self.last_arrival.expect("arrival_time on non-empty group")
    }
}

/// Accumulates acked packets into arrival groups and produces the
/// inter-group deltas feeding the trendline estimator.
#[derive(Debug, Default)]
pub(super) struct ArrivalGroupAccumulator {
    previous_group: Option<ArrivalGroup>,
    current_group: ArrivalGroup,
}

/// The delay variation between two consecutive packet groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct InterGroupDelta {
    /// Delta between the send times of the groups (last packet of each).
    pub send_delta: TimeDelta,
    /// Delta between the remote arrival times of the groups.
    pub arrival_delta: TimeDelta,
    /// Reported arrival of the last packet in the completed group.
    pub last_remote_recv_time: Instant,
}

impl ArrivalGroupAccumulator {
    /// Accumulate one packet. When the packet closes a group, the delta
    /// between the two most recent groups is returned.
    pub(super) fn accumulate_packet(&mut self, packet: &AckedPacket) -> Option<InterGroupDelta> {
        let need_new_group = self.current_group.add_packet(packet);

        if !need_new_group {
            return None;
        }

        let send_delta = self
            .previous_group
            .as_ref()
            .map(|prev| prev.departure_delta(&self.current_group));
        let arrival_delta = self
            .previous_group
            .as_ref()
            .map(|prev| prev.arrival_delta(&self.current_group));
        let last_remote_recv_time = self.current_group.arrival_time();

        let current = mem::take(&mut self.current_group);
        self.previous_group = Some(current);

        self.current_group.add_packet(packet);

        Some(InterGroupDelta {
            send_delta: send_delta?,
            arrival_delta: arrival_delta?,
            last_remote_recv_time,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::rtp::DataSize;

    fn acked(send_us: u64, recv_us: u64, base: Instant) -> AckedPacket {
        AckedPacket {
            seq_no: 0.into(),
            size: DataSize::ZERO,
            local_send_time: base + Duration::from_micros(send_us),
            remote_recv_time: base + Duration::from_micros(recv_us),
            local_recv_time: base + Duration::from_micros(recv_us + 50),
        }
    }

    #[test]
    fn any_packet_joins_empty_group() {
        let base = Instant::now();
        let group = ArrivalGroup::default();

        assert_eq!(
            group.membership(&acked(0, 10, base)),
            Membership::Member
        );
    }

    #[test]
    fn burst_within_interval_belongs() {
        let base = Instant::now();
        let packets = [
            acked(0, 150, base),
            acked(50, 225, base),
            acked(1005, 1140, base),
            acked(4995, 5001, base),
            // Outside the 5 ms send window, new group.
            acked(5700, 6000, base),
        ];

        let mut group = ArrivalGroup::default();
        for p in &packets {
            let new_group = group.membership(p) == Membership::NewGroup;
            if !new_group {
                group.add_packet(p);
            }
        }

        assert_eq!(group.size, 4);
    }

    #[test]
    fn out_of_order_send_is_skipped() {
        let base = Instant::now() + Duration::from_millis(10);
        let mut group = ArrivalGroup::default();

        group.add_packet(&acked(1000, 1150, base));

        // Sent before the group's first packet.
        let late = AckedPacket {
            seq_no: 1.into(),
            size: DataSize::ZERO,
            local_send_time: base,
            remote_recv_time: base + Duration::from_micros(5000),
            local_recv_time: base + Duration::from_micros(5050),
        };
        assert_eq!(group.membership(&late), Membership::Skipped);
    }

    #[test]
    fn group_transition_produces_delta() {
        let base = Instant::now();
        let mut acc = ArrivalGroupAccumulator::default();

        // First group: two packets inside 5 ms.
        assert_eq!(acc.accumulate_packet(&acked(0, 0, base)), None);
        assert_eq!(acc.accumulate_packet(&acked(2000, 2500, base)), None);

        // Second group starts; no previous-previous group yet, so no delta.
        assert_eq!(acc.accumulate_packet(&acked(10_000, 11_000, base)), None);

        // Third group closes the second; now we get a delta between
        // group 1 (last send 2ms, last arrival 2.5ms) and
        // group 2 (send 10ms, arrival 11ms).
        let delta = acc
            .accumulate_packet(&acked(20_000, 21_000, base))
            .expect("delta");

        assert_eq!(delta.send_delta, TimeDelta::from_millis(8));
        assert_eq!(
            delta.arrival_delta.as_millis_f64(),
            8.5
        );
    }

    #[test]
    fn reordered_arrival_gives_negative_delta() {
        let base = Instant::now();
        let mut acc = ArrivalGroupAccumulator::default();

        let data = [
            ((0_u64, 0_u64), None),
            ((60_000, 5_000), None),
            ((40_000, 10_000), None),
            (
                (70_000, 20_000),
                Some((TimeDelta::from_millis(-20), TimeDelta::from_millis(5))),
            ),
        ];

        for ((send, recv), expected) in data {
            let delta = acc.accumulate_packet(&acked(send, recv, base));
            assert_eq!(delta.map(|d| (d.send_delta, d.arrival_delta)), expected);
        }
    }
}
