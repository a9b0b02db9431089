use std::fmt::{Debug, Formatter};
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;
use crate::messaging::ack_number::AckNumber;

/// The number of sent packets that are remembered while waiting for their acknowledgement
pub const MAX_UNACKED_HISTORY: usize = 32;

/// Upper limit for reliable messages in a single packet, bounding the tracking data per packet
pub const MAX_RELIABLES_PER_PACKET: usize = 32;

/// The received-history bitfield covers this many packets before the highest received ack
pub const ACK_BITFIELD_LEN: u16 = u16::BITS as u16;


struct TrackedPacket {
    ack: AckNumber,
    sent_at: Instant,
    reliable_ids: Vec<u16>,
}

/// A sent packet that the peer acknowledged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmedPacket {
    pub ack: AckNumber,
    pub reliable_ids: Vec<u16>,
    pub rtt: Duration,
}

#[derive(Debug, Default)]
pub struct AckOutcome {
    /// oldest first
    pub confirmed: Vec<ConfirmedPacket>,
    /// packets that can not be acknowledged anymore because they fell out of the peer's history
    pub lost: Vec<AckNumber>,
}

/// Remembers recently sent packets that carried messages, so that acknowledgements in received
///  packet headers can be mapped back to the reliable messages they confirm.
///
/// Packets are stored in a ring indexed by ack number. Sending a packet into a slot that is still
///  occupied by an unacknowledged packet counts that older packet as lost.
pub struct PacketTracker {
    slots: Vec<Option<TrackedPacket>>,
}

impl Debug for PacketTracker {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let acks = self.slots.iter()
            .flatten()
            .map(|p| p.ack)
            .collect::<Vec<_>>();
        write!(f, "PacketTracker{{in flight: {:?}}}", acks)
    }
}

impl Default for PacketTracker {
    fn default() -> Self {
        PacketTracker::new()
    }
}

impl PacketTracker {
    pub fn new() -> PacketTracker {
        PacketTracker {
            slots: (0..MAX_UNACKED_HISTORY).map(|_| None).collect(),
        }
    }

    fn slot_index(ack: AckNumber) -> usize {
        ack.to_raw() as usize % MAX_UNACKED_HISTORY
    }

    /// Registers a packet carrying messages. Returns the ack of a still unacknowledged packet that
    ///  was evicted from the ring, if any.
    pub fn on_sent(&mut self, ack: AckNumber, reliable_ids: Vec<u16>, now: Instant) -> Option<AckNumber> {
        debug_assert!(reliable_ids.len() <= MAX_RELIABLES_PER_PACKET);
        self.replace(ack, Some(TrackedPacket {
            ack,
            sent_at: now,
            reliable_ids,
        }))
    }

    /// Registers a packet without messages: there is nothing to confirm, but the ack's slot is
    ///  reused and must not hold stale data
    pub fn on_sent_untracked(&mut self, ack: AckNumber) -> Option<AckNumber> {
        self.replace(ack, None)
    }

    fn replace(&mut self, ack: AckNumber, packet: Option<TrackedPacket>) -> Option<AckNumber> {
        let slot = &mut self.slots[Self::slot_index(ack)];
        let evicted = std::mem::replace(slot, packet)?;
        trace!("packet {:?} still unacknowledged when its slot was reused for {:?}", evicted.ack, ack);
        Some(evicted.ack)
    }

    /// Reconciles a received packet header's ack information with the packets in flight.
    ///
    /// `highest` itself is confirmed, and so is packet `highest - i - 1` if bit i of `history` is
    ///  set. Packets too old to be represented in `history` are lost.
    pub fn on_ack_header(&mut self, highest: AckNumber, history: u16, now: Instant) -> AckOutcome {
        let mut result = AckOutcome::default();

        for slot in self.slots.iter_mut() {
            let Some(packet) = slot else {
                continue;
            };
            if packet.ack != highest && !highest.is_newer_than(packet.ack) {
                // sent after the packet the peer last received
                continue;
            }

            let distance = highest.distance_from(packet.ack);
            let is_acked = distance == 0
                || (distance <= ACK_BITFIELD_LEN && history & (1 << (distance - 1)) != 0);

            if is_acked {
                if let Some(packet) = slot.take() {
                    result.confirmed.push(ConfirmedPacket {
                        ack: packet.ack,
                        rtt: now.saturating_duration_since(packet.sent_at),
                        reliable_ids: packet.reliable_ids,
                    });
                }
            }
            else if distance > ACK_BITFIELD_LEN {
                if let Some(packet) = slot.take() {
                    result.lost.push(packet.ack);
                }
            }
        }

        result.confirmed.sort_by_key(|p| std::cmp::Reverse(highest.distance_from(p.ack)));
        result.lost.sort_by_key(|&ack| std::cmp::Reverse(highest.distance_from(ack)));
        result
    }

    pub fn num_in_flight(&self) -> usize {
        self.slots.iter()
            .filter(|s| s.is_some())
            .count()
    }

    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rstest::rstest;

    fn ack(n: u16) -> AckNumber {
        AckNumber::from_raw(n).unwrap()
    }

    fn acks(packets: &[ConfirmedPacket]) -> Vec<u16> {
        packets.iter().map(|p| p.ack.to_raw()).collect()
    }

    #[test]
    fn test_confirm_highest_and_history() {
        let now = Instant::now();
        let mut tracker = PacketTracker::new();
        for n in 1..=5 {
            assert_eq!(tracker.on_sent(ack(n), vec![n * 10], now), None);
        }

        // peer received 5, 3 and 1
        let outcome = tracker.on_ack_header(ack(5), 0b1010, now + Duration::from_millis(20));
        assert_eq!(acks(&outcome.confirmed), vec![1, 3, 5]);
        assert_eq!(outcome.confirmed[0].reliable_ids, vec![10]);
        assert!(outcome.confirmed.iter().all(|p| p.rtt == Duration::from_millis(20)));
        assert!(outcome.lost.is_empty());
        assert_eq!(tracker.num_in_flight(), 2);

        // confirming again is a no-op
        let outcome = tracker.on_ack_header(ack(5), 0b1010, now);
        assert!(outcome.confirmed.is_empty());

        let outcome = tracker.on_ack_header(ack(5), 0b1111, now);
        assert_eq!(acks(&outcome.confirmed), vec![2, 4]);
        assert_eq!(tracker.num_in_flight(), 0);
    }

    #[test]
    fn test_newer_packets_stay_in_flight() {
        let now = Instant::now();
        let mut tracker = PacketTracker::new();
        for n in 1..=4 {
            tracker.on_sent(ack(n), vec![], now);
        }
        let outcome = tracker.on_ack_header(ack(2), 0, now);
        assert_eq!(acks(&outcome.confirmed), vec![2]);
        assert!(outcome.lost.is_empty());
        assert_eq!(tracker.num_in_flight(), 3);
    }

    #[rstest]
    #[case::just_inside(16, false)]
    #[case::just_outside(17, true)]
    fn test_lost_beyond_history(#[case] distance: u16, #[case] expected_lost: bool) {
        let now = Instant::now();
        let mut tracker = PacketTracker::new();
        tracker.on_sent(ack(100), vec![1], now);

        let outcome = tracker.on_ack_header(ack(100 + distance), 0, now);
        assert!(outcome.confirmed.is_empty());
        assert_eq!(outcome.lost == vec![ack(100)], expected_lost);
        assert_eq!(tracker.num_in_flight(), if expected_lost { 0 } else { 1 });
    }

    #[test]
    fn test_eviction_on_wrap() {
        let now = Instant::now();
        let mut tracker = PacketTracker::new();
        tracker.on_sent(ack(3), vec![7], now);

        assert_eq!(tracker.on_sent(ack(3 + MAX_UNACKED_HISTORY as u16), vec![8], now), Some(ack(3)));

        // the old packet's reliable ids are gone from the slot
        let outcome = tracker.on_ack_header(ack(3 + MAX_UNACKED_HISTORY as u16), 0, now);
        assert_eq!(outcome.confirmed.len(), 1);
        assert_eq!(outcome.confirmed[0].reliable_ids, vec![8]);
    }

    #[test]
    fn test_untracked_send_clears_stale_slot() {
        let now = Instant::now();
        let mut tracker = PacketTracker::new();
        tracker.on_sent(ack(5), vec![1, 2], now);
        assert_eq!(tracker.on_sent_untracked(ack(5 + MAX_UNACKED_HISTORY as u16)), Some(ack(5)));
        assert_eq!(tracker.on_sent_untracked(ack(5 + 2 * MAX_UNACKED_HISTORY as u16)), None);

        let outcome = tracker.on_ack_header(ack(5 + 2 * MAX_UNACKED_HISTORY as u16), u16::MAX, now);
        assert!(outcome.confirmed.is_empty());
        assert_eq!(tracker.num_in_flight(), 0);
    }

    #[test]
    fn test_ack_number_wrap_around() {
        let now = Instant::now();
        let mut tracker = PacketTracker::new();
        let first = ack(u16::MAX - 2);
        let mut a = first;
        for _ in 0..6 {
            tracker.on_sent(a, vec![a.to_raw()], now);
            a = a.next();
        }
        // sent: MAX-2, MAX-1, MAX, 1, 2, 3

        let outcome = tracker.on_ack_header(ack(2), 0b0000_0110, now);
        assert_eq!(acks(&outcome.confirmed), vec![u16::MAX - 1, u16::MAX, 2]);
        assert!(outcome.lost.is_empty());
        assert_eq!(tracker.num_in_flight(), 3);
    }

    #[test]
    fn test_clear() {
        let mut tracker = PacketTracker::new();
        tracker.on_sent(ack(1), vec![1], Instant::now());
        tracker.clear();
        assert_eq!(tracker.num_in_flight(), 0);
        assert!(tracker.on_ack_header(ack(1), 0, Instant::now()).confirmed.is_empty());
    }

    /// random loss and irregular ack reports, compared against a brute force computation over
    ///  all packets in flight
    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(3)]
    #[case(4)]
    fn test_ack_reconciliation(#[case] seed: u64) {
        let now = Instant::now();
        let mut rng = StdRng::seed_from_u64(seed);
        let mut tracker = PacketTracker::new();

        let mut in_flight: BTreeMap<u16, Vec<u16>> = BTreeMap::new();
        let mut received: BTreeSet<u16> = BTreeSet::new();
        let mut reliable_id = 0u16;

        for n in 1..3000u16 {
            let ids = (0..rng.gen_range(0..3)).map(|_| { reliable_id += 1; reliable_id }).collect::<Vec<_>>();
            let expected_evicted = if n > MAX_UNACKED_HISTORY as u16 && in_flight.remove(&(n - MAX_UNACKED_HISTORY as u16)).is_some() {
                Some(ack(n - MAX_UNACKED_HISTORY as u16))
            }
            else {
                None
            };
            assert_eq!(tracker.on_sent(ack(n), ids.clone(), now), expected_evicted);
            in_flight.insert(n, ids);

            if rng.gen_bool(0.8) {
                received.insert(n);
            }

            if rng.gen_bool(0.2) {
                let Some(&highest) = received.last() else {
                    continue;
                };
                let mut history = 0u16;
                for i in 0..ACK_BITFIELD_LEN {
                    if highest > i + 1 && received.contains(&(highest - i - 1)) {
                        history |= 1 << i;
                    }
                }

                let mut expected_confirmed = Vec::new();
                let mut expected_lost = Vec::new();
                for (&sent, _) in in_flight.iter().filter(|&(&sent, _)| sent <= highest) {
                    let distance = highest - sent;
                    if distance == 0 || (distance <= ACK_BITFIELD_LEN && received.contains(&sent)) {
                        expected_confirmed.push(sent);
                    }
                    else if distance > ACK_BITFIELD_LEN {
                        expected_lost.push(sent);
                    }
                }

                let outcome = tracker.on_ack_header(ack(highest), history, now);
                assert_eq!(acks(&outcome.confirmed), expected_confirmed);
                assert_eq!(outcome.lost.iter().map(|a| a.to_raw()).collect::<Vec<_>>(), expected_lost);
                for p in &outcome.confirmed {
                    assert_eq!(Some(&p.reliable_ids), in_flight.get(&p.ack.to_raw()));
                }

                for sent in expected_confirmed.into_iter().chain(expected_lost) {
                    in_flight.remove(&sent);
                }
            }
        }
        assert_eq!(tracker.num_in_flight(), in_flight.len());
    }
}
