use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::protocol::{sequence_greater_than, ProtocolPacket};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReorderStat {
    OldRealm,
    OldCounter,
    WaitingNextRealm,
    WaitingNextCounter,
    Retrievable,
}

/// Delivery horizon of a peer: the realm and counter of the last reorderable packet
/// handed to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReorderCursor {
    pub realm: u16,
    pub counter: u16,
}

impl ReorderCursor {
    pub fn advance(&mut self, packet: &ProtocolPacket) {
        self.realm = packet.realm();
        self.counter = packet.counter();
    }
}

struct Entry(ProtocolPacket);

impl Entry {
    fn key(&self) -> (u16, u16) {
        (self.0.realm(), self.0.counter())
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // max heap: the oldest (realm, counter) compares greatest
    fn cmp(&self, other: &Self) -> Ordering {
        let (realm, counter) = self.key();
        let (other_realm, other_counter) = other.key();
        let newer = |a: u16, b: u16| {
            if a == b {
                Ordering::Equal
            } else if sequence_greater_than(a, b) {
                Ordering::Greater
            } else {
                Ordering::Less
            }
        };
        newer(realm, other_realm)
            .then_with(|| newer(counter, other_counter))
            .reverse()
    }
}

/// Buffers reorderable packets until their predecessor has been delivered.
///
/// Once more than `max_size` packets are waiting, the oldest one is delivered regardless of
/// gaps, trading strict ordering for bounded latency.
pub struct Reorderer {
    heap: BinaryHeap<Entry>,
    max_size: usize,
}

impl Reorderer {
    pub fn new(max_size: usize) -> Self {
        Self {
            heap: BinaryHeap::new(),
            max_size,
        }
    }

    pub fn check_stat(packet: &ProtocolPacket, cursor: &ReorderCursor) -> ReorderStat {
        let realm = packet.realm();
        if realm != cursor.realm {
            if sequence_greater_than(realm, cursor.realm) {
                return if packet.last_reordered_counter() == 0 {
                    ReorderStat::Retrievable
                } else {
                    ReorderStat::WaitingNextRealm
                };
            }
            return ReorderStat::OldRealm;
        }
        if !sequence_greater_than(packet.counter(), cursor.counter) {
            return ReorderStat::OldCounter;
        }
        if packet.last_reordered_counter() == cursor.counter {
            ReorderStat::Retrievable
        } else {
            ReorderStat::WaitingNextCounter
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.heap.len()
    }
    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
    pub fn max_size(&self) -> usize {
        self.max_size
    }
    pub fn clear(&mut self) {
        self.heap.clear();
    }

    pub fn push(&mut self, packet: ProtocolPacket) {
        self.heap.push(Entry(packet));
    }

    /// Pops the next deliverable packet, dropping stale ones along the way.
    pub fn pop(&mut self, cursor: &mut ReorderCursor) -> Option<ProtocolPacket> {
        while let Some(top) = self.heap.peek() {
            match Self::check_stat(&top.0, cursor) {
                ReorderStat::OldRealm | ReorderStat::OldCounter => {
                    if let Some(Entry(stale)) = self.heap.pop() {
                        log::trace!(
                            "dropping stale buffered packet {}:{}",
                            stale.realm(),
                            stale.counter()
                        );
                    }
                }
                ReorderStat::Retrievable => {
                    let Entry(packet) = self.heap.pop()?;
                    cursor.advance(&packet);
                    return Some(packet);
                }
                ReorderStat::WaitingNextRealm | ReorderStat::WaitingNextCounter => return None,
            }
        }
        None
    }

    /// Delivers the oldest buffered packet if the buffer is over its bound.
    pub fn force_pop(&mut self, cursor: &mut ReorderCursor) -> Option<ProtocolPacket> {
        if self.heap.len() <= self.max_size {
            return None;
        }
        let Entry(packet) = self.heap.pop()?;
        log::debug!(
            "reorder buffer full, forcing {}:{} past {}:{}",
            packet.realm(),
            packet.counter(),
            cursor.realm,
            cursor.counter
        );
        cursor.advance(&packet);
        Some(packet)
    }

    /// Classifies `packet` and returns everything that became deliverable, in order.
    pub fn process(
        &mut self,
        packet: ProtocolPacket,
        cursor: &mut ReorderCursor,
    ) -> Vec<ProtocolPacket> {
        let mut delivered = Vec::new();
        match Self::check_stat(&packet, cursor) {
            stat @ (ReorderStat::OldRealm | ReorderStat::OldCounter) => {
                log::trace!(
                    "dropping {:?} packet {}:{} (cursor {}:{})",
                    stat,
                    packet.realm(),
                    packet.counter(),
                    cursor.realm,
                    cursor.counter
                );
                return delivered;
            }
            ReorderStat::Retrievable => {
                cursor.advance(&packet);
                delivered.push(packet);
            }
            ReorderStat::WaitingNextRealm | ReorderStat::WaitingNextCounter => self.push(packet),
        }
        loop {
            while let Some(next) = self.pop(cursor) {
                delivered.push(next);
            }
            match self.force_pop(cursor) {
                Some(forced) => delivered.push(forced),
                None => break,
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packet;

    fn packet(realm: u16, counter: u16, last_reordered: u16) -> ProtocolPacket {
        let mut packet = ProtocolPacket::new(1, Packet::new());
        let header = packet.header_mut();
        header.realm = realm;
        header.counter = counter;
        header.last_reordered_counter = last_reordered;
        packet
    }

    fn counters(packets: &[ProtocolPacket]) -> Vec<u16> {
        packets.iter().map(|p| p.counter()).collect()
    }

    #[test]
    fn stat_classification() {
        let cursor = ReorderCursor {
            realm: 3,
            counter: 10,
        };
        let stat = |p: ProtocolPacket| Reorderer::check_stat(&p, &cursor);
        assert_eq!(stat(packet(2, 50, 49)), ReorderStat::OldRealm);
        assert_eq!(stat(packet(3, 10, 9)), ReorderStat::OldCounter);
        assert_eq!(stat(packet(3, 8, 7)), ReorderStat::OldCounter);
        assert_eq!(stat(packet(3, 11, 10)), ReorderStat::Retrievable);
        assert_eq!(stat(packet(3, 12, 11)), ReorderStat::WaitingNextCounter);
        assert_eq!(stat(packet(4, 1, 0)), ReorderStat::Retrievable);
        assert_eq!(stat(packet(4, 2, 1)), ReorderStat::WaitingNextRealm);
    }

    #[test]
    fn delivers_in_counter_order() {
        let mut reorderer = Reorderer::new(16);
        let mut cursor = ReorderCursor::default();

        assert!(reorderer.process(packet(0, 3, 2), &mut cursor).is_empty());
        assert!(reorderer.process(packet(0, 2, 1), &mut cursor).is_empty());
        let delivered = reorderer.process(packet(0, 1, 0), &mut cursor);
        assert_eq!(counters(&delivered), [1, 2, 3]);
        assert!(reorderer.is_empty());

        // late duplicate
        assert!(reorderer.process(packet(0, 2, 1), &mut cursor).is_empty());
    }

    #[test]
    fn gaps_from_unordered_packets_are_followed() {
        // counters 2 and 4 were DO_NOT_REORDER, the chain skips them
        let mut reorderer = Reorderer::new(16);
        let mut cursor = ReorderCursor::default();
        assert!(reorderer.process(packet(0, 5, 3), &mut cursor).is_empty());
        assert!(reorderer.process(packet(0, 3, 1), &mut cursor).is_empty());
        let delivered = reorderer.process(packet(0, 1, 0), &mut cursor);
        assert_eq!(counters(&delivered), [1, 3, 5]);
    }

    #[test]
    fn force_flush_delivers_oldest_once() {
        let mut reorderer = Reorderer::new(2);
        let mut cursor = ReorderCursor::default();
        // counter 1 is lost
        assert!(reorderer.process(packet(0, 3, 2), &mut cursor).is_empty());
        assert!(reorderer.process(packet(0, 2, 1), &mut cursor).is_empty());
        let delivered = reorderer.process(packet(0, 5, 4), &mut cursor);
        // over the bound: 2 is forced out, which unblocks 3, 5 still waits on 4
        assert_eq!(counters(&delivered), [2, 3]);
        assert_eq!(reorderer.len(), 1);

        // the lost packet showing up late is stale now
        assert!(reorderer.process(packet(0, 1, 0), &mut cursor).is_empty());
        let delivered = reorderer.process(packet(0, 4, 3), &mut cursor);
        assert_eq!(counters(&delivered), [4, 5]);
    }

    #[test]
    fn new_realm_drops_old_buffered() {
        let mut reorderer = Reorderer::new(16);
        let mut cursor = ReorderCursor::default();
        assert!(reorderer.process(packet(0, 9, 8), &mut cursor).is_empty());
        let delivered = reorderer.process(packet(1, 1, 0), &mut cursor);
        assert_eq!(counters(&delivered), [1]);
        assert_eq!(cursor.realm, 1);
        // the realm 0 leftover is dropped on the next pop
        assert_eq!(reorderer.pop(&mut cursor), None);
        assert!(reorderer.is_empty());
    }
}
