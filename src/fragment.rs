//! Splitting of oversized datagrams into fragment envelopes, and their reassembly.
//!
//! A fragment envelope is a regular header with the `Fragmented` internal id where the
//! realm field carries the fragment set id and the counter field carries the fragment
//! index. The first fragment of a set starts with a one byte fragment count. Every
//! fragment is sized as if it carried that byte, so a datagram of `S` bytes always yields
//! `ceil(S / fragment_capacity(mtu))` fragments.
//!
//! Incomplete sets are bounded FIFO: once `max_sets` partial sets are pending, starting a
//! new one evicts the oldest.

use std::collections::{HashMap, VecDeque};

use crate::consts::{FRAGMENT_COUNT_SIZE, HEADER_SIZE, MAX_FRAGMENTS};
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::protocol::{encode_with_payload, Header, HeaderFlags, InternalId, ProtocolPacket};
use crate::time::Timestamp;

/// Payload bytes a single fragment can carry for the given mtu.
pub fn fragment_capacity(mtu: u16) -> usize {
    (mtu as usize).saturating_sub(HEADER_SIZE + FRAGMENT_COUNT_SIZE)
}

#[derive(Debug, Default)]
pub struct Fragmenter {
    next_id: u16,
}

impl Fragmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Splits an already serialized datagram into wire ready fragment envelopes.
    pub fn fragment(&mut self, data: &[u8], mtu: u16) -> Result<Vec<Vec<u8>>> {
        let capacity = fragment_capacity(mtu);
        if capacity == 0 {
            return Err(Error::PacketTooLarge {
                size: data.len(),
                mtu,
            });
        }
        let count = data.len().div_ceil(capacity);
        if count > MAX_FRAGMENTS {
            return Err(Error::FragmentOverflow {
                size: data.len(),
                max: MAX_FRAGMENTS,
            });
        }

        let set_id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        let fragments = data
            .chunks(capacity)
            .enumerate()
            .map(|(index, chunk)| {
                let header = Header {
                    id: InternalId::Fragmented.id(),
                    flags: HeaderFlags::DO_NOT_REORDER,
                    realm: set_id,
                    counter: index as u16,
                    last_reordered_counter: 0,
                };
                if index == 0 {
                    let mut payload = Vec::with_capacity(FRAGMENT_COUNT_SIZE + chunk.len());
                    payload.push(count as u8);
                    payload.extend_from_slice(chunk);
                    encode_with_payload(&header, &payload)
                } else {
                    encode_with_payload(&header, chunk)
                }
            })
            .collect::<Vec<_>>();
        log::trace!(
            "fragmented {} bytes into {} fragments (set {})",
            data.len(),
            fragments.len(),
            set_id
        );
        Ok(fragments)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefragStatus {
    /// Every fragment of the set is present, call [`Defragmenter::retrieve`].
    Retrievable(u16),
    Waiting,
    /// Duplicate or malformed fragment, dropped.
    Discarded,
}

#[derive(Debug)]
struct FragmentSet {
    id: u16,
    total: Option<usize>,
    fragments: HashMap<usize, Vec<u8>>,
    identity: Identity,
    timestamp: Timestamp,
}

impl FragmentSet {
    fn is_complete(&self) -> bool {
        self.total == Some(self.fragments.len())
    }
}

#[derive(Debug)]
pub struct Defragmenter {
    sets: VecDeque<FragmentSet>,
    max_sets: usize,
}

impl Defragmenter {
    pub fn new(max_sets: usize) -> Self {
        Self {
            sets: VecDeque::new(),
            max_sets: max_sets.max(1),
        }
    }

    #[cfg(test)]
    pub fn pending_sets(&self) -> usize {
        self.sets.len()
    }

    pub fn clear(&mut self) {
        self.sets.clear();
    }

    pub fn process(&mut self, mut packet: ProtocolPacket) -> DefragStatus {
        if packet.internal_id() != Some(InternalId::Fragmented) {
            return DefragStatus::Discarded;
        }
        let set_id = packet.realm();
        let index = packet.counter() as usize;
        if index >= MAX_FRAGMENTS {
            log::trace!("fragment index {} out of range", index);
            return DefragStatus::Discarded;
        }

        let mut total = None;
        if index == 0 {
            match packet.packet_mut().read::<u8>() {
                Some(count) if count > 0 => total = Some(count as usize),
                _ => {
                    log::trace!("first fragment of set {} has no valid count", set_id);
                    return DefragStatus::Discarded;
                }
            }
        }
        let identity = packet.identity();
        let timestamp = packet.timestamp();
        let data = packet.packet().remaining().to_vec();

        let position = match self.sets.iter().position(|set| set.id == set_id) {
            Some(position) => position,
            None => {
                if self.sets.len() >= self.max_sets {
                    if let Some(evicted) = self.sets.pop_front() {
                        log::debug!(
                            "evicting fragment set {} with {} fragments",
                            evicted.id,
                            evicted.fragments.len()
                        );
                    }
                }
                self.sets.push_back(FragmentSet {
                    id: set_id,
                    total: None,
                    fragments: HashMap::new(),
                    identity,
                    timestamp,
                });
                self.sets.len() - 1
            }
        };
        let set = &mut self.sets[position];

        if let Some(total) = total {
            if set.fragments.keys().any(|i| *i >= total) {
                log::trace!("fragment set {} count conflicts with received fragments", set_id);
                return DefragStatus::Discarded;
            }
            set.total = Some(total);
        }
        if matches!(set.total, Some(total) if index >= total) {
            return DefragStatus::Discarded;
        }
        if set.fragments.contains_key(&index) {
            log::trace!("duplicate fragment {} of set {}", index, set_id);
            return DefragStatus::Discarded;
        }
        set.fragments.insert(index, data);
        set.timestamp = timestamp;

        if set.is_complete() {
            DefragStatus::Retrievable(set_id)
        } else {
            DefragStatus::Waiting
        }
    }

    /// Removes a complete set and decodes the reassembled datagram.
    pub fn retrieve(&mut self, set_id: u16) -> Option<ProtocolPacket> {
        let position = self
            .sets
            .iter()
            .position(|set| set.id == set_id && set.is_complete())?;
        let mut set = self.sets.remove(position)?;
        let total = set.total?;
        let mut data = Vec::new();
        for index in 0..total {
            data.extend_from_slice(&set.fragments.remove(&index)?);
        }
        ProtocolPacket::decode(&data, set.identity, set.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packet;
    use std::net::Ipv4Addr;

    fn to_packet(bytes: &[u8]) -> ProtocolPacket {
        ProtocolPacket::decode(bytes, Identity::new(Ipv4Addr::LOCALHOST, 5000), 0).unwrap()
    }

    fn datagram(payload_len: usize) -> Vec<u8> {
        let payload = (0..payload_len).map(|i| (i % 251) as u8).collect::<Vec<_>>();
        ProtocolPacket::new(3, Packet::from_bytes(payload)).encode()
    }

    #[test]
    fn fragment_count_is_ceil() {
        let mtu = 100;
        let capacity = fragment_capacity(mtu);
        assert_eq!(capacity, 91);

        let mut fragmenter = Fragmenter::new();
        let exact = vec![0u8; capacity * 4];
        assert_eq!(fragmenter.fragment(&exact, mtu).unwrap().len(), 4);
        let one_more = vec![0u8; capacity * 4 + 1];
        let fragments = fragmenter.fragment(&one_more, mtu).unwrap();
        assert_eq!(fragments.len(), 5);
        assert!(fragments.iter().all(|f| f.len() <= mtu as usize));
    }

    #[test]
    fn too_many_fragments() {
        let mut fragmenter = Fragmenter::new();
        let data = vec![0u8; fragment_capacity(20) * MAX_FRAGMENTS + 1];
        assert!(matches!(
            fragmenter.fragment(&data, 20),
            Err(Error::FragmentOverflow { .. })
        ));
    }

    #[test]
    fn reassembles_in_any_order() {
        let original = datagram(1000);
        let mut fragmenter = Fragmenter::new();
        let mut fragments = fragmenter.fragment(&original, 300).unwrap();
        fragments.reverse();
        fragments.swap(0, 2);

        let mut defrag = Defragmenter::new(4);
        let last = fragments.pop().unwrap();
        for fragment in &fragments {
            assert_eq!(defrag.process(to_packet(fragment)), DefragStatus::Waiting);
        }
        let DefragStatus::Retrievable(id) = defrag.process(to_packet(&last)) else {
            panic!("set should be complete");
        };
        let packet = defrag.retrieve(id).unwrap();
        assert_eq!(packet.encode(), original);
        assert_eq!(defrag.pending_sets(), 0);
    }

    #[test]
    fn missing_fragment_never_completes() {
        let original = datagram(700);
        let mut fragmenter = Fragmenter::new();
        let fragments = fragmenter.fragment(&original, 200).unwrap();
        let mut defrag = Defragmenter::new(4);
        for fragment in fragments.iter().skip(1) {
            assert_eq!(defrag.process(to_packet(fragment)), DefragStatus::Waiting);
        }
        // duplicates are dropped and don't complete the set either
        assert_eq!(
            defrag.process(to_packet(&fragments[1])),
            DefragStatus::Discarded
        );
        assert_eq!(defrag.retrieve(0), None);
    }

    #[test]
    fn oldest_partial_set_is_evicted() {
        let mut fragmenter = Fragmenter::new();
        let mut defrag = Defragmenter::new(2);
        let sets = (0..3)
            .map(|_| fragmenter.fragment(&datagram(400), 200).unwrap())
            .collect::<Vec<_>>();
        for set in &sets {
            defrag.process(to_packet(&set[0]));
        }
        assert_eq!(defrag.pending_sets(), 2);

        // set 0 was evicted: its remaining fragments start a fresh set without a count
        for fragment in &sets[0][1..] {
            assert_eq!(defrag.process(to_packet(fragment)), DefragStatus::Waiting);
        }
        // set 2 survived and completes
        let mut status = DefragStatus::Waiting;
        for fragment in &sets[2][1..] {
            status = defrag.process(to_packet(fragment));
        }
        assert_eq!(status, DefragStatus::Retrievable(2));
    }

    #[test]
    fn non_fragment_is_discarded() {
        let mut defrag = Defragmenter::new(2);
        let packet = to_packet(&datagram(10));
        assert_eq!(defrag.process(packet), DefragStatus::Discarded);
    }
}
