use std::collections::{HashSet, VecDeque};

use crate::cache::PacketCache;
use crate::compressor::Compressor;
use crate::config::NetConfig;
use crate::consts::{HEADER_SIZE, MAX_ACKS_PER_RETURN, MAX_FRAGMENTS, RECENT_UNORDERED_WINDOW};
use crate::crypto::{CryptoError, CryptoSession};
use crate::error::{Error, Result};
use crate::fragment::{fragment_capacity, DefragStatus, Defragmenter, Fragmenter};
use crate::identity::Identity;
use crate::latency::LatencyPlanner;
use crate::packet::Packet;
use crate::protocol::{
    encode_with_payload, sequence_greater_than, HeaderFlags, InternalId, Label, ProtocolPacket,
};
use crate::reorder::{ReorderCursor, Reorderer};

/// The states of a peer connection.
///
/// Ordered so that every state below `Disconnected` is an error state, as
/// [`Client::is_error`] relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClientStatus {
    /// Nothing was received from the peer for too long, or too many reliable packets were lost.
    TimedOut,
    Disconnected,
    /// Handshake and mtu negotiation in progress.
    Handshaking,
    /// Crypto handshake in progress.
    Authenticating,
    Connected,
    /// A disconnect notice is queued but not sent yet.
    Disconnecting,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ClientStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub retransmissions: u64,
    pub packets_lost: u64,
}

fn next_counter(counter: u16) -> u16 {
    match counter.wrapping_add(1) {
        0 => 1,
        next => next,
    }
}

/// Per-peer protocol state.
///
/// A `Client` owns everything that sequences the traffic with one peer: the outbound
/// queue, realm and counters, the retransmission cache, the reorderer and the
/// defragmenter, the latency planner and the crypto session. It performs no I/O:
/// [`Client::drain_outbound`] produces datagrams and [`Client::receive`] consumes
/// decoded packets, which keeps it usable from both endpoints and easy to test.
pub struct Client {
    identity: Identity,
    status: ClientStatus,
    realm: u16,
    current_counter: u16,
    last_reordered_counter: u16,
    peer_counter: u16,
    cursor: ReorderCursor,
    acknowledgments: HashSet<Label>,
    lost_packets: u32,
    lost_packet_threshold: u32,
    latency: LatencyPlanner,
    mtu: u16,
    crypto: Option<Box<dyn CryptoSession>>,
    queue: VecDeque<ProtocolPacket>,
    cache: PacketCache,
    reorderer: Reorderer,
    defragmenter: Defragmenter,
    fragmenter: Fragmenter,
    recent_unordered: VecDeque<Label>,
    // user packets that overtook the end of the handshake
    early: Vec<ProtocolPacket>,
    return_rate: f64,
    last_return_time: f64,
    last_receive_time: f64,
    compression_threshold: usize,
    stats: ClientStats,
}

impl Client {
    pub fn new(identity: Identity, cfg: &NetConfig, time: f64) -> Self {
        let cache = if cfg.cache_enabled {
            PacketCache::new(cfg.cache_size)
        } else {
            PacketCache::disabled()
        };
        Self {
            identity,
            status: ClientStatus::Handshaking,
            realm: 0,
            current_counter: 0,
            last_reordered_counter: 0,
            peer_counter: 0,
            cursor: ReorderCursor::default(),
            acknowledgments: HashSet::new(),
            lost_packets: 0,
            lost_packet_threshold: cfg.lost_packet_threshold,
            latency: LatencyPlanner::new(),
            mtu: 0,
            crypto: None,
            queue: VecDeque::new(),
            cache,
            reorderer: Reorderer::new(cfg.reorder_cache_size),
            defragmenter: Defragmenter::new(cfg.defrag_max_sets),
            fragmenter: Fragmenter::new(),
            recent_unordered: VecDeque::new(),
            early: Vec::new(),
            return_rate: cfg.return_rate,
            last_return_time: time,
            last_receive_time: time,
            compression_threshold: cfg.compression_threshold,
            stats: ClientStats::default(),
        }
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }
    pub fn status(&self) -> ClientStatus {
        self.status
    }
    pub fn set_status(&mut self, status: ClientStatus) {
        if self.status == status {
            return;
        }
        log::debug!(
            "client {} status changing from {:?} to {:?}",
            self.identity,
            self.status,
            status
        );
        self.status = status;
    }
    pub fn is_connected(&self) -> bool {
        self.status == ClientStatus::Connected
    }
    pub fn is_pending(&self) -> bool {
        matches!(
            self.status,
            ClientStatus::Handshaking | ClientStatus::Authenticating
        )
    }
    pub fn is_error(&self) -> bool {
        self.status < ClientStatus::Disconnected
    }

    pub fn realm(&self) -> u16 {
        self.realm
    }
    pub fn current_counter(&self) -> u16 {
        self.current_counter
    }
    pub fn last_reordered_counter(&self) -> u16 {
        self.last_reordered_counter
    }
    /// Newest counter received from the peer in its current realm.
    pub fn peer_counter(&self) -> u16 {
        self.peer_counter
    }
    /// Realm and counter of the last ordered packet delivered to the application.
    pub fn delivery_cursor(&self) -> ReorderCursor {
        self.cursor
    }

    /// Negotiated mtu, `0` until the mtu discovery completed.
    pub fn mtu(&self) -> u16 {
        self.mtu
    }
    pub fn set_mtu(&mut self, mtu: u16) {
        log::debug!("client {} mtu set to {}", self.identity, mtu);
        self.mtu = mtu;
    }
    /// Largest payload that still fits a single datagram, if the mtu is known.
    pub fn max_payload_size(&self) -> Option<usize> {
        (self.mtu != 0).then(|| self.mtu as usize - HEADER_SIZE)
    }

    pub fn latency(&self) -> &LatencyPlanner {
        &self.latency
    }
    pub fn stats(&self) -> ClientStats {
        self.stats
    }
    pub fn lost_packets(&self) -> u32 {
        self.lost_packets
    }
    pub fn is_lost_threshold_reached(&self) -> bool {
        self.lost_packet_threshold > 0 && self.lost_packets >= self.lost_packet_threshold
    }
    pub fn last_receive_time(&self) -> f64 {
        self.last_receive_time
    }
    pub fn has_timed_out(&self, time: f64, timeout: f64) -> bool {
        timeout > 0.0 && time - self.last_receive_time > timeout
    }
    pub fn cache(&self) -> &PacketCache {
        &self.cache
    }
    pub fn pending_acknowledgments(&self) -> usize {
        self.acknowledgments.len()
    }
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }
    pub fn return_rate(&self) -> f64 {
        self.return_rate
    }

    pub fn push_packet(&mut self, packet: ProtocolPacket) {
        self.queue.push_back(packet);
    }
    pub fn clear_queue(&mut self) {
        self.queue.clear();
    }

    /// Restarts every sequence, done on both sides once the connection is established.
    pub fn reset_counters(&mut self) {
        self.current_counter = 0;
        self.last_reordered_counter = 0;
        self.peer_counter = 0;
        self.cursor = ReorderCursor {
            realm: self.cursor.realm,
            counter: 0,
        };
        self.acknowledgments.clear();
        self.recent_unordered.clear();
        self.reorderer.clear();
        self.defragmenter.clear();
        self.cache.clear();
        self.lost_packets = 0;
    }

    /// Starts a new realm: following packets restart their counters and the peer drops
    /// anything still in flight from the previous realm.
    pub fn advance_realm(&mut self) {
        self.realm = self.realm.wrapping_add(1);
        self.current_counter = 0;
        self.last_reordered_counter = 0;
        log::debug!("client {} advanced to realm {}", self.identity, self.realm);
    }

    pub fn set_crypto(&mut self, session: Box<dyn CryptoSession>) {
        self.crypto = Some(session);
    }
    pub fn has_crypto(&self) -> bool {
        self.crypto.is_some()
    }
    pub fn is_crypto_finished(&self) -> bool {
        self.crypto
            .as_ref()
            .map_or(true, |session| session.is_handshake_finished())
    }

    /// Feeds a handshake record (if any), advances the session and queues whatever it
    /// produced. Returns whether the handshake is finished.
    pub fn advance_crypto(
        &mut self,
        incoming: Option<&[u8]>,
    ) -> std::result::Result<bool, CryptoError> {
        let Some(session) = self.crypto.as_mut() else {
            return Ok(true);
        };
        if let Some(record) = incoming {
            session.push_wire(record);
        }
        session.advance_handshake()?;
        while let Some(record) = session.pull_wire() {
            let mut packet = Packet::with_capacity(record.len());
            packet.append(&record);
            self.queue
                .push_back(ProtocolPacket::internal(InternalId::CryptHandshake, packet));
        }
        Ok(session.is_handshake_finished())
    }

    fn stamp(&mut self, packet: &mut ProtocolPacket) {
        self.current_counter = next_counter(self.current_counter);
        let reorderable = packet.is_reorderable();
        let header = packet.header_mut();
        header.realm = self.realm;
        header.counter = self.current_counter;
        header.last_reordered_counter = self.last_reordered_counter;
        if reorderable {
            self.last_reordered_counter = self.current_counter;
        }
    }

    fn build_return(&mut self) -> ProtocolPacket {
        let mut packet = ProtocolPacket::internal(InternalId::Return, Packet::new());
        self.latency.pack(&mut packet);
        let labels = self
            .acknowledgments
            .iter()
            .take(MAX_ACKS_PER_RETURN)
            .copied()
            .collect::<Vec<_>>();
        for label in &labels {
            self.acknowledgments.remove(label);
        }
        packet.packet_mut().write(&labels);
        packet
    }

    fn serialize(
        &mut self,
        packet: &ProtocolPacket,
        time: f64,
        compressor: Option<&dyn Compressor>,
    ) -> Result<Vec<Vec<u8>>> {
        let mut payload = packet.stamped_payload(time, self.latency.correction_latency(time));
        let mut header = *packet.header();
        if let Some(compressor) = compressor {
            if !packet.is_internal()
                && payload.len() >= self.compression_threshold
                && payload.len() <= compressor.max_decompressed_size()
            {
                let compressed = compressor.compress(&payload)?;
                if compressed.len() < payload.len() {
                    payload = compressed;
                    header.flags |= HeaderFlags::COMPRESSED;
                }
            }
        }
        let datagram = encode_with_payload(&header, &payload);
        // mtu probes are sized on purpose and may exceed the current mtu
        if self.mtu == 0
            || datagram.len() <= self.mtu as usize
            || packet.internal_id() == Some(InternalId::MtuTest)
        {
            return Ok(vec![datagram]);
        }
        if header.flags.contains(HeaderFlags::DO_NOT_FRAGMENT) {
            return Err(Error::PacketTooLarge {
                size: datagram.len(),
                mtu: self.mtu,
            });
        }
        self.fragmenter.fragment(&datagram, self.mtu)
    }

    /// Checks a user packet against the negotiated mtu before it is queued.
    pub fn check_size(&self, packet: &ProtocolPacket) -> Result<()> {
        if self.mtu == 0 {
            return Ok(());
        }
        let size = HEADER_SIZE + packet.packet().len();
        if packet.has_flags(HeaderFlags::DO_NOT_FRAGMENT) && size > self.mtu as usize {
            return Err(Error::PacketTooLarge {
                size,
                mtu: self.mtu,
            });
        }
        if size > fragment_capacity(self.mtu) * MAX_FRAGMENTS {
            return Err(Error::FragmentOverflow {
                size,
                max: MAX_FRAGMENTS,
            });
        }
        Ok(())
    }

    /// Produces the datagrams due at `time`: a return packet when one is due, pending
    /// retransmissions, then queued packets, at most `budget` packets in total.
    pub fn drain_outbound(
        &mut self,
        time: f64,
        compressor: Option<&dyn Compressor>,
        budget: usize,
    ) -> Vec<Vec<u8>> {
        let mut datagrams = Vec::new();
        let mut remaining = budget;

        // a backlog beyond one return packet is flushed without waiting for the rate
        let return_due = time - self.last_return_time >= self.return_rate
            || self.acknowledgments.len() > MAX_ACKS_PER_RETURN;
        if self.is_connected() && return_due {
            self.last_return_time = time;
            let packet = self.build_return();
            self.queue.push_front(packet);
        }

        if self.is_connected() {
            let rtt = self
                .latency
                .round_trip_time()
                .map_or(0.0, |rtt| rtt as f64 / 1000.0);
            self.cache.check(time, self.return_rate + rtt);
            while remaining > 0 {
                let Some(packet) = self.cache.pop(time) else {
                    break;
                };
                remaining -= 1;
                self.lost_packets += 1;
                self.stats.retransmissions += 1;
                log::trace!(
                    "client {} retransmitting {}:{}",
                    self.identity,
                    packet.realm(),
                    packet.counter()
                );
                match self.serialize(&packet, time, compressor) {
                    Ok(mut out) => datagrams.append(&mut out),
                    Err(e) => log::warn!("client {} dropped a retransmission: {e}", self.identity),
                }
            }
        }

        while remaining > 0 {
            let Some(mut packet) = self.queue.pop_front() else {
                break;
            };
            remaining -= 1;
            self.stamp(&mut packet);
            let out = match self.serialize(&packet, time, compressor) {
                Ok(out) => out,
                Err(e) => {
                    log::warn!(
                        "client {} dropped packet {}: {e}",
                        self.identity,
                        packet.id()
                    );
                    continue;
                }
            };
            datagrams.extend(out);

            let is_disconnect = packet.internal_id() == Some(InternalId::Disconnect);
            if packet.has_flags(HeaderFlags::DO_NOT_DISCARD) && self.is_connected() {
                if self.cache.push(packet, time).is_some() {
                    self.lost_packets += 1;
                    self.stats.packets_lost += 1;
                }
            }
            if is_disconnect {
                self.set_status(ClientStatus::Disconnected);
            }
        }

        self.stats.packets_sent += datagrams.len() as u64;
        self.stats.bytes_sent += datagrams.iter().map(|d| d.len() as u64).sum::<u64>();
        datagrams
    }

    /// Runs a received packet through defragmentation, decompression, acknowledgment and
    /// reordering. Returns the packets ready for delivery, in order.
    pub fn receive(
        &mut self,
        packet: ProtocolPacket,
        time: f64,
        compressor: Option<&dyn Compressor>,
    ) -> Vec<ProtocolPacket> {
        self.last_receive_time = time;
        self.stats.packets_received += 1;
        self.stats.bytes_received += (HEADER_SIZE + packet.packet().len()) as u64;

        let mut packet = if packet.internal_id() == Some(InternalId::Fragmented) {
            match self.defragmenter.process(packet) {
                DefragStatus::Retrievable(set) => match self.defragmenter.retrieve(set) {
                    Some(packet) => packet,
                    None => {
                        log::trace!("client {} reassembled an invalid packet", self.identity);
                        return Vec::new();
                    }
                },
                DefragStatus::Waiting | DefragStatus::Discarded => return Vec::new(),
            }
        } else {
            packet
        };

        if packet.has_flags(HeaderFlags::COMPRESSED) {
            let Some(compressor) = compressor else {
                log::trace!(
                    "client {} sent a compressed packet but no compressor is set",
                    self.identity
                );
                return Vec::new();
            };
            match compressor.decompress(packet.packet().data()) {
                Ok(data) => {
                    *packet.packet_mut() = Packet::from_bytes(data);
                    packet.header_mut().flags.remove(HeaderFlags::COMPRESSED);
                }
                Err(e) => {
                    log::trace!(
                        "client {} sent a packet that failed to decompress: {e}",
                        self.identity
                    );
                    return Vec::new();
                }
            }
        }

        if self.is_pending() && !packet.is_internal() {
            if self.early.len() < self.reorderer.max_size() {
                self.early.push(packet);
            } else {
                log::trace!("client {} dropped an early packet", self.identity);
            }
            return Vec::new();
        }
        self.sequence(packet, time)
    }

    // acknowledgment, duplicate suppression and reordering of a whole packet
    fn sequence(&mut self, packet: ProtocolPacket, time: f64) -> Vec<ProtocolPacket> {
        if packet.realm() == self.cursor.realm
            && sequence_greater_than(packet.counter(), self.peer_counter)
        {
            self.peer_counter = packet.counter();
        }
        if packet.has_flags(HeaderFlags::DO_NOT_DISCARD) {
            self.acknowledgments.insert(packet.label());
        }

        if packet.internal_id() == Some(InternalId::Return) {
            self.handle_return(packet, time);
            return Vec::new();
        }

        if !packet.is_reorderable() {
            if packet.has_flags(HeaderFlags::DO_NOT_DISCARD) {
                let label = packet.label();
                if self.recent_unordered.contains(&label) {
                    log::trace!(
                        "client {} dropped duplicate {}:{}",
                        self.identity,
                        label.realm,
                        label.counter
                    );
                    return Vec::new();
                }
                if self.recent_unordered.len() == RECENT_UNORDERED_WINDOW {
                    self.recent_unordered.pop_front();
                }
                self.recent_unordered.push_back(label);
            }
            return vec![packet];
        }

        let realm = self.cursor.realm;
        let delivered = self.reorderer.process(packet, &mut self.cursor);
        if self.cursor.realm != realm {
            self.peer_counter = self.cursor.counter;
        }
        delivered
    }

    /// Runs the user packets held back during the handshake, once connected.
    pub fn replay_early(&mut self, time: f64) -> Vec<ProtocolPacket> {
        if !self.is_connected() || self.early.is_empty() {
            return Vec::new();
        }
        log::trace!(
            "client {} replaying {} early packets",
            self.identity,
            self.early.len()
        );
        std::mem::take(&mut self.early)
            .into_iter()
            .flat_map(|packet| self.sequence(packet, time))
            .collect()
    }

    fn handle_return(&mut self, mut packet: ProtocolPacket, time: f64) {
        let payload = packet.packet_mut();
        if !self.latency.unpack(payload, time) {
            log::trace!("client {} sent a malformed return packet", self.identity);
            return;
        }
        let Some(labels) = payload.read::<Vec<Label>>() else {
            log::trace!("client {} sent malformed acknowledgments", self.identity);
            return;
        };
        if self.cache.acknowledge_reception(&labels) > 0 {
            self.lost_packets = 0;
        }
    }
}
