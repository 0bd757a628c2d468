use std::io;

use bitflags::bitflags;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::bytes::Bytes;
use crate::consts::HEADER_SIZE;
use crate::identity::Identity;
use crate::packet::Packet;
use crate::time::{self, Timestamp};

pub const ID_MASK: u16 = 0x0FFF;
pub const FLAGS_MASK: u16 = 0xF000;
pub const INVALID_ID: u16 = 0;
/// Ids above this value belong to the protocol itself.
pub const INTERNAL_ID_START: u16 = 0x0F00;

bitflags! {
    /// The 4 flag bits packed into the top of the header id.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct HeaderFlags: u16 {
        /// Retransmitted until acknowledged.
        const DO_NOT_DISCARD = 1 << 15;
        /// Delivered as soon as it arrives, bypassing the reorderer.
        const DO_NOT_REORDER = 1 << 14;
        /// Payload went through the compressor.
        const COMPRESSED = 1 << 13;
        /// Rejected instead of split when larger than the mtu.
        const DO_NOT_FRAGMENT = 1 << 12;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum InternalId {
    Handshake = INTERNAL_ID_START + 1,
    AskMtu,
    AskMtuResponse,
    MtuTest,
    MtuTestResponse,
    MtuFinal,
    MtuFinalResponse,
    CryptHandshake,
    Return,
    Disconnect,
    Fragmented,
}

impl InternalId {
    pub fn from_id(id: u16) -> Option<Self> {
        const ALL: [InternalId; 11] = [
            InternalId::Handshake,
            InternalId::AskMtu,
            InternalId::AskMtuResponse,
            InternalId::MtuTest,
            InternalId::MtuTestResponse,
            InternalId::MtuFinal,
            InternalId::MtuFinalResponse,
            InternalId::CryptHandshake,
            InternalId::Return,
            InternalId::Disconnect,
            InternalId::Fragmented,
        ];
        ALL.into_iter().find(|internal| *internal as u16 == id)
    }
    pub fn id(self) -> u16 {
        self as u16
    }
}

/// Fixed 8 byte wire header: `id | realm | counter | last_reordered_counter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub id: u16,
    pub flags: HeaderFlags,
    pub realm: u16,
    pub counter: u16,
    pub last_reordered_counter: u16,
}

impl Header {
    pub fn new(id: u16, flags: HeaderFlags) -> Self {
        Self {
            id: id & ID_MASK,
            flags,
            ..Default::default()
        }
    }
    /// Decodes a header, rejecting short buffers and the reserved id before touching any field.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        let header = Self::read_from(&mut io::Cursor::new(buf)).ok()?;
        (header.id != INVALID_ID).then_some(header)
    }
    pub fn is_internal(&self) -> bool {
        self.id > INTERNAL_ID_START
    }
}

impl Bytes for Header {
    fn write_to(&self, writer: &mut impl WriteBytesExt) -> Result<(), io::Error> {
        writer.write_u16::<BigEndian>((self.id & ID_MASK) | self.flags.bits())?;
        writer.write_u16::<BigEndian>(self.realm)?;
        writer.write_u16::<BigEndian>(self.counter)?;
        writer.write_u16::<BigEndian>(self.last_reordered_counter)
    }
    fn read_from(reader: &mut impl ReadBytesExt) -> Result<Self, io::Error> {
        let raw_id = reader.read_u16::<BigEndian>()?;
        Ok(Self {
            id: raw_id & ID_MASK,
            flags: HeaderFlags::from_bits_truncate(raw_id & FLAGS_MASK),
            realm: reader.read_u16::<BigEndian>()?,
            counter: reader.read_u16::<BigEndian>()?,
            last_reordered_counter: reader.read_u16::<BigEndian>()?,
        })
    }
}

/// Identifies a sent packet for acknowledgment purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Label {
    pub counter: u16,
    pub realm: u16,
}

impl Label {
    pub const SIZE: usize = 4;

    pub fn new(counter: u16, realm: u16) -> Self {
        Self { counter, realm }
    }
}

impl Bytes for Label {
    fn write_to(&self, writer: &mut impl WriteBytesExt) -> Result<(), io::Error> {
        writer.write_u16::<BigEndian>(self.counter)?;
        writer.write_u16::<BigEndian>(self.realm)
    }
    fn read_from(reader: &mut impl ReadBytesExt) -> Result<Self, io::Error> {
        Ok(Self {
            counter: reader.read_u16::<BigEndian>()?,
            realm: reader.read_u16::<BigEndian>()?,
        })
    }
}

/// Payload patches applied to a copy of the packet right before it hits the wire,
/// so that retransmissions carry fresh values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOption {
    /// Overwrite the `u16` at `offset` with the current modulated timestamp.
    UpdateTimestamp { offset: usize },
    /// Overwrite the `u64` at `offset` with the current full timestamp.
    UpdateFullTimestamp { offset: usize },
    /// Overwrite the `u16` at `offset` with the latency planner's correction latency.
    UpdateCorrectionLatency { offset: usize },
}

/// A [`Packet`] with its header, the peer it came from (or goes to) and its send options.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolPacket {
    header: Header,
    packet: Packet,
    identity: Identity,
    timestamp: Timestamp,
    options: Vec<SendOption>,
}

impl ProtocolPacket {
    /// Creates a user packet. Only the low 12 bits of `id` are kept.
    pub fn new(id: u16, packet: Packet) -> Self {
        Self {
            header: Header::new(id, HeaderFlags::empty()),
            packet,
            identity: Identity::default(),
            timestamp: 0,
            options: Vec::new(),
        }
    }
    pub fn internal(id: InternalId, packet: Packet) -> Self {
        Self::new(id.id(), packet).with_flags(HeaderFlags::DO_NOT_REORDER)
    }
    pub fn with_flags(mut self, flags: HeaderFlags) -> Self {
        self.header.flags |= flags;
        self
    }
    pub fn with_option(mut self, option: SendOption) -> Self {
        self.options.push(option);
        self
    }

    pub fn id(&self) -> u16 {
        self.header.id
    }
    pub fn internal_id(&self) -> Option<InternalId> {
        if self.header.is_internal() {
            InternalId::from_id(self.header.id)
        } else {
            None
        }
    }
    pub fn is_internal(&self) -> bool {
        self.header.is_internal()
    }
    /// Whether the id may be sent by the application: neither reserved nor internal.
    pub fn is_user(&self) -> bool {
        self.header.id != INVALID_ID && !self.header.is_internal()
    }
    pub fn flags(&self) -> HeaderFlags {
        self.header.flags
    }
    pub fn has_flags(&self, flags: HeaderFlags) -> bool {
        self.header.flags.contains(flags)
    }
    pub fn header(&self) -> &Header {
        &self.header
    }
    pub fn header_mut(&mut self) -> &mut Header {
        &mut self.header
    }
    pub fn realm(&self) -> u16 {
        self.header.realm
    }
    pub fn counter(&self) -> u16 {
        self.header.counter
    }
    pub fn last_reordered_counter(&self) -> u16 {
        self.header.last_reordered_counter
    }
    pub fn label(&self) -> Label {
        Label::new(self.header.counter, self.header.realm)
    }
    pub fn packet(&self) -> &Packet {
        &self.packet
    }
    pub fn packet_mut(&mut self) -> &mut Packet {
        &mut self.packet
    }
    pub fn into_packet(self) -> Packet {
        self.packet
    }
    pub fn identity(&self) -> Identity {
        self.identity
    }
    pub fn set_identity(&mut self, identity: Identity) {
        self.identity = identity;
    }
    /// Local modulated time at which the packet was received.
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
    pub fn set_timestamp(&mut self, timestamp: Timestamp) {
        self.timestamp = timestamp;
    }
    pub fn options(&self) -> &[SendOption] {
        &self.options
    }
    pub fn add_option(&mut self, option: SendOption) {
        self.options.push(option);
    }
    pub fn is_reorderable(&self) -> bool {
        !self.header.flags.contains(HeaderFlags::DO_NOT_REORDER)
    }

    /// Returns a copy of the payload with every send option applied.
    pub fn stamped_payload(&self, time: f64, correction: Option<u16>) -> Vec<u8> {
        let mut payload = self.packet.data().to_vec();
        for option in &self.options {
            let (offset, bytes): (usize, Vec<u8>) = match *option {
                SendOption::UpdateTimestamp { offset } => {
                    (offset, time::timestamp(time).to_be_bytes().to_vec())
                }
                SendOption::UpdateFullTimestamp { offset } => {
                    (offset, time::full_timestamp(time).to_be_bytes().to_vec())
                }
                SendOption::UpdateCorrectionLatency { offset } => {
                    (offset, correction.unwrap_or(0).to_be_bytes().to_vec())
                }
            };
            match payload.get_mut(offset..offset + bytes.len()) {
                Some(slot) => slot.copy_from_slice(&bytes),
                None => log::warn!("send option {:?} is out of the payload bounds", option),
            }
        }
        payload
    }

    /// Header followed by the raw payload, without applying send options.
    pub fn encode(&self) -> Vec<u8> {
        encode_with_payload(&self.header, self.packet.data())
    }

    /// Parses a datagram. Short buffers and the reserved id yield `None`.
    pub fn decode(buf: &[u8], identity: Identity, timestamp: Timestamp) -> Option<Self> {
        let header = Header::decode(buf)?;
        Some(Self {
            header,
            packet: Packet::from_bytes(&buf[HEADER_SIZE..]),
            identity,
            timestamp,
            options: Vec::new(),
        })
    }
}

pub(crate) fn encode_with_payload(header: &Header, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    // writing to a Vec cannot fail
    let _ = header.write_to(&mut buf);
    buf.extend_from_slice(payload);
    buf
}

/// Wrap-aware "a is newer than b" for 16-bit sequence numbers.
pub fn sequence_greater_than(a: u16, b: u16) -> bool {
    const HALF: u16 = u16::MAX / 2 + 1;
    (a > b && a - b < HALF) || (a < b && b - a > HALF)
}
