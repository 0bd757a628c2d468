//! Per-client delta synchronization of shared values.
//!
//! A synchronized value remembers, for every connected client, whether the client still
//! has to receive the current value. [`NetworkTypeBase::clients_checkup`] follows the
//! [`ClientList`](crate::ClientList) events and marks every client once the value changed;
//! [`NetworkTypeBase::pack_client_data`] then writes it at most once per change.
//! A [`NetworkTypeHandler`] groups the values of one object and only writes those that
//! changed, behind a bitmap of their indices.

use std::any::Any;
use std::collections::HashMap;
use std::io;

use byteorder::{ReadBytesExt, WriteBytesExt};

use crate::bytes::Bytes;
use crate::client_list::{ClientListEvent, ClientListGuard};
use crate::identity::Identity;
use crate::packet::Packet;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncFlags {
    /// The value changed since it was last packed for this client.
    pub modified: bool,
    /// The client needs the whole value, not just the changes.
    pub explicit_update: bool,
    /// An update was packed for this client and isn't confirmed yet.
    pub waiting_update: bool,
}

impl SyncFlags {
    fn fresh() -> Self {
        Self {
            modified: true,
            explicit_update: true,
            waiting_update: false,
        }
    }
    pub fn needs_update(&self) -> bool {
        self.modified || self.explicit_update
    }
}

#[derive(Debug, Default)]
pub struct PerClientSyncs {
    flags: HashMap<Identity, SyncFlags>,
}

impl PerClientSyncs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconciles the table with the client list. Clients seen for the first time need a
    /// full update. With `force`, the table is rebuilt from the listed clients instead of
    /// the pending events.
    pub fn checkup(&mut self, clients: &ClientListGuard<'_>, force: bool) {
        if force {
            let identities = clients.identities();
            self.flags.retain(|identity, _| identities.contains(identity));
            for identity in identities {
                self.flags.entry(identity).or_insert_with(SyncFlags::fresh);
            }
            return;
        }
        for event in clients.events() {
            match event {
                ClientListEvent::Connected(identity) => {
                    self.flags.entry(identity).or_insert_with(SyncFlags::fresh);
                }
                ClientListEvent::Disconnected(identity) => {
                    self.flags.remove(&identity);
                }
            }
        }
    }

    pub fn set_all_modified(&mut self) {
        for flags in self.flags.values_mut() {
            flags.modified = true;
        }
    }
    pub fn require_all_explicit(&mut self) {
        for flags in self.flags.values_mut() {
            flags.explicit_update = true;
        }
    }

    pub fn get(&self, identity: &Identity) -> Option<SyncFlags> {
        self.flags.get(identity).copied()
    }
    pub fn get_mut(&mut self, identity: &Identity) -> Option<&mut SyncFlags> {
        self.flags.get_mut(identity)
    }
    pub fn contains(&self, identity: &Identity) -> bool {
        self.flags.contains_key(identity)
    }
    pub fn identities(&self) -> impl Iterator<Item = &Identity> {
        self.flags.keys()
    }
    pub fn len(&self) -> usize {
        self.flags.len()
    }
    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }
}

/// A value synchronized with every connected client.
pub trait NetworkTypeBase: Send {
    /// Returns whether the value changed since the last check and accepts it as the new
    /// broadcast value.
    fn check(&mut self) -> bool;
    /// Makes the next check report a change whatever the value.
    fn force_check(&mut self);
    /// Accepts the current value as broadcast without marking anyone.
    fn force_uncheck(&mut self);
    /// Writes the whole value.
    fn pack_full(&self, packet: &mut Packet);
    /// Writes what `identity` is missing. Values without a change log write everything.
    fn pack_for(&mut self, packet: &mut Packet, _identity: &Identity, _full: bool) {
        self.pack_full(packet);
    }
    /// Reads what [`NetworkTypeBase::pack_full`] or [`NetworkTypeBase::pack_for`] wrote.
    /// The applied value is not broadcast again.
    fn apply_data(&mut self, packet: &mut Packet) -> bool;

    fn syncs(&self) -> &PerClientSyncs;
    fn syncs_mut(&mut self) -> &mut PerClientSyncs;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn clients_checkup(&mut self, clients: &ClientListGuard<'_>, force: bool) {
        self.syncs_mut().checkup(clients, force);
        if self.check() {
            self.syncs_mut().set_all_modified();
        }
    }

    fn needs_update(&self, identity: &Identity) -> bool {
        self.syncs()
            .get(identity)
            .map_or(false, |flags| flags.needs_update())
    }

    /// Packs the value for `identity` if it needs it. Returns whether anything was written.
    fn pack_client_data(&mut self, packet: &mut Packet, identity: &Identity) -> bool {
        let Some(flags) = self.syncs_mut().get_mut(identity) else {
            return false;
        };
        if !flags.needs_update() {
            return false;
        }
        let full = flags.explicit_update;
        flags.modified = false;
        flags.explicit_update = false;
        flags.waiting_update = true;
        self.pack_for(packet, identity, full);
        true
    }

    fn confirm_update(&mut self, identity: &Identity) {
        if let Some(flags) = self.syncs_mut().get_mut(identity) {
            flags.waiting_update = false;
        }
    }

    /// Re-arms an unconfirmed update, e.g. after the packet carrying it was lost.
    fn resend_update(&mut self, identity: &Identity) {
        if let Some(flags) = self.syncs_mut().get_mut(identity) {
            if flags.waiting_update {
                flags.waiting_update = false;
                flags.explicit_update = true;
            }
        }
    }

    fn require_explicit_update(&mut self, identity: &Identity) {
        if let Some(flags) = self.syncs_mut().get_mut(identity) {
            flags.explicit_update = true;
        }
    }
}

/// A single synchronized value.
pub struct NetworkType<T> {
    value: T,
    last_broadcast: Option<T>,
    syncs: PerClientSyncs,
}

impl<T: Bytes + Clone + PartialEq + Send + 'static> NetworkType<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            last_broadcast: None,
            syncs: PerClientSyncs::new(),
        }
    }
    pub fn get(&self) -> &T {
        &self.value
    }
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.value
    }
    pub fn set(&mut self, value: T) {
        self.value = value;
    }
    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T: Bytes + Clone + PartialEq + Send + 'static> NetworkTypeBase for NetworkType<T> {
    fn check(&mut self) -> bool {
        if self.last_broadcast.as_ref() == Some(&self.value) {
            return false;
        }
        self.last_broadcast = Some(self.value.clone());
        true
    }
    fn force_check(&mut self) {
        self.last_broadcast = None;
    }
    fn force_uncheck(&mut self) {
        self.last_broadcast = Some(self.value.clone());
    }
    fn pack_full(&self, packet: &mut Packet) {
        packet.write(&self.value);
    }
    fn apply_data(&mut self, packet: &mut Packet) -> bool {
        let Some(value) = packet.read::<T>() else {
            return false;
        };
        self.last_broadcast = Some(value.clone());
        self.value = value;
        true
    }
    fn syncs(&self) -> &PerClientSyncs {
        &self.syncs
    }
    fn syncs_mut(&mut self) -> &mut PerClientSyncs {
        &mut self.syncs
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A dynamically typed value, for loosely structured object properties.
#[derive(Debug, Clone, PartialEq)]
pub enum Property {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
}

impl Bytes for Property {
    fn write_to(&self, buf: &mut impl WriteBytesExt) -> Result<(), io::Error> {
        match self {
            Property::Bool(v) => {
                buf.write_u8(0)?;
                v.write_to(buf)
            }
            Property::Int(v) => {
                buf.write_u8(1)?;
                v.write_to(buf)
            }
            Property::UInt(v) => {
                buf.write_u8(2)?;
                v.write_to(buf)
            }
            Property::Float(v) => {
                buf.write_u8(3)?;
                v.write_to(buf)
            }
            Property::Str(v) => {
                buf.write_u8(4)?;
                v.write_to(buf)
            }
            Property::Bytes(v) => {
                buf.write_u8(5)?;
                v.write_to(buf)
            }
        }
    }

    fn read_from(reader: &mut impl ReadBytesExt) -> Result<Self, io::Error> {
        Ok(match reader.read_u8()? {
            0 => Property::Bool(bool::read_from(reader)?),
            1 => Property::Int(i64::read_from(reader)?),
            2 => Property::UInt(u64::read_from(reader)?),
            3 => Property::Float(f64::read_from(reader)?),
            4 => Property::Str(String::read_from(reader)?),
            5 => Property::Bytes(Vec::<u8>::read_from(reader)?),
            tag => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown property tag {tag}"),
                ))
            }
        })
    }
}

/// A change to a [`NetworkTypeVector`].
#[derive(Debug, Clone, PartialEq)]
pub enum VectorEvent<T> {
    Push(T),
    Insert(u16, T),
    Remove(u16),
    Set(u16, T),
    Clear,
}

impl<T: Bytes> Bytes for VectorEvent<T> {
    fn write_to(&self, buf: &mut impl WriteBytesExt) -> Result<(), io::Error> {
        match self {
            VectorEvent::Push(value) => {
                buf.write_u8(0)?;
                value.write_to(buf)
            }
            VectorEvent::Insert(index, value) => {
                buf.write_u8(1)?;
                index.write_to(buf)?;
                value.write_to(buf)
            }
            VectorEvent::Remove(index) => {
                buf.write_u8(2)?;
                index.write_to(buf)
            }
            VectorEvent::Set(index, value) => {
                buf.write_u8(3)?;
                index.write_to(buf)?;
                value.write_to(buf)
            }
            VectorEvent::Clear => buf.write_u8(4),
        }
    }

    fn read_from(reader: &mut impl ReadBytesExt) -> Result<Self, io::Error> {
        Ok(match reader.read_u8()? {
            0 => VectorEvent::Push(T::read_from(reader)?),
            1 => VectorEvent::Insert(u16::read_from(reader)?, T::read_from(reader)?),
            2 => VectorEvent::Remove(u16::read_from(reader)?),
            3 => VectorEvent::Set(u16::read_from(reader)?, T::read_from(reader)?),
            4 => VectorEvent::Clear,
            tag => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown vector event {tag}"),
                ))
            }
        })
    }
}

const VECTOR_FULL: u8 = 0;
const VECTOR_EVENTS: u8 = 1;
const DEFAULT_MAX_PENDING_EVENTS: usize = 32;

/// A synchronized vector sending its changes as events.
///
/// Each client keeps its own list of events not yet packed for it. A client that has
/// more than `max_pending_events` waiting, or needs an explicit update, gets the whole
/// vector instead.
pub struct NetworkTypeVector<T> {
    values: Vec<T>,
    events: Vec<VectorEvent<T>>,
    pending: HashMap<Identity, Vec<VectorEvent<T>>>,
    refresh: bool,
    max_pending_events: usize,
    syncs: PerClientSyncs,
}

impl<T: Bytes + Clone + PartialEq + Send + 'static> Default for NetworkTypeVector<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Bytes + Clone + PartialEq + Send + 'static> NetworkTypeVector<T> {
    pub fn new() -> Self {
        Self {
            values: Vec::new(),
            events: Vec::new(),
            pending: HashMap::new(),
            refresh: false,
            max_pending_events: DEFAULT_MAX_PENDING_EVENTS,
            syncs: PerClientSyncs::new(),
        }
    }
    pub fn max_pending_events(mut self, max: usize) -> Self {
        self.max_pending_events = max;
        self
    }

    pub fn push(&mut self, value: T) {
        self.events.push(VectorEvent::Push(value.clone()));
        self.values.push(value);
    }
    /// Inserts at `index`. Returns false if it is out of bounds.
    pub fn insert(&mut self, index: usize, value: T) -> bool {
        if index > self.values.len() || index > u16::MAX as usize {
            return false;
        }
        self.events
            .push(VectorEvent::Insert(index as u16, value.clone()));
        self.values.insert(index, value);
        true
    }
    pub fn remove(&mut self, index: usize) -> Option<T> {
        if index >= self.values.len() {
            return None;
        }
        self.events.push(VectorEvent::Remove(index as u16));
        Some(self.values.remove(index))
    }
    pub fn set(&mut self, index: usize, value: T) -> bool {
        let Some(slot) = self.values.get_mut(index) else {
            return false;
        };
        if *slot == value {
            return true;
        }
        *slot = value.clone();
        self.events.push(VectorEvent::Set(index as u16, value));
        true
    }
    pub fn clear(&mut self) {
        self.values.clear();
        self.events.push(VectorEvent::Clear);
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.values.get(index)
    }
    pub fn as_slice(&self) -> &[T] {
        &self.values
    }
    pub fn len(&self) -> usize {
        self.values.len()
    }
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn apply_event(&mut self, event: VectorEvent<T>) -> bool {
        match event {
            VectorEvent::Push(value) => self.values.push(value),
            VectorEvent::Insert(index, value) if index as usize <= self.values.len() => {
                self.values.insert(index as usize, value)
            }
            VectorEvent::Remove(index) if (index as usize) < self.values.len() => {
                self.values.remove(index as usize);
            }
            VectorEvent::Set(index, value) if (index as usize) < self.values.len() => {
                self.values[index as usize] = value
            }
            VectorEvent::Clear => self.values.clear(),
            _ => return false,
        }
        true
    }
}

impl<T: Bytes + Clone + PartialEq + Send + 'static> NetworkTypeBase for NetworkTypeVector<T> {
    fn check(&mut self) -> bool {
        if self.refresh {
            self.refresh = false;
            self.events.clear();
            self.syncs.require_all_explicit();
            return true;
        }
        if self.events.is_empty() {
            return false;
        }
        let events = std::mem::take(&mut self.events);
        for identity in self.syncs.identities() {
            self.pending
                .entry(*identity)
                .or_default()
                .extend(events.iter().cloned());
        }
        true
    }
    fn force_check(&mut self) {
        self.refresh = true;
    }
    fn force_uncheck(&mut self) {
        self.refresh = false;
        self.events.clear();
    }
    fn pack_full(&self, packet: &mut Packet) {
        packet.write(&VECTOR_FULL).write(&self.values);
    }
    fn pack_for(&mut self, packet: &mut Packet, identity: &Identity, full: bool) {
        let events = self.pending.remove(identity).unwrap_or_default();
        if full || events.len() > self.max_pending_events {
            self.pack_full(packet);
        } else {
            packet.write(&VECTOR_EVENTS).write(&events);
        }
    }
    fn apply_data(&mut self, packet: &mut Packet) -> bool {
        match packet.read::<u8>() {
            Some(VECTOR_FULL) => match packet.read::<Vec<T>>() {
                Some(values) => {
                    self.values = values;
                    true
                }
                None => false,
            },
            Some(VECTOR_EVENTS) => match packet.read::<Vec<VectorEvent<T>>>() {
                Some(events) => events.into_iter().all(|event| self.apply_event(event)),
                None => false,
            },
            _ => {
                packet.invalidate();
                false
            }
        }
    }
    fn syncs(&self) -> &PerClientSyncs {
        &self.syncs
    }
    fn syncs_mut(&mut self) -> &mut PerClientSyncs {
        &mut self.syncs
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn clients_checkup(&mut self, clients: &ClientListGuard<'_>, force: bool) {
        self.syncs.checkup(clients, force);
        let syncs = &self.syncs;
        self.pending.retain(|identity, _| syncs.contains(identity));
        if self.check() {
            self.syncs.set_all_modified();
        }
    }
}

/// The synchronized values of one object, addressed by index.
///
/// Modifications are packed as the number of values, a bitmap of the changed indices,
/// then the data of each changed value in index order.
#[derive(Default)]
pub struct NetworkTypeHandler {
    types: Vec<Box<dyn NetworkTypeBase>>,
}

impl NetworkTypeHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a value, returns its index.
    pub fn push<N: NetworkTypeBase + 'static>(&mut self, value: N) -> usize {
        self.types.push(Box::new(value));
        self.types.len() - 1
    }
    pub fn get(&self, index: usize) -> Option<&dyn NetworkTypeBase> {
        self.types.get(index).map(|value| value.as_ref())
    }
    pub fn get_mut(&mut self, index: usize) -> Option<&mut (dyn NetworkTypeBase + 'static)> {
        self.types.get_mut(index).map(|value| value.as_mut())
    }
    pub fn get_typed<N: 'static>(&self, index: usize) -> Option<&N> {
        self.types.get(index)?.as_any().downcast_ref()
    }
    pub fn get_typed_mut<N: 'static>(&mut self, index: usize) -> Option<&mut N> {
        self.types.get_mut(index)?.as_any_mut().downcast_mut()
    }
    pub fn len(&self) -> usize {
        self.types.len()
    }
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn clients_checkup(&mut self, clients: &ClientListGuard<'_>, force: bool) {
        for value in &mut self.types {
            value.clients_checkup(clients, force);
        }
    }

    fn bitmap_len(&self) -> usize {
        (self.types.len() + 7) / 8
    }

    /// Packs the values `identity` is missing. Returns false, without writing anything,
    /// when it is up to date.
    pub fn pack_modification(&mut self, packet: &mut Packet, identity: &Identity) -> bool {
        let mut bitmap = vec![0u8; self.bitmap_len()];
        let mut any = false;
        for (index, value) in self.types.iter().enumerate() {
            if value.needs_update(identity) {
                bitmap[index / 8] |= 1 << (index % 8);
                any = true;
            }
        }
        if !any {
            return false;
        }
        packet.write(&(self.types.len() as u16)).append(&bitmap);
        for (index, value) in self.types.iter_mut().enumerate() {
            if bitmap[index / 8] & (1 << (index % 8)) != 0 {
                value.pack_client_data(packet, identity);
            }
        }
        true
    }

    /// Packs every value in full, e.g. for a late joiner outside the per-client tracking.
    pub fn pack_all(&self, packet: &mut Packet) {
        let bitmap = vec![0xFFu8; self.bitmap_len()];
        packet.write(&(self.types.len() as u16)).append(&bitmap);
        for value in &self.types {
            value.pack_full(packet);
        }
    }

    /// Applies what [`NetworkTypeHandler::pack_modification`] or
    /// [`NetworkTypeHandler::pack_all`] wrote.
    pub fn unpack_modification(&mut self, packet: &mut Packet) -> bool {
        let Some(count) = packet.read_checked::<u16>(|count| *count as usize == self.types.len())
        else {
            log::trace!("network type count doesn't match the handler");
            return false;
        };
        let Some(bitmap) = packet.read_bytes(self.bitmap_len()) else {
            return false;
        };
        for index in 0..count as usize {
            if bitmap[index / 8] & (1 << (index % 8)) != 0 && !self.types[index].apply_data(packet)
            {
                log::trace!("network type {index} failed to apply");
                return false;
            }
        }
        true
    }

    pub fn confirm_update(&mut self, identity: &Identity) {
        for value in &mut self.types {
            value.confirm_update(identity);
        }
    }
    pub fn resend_update(&mut self, identity: &Identity) {
        for value in &mut self.types {
            value.resend_update(identity);
        }
    }
}
