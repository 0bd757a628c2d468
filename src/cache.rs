use std::collections::VecDeque;

use crate::consts::CACHE_DELAY_FACTOR;
use crate::protocol::{Label, ProtocolPacket};

#[derive(Debug, Clone)]
struct CacheEntry {
    packet: ProtocolPacket,
    label: Label,
    send_time: f64,
}

/// Fixed size ring of reliable packets waiting for an acknowledgment.
///
/// When the ring is full the oldest entry is overwritten and its label is handed back to
/// the caller, which counts it as lost.
#[derive(Debug)]
pub struct PacketCache {
    entries: Vec<Option<CacheEntry>>,
    head: usize,
    enabled: bool,
    due: VecDeque<(usize, Label)>,
}

impl PacketCache {
    pub fn new(size: usize) -> Self {
        Self {
            entries: vec![None; size.max(1)],
            head: 0,
            enabled: true,
            due: VecDeque::new(),
        }
    }
    pub fn disabled() -> Self {
        let mut cache = Self::new(1);
        cache.enabled = false;
        cache
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
    pub fn enable(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.clear();
        }
    }
    pub fn clear(&mut self) {
        self.entries.iter_mut().for_each(|entry| *entry = None);
        self.due.clear();
        self.head = 0;
    }
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|entry| entry.is_some()).count()
    }
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(Option::is_none)
    }
    pub fn contains(&self, label: &Label) -> bool {
        self.entries.iter().flatten().any(|entry| entry.label == *label)
    }

    /// Records a sent reliable packet. Returns the label of the entry it displaced, if any.
    pub fn push(&mut self, packet: ProtocolPacket, time: f64) -> Option<Label> {
        if !self.enabled {
            return None;
        }
        let label = packet.label();
        let evicted = self.entries[self.head].take().map(|entry| entry.label);
        if let Some(evicted) = evicted {
            log::debug!(
                "retransmission cache full, giving up on {}:{}",
                evicted.realm,
                evicted.counter
            );
        }
        self.entries[self.head] = Some(CacheEntry {
            packet,
            label,
            send_time: time,
        });
        self.head = (self.head + 1) % self.entries.len();
        evicted
    }

    /// Drops acknowledged entries and returns how many were found.
    pub fn acknowledge_reception<'a>(
        &mut self,
        labels: impl IntoIterator<Item = &'a Label>,
    ) -> usize {
        if !self.enabled {
            return 0;
        }
        let mut acknowledged = 0;
        for label in labels {
            for slot in self.entries.iter_mut() {
                if matches!(slot, Some(entry) if entry.label == *label) {
                    *slot = None;
                    acknowledged += 1;
                }
            }
        }
        acknowledged
    }

    /// Queues every entry unacknowledged for longer than `client_delay * CACHE_DELAY_FACTOR`.
    pub fn check(&mut self, time: f64, client_delay: f64) -> usize {
        if !self.enabled {
            return 0;
        }
        let limit = client_delay * CACHE_DELAY_FACTOR;
        for (index, slot) in self.entries.iter().enumerate() {
            let Some(entry) = slot else { continue };
            if time - entry.send_time >= limit
                && !self.due.iter().any(|(_, label)| *label == entry.label)
            {
                self.due.push_back((index, entry.label));
            }
        }
        self.due.len()
    }

    /// Next packet due for retransmission, its send time re-armed to `time`.
    pub fn pop(&mut self, time: f64) -> Option<ProtocolPacket> {
        while let Some((index, label)) = self.due.pop_front() {
            match self.entries.get_mut(index) {
                Some(Some(entry)) if entry.label == label => {
                    entry.send_time = time;
                    return Some(entry.packet.clone());
                }
                _ => continue,
            }
        }
        None
    }
}
