use std::io;

use crate::bytes::Bytes;

/// Growable byte buffer with a read cursor.
///
/// All primitive reads and writes go through [`Bytes`] and are therefore in network byte
/// order. The first failed read poisons the packet: every later read returns `None`, so a
/// decoder can chain extractions and check [`Packet::is_valid`] once at the end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    data: Vec<u8>,
    read_pos: usize,
    valid: bool,
}

impl Default for Packet {
    fn default() -> Self {
        Self::new()
    }
}

impl Packet {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            read_pos: 0,
            valid: true,
        }
    }
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            read_pos: 0,
            valid: true,
        }
    }
    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            read_pos: 0,
            valid: true,
        }
    }
    pub fn data(&self) -> &[u8] {
        &self.data
    }
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
    pub fn len(&self) -> usize {
        self.data.len()
    }
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
    pub fn clear(&mut self) {
        self.data.clear();
        self.read_pos = 0;
        self.valid = true;
    }
    pub fn is_valid(&self) -> bool {
        self.valid
    }
    pub fn invalidate(&mut self) {
        self.valid = false;
    }
    pub fn read_pos(&self) -> usize {
        self.read_pos
    }
    pub fn set_read_pos(&mut self, pos: usize) {
        if pos > self.data.len() {
            self.valid = false;
        }
        self.read_pos = pos.min(self.data.len());
    }
    /// True once every byte has been consumed.
    pub fn end_reached(&self) -> bool {
        self.read_pos >= self.data.len()
    }
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.read_pos.min(self.data.len())..]
    }

    pub fn write<T: Bytes>(&mut self, value: &T) -> &mut Self {
        if value.write_to(&mut self.data).is_err() {
            self.valid = false;
        }
        self
    }
    pub fn append(&mut self, bytes: &[u8]) -> &mut Self {
        self.data.extend_from_slice(bytes);
        self
    }
    /// Overwrites already written bytes, used to patch placeholders at send time.
    pub fn overwrite(&mut self, offset: usize, bytes: &[u8]) -> bool {
        let Some(end) = offset.checked_add(bytes.len()) else {
            return false;
        };
        if end > self.data.len() {
            return false;
        }
        self.data[offset..end].copy_from_slice(bytes);
        true
    }

    pub fn read<T: Bytes>(&mut self) -> Option<T> {
        if !self.valid {
            return None;
        }
        let mut cursor = io::Cursor::new(self.remaining());
        match T::read_from(&mut cursor) {
            Ok(value) => {
                let consumed = cursor.position() as usize;
                self.read_pos += consumed;
                Some(value)
            }
            Err(_) => {
                self.valid = false;
                None
            }
        }
    }
    /// Reads a value and poisons the packet when it fails `rule`.
    pub fn read_checked<T: Bytes>(&mut self, rule: impl FnOnce(&T) -> bool) -> Option<T> {
        let value = self.read::<T>()?;
        if rule(&value) {
            Some(value)
        } else {
            log::trace!("packet value rejected by rule at offset {}", self.read_pos);
            self.valid = false;
            None
        }
    }
    pub fn read_bytes(&mut self, len: usize) -> Option<Vec<u8>> {
        if !self.valid || self.remaining().len() < len {
            self.valid = false;
            return None;
        }
        let bytes = self.remaining()[..len].to_vec();
        self.read_pos += len;
        Some(bytes)
    }
    pub fn read_remaining(&mut self) -> Option<Vec<u8>> {
        let len = self.remaining().len();
        self.read_bytes(len)
    }
    pub fn skip(&mut self, len: usize) -> bool {
        if !self.valid || self.remaining().len() < len {
            self.valid = false;
            return false;
        }
        self.read_pos += len;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read() {
        let mut packet = Packet::new();
        packet
            .write(&7u8)
            .write(&0xBEEFu16)
            .write(&-3i32)
            .write(&"hi".to_string());
        assert_eq!(&packet.data()[..3], &[7, 0xBE, 0xEF]);

        assert_eq!(packet.read::<u8>(), Some(7));
        assert_eq!(packet.read::<u16>(), Some(0xBEEF));
        assert_eq!(packet.read::<i32>(), Some(-3));
        assert_eq!(packet.read::<String>().as_deref(), Some("hi"));
        assert!(packet.end_reached());
        assert!(packet.is_valid());
    }

    #[test]
    fn failed_read_poisons_packet() {
        let mut packet = Packet::from_bytes(vec![1, 2, 3]);
        assert_eq!(packet.read::<u32>(), None);
        assert!(!packet.is_valid());
        // even a read that would fit now fails
        assert_eq!(packet.read::<u8>(), None);
    }

    #[test]
    fn rule_violation_poisons_packet() {
        let mut packet = Packet::new();
        packet.write(&900u16).write(&1u8);
        assert_eq!(packet.read_checked::<u16>(|v| *v < 512), None);
        assert!(!packet.is_valid());
        assert_eq!(packet.read::<u8>(), None);
    }

    #[test]
    fn overwrite_bounds() {
        let mut packet = Packet::from_bytes(vec![0; 4]);
        assert!(packet.overwrite(2, &[9, 9]));
        assert!(!packet.overwrite(3, &[9, 9]));
        assert_eq!(packet.data(), &[0, 0, 9, 9]);
    }

    #[test]
    fn read_bytes_and_skip() {
        let mut packet = Packet::from_bytes(vec![1, 2, 3, 4, 5]);
        assert!(packet.skip(1));
        assert_eq!(packet.read_bytes(2), Some(vec![2, 3]));
        assert_eq!(packet.read_remaining(), Some(vec![4, 5]));
        assert!(!packet.skip(1));
        assert!(!packet.is_valid());
    }
}
