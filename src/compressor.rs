use crate::consts::MAX_FRAGMENTS;
use crate::fragment::fragment_capacity;

#[derive(thiserror::Error, Debug)]
pub enum CompressionError {
    #[error("compressed payload is truncated")]
    Truncated,
    #[error("decompressed size {size} exceeds the limit of {max}")]
    TooLarge { size: usize, max: usize },
    #[error("failed to decompress payload: {0}")]
    Corrupt(String),
}

/// Payload codec applied to packets above the compression threshold.
pub trait Compressor: Send + Sync {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError>;
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError>;
    /// Largest payload `decompress` accepts. Bigger payloads are sent uncompressed.
    fn max_decompressed_size(&self) -> usize {
        usize::MAX
    }
}

/// Size of the largest packet the fragmenter can produce at any mtu.
pub fn max_packet_size() -> usize {
    fragment_capacity(u16::MAX) * MAX_FRAGMENTS
}

/// LZ4 block compression with the uncompressed size prepended.
#[derive(Debug, Clone, Copy)]
pub struct Lz4Compressor {
    max_size: usize,
}

impl Default for Lz4Compressor {
    fn default() -> Self {
        Self {
            max_size: max_packet_size(),
        }
    }
}

impl Lz4Compressor {
    pub fn new() -> Self {
        Self::default()
    }
    /// Cap on the decompressed size; larger claims are rejected before allocating.
    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }
}

impl Compressor for Lz4Compressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        Ok(lz4_flex::compress_prepend_size(data))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        let Some(prefix) = data.get(..4) else {
            return Err(CompressionError::Truncated);
        };
        let claimed = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        if claimed > self.max_size {
            return Err(CompressionError::TooLarge {
                size: claimed,
                max: self.max_size,
            });
        }
        lz4_flex::decompress_size_prepended(data)
            .map_err(|e| CompressionError::Corrupt(e.to_string()))
    }

    fn max_decompressed_size(&self) -> usize {
        self.max_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compresses_repetitive_data() {
        let lz4 = Lz4Compressor::new();
        let data = b"realm".repeat(200);
        let compressed = lz4.compress(&data).unwrap();
        assert!(compressed.len() < data.len());
        assert_eq!(lz4.decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn default_limit_covers_fragmented_packets() {
        let lz4 = Lz4Compressor::new();
        assert_eq!(lz4.max_decompressed_size(), max_packet_size());
        let data = b"state ".repeat(20_000);
        assert_eq!(lz4.decompress(&lz4.compress(&data).unwrap()).unwrap(), data);
    }

    #[test]
    fn rejects_oversized_claims() {
        let lz4 = Lz4Compressor::new().max_size(100);
        let compressed = lz4.compress(&[7u8; 500]).unwrap();
        assert!(matches!(
            lz4.decompress(&compressed),
            Err(CompressionError::TooLarge { size: 500, max: 100 })
        ));
        assert!(matches!(
            lz4.decompress(&[1, 2]),
            Err(CompressionError::Truncated)
        ));
    }
}
