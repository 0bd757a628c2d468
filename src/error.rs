use thiserror::Error;

use crate::identity::Identity;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Transport(#[from] crate::transceiver::TransportError),
    #[error(transparent)]
    Crypto(#[from] crate::crypto::CryptoError),
    #[error(transparent)]
    Compression(#[from] crate::compressor::CompressionError),
    #[error("invalid packet")]
    InvalidPacket,
    #[error("packet of {size} bytes exceeds the mtu of {mtu} and may not be fragmented")]
    PacketTooLarge { size: usize, mtu: u16 },
    #[error("packet of {size} bytes needs more than {max} fragments")]
    FragmentOverflow { size: usize, max: usize },
    #[error("tried to send a packet to a client that doesn't exist: {0}")]
    ClientNotFound(Identity),
    #[error("the peer is not connected")]
    NotConnected,
}

pub type Result<T> = std::result::Result<T, Error>;
