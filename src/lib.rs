mod bytes;
mod cache;
mod consts;
mod endpoint;
mod error;
mod fragment;
mod latency;
mod packet;
mod protocol;
mod reorder;
mod socket;
mod threads;
mod time;
mod transceiver;

#[cfg(test)]
mod simulator;

pub mod client;
pub mod client_list;
pub mod command;
pub mod compressor;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod identity;
pub mod network_type;
pub mod server;

pub use crate::bytes::Bytes;
pub use crate::client::{Client, ClientStats, ClientStatus};
pub use crate::client_list::{ClientList, ClientListEvent, SharedClient};
pub use crate::command::{CommandError, CommandHandle, CommandResult};
pub use crate::compressor::{CompressionError, Compressor, Lz4Compressor};
pub use crate::config::NetConfig;
pub use crate::connection::Connection;
pub use crate::consts::{DEFAULT_MAX_MTU, MIN_MTU, PROTOCOL_VERSION};
pub use crate::crypto::{generate_key, psk_factory, CryptoFactory, CryptoSession, Key, Role};
pub use crate::error::{Error, Result};
pub use crate::identity::Identity;
pub use crate::network_type::{
    NetworkType, NetworkTypeBase, NetworkTypeHandler, NetworkTypeVector, Property,
};
pub use crate::packet::Packet;
pub use crate::protocol::{HeaderFlags, InternalId, ProtocolPacket};
pub use crate::server::Server;
pub use crate::socket::UdpTransceiver;
pub use crate::threads::{spawn, NetDriver, NetThreads, Notifier};
pub use crate::transceiver::{Transceiver, TransportError};
