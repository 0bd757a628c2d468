pub const HANDSHAKE_MAGIC: &[u8; 9] = b"REALMNET\0";
pub const PROTOCOL_VERSION: &str = "realmnet 1.0";

pub const HEADER_SIZE: usize = 8;
pub const FRAGMENT_COUNT_SIZE: usize = 1;
pub const MAX_FRAGMENTS: usize = u8::MAX as usize;

/// Smallest datagram every IPv4 path is guaranteed to carry (576 - 60 - 8).
pub const MIN_MTU: u16 = 508;
pub const DEFAULT_MAX_MTU: u16 = 1472;
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

pub const DEFAULT_RETURN_RATE_SEC: f64 = 0.1;
pub const DEFAULT_CONNECTION_TIMEOUT_SEC: f64 = 10.0;
pub const DEFAULT_HANDSHAKE_TIMEOUT_SEC: f64 = 2.0;
pub const DEFAULT_MTU_TRY_TIMEOUT_SEC: f64 = 0.4;
pub const DEFAULT_MTU_MAX_TRIES: u32 = 16;

pub const DEFAULT_CACHE_SIZE: usize = 64;
pub const CACHE_DELAY_FACTOR: f64 = 1.5;
pub const DEFAULT_REORDER_CACHE_SIZE: usize = 32;
pub const DEFAULT_DEFRAG_MAX_SETS: usize = 16;
pub const DEFAULT_LOST_PACKET_THRESHOLD: u32 = 16;
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 128;
pub const DEFAULT_MAX_CLIENTS: usize = 64;
pub const DEFAULT_SEND_BUDGET: usize = 64;

pub const LATENCY_WINDOW: usize = 10;
pub const MAX_ACKS_PER_RETURN: usize = 128;
pub const RECENT_UNORDERED_WINDOW: usize = 64;

pub(crate) const SOCKET_RECV_BUF_SIZE: usize = 4 * 1024 * 1024;
pub(crate) const SOCKET_SEND_BUF_SIZE: usize = 4 * 1024 * 1024;
pub(crate) const NONCE_BYTES_SIZE: usize = 12;
pub(crate) const PRIVATE_KEY_SIZE: usize = 32;
