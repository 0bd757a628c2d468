use crate::consts::*;

/// Protocol tuning shared by [`Server`](crate::Server) and [`Connection`](crate::Connection).
///
/// # Example
/// ```
/// use realmnet::NetConfig;
///
/// let cfg = NetConfig::default()
///     .max_mtu(1200)
///     .return_rate(0.05)
///     .connection_timeout(5.0);
/// assert_eq!(cfg.get_max_mtu(), 1200);
/// ```
#[derive(Debug, Clone)]
pub struct NetConfig {
    pub(crate) version: String,
    pub(crate) max_mtu: u16,
    pub(crate) handshake_timeout: f64,
    pub(crate) mtu_try_timeout: f64,
    pub(crate) mtu_max_tries: u32,
    pub(crate) return_rate: f64,
    pub(crate) cache_size: usize,
    pub(crate) cache_enabled: bool,
    pub(crate) reorder_cache_size: usize,
    pub(crate) defrag_max_sets: usize,
    pub(crate) lost_packet_threshold: u32,
    pub(crate) connection_timeout: f64,
    pub(crate) compression_threshold: usize,
    pub(crate) max_clients: usize,
    pub(crate) send_budget: usize,
    pub(crate) tick_interval: f64,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            max_mtu: DEFAULT_MAX_MTU,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT_SEC,
            mtu_try_timeout: DEFAULT_MTU_TRY_TIMEOUT_SEC,
            mtu_max_tries: DEFAULT_MTU_MAX_TRIES,
            return_rate: DEFAULT_RETURN_RATE_SEC,
            cache_size: DEFAULT_CACHE_SIZE,
            cache_enabled: true,
            reorder_cache_size: DEFAULT_REORDER_CACHE_SIZE,
            defrag_max_sets: DEFAULT_DEFRAG_MAX_SETS,
            lost_packet_threshold: DEFAULT_LOST_PACKET_THRESHOLD,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT_SEC,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            max_clients: DEFAULT_MAX_CLIENTS,
            send_budget: DEFAULT_SEND_BUDGET,
            tick_interval: 1.0 / 120.0,
        }
    }
}

impl NetConfig {
    pub fn new() -> Self {
        Self::default()
    }
    /// Version string exchanged during the handshake. Peers with different versions are rejected.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }
    /// Largest datagram this side will ever try. Clamped to at least [`MIN_MTU`].
    pub fn max_mtu(mut self, max_mtu: u16) -> Self {
        self.max_mtu = max_mtu.max(MIN_MTU);
        self
    }
    /// Time allowed for each handshake stage.
    pub fn handshake_timeout(mut self, seconds: f64) -> Self {
        self.handshake_timeout = seconds;
        self
    }
    /// Time to wait for the answer to a single mtu probe.
    pub fn mtu_try_timeout(mut self, seconds: f64) -> Self {
        self.mtu_try_timeout = seconds;
        self
    }
    pub fn mtu_max_tries(mut self, tries: u32) -> Self {
        self.mtu_max_tries = tries;
        self
    }
    /// Period of the return packet carrying acknowledgments and latency data.
    /// The default is 10 packets per second. (`0.1` seconds)
    pub fn return_rate(mut self, seconds: f64) -> Self {
        self.return_rate = seconds;
        self
    }
    pub fn cache_size(mut self, size: usize) -> Self {
        self.cache_size = size;
        self
    }
    /// Disabling the retransmission cache turns every packet into a best effort one.
    pub fn cache_enabled(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }
    /// Number of buffered out of order packets before the oldest is forced out.
    pub fn reorder_cache_size(mut self, size: usize) -> Self {
        self.reorder_cache_size = size;
        self
    }
    pub fn defrag_max_sets(mut self, sets: usize) -> Self {
        self.defrag_max_sets = sets;
        self
    }
    /// Reliable packets given up on before the client is dropped. `0` disables the check.
    pub fn lost_packet_threshold(mut self, threshold: u32) -> Self {
        self.lost_packet_threshold = threshold;
        self
    }
    pub fn connection_timeout(mut self, seconds: f64) -> Self {
        self.connection_timeout = seconds;
        self
    }
    /// Payloads at least this large go through the compressor, if one is set.
    pub fn compression_threshold(mut self, bytes: usize) -> Self {
        self.compression_threshold = bytes;
        self
    }
    pub fn max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = max_clients;
        self
    }
    /// Datagrams sent to a single client per transmission step.
    pub fn send_budget(mut self, datagrams: usize) -> Self {
        self.send_budget = datagrams.max(1);
        self
    }
    /// Sleep between transmission steps of the worker threads.
    pub fn tick_interval(mut self, seconds: f64) -> Self {
        self.tick_interval = seconds;
        self
    }

    pub fn get_version(&self) -> &str {
        &self.version
    }
    pub fn get_max_mtu(&self) -> u16 {
        self.max_mtu
    }
    pub fn get_return_rate(&self) -> f64 {
        self.return_rate
    }
    pub fn get_connection_timeout(&self) -> f64 {
        self.connection_timeout
    }
    pub fn get_tick_interval(&self) -> f64 {
        self.tick_interval
    }
}
