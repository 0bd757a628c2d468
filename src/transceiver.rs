use std::io;
use std::net::SocketAddr;

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("operation would block")]
    WouldBlock,
    #[error("transport is disconnected")]
    Disconnected,
    #[error("connection refused by the remote")]
    Refused,
    #[error(transparent)]
    Io(io::Error),
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Self::WouldBlock,
            io::ErrorKind::ConnectionRefused => Self::Refused,
            io::ErrorKind::NotConnected
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => Self::Disconnected,
            _ => Self::Io(e),
        }
    }
}

/// A trait for sending and receiving datagrams.
///
/// Both [`Server`](crate::Server) and [`Connection`](crate::Connection) use a statically
/// dispatched `T: Transceiver`, so anything implementing it can carry the protocol.
/// [`UdpTransceiver`](crate::UdpTransceiver) is the default implementation.
///
/// Methods take `&self` so that the reception and transmission threads can share one
/// transceiver; [`spawn`](crate::spawn) additionally requires it to be `Send + Sync`.
pub trait Transceiver {
    /// Returns the local address of the socket (i.e. the address it is bound to).
    fn addr(&self) -> SocketAddr;
    /// Receives a datagram, if one is available.
    ///
    /// Should **NOT** block if no datagram is available.
    fn recv(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, TransportError>;
    /// Sends a datagram to the specified address.
    ///
    /// Should **NOT** block if the datagram cannot be sent, return
    /// [`TransportError::WouldBlock`] instead.
    fn send(&self, buf: &[u8], addr: SocketAddr) -> Result<usize, TransportError>;
}
