use std::io::{self};
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};

use crate::consts::{SOCKET_RECV_BUF_SIZE, SOCKET_SEND_BUF_SIZE};
use crate::transceiver::{Transceiver, TransportError};

/// Non-blocking UDP socket with enlarged kernel buffers.
pub struct UdpTransceiver {
    socket: UdpSocket,
    addr: SocketAddr,
}

impl UdpTransceiver {
    pub fn new(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let addr = addr.to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "no socket addresses found")
        })?;
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        if addr.is_ipv6() {
            socket.set_only_v6(true)?;
        }
        socket.set_send_buffer_size(SOCKET_SEND_BUF_SIZE)?;
        socket.set_recv_buffer_size(SOCKET_RECV_BUF_SIZE)?;
        socket.bind(&addr.into())?;
        socket.set_nonblocking(true)?;
        let socket: UdpSocket = socket.into();
        let addr = socket.local_addr()?;
        Ok(Self { socket, addr })
    }
}

impl Transceiver for UdpTransceiver {
    fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn recv(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, TransportError> {
        match self.socket.recv_from(buf) {
            Ok((len, addr)) if len > 0 => Ok(Some((len, addr))),
            Ok(_) => Ok(None),
            Err(e) => match TransportError::from(e) {
                TransportError::WouldBlock => Ok(None),
                e => Err(e),
            },
        }
    }

    fn send(&self, buf: &[u8], addr: SocketAddr) -> Result<usize, TransportError> {
        self.socket.send_to(buf, addr).map_err(TransportError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::{Duration, Instant};

    #[test]
    fn loopback_datagram() {
        let a = UdpTransceiver::new((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let b = UdpTransceiver::new((Ipv4Addr::LOCALHOST, 0)).unwrap();
        assert_ne!(a.addr().port(), 0);

        let mut buf = [0u8; 64];
        assert!(a.recv(&mut buf).unwrap().is_none());

        assert_eq!(b.send(b"ping", a.addr()).unwrap(), 4);
        let start = Instant::now();
        let received = loop {
            if let Some(received) = a.recv(&mut buf).unwrap() {
                break received;
            }
            assert!(start.elapsed() < Duration::from_secs(2));
            std::thread::sleep(Duration::from_millis(1));
        };
        assert_eq!(received, (4, b.addr()));
        assert_eq!(&buf[..4], b"ping");
    }
}
