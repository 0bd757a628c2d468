use std::sync::Arc;

use parking_lot::Mutex;

use crate::client::Client;
use crate::compressor::Compressor;
use crate::config::NetConfig;
use crate::consts::MAX_DATAGRAM_SIZE;
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::protocol::ProtocolPacket;
use crate::time;
use crate::transceiver::{Transceiver, TransportError};

pub(crate) enum Received {
    Nothing,
    Discarded,
    Packet(ProtocolPacket),
}

/// The I/O half shared by [`Server`](crate::Server) and [`Connection`](crate::Connection).
pub(crate) struct Endpoint<T: Transceiver> {
    transceiver: T,
    compressor: Option<Arc<dyn Compressor>>,
    cfg: NetConfig,
    recv_buf: Mutex<Vec<u8>>,
}

impl<T: Transceiver> Endpoint<T> {
    pub fn new(transceiver: T, cfg: NetConfig) -> Self {
        Self {
            transceiver,
            compressor: None,
            cfg,
            recv_buf: Mutex::new(vec![0; MAX_DATAGRAM_SIZE]),
        }
    }

    pub fn set_compressor(&mut self, compressor: Arc<dyn Compressor>) {
        self.compressor = Some(compressor);
    }
    pub fn compressor(&self) -> Option<&dyn Compressor> {
        self.compressor.as_deref()
    }
    pub fn cfg(&self) -> &NetConfig {
        &self.cfg
    }
    pub fn transceiver(&self) -> &T {
        &self.transceiver
    }

    pub fn receive(&self, time: f64) -> Result<Received> {
        let mut buf = self.recv_buf.lock();
        let Some((len, addr)) = self.transceiver.recv(&mut buf)? else {
            return Ok(Received::Nothing);
        };
        match ProtocolPacket::decode(&buf[..len], Identity::from(addr), time::timestamp(time)) {
            Some(packet) => Ok(Received::Packet(packet)),
            None => {
                log::trace!("discarded malformed datagram of {len} bytes from {addr}");
                Ok(Received::Discarded)
            }
        }
    }

    /// Sends a single datagram outside of any client sequencing.
    pub fn send_raw(&self, datagram: &[u8], to: Identity) -> Result<()> {
        match self.transceiver.send(datagram, to.addr()) {
            Ok(_) | Err(TransportError::WouldBlock) => Ok(()),
            Err(e) => Err(Error::Transport(e)),
        }
    }

    /// Sends everything `client` has due at `time`. Returns the number of datagrams sent.
    pub fn flush(&self, client: &mut Client, time: f64) -> Result<usize> {
        let datagrams = client.drain_outbound(time, self.compressor(), self.cfg.send_budget);
        let addr = client.identity().addr();
        let mut sent = 0;
        for datagram in &datagrams {
            match self.transceiver.send(datagram, addr) {
                Ok(_) => sent += 1,
                Err(TransportError::WouldBlock) => {
                    log::debug!(
                        "send buffer full, {} datagrams to {} dropped",
                        datagrams.len() - sent,
                        addr
                    );
                    break;
                }
                Err(e) => return Err(Error::Transport(e)),
            }
        }
        Ok(sent)
    }
}
