use std::collections::{HashMap, VecDeque};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::client::{Client, ClientStatus};
use crate::client_list::{ClientList, SharedClient};
use crate::command::{answer_probe, handshake_packet, read_handshake};
use crate::compressor::Compressor;
use crate::config::NetConfig;
use crate::crypto::{CryptoFactory, Role};
use crate::endpoint::{Endpoint, Received};
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::packet::Packet;
use crate::protocol::{InternalId, ProtocolPacket};
use crate::socket::UdpTransceiver;
use crate::threads::{NetDriver, Notifier};
use crate::transceiver::Transceiver;

/// The accepting side.
///
/// Peers first live in a pending table while they go through the handshake, the mtu
/// discovery and the optional crypto handshake, then move to the [`ClientList`].
/// Every method takes `&self`, so a server can be shared with the threads started by
/// [`spawn`](crate::spawn) or driven by calling [`Server::update`] from a single loop.
pub struct Server<T: Transceiver = UdpTransceiver> {
    endpoint: Endpoint<T>,
    clients: ClientList,
    pending: Mutex<HashMap<Identity, SharedClient>>,
    incoming: Mutex<VecDeque<ProtocolPacket>>,
    crypto: Option<CryptoFactory>,
    notifier: Notifier,
}

impl Server<UdpTransceiver> {
    pub fn new(addr: impl ToSocketAddrs, cfg: NetConfig) -> Result<Self> {
        Ok(Self::with_transceiver(UdpTransceiver::new(addr)?, cfg))
    }
}

impl<T: Transceiver> Server<T> {
    pub fn with_transceiver(transceiver: T, cfg: NetConfig) -> Self {
        Self {
            endpoint: Endpoint::new(transceiver, cfg),
            clients: ClientList::new(),
            pending: Mutex::new(HashMap::new()),
            incoming: Mutex::new(VecDeque::new()),
            crypto: None,
            notifier: Notifier::new(),
        }
    }
    pub fn with_compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.endpoint.set_compressor(compressor);
        self
    }
    /// Requires a crypto handshake from every client, with sessions built by `factory`.
    pub fn with_crypto(mut self, factory: CryptoFactory) -> Self {
        self.crypto = Some(factory);
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.endpoint.transceiver().addr()
    }
    pub fn cfg(&self) -> &NetConfig {
        self.endpoint.cfg()
    }
    pub fn clients(&self) -> &ClientList {
        &self.clients
    }
    pub fn client(&self, identity: &Identity) -> Option<SharedClient> {
        self.clients.get(identity)
    }
    /// Number of peers still going through the connection handshake.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Receives everything available, then runs one transmission step.
    pub fn update(&self, time: f64) -> Result<()> {
        while self.receive_step(time)? {}
        self.transmit(time)
    }

    /// Queues `packet` for a connected client.
    pub fn send(&self, identity: &Identity, packet: ProtocolPacket) -> Result<()> {
        if !packet.is_user() {
            return Err(Error::InvalidPacket);
        }
        let Some(shared) = self.clients.get(identity) else {
            return Err(Error::ClientNotFound(*identity));
        };
        let mut client = shared.lock();
        if !client.is_connected() {
            return Err(Error::NotConnected);
        }
        client.check_size(&packet)?;
        client.push_packet(packet);
        drop(client);
        self.notifier.notify();
        Ok(())
    }

    /// Queues a copy of `packet` for every connected client. Returns how many got it.
    pub fn send_to_all(&self, packet: &ProtocolPacket) -> Result<usize> {
        if !packet.is_user() {
            return Err(Error::InvalidPacket);
        }
        let mut sent = 0;
        for (identity, shared) in self.clients.lock().clients() {
            let mut client = shared.lock();
            if !client.is_connected() {
                continue;
            }
            if let Err(e) = client.check_size(packet) {
                log::warn!("packet not sent to {identity}: {e}");
                continue;
            }
            client.push_packet(packet.clone());
            sent += 1;
        }
        self.notifier.notify();
        Ok(sent)
    }

    /// Takes the next packet received from any client, in delivery order.
    pub fn pop_packet(&self) -> Option<ProtocolPacket> {
        self.incoming.lock().pop_front()
    }

    /// Sends a disconnect notice; the client leaves the list once it is out.
    pub fn disconnect(&self, identity: &Identity) -> Result<()> {
        let Some(shared) = self.clients.get(identity) else {
            return Err(Error::ClientNotFound(*identity));
        };
        Self::queue_disconnect(&mut shared.lock());
        self.notifier.notify();
        Ok(())
    }

    pub fn disconnect_all(&self) {
        log::debug!("server disconnecting all clients");
        for (_, shared) in self.clients.lock().clients() {
            Self::queue_disconnect(&mut shared.lock());
        }
        self.notifier.notify();
    }

    fn queue_disconnect(client: &mut Client) {
        if client.status() <= ClientStatus::Disconnected {
            return;
        }
        client.clear_queue();
        client.push_packet(ProtocolPacket::internal(InternalId::Disconnect, Packet::new()));
        client.set_status(ClientStatus::Disconnecting);
    }

    /// Handles at most one received datagram. Returns whether there was one.
    pub fn receive_step(&self, time: f64) -> Result<bool> {
        let packet = match self.endpoint.receive(time)? {
            Received::Nothing => return Ok(false),
            Received::Discarded => return Ok(true),
            Received::Packet(packet) => packet,
        };
        let identity = packet.identity();
        if let Some(shared) = self.clients.get(&identity) {
            self.process_connected(identity, &shared, packet, time);
            return Ok(true);
        }
        let pending = self.pending.lock().get(&identity).cloned();
        match pending {
            Some(shared) => self.process_pending(identity, &shared, packet, time)?,
            None => self.process_unknown(identity, packet, time)?,
        }
        Ok(true)
    }

    fn process_unknown(
        &self,
        identity: Identity,
        packet: ProtocolPacket,
        time: f64,
    ) -> Result<()> {
        if packet.internal_id() != Some(InternalId::Handshake) {
            log::trace!("server ignored packet {} from unknown {identity}", packet.id());
            return Ok(());
        }
        let cfg = self.cfg();
        match read_handshake(&packet) {
            Some(version) if version == cfg.version => {}
            other => {
                log::warn!(
                    "server rejected handshake from {identity}: expected {:?}, got {:?}",
                    cfg.version,
                    other
                );
                // the peer learns what we speak and fails on its side
                return self
                    .endpoint
                    .send_raw(&handshake_packet(&cfg.version).encode(), identity);
            }
        }
        let mut pending = self.pending.lock();
        if pending.len() + self.clients.len() >= cfg.max_clients {
            log::warn!("server is full, ignored handshake from {identity}");
            return Ok(());
        }
        let mut client = Client::new(identity, cfg, time);
        client.push_packet(handshake_packet(&cfg.version));
        pending.insert(identity, Arc::new(Mutex::new(client)));
        drop(pending);
        log::debug!("server accepted handshake from {identity}");
        self.notifier.notify();
        Ok(())
    }

    fn process_pending(
        &self,
        identity: Identity,
        shared: &SharedClient,
        packet: ProtocolPacket,
        time: f64,
    ) -> Result<()> {
        let cfg = self.cfg();
        let mut client = shared.lock();
        let mut promote = false;
        for packet in client.receive(packet, time, self.endpoint.compressor()) {
            match packet.internal_id() {
                Some(InternalId::Handshake) => {
                    client.push_packet(handshake_packet(&cfg.version));
                }
                Some(InternalId::MtuFinal) => {
                    answer_probe(&mut client, &packet, cfg.max_mtu);
                    match &self.crypto {
                        Some(factory) => {
                            client.set_crypto(factory(Role::Responder));
                            client.set_status(ClientStatus::Authenticating);
                            if let Err(e) = client.advance_crypto(None) {
                                log::warn!("crypto handshake with {identity} failed: {e}");
                                client.set_status(ClientStatus::Disconnected);
                            }
                        }
                        None => promote = true,
                    }
                }
                Some(InternalId::CryptHandshake) => {
                    match client.advance_crypto(Some(packet.packet().data())) {
                        Ok(finished) => promote = finished,
                        Err(e) => {
                            log::warn!("crypto handshake with {identity} failed: {e}");
                            client.set_status(ClientStatus::Disconnected);
                        }
                    }
                }
                Some(InternalId::Disconnect) => {
                    client.set_status(ClientStatus::Disconnected);
                }
                Some(_) if answer_probe(&mut client, &packet, cfg.max_mtu) => {}
                _ => {
                    log::trace!("server ignored packet {} from pending {identity}", packet.id())
                }
            }
        }

        if client.status() == ClientStatus::Disconnected {
            drop(client);
            self.pending.lock().remove(&identity);
            return Ok(());
        }
        if promote {
            // the last handshake answer goes out with the old counters
            self.endpoint.flush(&mut client, time)?;
            client.reset_counters();
            client.set_status(ClientStatus::Connected);
            let early = client.replay_early(time);
            drop(client);
            self.pending.lock().remove(&identity);
            self.clients.add_shared(identity, shared.clone());
            log::info!("client {identity} connected");
            self.incoming.lock().extend(early);
        }
        self.notifier.notify();
        Ok(())
    }

    fn process_connected(
        &self,
        identity: Identity,
        shared: &SharedClient,
        packet: ProtocolPacket,
        time: f64,
    ) {
        let cfg = self.cfg();
        let mut client = shared.lock();
        let mut delivered = 0;
        for packet in client.receive(packet, time, self.endpoint.compressor()) {
            match packet.internal_id() {
                None => {
                    self.incoming.lock().push_back(packet);
                    delivered += 1;
                }
                Some(InternalId::Disconnect) => {
                    client.set_status(ClientStatus::Disconnected);
                }
                Some(_) if answer_probe(&mut client, &packet, cfg.max_mtu) => {}
                Some(id) => log::trace!("server ignored {:?} from {identity}", id),
            }
        }
        let left = client.status() == ClientStatus::Disconnected;
        drop(client);
        if left {
            self.clients.remove(&identity);
            log::info!("client {identity} disconnected");
        }
        if delivered > 0 {
            log::trace!("server delivered {delivered} packets from {identity}");
        }
    }

    /// Handles timeouts and sends whatever is due to every pending and connected client.
    pub fn transmit(&self, time: f64) -> Result<()> {
        let cfg = self.cfg();

        let pending = self
            .pending
            .lock()
            .iter()
            .map(|(identity, client)| (*identity, client.clone()))
            .collect::<Vec<_>>();
        for (identity, shared) in pending {
            let mut client = shared.lock();
            if client.has_timed_out(time, cfg.connection_timeout) {
                client.set_status(ClientStatus::TimedOut);
                drop(client);
                log::debug!("pending client {identity} timed out");
                self.pending.lock().remove(&identity);
                continue;
            }
            if let Err(e) = self.endpoint.flush(&mut client, time) {
                log::error!("failed to send to pending client {identity}: {e}");
            }
        }

        let mut gone = Vec::new();
        for (identity, shared) in self.clients.lock().clients() {
            let mut client = shared.lock();
            if client.status() > ClientStatus::Disconnected
                && (client.has_timed_out(time, cfg.connection_timeout)
                    || client.is_lost_threshold_reached())
            {
                log::warn!(
                    "client {identity} timed out ({} reliable packets lost)",
                    client.lost_packets()
                );
                client.set_status(ClientStatus::TimedOut);
            }
            if client.status() > ClientStatus::Disconnected {
                if let Err(e) = self.endpoint.flush(&mut client, time) {
                    log::error!("failed to send to client {identity}: {e}");
                }
            }
            if client.status() <= ClientStatus::Disconnected {
                gone.push(identity);
            }
        }
        for identity in gone {
            self.clients.remove(&identity);
            log::info!("client {identity} removed");
        }
        Ok(())
    }
}

impl<T: Transceiver + Send + Sync + 'static> NetDriver for Server<T> {
    fn receive_step(&self, time: f64) -> Result<bool> {
        Server::receive_step(self, time)
    }
    fn transmit_step(&self, time: f64) -> Result<()> {
        self.transmit(time)
    }
    fn notifier(&self) -> &Notifier {
        &self.notifier
    }
    fn tick_interval(&self) -> f64 {
        self.cfg().tick_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::{Duration, Instant};

    fn handshake_from(socket: &UdpTransceiver, to: SocketAddr, version: &str) {
        socket
            .send(&handshake_packet(version).encode(), to)
            .unwrap();
    }

    fn wait_for(server: &Server, socket: &UdpTransceiver) -> Option<ProtocolPacket> {
        let start = Instant::now();
        let mut buf = [0u8; 2048];
        while start.elapsed() < Duration::from_secs(2) {
            server.update(start.elapsed().as_secs_f64()).unwrap();
            if let Some((len, from)) = socket.recv(&mut buf).unwrap() {
                return ProtocolPacket::decode(&buf[..len], Identity::from(from), 0);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        None
    }

    #[test]
    fn handshake_over_udp() {
        let server = Server::new((Ipv4Addr::LOCALHOST, 0), NetConfig::default()).unwrap();
        let peer = UdpTransceiver::new((Ipv4Addr::LOCALHOST, 0)).unwrap();

        handshake_from(&peer, server.addr(), "another protocol");
        let reply = wait_for(&server, &peer).unwrap();
        assert_eq!(read_handshake(&reply).as_deref(), Some(server.cfg().get_version()));
        assert_eq!(server.pending_len(), 0);

        handshake_from(&peer, server.addr(), server.cfg().get_version());
        let reply = wait_for(&server, &peer).unwrap();
        assert_eq!(reply.internal_id(), Some(InternalId::Handshake));
        assert_eq!(server.pending_len(), 1);
        assert!(server.clients().is_empty());
    }

    #[test]
    fn user_packets_need_a_connected_client() {
        let server = Server::new((Ipv4Addr::LOCALHOST, 0), NetConfig::default()).unwrap();
        let nobody = Identity::new(Ipv4Addr::LOCALHOST, 9);
        assert!(matches!(
            server.send(&nobody, ProtocolPacket::new(1, Packet::new())),
            Err(Error::ClientNotFound(_))
        ));
        assert!(matches!(
            server.send(
                &nobody,
                ProtocolPacket::internal(InternalId::Return, Packet::new())
            ),
            Err(Error::InvalidPacket)
        ));
        assert!(matches!(
            server.send(&nobody, ProtocolPacket::new(0, Packet::new())),
            Err(Error::InvalidPacket)
        ));
        assert!(matches!(
            server.send_to_all(&ProtocolPacket::new(0, Packet::new())),
            Err(Error::InvalidPacket)
        ));
    }
}
