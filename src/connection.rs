use std::collections::VecDeque;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::client::{Client, ClientStatus};
use crate::client_list::SharedClient;
use crate::command::{
    promise, CommandContext, CommandHandle, CommandQueue, ConnectCommand, DisconnectCommand,
    MtuCommand,
};
use crate::compressor::Compressor;
use crate::config::NetConfig;
use crate::crypto::CryptoFactory;
use crate::endpoint::{Endpoint, Received};
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::protocol::{InternalId, ProtocolPacket};
use crate::socket::UdpTransceiver;
use crate::threads::{NetDriver, Notifier};
use crate::transceiver::Transceiver;

/// The connecting side, talking to a single server.
///
/// Connection establishment, mtu discovery and disconnection run as commands, one at a
/// time, and report through a [`CommandHandle`].
pub struct Connection<T: Transceiver = UdpTransceiver> {
    endpoint: Endpoint<T>,
    peer: Mutex<Option<SharedClient>>,
    commands: Mutex<CommandQueue>,
    incoming: Mutex<VecDeque<ProtocolPacket>>,
    crypto: Option<CryptoFactory>,
    // time of the last command update
    clock: Mutex<Option<f64>>,
    notifier: Notifier,
}

impl Connection<UdpTransceiver> {
    pub fn new(addr: impl ToSocketAddrs, cfg: NetConfig) -> Result<Self> {
        Ok(Self::with_transceiver(UdpTransceiver::new(addr)?, cfg))
    }
}

impl<T: Transceiver> Connection<T> {
    pub fn with_transceiver(transceiver: T, cfg: NetConfig) -> Self {
        Self {
            endpoint: Endpoint::new(transceiver, cfg),
            peer: Mutex::new(None),
            commands: Mutex::new(CommandQueue::new()),
            incoming: Mutex::new(VecDeque::new()),
            crypto: None,
            clock: Mutex::new(None),
            notifier: Notifier::new(),
        }
    }
    pub fn with_compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.endpoint.set_compressor(compressor);
        self
    }
    /// Runs a crypto handshake after the mtu negotiation, with sessions built by `factory`.
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
    /// The server, once [`Connection::connect`] was called.
    pub fn peer(&self) -> Option<SharedClient> {
        self.peer.lock().clone()
    }
    pub fn status(&self) -> ClientStatus {
        self.peer
            .lock()
            .as_ref()
            .map_or(ClientStatus::Disconnected, |peer| peer.lock().status())
    }
    pub fn is_connected(&self) -> bool {
        self.status() == ClientStatus::Connected
    }

    /// Starts connecting to `addr`, dropping any previous peer and pending commands.
    pub fn connect(&self, addr: SocketAddr) -> CommandHandle<()> {
        let mut commands = self.commands.lock();
        commands.clear();
        let time = self.clock.lock().unwrap_or(0.0);
        let client = Client::new(Identity::from(addr), self.cfg(), time);
        *self.peer.lock() = Some(Arc::new(Mutex::new(client)));

        let (command, handle) = ConnectCommand::new(self.cfg().handshake_timeout);
        commands.push(Box::new(command));
        drop(commands);
        log::debug!("connecting to {addr}");
        self.notifier.notify();
        handle
    }

    /// Tells the server we leave. Resolves right away when there is no peer.
    pub fn disconnect(&self) -> CommandHandle<()> {
        let mut commands = self.commands.lock();
        commands.clear();
        if self.peer.lock().is_none() {
            let (mut completer, handle) = promise();
            completer.complete(Ok(()));
            return handle;
        }
        let (command, handle) = DisconnectCommand::new(self.cfg().handshake_timeout);
        commands.push(Box::new(command));
        drop(commands);
        self.notifier.notify();
        handle
    }

    /// Runs a new mtu discovery with the connected server.
    pub fn discover_mtu(&self) -> CommandHandle<u16> {
        let (command, handle) = MtuCommand::new(self.cfg().handshake_timeout);
        self.commands.lock().push(Box::new(command));
        self.notifier.notify();
        handle
    }

    /// Queues `packet` for the server.
    pub fn send(&self, packet: ProtocolPacket) -> Result<()> {
        if !packet.is_user() {
            return Err(Error::InvalidPacket);
        }
        let Some(peer) = self.peer() else {
            return Err(Error::NotConnected);
        };
        let mut client = peer.lock();
        if !client.is_connected() {
            return Err(Error::NotConnected);
        }
        client.check_size(&packet)?;
        client.push_packet(packet);
        drop(client);
        self.notifier.notify();
        Ok(())
    }

    /// Takes the next packet received from the server, in delivery order.
    pub fn pop_packet(&self) -> Option<ProtocolPacket> {
        self.incoming.lock().pop_front()
    }

    /// Receives everything available, then runs one transmission step.
    pub fn update(&self, time: f64) -> Result<()> {
        while self.receive_step(time)? {}
        self.transmit(time)
    }

    fn update_commands(&self, time: f64) {
        let mut commands = self.commands.lock();
        let delta = {
            let mut clock = self.clock.lock();
            let delta = clock.map_or(0.0, |last| (time - last).max(0.0));
            *clock = Some(time);
            delta
        };
        let Some(peer) = self.peer() else {
            commands.clear();
            return;
        };
        let mut client = peer.lock();
        let mut ctx = CommandContext {
            client: &mut client,
            cfg: self.cfg(),
            crypto: self.crypto.as_ref(),
            time,
        };
        commands.update(&mut ctx, delta);
        // user packets that overtook the handshake's last answer
        let early = client.replay_early(time);
        if !early.is_empty() {
            self.incoming.lock().extend(early);
        }
    }

    /// Handles at most one received datagram. Returns whether there was one.
    pub fn receive_step(&self, time: f64) -> Result<bool> {
        let packet = match self.endpoint.receive(time)? {
            Received::Nothing => return Ok(false),
            Received::Discarded => return Ok(true),
            Received::Packet(packet) => packet,
        };
        let Some(peer) = self.peer() else {
            return Ok(true);
        };
        let identity = packet.identity();
        let mut commands = self.commands.lock();
        let mut client = peer.lock();
        if identity != client.identity() {
            log::trace!("ignored datagram from {identity}");
            return Ok(true);
        }

        for packet in client.receive(packet, time, self.endpoint.compressor()) {
            match packet.internal_id() {
                None if client.is_connected() => {
                    self.incoming.lock().push_back(packet);
                }
                None => log::trace!("dropped packet {} received before connecting", packet.id()),
                Some(InternalId::Disconnect) => {
                    log::info!("server {identity} closed the connection");
                    client.set_status(ClientStatus::Disconnected);
                    commands.clear();
                }
                Some(id) => {
                    let mut ctx = CommandContext {
                        client: &mut client,
                        cfg: self.cfg(),
                        crypto: self.crypto.as_ref(),
                        time,
                    };
                    if !commands.on_receive(&mut ctx, &packet) {
                        log::trace!("no command wanted {:?} from {identity}", id);
                    }
                }
            }
        }
        drop(client);
        drop(commands);
        // commands may have queued answers
        self.notifier.notify();
        Ok(true)
    }

    /// Runs the commands, checks the connection health and sends whatever is due.
    pub fn transmit(&self, time: f64) -> Result<()> {
        self.update_commands(time);
        let Some(peer) = self.peer() else {
            return Ok(());
        };
        let cfg = self.cfg();
        let mut client = peer.lock();
        if client.is_connected()
            && (client.has_timed_out(time, cfg.connection_timeout)
                || client.is_lost_threshold_reached())
        {
            log::warn!(
                "connection to {} timed out ({} reliable packets lost)",
                client.identity(),
                client.lost_packets()
            );
            client.set_status(ClientStatus::TimedOut);
        }
        if client.status() > ClientStatus::Disconnected {
            self.endpoint.flush(&mut client, time)?;
        }
        Ok(())
    }
}

impl<T: Transceiver + Send + Sync + 'static> NetDriver for Connection<T> {
    fn receive_step(&self, time: f64) -> Result<bool> {
        Connection::receive_step(self, time)
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
