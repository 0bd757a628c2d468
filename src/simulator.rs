use std::{
    cell::RefCell,
    collections::HashMap,
    net::{Ipv4Addr, SocketAddr},
    rc::Rc,
};

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::transceiver::{Transceiver, TransportError};

#[derive(Debug, Clone)]
struct Datagram {
    from: SocketAddr,
    delivery_time: f64,
    data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SimulationConfig {
    pub latency_ms: f64,
    pub jitter_ms: f64,
    pub packet_loss_percent: f64,
    pub duplicate_packet_percent: f64,
    /// Datagrams larger than this are silently dropped, like on a path with a small mtu.
    pub max_datagram_size: Option<usize>,
}

/// The medium shared by every simulated endpoint. Datagrams are delivered once the
/// network time reaches their delivery time.
pub struct SimNetwork {
    pub time: f64,
    pub cfg: SimulationConfig,
    rng: StdRng,
    queues: HashMap<u16, Vec<Datagram>>,
}

impl SimNetwork {
    pub fn new(cfg: SimulationConfig) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            time: 0.0,
            cfg,
            rng: StdRng::seed_from_u64(0x5EED),
            queues: HashMap::new(),
        }))
    }

    fn roll(&mut self, percent: f64) -> bool {
        percent > 0.0 && self.rng.gen_range(0.0..100.0) < percent
    }

    fn delay(&mut self) -> f64 {
        let mut delay = self.cfg.latency_ms;
        if self.cfg.jitter_ms > 0.0 {
            delay += self.rng.gen_range(-self.cfg.jitter_ms..self.cfg.jitter_ms);
        }
        delay.max(0.0) / 1000.0
    }
}

pub struct NetworkSimulator {
    pub port: u16,
    pub network: Rc<RefCell<SimNetwork>>,
}

impl NetworkSimulator {
    pub fn new(port: u16, network: Rc<RefCell<SimNetwork>>) -> Self {
        network.borrow_mut().queues.insert(port, Vec::new());
        Self { port, network }
    }
}

impl Transceiver for NetworkSimulator {
    fn addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.port))
    }

    fn recv(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, TransportError> {
        let mut network = self.network.borrow_mut();
        let now = network.time;
        let Some(queue) = network.queues.get_mut(&self.port) else {
            return Ok(None);
        };
        // earliest due datagram, send order breaking ties
        let mut next: Option<(usize, f64)> = None;
        for (index, datagram) in queue.iter().enumerate() {
            if datagram.delivery_time <= now
                && next.map_or(true, |(_, time)| datagram.delivery_time < time)
            {
                next = Some((index, datagram.delivery_time));
            }
        }
        let Some((index, _)) = next else {
            return Ok(None);
        };
        let datagram = queue.remove(index);
        let len = datagram.data.len().min(buf.len());
        buf[..len].copy_from_slice(&datagram.data[..len]);
        Ok(Some((len, datagram.from)))
    }

    fn send(&self, buf: &[u8], addr: SocketAddr) -> Result<usize, TransportError> {
        let mut network = self.network.borrow_mut();
        if !network.queues.contains_key(&addr.port()) {
            return Ok(0);
        }
        if network.cfg.max_datagram_size.is_some_and(|max| buf.len() > max) {
            return Ok(buf.len());
        }
        let loss = network.cfg.packet_loss_percent;
        if network.roll(loss) {
            return Ok(buf.len());
        }
        let duplicate = network.cfg.duplicate_packet_percent;
        let copies = if network.roll(duplicate) {
            2
        } else {
            1
        };
        for _ in 0..copies {
            let delivery_time = network.time + network.delay();
            let datagram = Datagram {
                from: self.addr(),
                delivery_time,
                data: buf.to_vec(),
            };
            if let Some(queue) = network.queues.get_mut(&addr.port()) {
                queue.push(datagram);
            }
        }
        Ok(buf.len())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        client::ClientStatus,
        command::{CommandError, CommandResult},
        compressor::Lz4Compressor,
        config::NetConfig,
        connection::Connection,
        crypto::psk_factory,
        identity::Identity,
        network_type::{NetworkType, NetworkTypeHandler, NetworkTypeVector},
        packet::Packet,
        protocol::{HeaderFlags, ProtocolPacket},
        server::Server,
    };

    const SERVER_PORT: u16 = 50000;
    const CLIENT_PORT: u16 = 40000;
    const DELTA: f64 = 1. / 100.;

    fn enable_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    struct Sim {
        network: Rc<RefCell<SimNetwork>>,
        server: Server<NetworkSimulator>,
        connection: Connection<NetworkSimulator>,
        time: f64,
    }

    impl Sim {
        fn new(server_cfg: NetConfig, client_cfg: NetConfig) -> Self {
            Self::build(server_cfg, client_cfg, |server| server, |connection| connection)
        }

        fn build(
            server_cfg: NetConfig,
            client_cfg: NetConfig,
            server: impl FnOnce(Server<NetworkSimulator>) -> Server<NetworkSimulator>,
            connection: impl FnOnce(Connection<NetworkSimulator>) -> Connection<NetworkSimulator>,
        ) -> Self {
            enable_logging();
            let network = SimNetwork::new(SimulationConfig::default());
            let server = server(Server::with_transceiver(
                NetworkSimulator::new(SERVER_PORT, network.clone()),
                server_cfg,
            ));
            let connection = connection(Connection::with_transceiver(
                NetworkSimulator::new(CLIENT_PORT, network.clone()),
                client_cfg,
            ));
            Self {
                network,
                server,
                connection,
                time: 0.0,
            }
        }

        fn set_network(&self, cfg: SimulationConfig) {
            self.network.borrow_mut().cfg = cfg;
        }

        fn step(&mut self) {
            self.network.borrow_mut().time = self.time;
            self.connection.update(self.time).unwrap();
            self.server.update(self.time).unwrap();
            self.time += DELTA;
        }

        fn run(&mut self, seconds: f64) {
            let end = self.time + seconds;
            while self.time < end {
                self.step();
            }
        }

        fn run_until(&mut self, seconds: f64, mut done: impl FnMut(&mut Self) -> bool) -> bool {
            let end = self.time + seconds;
            while self.time < end {
                self.step();
                if done(self) {
                    return true;
                }
            }
            false
        }

        fn connect(&mut self) -> CommandResult<()> {
            let mut handle = self.connection.connect(self.server.addr());
            let end = self.time + 30.0;
            while self.time < end {
                self.step();
                if let Some(result) = handle.try_result() {
                    return result;
                }
            }
            panic!("connection attempt never resolved");
        }

        fn client_identity(&self) -> Identity {
            Identity::new(Ipv4Addr::LOCALHOST, CLIENT_PORT)
        }

        fn server_side_mtu(&self) -> u16 {
            self.server.client(&self.client_identity()).unwrap().lock().mtu()
        }

        fn client_side_mtu(&self) -> u16 {
            self.connection.peer().unwrap().lock().mtu()
        }
    }

    fn numbered(value: u32) -> ProtocolPacket {
        let mut packet = Packet::new();
        packet.write(&value);
        ProtocolPacket::new(1, packet).with_flags(HeaderFlags::DO_NOT_DISCARD)
    }

    fn number(packet: ProtocolPacket) -> u32 {
        packet.into_packet().read::<u32>().unwrap()
    }

    /// Sends `count` numbered packets from the connection, one per step, and collects
    /// what the server delivers.
    fn stream_to_server(sim: &mut Sim, count: u32) -> Vec<u32> {
        let mut received = Vec::new();
        let mut next = 0;
        sim.run_until(60.0, |sim| {
            if next < count {
                sim.connection.send(numbered(next)).unwrap();
                next += 1;
            }
            while let Some(packet) = sim.server.pop_packet() {
                received.push(number(packet));
            }
            received.len() >= count as usize
        });
        received
    }

    #[test]
    fn connect_negotiates_smallest_mtu() {
        let mut sim = Sim::new(
            NetConfig::default().max_mtu(1300).return_rate(100.0),
            NetConfig::default().return_rate(100.0),
        );
        assert_eq!(sim.connect(), Ok(()));

        assert!(sim.connection.is_connected());
        assert_eq!(sim.server.clients().len(), 1);
        assert_eq!(sim.server.pending_len(), 0);
        let shared = sim.server.client(&sim.client_identity()).unwrap();
        assert_eq!(shared.lock().status(), ClientStatus::Connected);
        assert_eq!(sim.server_side_mtu(), 1300);
        assert_eq!(sim.client_side_mtu(), 1300);

        // both sides start the connected phase from fresh counters
        assert_eq!(shared.lock().current_counter(), 0);
        assert_eq!(sim.connection.peer().unwrap().lock().current_counter(), 0);
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let mut sim = Sim::new(
            NetConfig::default(),
            NetConfig::default().version("realmnet 0.9"),
        );
        assert_eq!(sim.connect(), Err(CommandError::HandshakeMismatch));
        assert_eq!(sim.connection.status(), ClientStatus::Disconnected);
        assert!(sim.server.clients().is_empty());
        assert_eq!(sim.server.pending_len(), 0);
    }

    #[test]
    fn full_server_ignores_handshakes() {
        let mut sim = Sim::new(
            NetConfig::default().max_clients(0),
            NetConfig::default().handshake_timeout(0.5),
        );
        assert_eq!(sim.connect(), Err(CommandError::Timeout));
        assert_eq!(sim.connection.status(), ClientStatus::TimedOut);
        assert_eq!(sim.server.pending_len(), 0);
    }

    #[test]
    fn discovers_path_mtu() {
        let mut sim = Sim::new(NetConfig::default(), NetConfig::default());
        sim.set_network(SimulationConfig {
            max_datagram_size: Some(1000),
            ..Default::default()
        });
        assert_eq!(sim.connect(), Ok(()));
        assert_eq!(sim.client_side_mtu(), 1000);
        assert_eq!(sim.server_side_mtu(), 1000);
    }

    #[test]
    fn rediscovers_mtu_after_path_change() {
        let mut sim = Sim::new(NetConfig::default(), NetConfig::default());
        assert_eq!(sim.connect(), Ok(()));
        assert_eq!(sim.client_side_mtu(), 1472);

        sim.set_network(SimulationConfig {
            max_datagram_size: Some(1200),
            ..Default::default()
        });
        let mut handle = sim.connection.discover_mtu();
        let mut handle_result = None;
        sim.run_until(30.0, |_| {
            handle_result = handle.try_result();
            handle_result.is_some()
        });
        assert_eq!(handle_result, Some(Ok(1200)));
        sim.run(0.1);
        assert_eq!(sim.client_side_mtu(), 1200);
        assert_eq!(sim.server_side_mtu(), 1200);
        assert!(sim.connection.is_connected());
    }

    #[test]
    fn reliable_packets_survive_loss() {
        let cfg = NetConfig::default()
            .lost_packet_threshold(1000)
            .cache_size(256)
            .reorder_cache_size(256);
        let mut sim = Sim::new(cfg.clone(), cfg);
        assert_eq!(sim.connect(), Ok(()));

        sim.set_network(SimulationConfig {
            latency_ms: 20.0,
            packet_loss_percent: 10.0,
            duplicate_packet_percent: 5.0,
            ..Default::default()
        });
        let received = stream_to_server(&mut sim, 100);
        assert_eq!(received, (0..100u32).collect::<Vec<_>>());
        assert!(sim.connection.is_connected());
    }

    #[test]
    fn jitter_does_not_reorder_delivery() {
        let mut sim = Sim::new(NetConfig::default(), NetConfig::default());
        assert_eq!(sim.connect(), Ok(()));

        sim.set_network(SimulationConfig {
            latency_ms: 50.0,
            jitter_ms: 40.0,
            ..Default::default()
        });
        let received = stream_to_server(&mut sim, 60);
        assert_eq!(received, (0..60u32).collect::<Vec<_>>());
    }

    #[test]
    fn ordered_packets_sent_right_after_promotion_arrive() {
        let mut sim = Sim::new(NetConfig::default(), NetConfig::default());
        sim.set_network(SimulationConfig {
            latency_ms: 30.0,
            jitter_ms: 25.0,
            ..Default::default()
        });
        let mut handle = sim.connection.connect(sim.server.addr());
        let identity = sim.client_identity();
        let mut next = 0u32;
        let mut received = Vec::new();
        sim.run_until(30.0, |sim| {
            if next < 20 && !sim.server.clients().is_empty() {
                let mut payload = Packet::new();
                payload.write(&next);
                sim.server.send(&identity, ProtocolPacket::new(1, payload)).unwrap();
                next += 1;
            }
            while let Some(packet) = sim.connection.pop_packet() {
                received.push(number(packet));
            }
            received.len() >= 20
        });
        assert_eq!(handle.try_result(), Some(Ok(())));
        assert_eq!(received, (0..20u32).collect::<Vec<_>>());
    }

    #[test]
    fn large_packets_are_fragmented() {
        let mut sim = Sim::new(NetConfig::default(), NetConfig::default());
        assert_eq!(sim.connect(), Ok(()));

        let payload = (0..20_000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>();
        let packet = ProtocolPacket::new(7, Packet::from_bytes(payload.clone()))
            .with_flags(HeaderFlags::DO_NOT_DISCARD);
        sim.connection.send(packet.clone()).unwrap();
        sim.server.send(&sim.client_identity(), packet).unwrap();

        let mut at_server = None;
        let mut at_client = None;
        sim.run_until(5.0, |sim| {
            at_server = at_server.take().or_else(|| sim.server.pop_packet());
            at_client = at_client.take().or_else(|| sim.connection.pop_packet());
            at_server.is_some() && at_client.is_some()
        });
        for received in [at_server, at_client] {
            let received = received.unwrap();
            assert_eq!(received.id(), 7);
            assert_eq!(received.packet().data(), &payload[..]);
        }
    }

    #[test]
    fn compressed_payloads_arrive_intact() {
        let mut sim = Sim::build(
            NetConfig::default(),
            NetConfig::default(),
            |server| server.with_compressor(Arc::new(Lz4Compressor::new())),
            |connection| connection.with_compressor(Arc::new(Lz4Compressor::new())),
        );
        assert_eq!(sim.connect(), Ok(()));

        let payload = b"realm ".repeat(600);
        sim.connection
            .send(ProtocolPacket::new(3, Packet::from_bytes(payload.clone())))
            .unwrap();
        let mut received = None;
        sim.run_until(2.0, |sim| {
            received = sim.server.pop_packet();
            received.is_some()
        });
        let received = received.unwrap();
        assert!(!received.has_flags(HeaderFlags::COMPRESSED));
        assert_eq!(received.packet().data(), &payload[..]);
    }

    #[test]
    fn client_disconnects() {
        let mut sim = Sim::new(NetConfig::default(), NetConfig::default());
        assert_eq!(sim.connect(), Ok(()));

        let mut handle = sim.connection.disconnect();
        let mut result = None;
        sim.run_until(2.0, |_| {
            result = handle.try_result();
            result.is_some()
        });
        assert_eq!(result, Some(Ok(())));
        assert_eq!(sim.connection.status(), ClientStatus::Disconnected);
        assert!(sim.run_until(1.0, |sim| sim.server.clients().is_empty()));
    }

    #[test]
    fn server_disconnects_client() {
        let mut sim = Sim::new(NetConfig::default(), NetConfig::default());
        assert_eq!(sim.connect(), Ok(()));

        sim.server.disconnect(&sim.client_identity()).unwrap();
        assert!(sim.run_until(1.0, |sim| {
            sim.connection.status() == ClientStatus::Disconnected
        }));
        assert!(sim.server.clients().is_empty());
    }

    #[test]
    fn silence_times_both_sides_out() {
        let cfg = NetConfig::default().connection_timeout(1.0);
        let mut sim = Sim::new(cfg.clone(), cfg);
        assert_eq!(sim.connect(), Ok(()));

        sim.set_network(SimulationConfig {
            packet_loss_percent: 100.0,
            ..Default::default()
        });
        sim.run(1.5);
        assert_eq!(sim.connection.status(), ClientStatus::TimedOut);
        assert!(sim.server.clients().is_empty());
    }

    #[test]
    fn shared_key_authenticates() {
        let key = [42u8; 32];
        let cfg = NetConfig::default().return_rate(100.0);
        let mut sim = Sim::build(
            cfg.clone().max_mtu(1400),
            cfg,
            |server| server.with_crypto(psk_factory(key)),
            |connection| connection.with_crypto(psk_factory(key)),
        );
        assert_eq!(sim.connect(), Ok(()));
        assert!(sim.connection.is_connected());
        assert_eq!(sim.server.clients().len(), 1);
        assert_eq!(sim.client_side_mtu(), 1400);
        assert_eq!(sim.server_side_mtu(), 1400);
        let shared = sim.server.client(&sim.client_identity()).unwrap();
        assert_eq!(shared.lock().current_counter(), 0);
        assert_eq!(sim.connection.peer().unwrap().lock().current_counter(), 0);

        sim.connection.send(numbered(9)).unwrap();
        let mut received = None;
        sim.run_until(1.0, |sim| {
            received = sim.server.pop_packet();
            received.is_some()
        });
        assert_eq!(received.map(number), Some(9));
    }

    #[test]
    fn network_types_follow_the_server() {
        const SYNC: u16 = 0x20;

        let mut sim = Sim::new(NetConfig::default(), NetConfig::default());
        assert_eq!(sim.connect(), Ok(()));

        let mut source = NetworkTypeHandler::new();
        let score = source.push(NetworkType::new(7u32));
        let names = source.push(NetworkTypeVector::<u16>::new());
        let mut mirror = NetworkTypeHandler::new();
        mirror.push(NetworkType::new(0u32));
        mirror.push(NetworkTypeVector::<u16>::new());

        let mut sync = |sim: &mut Sim, source: &mut NetworkTypeHandler| {
            source.clients_checkup(&sim.server.clients().lock(), false);
            sim.server.clients().clear_events();
            for identity in sim.server.clients().lock().identities() {
                let mut packet = Packet::new();
                if source.pack_modification(&mut packet, &identity) {
                    let packet = ProtocolPacket::new(SYNC, packet)
                        .with_flags(HeaderFlags::DO_NOT_DISCARD);
                    sim.server.send(&identity, packet).unwrap();
                    source.confirm_update(&identity);
                }
            }
            sim.run_until(1.0, |sim| {
                let Some(packet) = sim.connection.pop_packet() else {
                    return false;
                };
                assert_eq!(packet.id(), SYNC);
                assert!(mirror.unpack_modification(&mut packet.into_packet()));
                true
            })
        };

        assert!(sync(&mut sim, &mut source));
        source
            .get_typed_mut::<NetworkType<u32>>(score)
            .unwrap()
            .set(12);
        let vector = source
            .get_typed_mut::<NetworkTypeVector<u16>>(names)
            .unwrap();
        vector.push(4);
        vector.push(5);
        assert!(sync(&mut sim, &mut source));
        source
            .get_typed_mut::<NetworkTypeVector<u16>>(names)
            .unwrap()
            .remove(0);
        assert!(sync(&mut sim, &mut source));

        assert_eq!(
            *mirror.get_typed::<NetworkType<u32>>(score).unwrap().get(),
            12
        );
        assert_eq!(
            mirror
                .get_typed::<NetworkTypeVector<u16>>(names)
                .unwrap()
                .as_slice(),
            &[5u16]
        );
    }

    #[test]
    fn simulator_drops_oversized_datagrams() {
        let network = SimNetwork::new(SimulationConfig {
            max_datagram_size: Some(4),
            ..Default::default()
        });
        let a = NetworkSimulator::new(1, network.clone());
        let b = NetworkSimulator::new(2, network);
        let mut buf = [0u8; 16];
        b.send(b"too long", a.addr()).unwrap();
        b.send(b"ok", a.addr()).unwrap();
        assert_eq!(a.recv(&mut buf).unwrap(), Some((2, b.addr())));
        assert_eq!(a.recv(&mut buf).unwrap(), None);
    }
}
