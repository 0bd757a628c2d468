use std::{
    io::{self, BufRead},
    net::SocketAddr,
    sync::Arc,
    thread,
    time::Duration,
};

use realmnet::{spawn, Connection, HeaderFlags, NetConfig, Packet, ProtocolPacket, Server};

const ECHO_ID: u16 = 1;

fn main() {
    env_logger::Builder::new()
        .filter(None, log::LevelFilter::Info)
        .init();

    let server_addr: SocketAddr = "127.0.0.1:12345".parse().unwrap();
    let server = Arc::new(Server::new(server_addr, NetConfig::default()).unwrap());
    let _server_threads = spawn(server.clone()).unwrap();

    let connection = Arc::new(Connection::new("127.0.0.1:0", NetConfig::default()).unwrap());
    let _connection_threads = spawn(connection.clone()).unwrap();
    connection.connect(server_addr).wait().unwrap();

    let echo = server.clone();
    thread::spawn(move || loop {
        while let Some(packet) = echo.pop_packet() {
            let identity = packet.identity();
            println!(
                "server received: {}",
                String::from_utf8_lossy(packet.packet().data())
            );
            let reply = ProtocolPacket::new(ECHO_ID, packet.into_packet())
                .with_flags(HeaderFlags::DO_NOT_DISCARD);
            echo.send(&identity, reply).unwrap();
        }
        thread::sleep(Duration::from_millis(5));
    });

    let printer = connection.clone();
    thread::spawn(move || loop {
        while let Some(packet) = printer.pop_packet() {
            println!(
                "echoed back: {}",
                String::from_utf8_lossy(packet.packet().data())
            );
        }
        thread::sleep(Duration::from_millis(5));
    });

    for line in io::stdin().lock().lines() {
        let input = line.unwrap();
        if input.is_empty() {
            continue;
        }
        let packet = ProtocolPacket::new(ECHO_ID, Packet::from_bytes(input.into_bytes()))
            .with_flags(HeaderFlags::DO_NOT_DISCARD);
        connection.send(packet).unwrap();
    }

    connection.disconnect().wait().unwrap();
}
