//! DSU server exercised over a real loopback socket

use dsu_bridge::ds3::types::{Battery, ConnectionType, DeviceAddress, Model, PadMeta, PadState};
use dsu_bridge::server::codec::{self, Magic, MessageType, Request};
use dsu_bridge::server::subscription::FLAG_SLOT;
use dsu_bridge::server::{ProtocolServer, WireSettings};
use dsu_bridge::{NormalizedReport, PadId, SlotTable};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

const PAD: DeviceAddress = DeviceAddress([0x00, 0x1B, 0xDC, 0x11, 0x22, 0x33]);

fn init_logging() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Debug)
        .try_init();
}

async fn start_server(slots: Arc<SlotTable>) -> (Arc<ProtocolServer>, SocketAddr) {
    let server = ProtocolServer::bind(
        SocketAddr::from(([127, 0, 0, 1], 0)),
        slots,
        WireSettings::default(),
    )
    .await
    .unwrap();
    let server = Arc::new(server);
    let addr = server.local_addr().unwrap();
    tokio::spawn(Arc::clone(&server).run());
    (server, addr)
}

async fn client(server: SocketAddr) -> UdpSocket {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.connect(server).await.unwrap();
    socket
}

async fn recv(socket: &UdpSocket) -> Option<Vec<u8>> {
    let mut buf = [0u8; 1024];
    match timeout(Duration::from_millis(500), socket.recv(&mut buf)).await {
        Ok(Ok(len)) => Some(buf[..len].to_vec()),
        _ => None,
    }
}

fn connected_meta(pad_id: PadId) -> PadMeta {
    PadMeta {
        pad_id,
        state: PadState::Connected,
        model: Model::DS3,
        connection_type: ConnectionType::Bluetooth,
        address: PAD,
        battery: Battery::High,
    }
}

#[tokio::test]
async fn test_version_request() {
    init_logging();
    let (server, addr) = start_server(Arc::new(SlotTable::new())).await;
    let socket = client(addr).await;

    socket.send(&Request::Version.encode(0x1234)).await.unwrap();
    let reply = recv(&socket).await.expect("version reply");
    let packet = codec::parse(&reply, Magic::Server).unwrap();

    assert_eq!(packet.sender_id, server.server_id());
    assert_eq!(packet.message_type(), Some(MessageType::Version as u32));
    assert_eq!(&packet.payload[4..], &[0xE9, 0x03, 0x00, 0x00]);

    server.stop();
}

#[tokio::test]
async fn test_list_ports_replies_in_order() {
    init_logging();
    let slots = Arc::new(SlotTable::new());
    slots.update(connected_meta(PadId::Four));
    let (server, addr) = start_server(Arc::clone(&slots)).await;
    let socket = client(addr).await;

    let request = Request::ListPorts(vec![PadId::Two, PadId::Four]);
    socket.send(&request.encode(7)).await.unwrap();

    let first = codec::parse(&recv(&socket).await.unwrap(), Magic::Server).unwrap();
    let second = codec::parse(&recv(&socket).await.unwrap(), Magic::Server).unwrap();
    assert!(recv(&socket).await.is_none());

    assert_eq!(first.payload.len(), 16);
    assert_eq!(&first.payload[4..8], &[1, 0, 0, 0]);
    assert_eq!(&second.payload[4..8], &[3, 2, 1, 2]);
    assert_eq!(&second.payload[8..14], PAD.as_bytes());

    server.stop();
}

#[tokio::test]
async fn test_corrupt_datagram_ignored() {
    init_logging();
    let (server, addr) = start_server(Arc::new(SlotTable::new())).await;
    let socket = client(addr).await;

    let mut corrupt = Request::Version.encode(1);
    let last = corrupt.len() - 1;
    corrupt[last] ^= 0x01;
    socket.send(&corrupt).await.unwrap();
    assert!(recv(&socket).await.is_none());

    // server keeps answering afterwards
    socket.send(&Request::Version.encode(1)).await.unwrap();
    assert!(recv(&socket).await.is_some());

    server.stop();
}

#[tokio::test]
async fn test_subscribed_client_receives_broadcast() {
    init_logging();
    let (server, addr) = start_server(Arc::new(SlotTable::new())).await;
    let socket = client(addr).await;

    let subscribe = Request::PadData {
        flags: FLAG_SLOT,
        slot: 0,
        address: DeviceAddress::ZERO,
    };
    socket.send(&subscribe.encode(3)).await.unwrap();

    // wait for the request task to register the client
    for _ in 0..50 {
        if !server.registry().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(server.registry().len(), 1);

    let report = NormalizedReport {
        pad_id: PadId::One,
        state: PadState::Connected,
        model: Model::DS3,
        connection_type: ConnectionType::Bluetooth,
        address: PAD,
        battery: Battery::High,
        packet_counter: 42,
        ..NormalizedReport::default()
    };
    assert_eq!(server.broadcast(&report).await, 1);

    let datagram = recv(&socket).await.expect("pad data");
    assert_eq!(datagram.len(), 100);
    let packet = codec::parse(&datagram, Magic::Server).unwrap();
    assert_eq!(packet.message_type(), Some(MessageType::PadData as u32));
    assert_eq!(&datagram[32..36], &42u32.to_le_bytes());

    // a report for another slot is not delivered
    let other = NormalizedReport {
        pad_id: PadId::Two,
        ..report
    };
    assert_eq!(server.broadcast(&other).await, 0);

    server.stop();
}
