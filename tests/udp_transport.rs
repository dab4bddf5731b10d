//! UDP endpoint tests over real loopback sockets.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::{current_hello, RecordingSwitch};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use vnet_protocol::config::Config;
use vnet_protocol::core::address::Address;
use vnet_protocol::core::fragment::Fragment;
use vnet_protocol::core::identity::LocalIdentity;
use vnet_protocol::core::packet::Packet;
use vnet_protocol::error::Result;
use vnet_protocol::node::{MulticastDirectory, NetworkTable, PeerTable, RuntimeEnvironment, Topology};
use vnet_protocol::protocol::message::{Message, OkBody};
use vnet_protocol::protocol::{Dispatcher, Verb};
use vnet_protocol::transport::{beacon, Datagram, UdpEndpoint};

struct RunningNode {
    identity: Arc<LocalIdentity>,
    topology: Arc<PeerTable>,
    dispatcher: Arc<Dispatcher>,
    address: SocketAddr,
    others_rx: mpsc::Receiver<(Datagram, SocketAddr)>,
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<Result<()>>,
}

async fn start_node() -> RunningNode {
    let identity = Arc::new(LocalIdentity::generate().unwrap());
    let endpoint = UdpEndpoint::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let topology = Arc::new(PeerTable::new(identity.address(), []));
    let env = RuntimeEnvironment {
        identity: Arc::clone(&identity),
        topology: topology.clone(),
        switch: Arc::new(RecordingSwitch::default()),
        transport: Arc::new(endpoint.transport()),
        networks: Arc::new(NetworkTable::new()),
        multicaster: Arc::new(MulticastDirectory::new()),
        netconf: None,
    };
    let dispatcher = Arc::new(Dispatcher::new(env, &Config::default()));
    let address = endpoint.local_addr().unwrap();

    let (others_tx, others_rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let run_dispatcher = Arc::clone(&dispatcher);
    let handle = tokio::spawn(async move {
        endpoint
            .run(run_dispatcher, Some(others_tx), shutdown_rx)
            .await
    });

    RunningNode {
        identity,
        topology,
        dispatcher,
        address,
        others_rx,
        shutdown_tx,
        handle,
    }
}

async fn client() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.unwrap()
}

#[tokio::test]
async fn test_hello_over_udp_gets_ok() {
    let node = start_node().await;
    let a = LocalIdentity::generate().unwrap();
    let socket = client().await;

    let hello = current_hello(&a, &node.identity);
    let hello_id = hello.packet_id();
    socket.send_to(hello.as_bytes(), node.address).await.unwrap();

    let mut buf = vec![0u8; 2048];
    let (n, from) = timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .expect("reply within timeout")
        .unwrap();
    assert_eq!(from, node.address);

    let mut reply = Packet::from_bytes(&buf[..n]).unwrap();
    let key = a.agree(node.identity.identity()).unwrap();
    reply.dearmor(&key).unwrap();
    reply.uncompress().unwrap();
    assert_eq!(reply.verb_raw(), Verb::Ok as u8);
    let Message::Ok(ok) = Message::decode(reply.verb_raw(), reply.payload()).unwrap() else {
        panic!("expected OK");
    };
    assert_eq!(ok.in_re_packet_id, hello_id);
    assert!(matches!(ok.body, OkBody::Hello(_)));

    let peer = node.topology.get_peer(a.address()).unwrap();
    assert_eq!(peer.direct_path().unwrap(), Some(socket.local_addr().unwrap()));
    assert_eq!(node.dispatcher.metrics().snapshot().packets_sent, 1);

    node.shutdown_tx.send(()).await.unwrap();
    node.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_beacons_and_fragments_are_handed_off() {
    let mut node = start_node().await;
    let socket = client().await;
    let announcer = Address::new(0x1122334455);

    socket.send_to(&beacon(announcer), node.address).await.unwrap();
    let (datagram, from) = timeout(Duration::from_secs(5), node.others_rx.recv())
        .await
        .expect("beacon within timeout")
        .unwrap();
    assert_eq!(datagram, Datagram::Beacon(announcer));
    assert_eq!(from, socket.local_addr().unwrap());

    let mut head = Packet::new(node.identity.address(), announcer, Verb::Frame);
    head.append(&[0x5a; 400]);
    let fragment = Fragment::new(&head, 200, 200, 1, 2).unwrap();
    socket.send_to(fragment.as_bytes(), node.address).await.unwrap();
    let (datagram, _) = timeout(Duration::from_secs(5), node.others_rx.recv())
        .await
        .expect("fragment within timeout")
        .unwrap();
    assert!(matches!(datagram, Datagram::Fragment(_)));

    // packets never reach the side channel
    assert!(node.others_rx.try_recv().is_err());

    node.shutdown_tx.send(()).await.unwrap();
    node.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_garbage_datagrams_do_not_stop_the_loop() {
    let node = start_node().await;
    let a = LocalIdentity::generate().unwrap();
    let socket = client().await;

    for junk in [&[0u8; 3][..], &[0xffu8; 20][..], &[1u8; 27][..]] {
        socket.send_to(junk, node.address).await.unwrap();
    }
    socket
        .send_to(current_hello(&a, &node.identity).as_bytes(), node.address)
        .await
        .unwrap();

    let mut buf = vec![0u8; 2048];
    let received = timeout(Duration::from_secs(5), socket.recv_from(&mut buf)).await;
    assert!(received.is_ok(), "endpoint stopped answering after junk");

    node.shutdown_tx.send(()).await.unwrap();
    node.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_shutdown_stops_endpoint() {
    let node = start_node().await;
    node.shutdown_tx.send(()).await.unwrap();
    let result = timeout(Duration::from_secs(5), node.handle)
        .await
        .expect("endpoint stops promptly")
        .unwrap();
    assert!(result.is_ok());
}
