//! End-to-end gateway tests over real sockets: logon flow through the
//! upstream channel, session delivery, broadcast, disconnect cleanup.

use bytes::Bytes;
use holdfast_core::{Channel, Select, WorkerPool};
use holdfast_gateway::{
    ConnectionManager, InboundFrame, NetworkConfig, SessionId, TcpServer, UpstreamService,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    server: TcpServer,
    addr: SocketAddr,
    manager: Arc<ConnectionManager>,
    upstream: Channel<InboundFrame>,
}

async fn start_gateway() -> Harness {
    let manager = ConnectionManager::new();
    let upstream = Channel::new();
    let service = Arc::new(UpstreamService::new(upstream.clone()));
    let pool = Arc::new(WorkerPool::new(2));

    let config = NetworkConfig { bind_address: "127.0.0.1:0".parse().unwrap(), max_connections: 16 };
    let mut server = TcpServer::new(config, Arc::clone(&manager), service, pool);
    let addr = server.start().await.expect("gateway starts");

    Harness { server, addr, manager, upstream }
}

async fn wait_for_connections(manager: &ConnectionManager, expected: usize) {
    timeout(WAIT, async {
        while manager.len() != expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("connection count settles");
}

#[tokio::test]
async fn test_logon_flow_binds_session_and_delivers_reply() {
    let mut harness = start_gateway().await;

    let mut client = TcpStream::connect(harness.addr).await.unwrap();
    client.write_all(b"LOGON alice").await.unwrap();

    // The gateway forwards the opaque payload upstream, tagged with the
    // connection id.
    let frame = timeout(WAIT, harness.upstream.recv()).await.unwrap();
    assert_eq!(frame.payload, Bytes::from_static(b"LOGON alice"));

    // The upper layer accepts the logon and answers via the session.
    let session = SessionId::new(5000);
    harness.manager.set_session(frame.connection, session);
    harness.manager.send_to_session(session, Bytes::from_static(b"WELCOME"));

    let mut reply = [0u8; 7];
    timeout(WAIT, client.read_exact(&mut reply)).await.unwrap().unwrap();
    assert_eq!(&reply, b"WELCOME");

    let bound = harness.manager.connection_by_session(session).unwrap();
    assert_eq!(bound.id(), frame.connection);

    harness.server.stop().await;
}

#[tokio::test]
async fn test_broadcast_reaches_every_client() {
    let mut harness = start_gateway().await;

    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(TcpStream::connect(harness.addr).await.unwrap());
    }
    wait_for_connections(&harness.manager, 3).await;

    harness.manager.broadcast(Bytes::from_static(b"X"));

    for client in &mut clients {
        let mut byte = [0u8; 1];
        timeout(WAIT, client.read_exact(&mut byte)).await.unwrap().unwrap();
        assert_eq!(&byte, b"X");
    }

    harness.server.stop().await;
}

#[tokio::test]
async fn test_disconnect_unregisters_and_later_sends_are_noops() {
    let mut harness = start_gateway().await;

    let mut client = TcpStream::connect(harness.addr).await.unwrap();
    client.write_all(b"hello").await.unwrap();
    let frame = timeout(WAIT, harness.upstream.recv()).await.unwrap();
    let id = frame.connection;
    harness.manager.set_session(id, SessionId::new(7));

    drop(client);
    wait_for_connections(&harness.manager, 0).await;

    assert!(harness.manager.connection(id).is_none());
    assert!(harness.manager.connection_by_session(SessionId::new(7)).is_none());
    // Point and session sends to the dead connection must be no-ops.
    harness.manager.send_to_connection(id, Bytes::from_static(b"X"));
    harness.manager.send_to_session(SessionId::new(7), Bytes::from_static(b"X"));

    harness.server.stop().await;
}

#[tokio::test]
async fn test_select_merges_two_gateways_upstreams() {
    let mut first = start_gateway().await;
    let mut second = start_gateway().await;

    let select = Select::new([(1, &first.upstream), (2, &second.upstream)]);

    let mut to_first = TcpStream::connect(first.addr).await.unwrap();
    to_first.write_all(b"one").await.unwrap();
    let (tag, frame) = timeout(WAIT, select.recv()).await.unwrap();
    assert_eq!(tag, 1);
    assert_eq!(frame.payload, Bytes::from_static(b"one"));

    let mut to_second = TcpStream::connect(second.addr).await.unwrap();
    to_second.write_all(b"two").await.unwrap();
    let (tag, frame) = timeout(WAIT, select.recv()).await.unwrap();
    assert_eq!(tag, 2);
    assert_eq!(frame.payload, Bytes::from_static(b"two"));

    first.server.stop().await;
    second.server.stop().await;
}

#[tokio::test]
async fn test_capacity_limit_rejects_excess_connections() {
    let manager = ConnectionManager::new();
    let upstream: Channel<InboundFrame> = Channel::new();
    let service = Arc::new(UpstreamService::new(upstream.clone()));
    let config = NetworkConfig { bind_address: "127.0.0.1:0".parse().unwrap(), max_connections: 1 };
    let mut server =
        TcpServer::new(config, Arc::clone(&manager), service, Arc::new(WorkerPool::new(1)));
    let addr = server.start().await.unwrap();

    let _first = TcpStream::connect(addr).await.unwrap();
    wait_for_connections(&manager, 1).await;

    // The second connection is accepted at the OS level but immediately
    // dropped by the gateway; reading from it must hit EOF.
    let mut second = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 1];
    let read = timeout(WAIT, second.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(read, 0, "rejected connection must be closed");
    assert_eq!(manager.len(), 1);

    server.stop().await;
}
