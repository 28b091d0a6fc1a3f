
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use harness::{node, peer, TestNode, NODE_V4, PEER_V4};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use vnet_node::sim::Injected;
use vnet_node::{flow_handler, Error, FallbackDecision};

const NODE_V6: Ipv6Addr = Ipv6Addr::new(0xfd7a, 0x115c, 0xa1e0, 0, 0, 0, 0, 1);

#[tokio::test]
async fn tcp_flow_reaches_listener() {
    let node_handle = TestNode::up().await;
    let listener = node_handle.server.listen("tcp", ":80").await.unwrap();

    let accept = tokio::spawn(async move {
        let mut conn = listener.accept().await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        conn.write_all(b"pong").await.unwrap();
        buf
    });

    let mut remote = node_handle
        .stack()
        .inject_tcp(peer(40000), node(80))
        .into_stream()
        .expect("flow to :80 must be delivered");
    remote.write_all(b"ping").await.unwrap();
    let mut reply = [0u8; 4];
    remote.read_exact(&mut reply).await.unwrap();

    assert_eq!(&reply, b"pong");
    assert_eq!(&accept.await.unwrap(), b"ping");
}

#[tokio::test]
async fn unclaimed_port_is_dropped() {
    let node_handle = TestNode::up().await;
    let _listener = node_handle.server.listen("tcp", ":80").await.unwrap();

    let stack = node_handle.stack();
    assert!(matches!(stack.inject_tcp(peer(40000), node(81)), Injected::Dropped));

    // A host-less listener only answers for the node's own addresses.
    let elsewhere = SocketAddr::new(IpAddr::V4(PEER_V4), 80);
    assert!(matches!(stack.inject_tcp(peer(40000), elsewhere), Injected::Dropped));
}

#[tokio::test]
async fn family_specific_listener() {
    let node_handle = TestNode::up().await;
    let v6 = node_handle
        .server
        .listen("tcp6", &format!("[{NODE_V6}]:8080"))
        .await
        .unwrap();
    let _generic = node_handle.server.listen("tcp", ":8080").await.unwrap();

    let accept = tokio::spawn(async move { v6.accept().await.is_ok() });
    let dst = SocketAddr::new(IpAddr::V6(NODE_V6), 8080);
    let src = SocketAddr::new("fd7a:115c:a1e0::2".parse().unwrap(), 40000);
    assert!(node_handle.stack().inject_tcp(src, dst).into_stream().is_some());
    assert!(timeout(Duration::from_secs(2), accept).await.unwrap().unwrap());
}

#[tokio::test]
async fn listen_rejects_bad_addresses() {
    let node_handle = TestNode::up().await;
    let server = &node_handle.server;

    assert!(matches!(server.listen("sctp", ":80").await, Err(Error::Network(_))));
    assert!(matches!(server.listen("tcp4", "[::1]:80").await, Err(Error::Network(_))));
    assert!(matches!(server.listen("tcp", "example.com:80").await, Err(Error::Network(_))));
    assert!(matches!(server.listen("tcp", ":nope").await, Err(Error::Network(_))));

    let ln = server.listen("", ":https").await.unwrap();
    assert_eq!(ln.keys()[0].port, 443);
    assert_eq!(ln.addr().addr, ":https");
}

#[tokio::test]
async fn duplicate_listen_conflicts_until_closed() {
    let node_handle = TestNode::up().await;
    let server = &node_handle.server;

    let first = server.listen("tcp", ":80").await.unwrap();
    let err = server.listen("tcp", ":80").await.unwrap_err();
    assert_eq!(err.to_string(), "listener already open for tcp, :80");

    first.close().unwrap();
    assert!(matches!(first.close(), Err(Error::ListenerClosed)));
    server.listen("tcp", ":80").await.unwrap();
}

#[tokio::test]
async fn udp_flow_reaches_udp_listener() {
    let node_handle = TestNode::up().await;
    let listener = node_handle.server.listen("udp", ":53").await.unwrap();
    let accept = tokio::spawn(async move { listener.accept().await.is_ok() });

    let stack = node_handle.stack();
    assert!(stack.inject_udp(peer(5353), node(53)).into_stream().is_some());
    assert!(timeout(Duration::from_secs(2), accept).await.unwrap().unwrap());

    // TCP to the same port is a different key.
    assert!(matches!(stack.inject_tcp(peer(5353), node(53)), Injected::Dropped));
}

#[tokio::test]
async fn fallback_handler_claims_unmatched_flows() {
    let node_handle = TestNode::up().await;
    let served = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&served);
    let registration = node_handle
        .server
        .register_fallback_tcp_handler(move |_src, dst| {
            if dst.port() != 22 {
                return FallbackDecision::Pass;
            }
            let counter = Arc::clone(&counter);
            FallbackDecision::Intercept(Some(flow_handler(move |mut conn| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let _ = conn.write_all(b"SSH-2.0-vnet\r\n").await;
                }
            })))
        });

    let stack = node_handle.stack();
    let mut remote = stack
        .inject_tcp(peer(40000), node(22))
        .into_stream()
        .expect("fallback must claim :22");
    let mut banner = [0u8; 14];
    remote.read_exact(&mut banner).await.unwrap();
    assert_eq!(&banner, b"SSH-2.0-vnet\r\n");
    assert_eq!(served.load(Ordering::SeqCst), 1);

    assert!(matches!(stack.inject_tcp(peer(40000), node(23)), Injected::Dropped));

    registration.deregister();
    assert!(matches!(stack.inject_tcp(peer(40000), node(22)), Injected::Dropped));
}

#[tokio::test]
async fn listener_takes_precedence_over_fallback() {
    let node_handle = TestNode::up().await;
    let _registration = node_handle
        .server
        .register_fallback_tcp_handler(|_, _| FallbackDecision::Intercept(None));
    let listener = node_handle.server.listen("tcp", ":80").await.unwrap();
    let accept = tokio::spawn(async move { listener.accept().await.is_ok() });

    let stack = node_handle.stack();
    assert!(stack.inject_tcp(peer(1), node(80)).into_stream().is_some());
    assert!(timeout(Duration::from_secs(2), accept).await.unwrap().unwrap());

    // Intercept(None) accepts and drops.
    assert!(matches!(stack.inject_tcp(peer(1), node(81)), Injected::Dropped));
}

#[tokio::test]
async fn dial_peer_over_overlay() {
    let node_handle = TestNode::up().await;

    let mut conn = node_handle
        .server
        .dial("tcp", &format!("{PEER_V4}:7"))
        .await
        .unwrap();
    conn.write_all(b"echo").await.unwrap();
    let mut buf = [0u8; 4];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"echo");
}

#[tokio::test]
async fn dial_rejects_udp_and_mismatched_family() {
    let node_handle = TestNode::up().await;
    let server = &node_handle.server;

    assert!(matches!(
        server.dial("udp", &format!("{PEER_V4}:53")).await,
        Err(Error::TcpOnly { .. })
    ));
    assert!(matches!(
        server.dial("tcp6", &format!("{PEER_V4}:7")).await,
        Err(Error::Io(_))
    ));
}

#[tokio::test]
async fn dial_after_close_fails() {
    let node_handle = TestNode::up().await;
    node_handle.server.close().await.unwrap();
    assert!(matches!(
        node_handle.server.dial("tcp", &format!("{NODE_V4}:80")).await,
        Err(Error::DialerClosed)
    ));
}
