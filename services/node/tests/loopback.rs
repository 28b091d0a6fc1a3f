
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use harness::{TestNode, PEER_V4};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use vnet_node::LoopbackInfo;

async fn http_get(info: &LoopbackInfo, headers: &[(&str, String)]) -> (u16, String) {
    let mut stream = TcpStream::connect(info.addr).await.unwrap();
    let mut req = format!(
        "GET /localapi/v0/status HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n",
        info.addr
    );
    for (name, value) in headers {
        req.push_str(&format!("{name}: {value}\r\n"));
    }
    req.push_str("\r\n");
    stream.write_all(req.as_bytes()).await.unwrap();

    let mut resp = String::new();
    stream.read_to_string(&mut resp).await.unwrap();
    let code = resp[9..12].parse().unwrap();
    (code, resp)
}

fn basic(password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!(":{password}")))
}

#[tokio::test]
async fn loopback_is_created_once() {
    let node = TestNode::up().await;
    let first = node.server.loopback().await.unwrap();
    let second = node.server.loopback().await.unwrap();

    assert_eq!(first, second);
    assert!(first.addr.ip().is_loopback());
    assert_eq!(first.proxy_user, "vnet");
    assert_eq!(first.proxy_password.len(), 32);
    assert_ne!(first.proxy_password, first.local_api_password);
}

#[tokio::test]
async fn local_api_requires_gate_header() {
    let node = TestNode::up().await;
    let info = node.server.loopback().await.unwrap();

    let (code, body) = http_get(&info, &[("Authorization", basic(&info.local_api_password))]).await;
    assert_eq!(code, 403);
    assert!(body.contains("missing 'Sec-Vnet: localapi' header"));
}

#[tokio::test]
async fn local_api_requires_password() {
    let node = TestNode::up().await;
    let info = node.server.loopback().await.unwrap();

    let (code, _) = http_get(&info, &[("Sec-Vnet", "localapi".into())]).await;
    assert_eq!(code, 401);

    let (code, _) = http_get(
        &info,
        &[
            ("Sec-Vnet", "localapi".into()),
            ("Authorization", basic(&info.proxy_password)),
        ],
    )
    .await;
    assert_eq!(code, 401);
}

#[tokio::test]
async fn local_api_serves_status() {
    let node = TestNode::up().await;
    let info = node.server.loopback().await.unwrap();

    let (code, body) = http_get(
        &info,
        &[
            ("Sec-Vnet", "localapi".into()),
            ("Authorization", basic(&info.local_api_password)),
        ],
    )
    .await;
    assert_eq!(code, 200);
    assert!(body.contains("\"backend_state\":\"running\""));
}

async fn socks_handshake(info: &LoopbackInfo, password: &str) -> (TcpStream, u8) {
    let mut stream = TcpStream::connect(info.addr).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [0x05, 0x02]);

    let mut auth = vec![0x01, info.proxy_user.len() as u8];
    auth.extend_from_slice(info.proxy_user.as_bytes());
    auth.push(password.len() as u8);
    auth.extend_from_slice(password.as_bytes());
    stream.write_all(&auth).await.unwrap();
    let mut status = [0u8; 2];
    stream.read_exact(&mut status).await.unwrap();
    (stream, status[1])
}

#[tokio::test]
async fn socks5_connects_to_peer() {
    let node = TestNode::up().await;
    let info = node.server.loopback().await.unwrap();

    let (mut stream, status) = socks_handshake(&info, &info.proxy_password).await;
    assert_eq!(status, 0x00);

    let mut connect = vec![0x05, 0x01, 0x00, 0x01];
    connect.extend_from_slice(&PEER_V4.octets());
    connect.extend_from_slice(&7u16.to_be_bytes());
    stream.write_all(&connect).await.unwrap();
    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x00);

    stream.write_all(b"through the proxy").await.unwrap();
    let mut echoed = [0u8; 17];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"through the proxy");
}

#[tokio::test]
async fn socks5_rejects_wrong_password() {
    let node = TestNode::up().await;
    let info = node.server.loopback().await.unwrap();

    let (_stream, status) = socks_handshake(&info, &info.local_api_password).await;
    assert_eq!(status, 0x01);
}

#[tokio::test]
async fn loopback_closed_with_server() {
    let node = TestNode::up().await;
    node.server.loopback().await.unwrap();
    node.server.close().await.unwrap();

    assert!(matches!(
        node.server.loopback().await,
        Err(vnet_node::Error::ServerClosed)
    ));
}
