//! Outbound connections: overlay peers through the user-space stack,
//! everything else through the host network.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::{lookup_host, TcpStream};
use tracing::debug;
use vnet_networking::{lookup_port, split_host_port, Network, Protocol};

use crate::conn::Conn;
use crate::error::Error;
use crate::subsystems::{NetStack, PacketEngine};

pub struct Dialer {
    engine: Arc<dyn PacketEngine>,
    stack: Arc<dyn NetStack>,
    closed: AtomicBool,
}

impl Dialer {
    pub fn new(engine: Arc<dyn PacketEngine>, stack: Arc<dyn NetStack>) -> Self {
        Self {
            engine,
            stack,
            closed: AtomicBool::new(false),
        }
    }

    /// Dial `address` (`host:port`) over `network` (`tcp`, `tcp4`, `tcp6`).
    ///
    /// Dropping the returned future abandons the attempt.
    pub async fn dial(&self, network: &str, address: &str) -> Result<Conn, Error> {
        if self.is_closed() {
            return Err(Error::DialerClosed);
        }

        let net: Network = network.parse()?;
        if net.protocol() != Protocol::Tcp {
            return Err(Error::TcpOnly {
                op: "dial",
                network: network.to_string(),
            });
        }
        let (host, port) = split_host_port(address)?;
        let port = lookup_port(net, port)?;

        if let Ok(ip) = host.parse::<IpAddr>() {
            if !net.admits(ip) {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("address {ip} is not reachable over {net}"),
                )
                .into());
            }
            return self.dial_ip(SocketAddr::new(ip, port)).await;
        }

        let mut last_err = None;
        for addr in lookup_host((host, port)).await? {
            if !net.admits(addr.ip()) {
                continue;
            }
            match self.dial_ip(addr).await {
                Ok(conn) => return Ok(conn),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no {net} addresses for {host}"),
            )
            .into()
        }))
    }

    async fn dial_ip(&self, addr: SocketAddr) -> Result<Conn, Error> {
        if self.engine.is_peer(addr.ip()) {
            debug!(%addr, "dialing peer over overlay");
            let conn = self.stack.dial_tcp(addr).await?;
            return Ok(conn);
        }
        debug!(%addr, "dialing over host network");
        let stream = TcpStream::connect(addr).await?;
        Ok(Box::new(stream))
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("dialer closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const PEER: &str = "100.64.0.2";

    struct FakeEngine;

    #[async_trait]
    impl PacketEngine for FakeEngine {
        fn is_peer(&self, ip: IpAddr) -> bool {
            ip == PEER.parse::<IpAddr>().unwrap()
        }

        fn listen_port(&self) -> u16 {
            0
        }

        async fn close(&self) {}
    }

    #[derive(Default)]
    struct FakeStack {
        dials: AtomicUsize,
    }

    #[async_trait]
    impl NetStack for FakeStack {
        async fn start(&self, _backend: Arc<dyn Backend>) -> anyhow::Result<()> {
            Ok(())
        }

        async fn dial_tcp(&self, _dst: SocketAddr) -> io::Result<Conn> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            let (local, mut remote) = duplex(64);
            tokio::spawn(async move {
                let _ = remote.write_all(b"overlay").await;
            });
            Ok(Box::new(local))
        }

        async fn close(&self) {}
    }

    fn dialer() -> (Dialer, Arc<FakeStack>) {
        let stack = Arc::new(FakeStack::default());
        (Dialer::new(Arc::new(FakeEngine), stack.clone()), stack)
    }

    #[tokio::test]
    async fn test_peer_dialed_over_overlay() {
        let (dialer, stack) = dialer();
        let mut conn = dialer.dial("tcp", &format!("{PEER}:80")).await.unwrap();
        let mut buf = [0u8; 7];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"overlay");
        assert_eq!(stack.dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_non_peer_dialed_over_host() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"host").await.unwrap();
        });

        let (dialer, stack) = dialer();
        let mut conn = dialer.dial("tcp4", &addr.to_string()).await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"host");
        assert_eq!(stack.dials.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_rejections() {
        let (dialer, _) = dialer();
        assert!(matches!(
            dialer.dial("udp", &format!("{PEER}:53")).await,
            Err(Error::TcpOnly { .. })
        ));
        assert!(matches!(
            dialer.dial("tcp", "no-port").await,
            Err(Error::Network(_))
        ));
        assert!(matches!(
            dialer.dial("tcp6", &format!("{PEER}:80")).await,
            Err(Error::Io(_))
        ));

        dialer.close();
        assert!(dialer.is_closed());
        assert!(matches!(
            dialer.dial("tcp", &format!("{PEER}:80")).await,
            Err(Error::DialerClosed)
        ));
    }
}
