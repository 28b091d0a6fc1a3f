//! Loopback TCP surface: the local API and a SOCKS5 proxy on one
//! `127.0.0.1` port, told apart by the first byte of each connection.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::dialer::Dialer;
use crate::error::Error;
use crate::localapi::gated_router;
use crate::localapi::memnet::{ChannelAddr, ChannelListener};
use crate::socks5::{Socks5Server, SOCKS5_VERSION};

/// Username the SOCKS5 proxy expects.
pub const PROXY_USER: &str = "vnet";

const SNIFF_TIMEOUT: Duration = Duration::from_secs(10);

/// Where the loopback surface listens and how to authenticate to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopbackInfo {
    pub addr: SocketAddr,
    pub proxy_user: String,
    pub proxy_password: String,
    /// Basic-auth password for the local API (any username).
    pub local_api_password: String,
}

pub(crate) struct Loopback {
    info: LoopbackInfo,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

impl Loopback {
    pub(crate) async fn spawn(backend: Arc<dyn Backend>, dialer: Arc<Dialer>) -> Result<Self, Error> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let info = LoopbackInfo {
            addr: listener.local_addr()?,
            proxy_user: PROXY_USER.to_string(),
            proxy_password: random_secret(),
            local_api_password: random_secret(),
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (http_tx, http_rx) = mpsc::channel::<TcpStream>(64);

        let app = gated_router(backend, info.local_api_password.clone());
        let mut http_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let listener = ChannelListener::new(http_rx, ChannelAddr("loopback"));
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = http_shutdown.wait_for(|stop| *stop).await;
                })
                .await;
            if let Err(e) = result {
                warn!(error = %e, "loopback local api server failed");
            }
        });

        let socks = Arc::new(Socks5Server::new(
            PROXY_USER,
            info.proxy_password.clone(),
            dialer,
        ));
        let accept_task = tokio::spawn(accept_loop(listener, socks, http_tx, shutdown_rx));

        info!(addr = %info.addr, "loopback surface listening");
        Ok(Self {
            info,
            shutdown,
            accept_task,
        })
    }

    pub(crate) fn info(&self) -> LoopbackInfo {
        self.info.clone()
    }

    pub(crate) fn close(&self) {
        if self.shutdown.send(true).is_err() {
            debug!("loopback http server already stopped");
        }
        self.accept_task.abort();
        debug!(addr = %self.info.addr, "loopback surface closed");
    }
}

async fn accept_loop(
    listener: TcpListener,
    socks: Arc<Socks5Server>,
    http_tx: mpsc::Sender<TcpStream>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "loopback accept failed");
                    continue;
                }
            },
            _ = shutdown.wait_for(|stop| *stop) => return,
        };

        let socks = Arc::clone(&socks);
        let http_tx = http_tx.clone();
        tokio::spawn(async move {
            let mut first = [0u8; 1];
            match timeout(SNIFF_TIMEOUT, stream.peek(&mut first)).await {
                Ok(Ok(1)) if first[0] == SOCKS5_VERSION => {
                    if let Err(e) = socks.serve(stream).await {
                        debug!(%peer, error = %e, "SOCKS5 session ended");
                    }
                }
                Ok(Ok(1)) => {
                    let _ = http_tx.send(stream).await;
                }
                _ => debug!(%peer, "loopback connection closed before first byte"),
            }
        });
    }
}

fn random_secret() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_secret() {
        let a = random_secret();
        let b = random_secret();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }
}
