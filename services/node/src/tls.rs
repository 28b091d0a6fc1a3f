//! TLS-terminating listeners. Certificates come from the backend, chosen by
//! the ClientHello server name.
//!
//! Raw connections are accepted as soon as they are delivered; each
//! handshake runs in its own task, so a slow or silent client only holds up
//! itself.

use std::sync::Arc;
use std::time::Duration;

use rustls::crypto::CryptoProvider;
use rustls::server::Acceptor;
use rustls::ServerConfig;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;
use tracing::debug;

use crate::backend::Backend;
use crate::conn::Conn;
use crate::error::Error;
use crate::listener::{Listener, ListenerAddr, HANDOFF_TIMEOUT};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub type TlsConn = TlsStream<Conn>;

pub struct TlsListener {
    listener: Listener,
    ready: Mutex<mpsc::Receiver<TlsConn>>,
    closed: watch::Receiver<bool>,
    accept_task: JoinHandle<()>,
}

impl TlsListener {
    pub(crate) fn new(listener: Listener, backend: Arc<dyn Backend>) -> Self {
        let (ready_tx, ready_rx) = mpsc::channel(1);
        let (closed_tx, closed_rx) = watch::channel(false);
        let handshaker = Arc::new(Handshaker {
            backend,
            provider: Arc::new(rustls::crypto::ring::default_provider()),
            addr: listener.addr(),
        });
        let accept_task = tokio::spawn(accept_loop(
            listener.clone(),
            handshaker,
            ready_tx,
            closed_tx,
        ));
        Self {
            listener,
            ready: Mutex::new(ready_rx),
            closed: closed_rx,
            accept_task,
        }
    }

    /// Wait for the next connection that completes a handshake.
    ///
    /// Failed handshakes are logged and skipped.
    pub async fn accept(&self) -> Result<TlsConn, Error> {
        let mut closed = self.closed.clone();
        let mut ready = self.ready.lock().await;
        tokio::select! {
            biased;
            conn = ready.recv() => conn.ok_or(Error::ListenerClosed),
            _ = closed.wait_for(|closed| *closed) => Err(Error::ListenerClosed),
        }
    }

    pub fn close(&self) -> Result<(), Error> {
        self.listener.close()
    }

    pub fn addr(&self) -> ListenerAddr {
        self.listener.addr()
    }

    /// The plain listener underneath.
    pub fn listener(&self) -> &Listener {
        &self.listener
    }
}

impl Drop for TlsListener {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

struct Handshaker {
    backend: Arc<dyn Backend>,
    provider: Arc<CryptoProvider>,
    addr: ListenerAddr,
}

impl Handshaker {
    async fn run(&self, conn: Conn, ready: mpsc::Sender<TlsConn>) {
        let tls = match timeout(HANDSHAKE_TIMEOUT, self.handshake(conn)).await {
            Ok(Ok(tls)) => tls,
            Ok(Err(e)) => {
                debug!(addr = %self.addr, error = %e, "tls handshake failed");
                return;
            }
            Err(_) => {
                debug!(addr = %self.addr, "tls handshake timed out");
                return;
            }
        };
        match timeout(HANDOFF_TIMEOUT, ready.send(tls)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => debug!(addr = %self.addr, "tls listener gone; dropping connection"),
            Err(_) => debug!(addr = %self.addr, "no accept within hand-off timeout; dropping connection"),
        }
    }

    async fn handshake(&self, conn: Conn) -> Result<TlsConn, Error> {
        let start = LazyConfigAcceptor::new(Acceptor::default(), conn).await?;
        let server_name = start
            .client_hello()
            .server_name()
            .map(str::to_string)
            .ok_or_else(|| rustls::Error::General("ClientHello has no server name".into()))?;

        let pair = self
            .backend
            .get_certificate(&server_name)
            .await
            .map_err(Error::subsystem("certificate"))?;
        let config = ServerConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(pair.chain, pair.key)?;

        Ok(start.into_stream(Arc::new(config)).await?)
    }
}

async fn accept_loop(
    listener: Listener,
    handshaker: Arc<Handshaker>,
    ready: mpsc::Sender<TlsConn>,
    closed: watch::Sender<bool>,
) {
    while let Ok(conn) = listener.accept().await {
        let handshaker = Arc::clone(&handshaker);
        let ready = ready.clone();
        tokio::spawn(async move { handshaker.run(conn, ready).await });
    }
    debug!(addr = %handshaker.addr, "tls listener closed");
    if closed.send(true).is_err() {
        debug!("tls listener dropped before close");
    }
}
