//! Channel-fed listeners for serving HTTP without a socket.

use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{duplex, AsyncRead, AsyncWrite, DuplexStream};
use tokio::sync::mpsc;

/// Buffer size of each in-process connection, per direction.
const PIPE_BUFFER: usize = 64 * 1024;

/// Placeholder address of a channel listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelAddr(pub &'static str);

/// An `axum::serve` listener whose connections arrive on a channel.
pub struct ChannelListener<T> {
    rx: mpsc::Receiver<T>,
    addr: ChannelAddr,
}

impl<T> ChannelListener<T> {
    pub fn new(rx: mpsc::Receiver<T>, addr: ChannelAddr) -> Self {
        Self { rx, addr }
    }
}

impl<T> axum::serve::Listener for ChannelListener<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Io = T;
    type Addr = ChannelAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match self.rx.recv().await {
            Some(io) => (io, self.addr),
            // Every sender is gone; park until the server is shut down.
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(self.addr)
    }
}

/// Client side of an in-process listener.
#[derive(Clone)]
pub struct MemDialer {
    tx: Arc<Mutex<Option<mpsc::Sender<DuplexStream>>>>,
}

/// A connected dialer/listener pair.
pub fn mem_pipe(addr: ChannelAddr) -> (MemDialer, ChannelListener<DuplexStream>) {
    let (tx, rx) = mpsc::channel(16);
    (
        MemDialer {
            tx: Arc::new(Mutex::new(Some(tx))),
        },
        ChannelListener::new(rx, addr),
    )
}

impl MemDialer {
    pub async fn dial(&self) -> io::Result<DuplexStream> {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(closed)?;

        let (client, server) = duplex(PIPE_BUFFER);
        tx.send(server).await.map_err(|_| closed())?;
        Ok(client)
    }

    /// Refuse further dials. Connections already accepted are unaffected.
    pub fn close(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "in-process listener closed")
}
