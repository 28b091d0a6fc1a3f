//! Listeners: the hand-off point between the flow dispatch path and an
//! application's accept loop.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{oneshot, Notify};
use tokio::time::{timeout_at, Instant};
use tracing::debug;
use vnet_networking::Network;

use crate::conn::{flow_handler, Conn, FlowHandler};
use crate::error::Error;
use crate::registry::{ListenKey, Registry};

/// How long a delivered connection waits for an accept before it is dropped.
pub const HANDOFF_TIMEOUT: Duration = Duration::from_secs(1);

/// Identity of a listener within its registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub(crate) u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ln-{}", self.0)
    }
}

/// Shared state of one listener, referenced from every key it is indexed by.
pub(crate) struct ListenerInner {
    pub(crate) id: ListenerId,
    pub(crate) keys: Vec<ListenKey>,
    addr: String,
    /// Set under the registry lock.
    closed: AtomicBool,
    waiters: Mutex<VecDeque<oneshot::Sender<Conn>>>,
    waiter_ready: Notify,
}

impl ListenerInner {
    pub(crate) fn new(id: ListenerId, keys: Vec<ListenKey>, addr: String) -> Self {
        Self {
            id,
            keys,
            addr,
            closed: AtomicBool::new(false),
            waiters: Mutex::new(VecDeque::new()),
            waiter_ready: Notify::new(),
        }
    }

    fn waiters(&self) -> MutexGuard<'_, VecDeque<oneshot::Sender<Conn>>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Mark closed. Returns false if it already was. Caller holds the
    /// registry lock.
    pub(crate) fn mark_closed(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        // Dropping the senders fails every pending accept.
        self.waiters().clear();
        self.waiter_ready.notify_waiters();
        true
    }

    async fn accept(&self) -> Result<Conn, Error> {
        let rx = {
            let mut waiters = self.waiters();
            if self.is_closed() {
                return Err(Error::ListenerClosed);
            }
            let (tx, rx) = oneshot::channel();
            waiters.push_back(tx);
            rx
        };
        self.waiter_ready.notify_waiters();
        rx.await.map_err(|_| Error::ListenerClosed)
    }

    /// Hand `conn` to a waiting accept, or drop it after [`HANDOFF_TIMEOUT`].
    pub(crate) async fn deliver(&self, conn: Conn) {
        let deadline = Instant::now() + HANDOFF_TIMEOUT;
        let mut conn = conn;

        loop {
            let notified = self.waiter_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let waiter = self.waiters().pop_front();
            match waiter {
                Some(tx) => match tx.send(conn) {
                    Ok(()) => return,
                    // That accept was cancelled; try the next one.
                    Err(returned) => conn = returned,
                },
                None => {
                    if self.is_closed() {
                        debug!(listener = %self.id, "listener closed; dropping connection");
                        return;
                    }
                    if timeout_at(deadline, notified).await.is_err() {
                        debug!(listener = %self.id, addr = %self.addr, "no accept within hand-off timeout; dropping connection");
                        return;
                    }
                }
            }
        }
    }
}

/// Address a listener was opened with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerAddr {
    pub network: Network,
    pub addr: String,
}

impl fmt::Display for ListenerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.addr)
    }
}

/// A registered endpoint on the node's overlay interface.
///
/// Connections are handed over one at a time; there is no backlog. Clones
/// refer to the same listener.
#[derive(Clone)]
pub struct Listener {
    pub(crate) inner: Arc<ListenerInner>,
    pub(crate) registry: Arc<Registry>,
}

impl Listener {
    /// Wait for the next connection.
    ///
    /// Fails immediately once the listener is closed, and wakes pending calls
    /// with the same error when it is.
    pub async fn accept(&self) -> Result<Conn, Error> {
        self.inner.accept().await
    }

    /// Remove the listener from the registry. The second call returns
    /// [`Error::ListenerClosed`].
    pub fn close(&self) -> Result<(), Error> {
        self.registry.deregister(&self.inner)
    }

    pub fn addr(&self) -> ListenerAddr {
        ListenerAddr {
            network: self.inner.keys[0].network,
            addr: self.inner.addr.clone(),
        }
    }

    pub fn id(&self) -> ListenerId {
        self.inner.id
    }

    pub fn keys(&self) -> &[ListenKey] {
        &self.inner.keys
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Handler that delivers flows to this listener.
    pub(crate) fn handler(inner: &Arc<ListenerInner>) -> FlowHandler {
        let inner = Arc::clone(inner);
        flow_handler(move |conn| {
            let inner = Arc::clone(&inner);
            async move { inner.deliver(conn).await }
        })
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.inner.id)
            .field("addr", &self.inner.addr)
            .field("closed", &self.inner.is_closed())
            .finish()
    }
}
