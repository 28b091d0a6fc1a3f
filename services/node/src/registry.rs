//! Listener registry and flow dispatch.
//!
//! One lock guards the key → listener map, the fallback handler set and the
//! closed flag. Lookups and mutations share it, so a lookup always sees a
//! consistent set of listeners.
//!
//! Match order for an inbound flow to `dst`:
//! 1. `(tcp4|tcp6, dst.ip, dst.port)` for dst's family
//! 2. `(tcp, dst.ip, dst.port)`
//! 3. if dst.ip is one of the node's addresses, 1–2 again with no host
//! 4. fallback handlers (ordinary TCP flows only)

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, info};
use vnet_networking::{Network, NodeAddrs, Protocol};

use crate::conn::FlowHandler;
use crate::error::Error;
use crate::listener::{Listener, ListenerId, ListenerInner};
use crate::subsystems::FlowDecision;

/// One registry entry. Compared by exact structural equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenKey {
    pub network: Network,
    /// `None` binds every address of the node.
    pub host: Option<IpAddr>,
    pub port: u16,
    pub funnel: bool,
}

impl ListenKey {
    pub fn new(network: Network, host: Option<IpAddr>, port: u16, funnel: bool) -> Self {
        Self {
            network,
            host,
            port,
            funnel,
        }
    }
}

/// Which traffic classes a listener receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenOn {
    /// Private overlay traffic only.
    Tailnet,
    /// Public ingress traffic only.
    Funnel,
    /// Both, under two keys mapped to the same listener.
    Both,
}

impl ListenOn {
    pub fn keys(self, network: Network, host: Option<IpAddr>, port: u16) -> Vec<ListenKey> {
        let key = |funnel| ListenKey::new(network, host, port, funnel);
        match self {
            ListenOn::Tailnet => vec![key(false)],
            ListenOn::Funnel => vec![key(true)],
            ListenOn::Both => vec![key(false), key(true)],
        }
    }
}

/// Answer of a fallback handler.
pub enum FallbackDecision {
    /// Not interested in this flow.
    Pass,
    /// Claim the flow. `None` accepts it and drops it.
    Intercept(Option<FlowHandler>),
}

/// Consulted for TCP flows no listener claims.
pub type FallbackTcpHandler = Arc<dyn Fn(SocketAddr, SocketAddr) -> FallbackDecision + Send + Sync>;

/// Outcome of matching a flow.
pub enum Claim {
    Listener { id: ListenerId, handler: FlowHandler },
    Fallback(Option<FlowHandler>),
    Unclaimed,
}

impl Claim {
    pub fn listener_id(&self) -> Option<ListenerId> {
        match self {
            Claim::Listener { id, .. } => Some(*id),
            _ => None,
        }
    }

    pub fn is_claimed(&self) -> bool {
        !matches!(self, Claim::Unclaimed)
    }

    /// The handler that serves the flow, if any.
    pub fn into_handler(self) -> Option<FlowHandler> {
        match self {
            Claim::Listener { handler, .. } => Some(handler),
            Claim::Fallback(handler) => handler,
            Claim::Unclaimed => None,
        }
    }

    /// Unclaimed flows are accepted and dropped, never forwarded.
    pub fn into_decision(self) -> FlowDecision {
        match self.into_handler() {
            Some(handler) => FlowDecision::Deliver(handler),
            None => FlowDecision::Drop,
        }
    }
}

impl fmt::Debug for Claim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Claim::Listener { id, .. } => write!(f, "Listener({id})"),
            Claim::Fallback(h) => write!(f, "Fallback(drop={})", h.is_none()),
            Claim::Unclaimed => f.write_str("Unclaimed"),
        }
    }
}

#[derive(Default)]
struct RegistryState {
    listeners: HashMap<ListenKey, Arc<ListenerInner>>,
    fallbacks: HashMap<u64, FallbackTcpHandler>,
    next_listener: u64,
    next_fallback: u64,
    closed: bool,
}

impl RegistryState {
    fn find(&self, protocol: Protocol, dst: SocketAddr, funnel: bool, own: &NodeAddrs) -> Option<Arc<ListenerInner>> {
        let networks = [
            Network::for_family(protocol, dst.is_ipv6()),
            Network::generic(protocol),
        ];

        for network in networks {
            let key = ListenKey::new(network, Some(dst.ip()), dst.port(), funnel);
            if let Some(ln) = self.listeners.get(&key) {
                return Some(Arc::clone(ln));
            }
        }

        if own.contains(dst.ip()) {
            for network in networks {
                let key = ListenKey::new(network, None, dst.port(), funnel);
                if let Some(ln) = self.listeners.get(&key) {
                    return Some(Arc::clone(ln));
                }
            }
        }

        None
    }

    /// Remove every key still mapped to `inner` and mark it closed.
    fn close_listener(&mut self, inner: &Arc<ListenerInner>) -> Result<(), Error> {
        if !inner.mark_closed() {
            return Err(Error::ListenerClosed);
        }
        for key in &inner.keys {
            if self
                .listeners
                .get(key)
                .is_some_and(|ln| Arc::ptr_eq(ln, inner))
            {
                self.listeners.remove(key);
            }
        }
        Ok(())
    }
}

/// Keyed store of listeners plus the fallback handler set.
#[derive(Default)]
pub struct Registry {
    state: Mutex<RegistryState>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a listener under every key in `keys`, or under none.
    pub fn register(self: &Arc<Self>, keys: Vec<ListenKey>, addr: String) -> Result<Listener, Error> {
        let mut state = self.lock();
        if state.closed {
            return Err(Error::ServerClosed);
        }
        if let Some(key) = keys.iter().find(|k| state.listeners.contains_key(k)) {
            return Err(Error::AddrInUse {
                network: key.network,
                addr,
            });
        }

        state.next_listener += 1;
        let id = ListenerId(state.next_listener);
        let inner = Arc::new(ListenerInner::new(id, keys, addr));
        for key in &inner.keys {
            state.listeners.insert(*key, Arc::clone(&inner));
        }
        debug!(listener = %id, keys = inner.keys.len(), "registered listener");

        Ok(Listener {
            inner,
            registry: Arc::clone(self),
        })
    }

    pub(crate) fn deregister(&self, inner: &Arc<ListenerInner>) -> Result<(), Error> {
        self.lock().close_listener(inner)
    }

    /// Match an inbound TCP flow. Fallback handlers are only consulted for
    /// ordinary (non-funnel) flows.
    pub fn match_tcp(&self, src: SocketAddr, dst: SocketAddr, funnel: bool, own: &NodeAddrs) -> Claim {
        let fallbacks: Vec<FallbackTcpHandler> = {
            let state = self.lock();
            if let Some(ln) = state.find(Protocol::Tcp, dst, funnel, own) {
                return Claim::Listener {
                    id: ln.id,
                    handler: Listener::handler(&ln),
                };
            }
            if funnel {
                return Claim::Unclaimed;
            }
            state.fallbacks.values().cloned().collect()
        };

        // Invoked without the lock so a handler may itself (de)register.
        for fallback in fallbacks {
            if let FallbackDecision::Intercept(handler) = fallback(src, dst) {
                return Claim::Fallback(handler);
            }
        }
        Claim::Unclaimed
    }

    /// Match a TCP flow that arrived over public ingress.
    ///
    /// The destination is the node's own address of the source's family.
    pub fn match_funnel_tcp(&self, src: SocketAddr, dst_port: u16, own: &NodeAddrs) -> Claim {
        match own.same_family_as(src.ip()) {
            Some(ip) => self.match_tcp(src, SocketAddr::new(ip, dst_port), true, own),
            None => Claim::Unclaimed,
        }
    }

    /// Match an inbound UDP flow. No fallback handlers, no funnel.
    pub fn match_udp(&self, dst: SocketAddr, own: &NodeAddrs) -> Claim {
        match self.lock().find(Protocol::Udp, dst, false, own) {
            Some(ln) => Claim::Listener {
                id: ln.id,
                handler: Listener::handler(&ln),
            },
            None => Claim::Unclaimed,
        }
    }

    /// Add a fallback handler for TCP flows no listener claims.
    pub fn register_fallback<F>(self: &Arc<Self>, handler: F) -> FallbackRegistration
    where
        F: Fn(SocketAddr, SocketAddr) -> FallbackDecision + Send + Sync + 'static,
    {
        let mut state = self.lock();
        state.next_fallback += 1;
        let id = state.next_fallback;
        state.fallbacks.insert(id, Arc::new(handler));
        FallbackRegistration {
            id,
            registry: Arc::downgrade(self),
        }
    }

    /// Set the closed flag. Fails if it was already set.
    pub(crate) fn begin_close(&self) -> Result<(), Error> {
        let mut state = self.lock();
        if state.closed {
            return Err(Error::ServerClosed);
        }
        state.closed = true;
        Ok(())
    }

    /// Close every listener exactly once and drop all fallback handlers.
    pub(crate) fn close_all(&self) -> usize {
        let mut state = self.lock();

        let distinct: BTreeMap<ListenerId, Arc<ListenerInner>> = state
            .listeners
            .values()
            .map(|ln| (ln.id, Arc::clone(ln)))
            .collect();

        let mut closed = 0;
        for ln in distinct.values() {
            if state.close_listener(ln).is_ok() {
                closed += 1;
            }
        }
        state.fallbacks.clear();

        info!(listeners = closed, "closed all listeners");
        closed
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of registered keys.
    pub fn key_count(&self) -> usize {
        self.lock().listeners.len()
    }

    pub fn listener_for(&self, key: &ListenKey) -> Option<ListenerId> {
        self.lock().listeners.get(key).map(|ln| ln.id)
    }

    pub fn fallback_count(&self) -> usize {
        self.lock().fallbacks.len()
    }
}

/// Handle returned by [`Registry::register_fallback`].
#[derive(Debug)]
pub struct FallbackRegistration {
    id: u64,
    registry: Weak<Registry>,
}

impl FallbackRegistration {
    /// Remove the handler. Later calls are no-ops.
    pub fn deregister(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().fallbacks.remove(&self.id);
        }
    }
}
