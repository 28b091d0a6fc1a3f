//! Simulated collaborators.
//!
//! A deterministic network monitor, packet engine, user-space stack and
//! backend that run entirely in-process. The stack turns injected flows into
//! in-memory streams; the backend walks Starting → Running (or NeedsLogin)
//! and keeps its serve config in the state store. Every stage can be made to
//! fail, and the set records what was built and what was closed.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::io::{duplex, DuplexStream};
use tokio::sync::broadcast;
use tracing::debug;
use vnet_networking::NodeAddrs;
use vnet_tlsdial::TrustMonitor;

use crate::backend::{
    Backend, BackendEvent, BackendState, CertPair, Prefs, SelfNode, ServeConfig, StartOptions,
    Status, CAP_FUNNEL, CAP_HTTPS,
};
use crate::conn::{Conn, FlowHandler};
use crate::store::StateStore;
use crate::subsystems::{
    BackendParams, EngineConfig, FlowDecision, FlowResolver, FunnelResolver, NetMonitor, NetStack,
    PacketEngine, Subsystems,
};

/// State-store key of the persisted serve config.
pub const SERVE_CONFIG_KEY: &str = "_serve";

/// Engine port used when the configuration leaves it to the engine.
pub const DEFAULT_LISTEN_PORT: u16 = 41641;

const PIPE_BUFFER: usize = 64 * 1024;

/// A startup step that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimStage {
    NetMonitor,
    Engine,
    Stack,
    Backend,
    StackStart,
    BackendStart,
}

impl fmt::Display for SimStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SimStage::NetMonitor => "netmon",
            SimStage::Engine => "engine",
            SimStage::Stack => "netstack",
            SimStage::Backend => "backend",
            SimStage::StackStart => "netstack start",
            SimStage::BackendStart => "backend start",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct SimOptions {
    pub node_addrs: NodeAddrs,
    /// Report NeedsLogin after start unless an auth key is given.
    pub needs_login: bool,
    pub fail_at: Option<SimStage>,
    /// Stage that sleeps before it is built.
    pub slow_at: Option<(SimStage, Duration)>,
    /// Overlay peers; dialing one yields an echo connection.
    pub peers: Vec<IpAddr>,
    pub cert_domains: Vec<String>,
    pub capabilities: Vec<String>,
    pub funnel_ports: Option<Vec<u16>>,
    /// Reported on the event bus instead of reaching Running.
    pub backend_error: Option<String>,
    /// Time between start and Running.
    pub startup_delay: Duration,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            node_addrs: NodeAddrs::new(
                Some(Ipv4Addr::new(100, 64, 0, 1)),
                Some(Ipv6Addr::new(0xfd7a, 0x115c, 0xa1e0, 0, 0, 0, 0, 1)),
            ),
            needs_login: false,
            fail_at: None,
            slow_at: None,
            peers: vec![IpAddr::V4(Ipv4Addr::new(100, 64, 0, 2))],
            cert_domains: vec!["node.example.ts.net".to_string()],
            capabilities: vec![CAP_HTTPS.to_string(), CAP_FUNNEL.to_string()],
            funnel_ports: None,
            backend_error: None,
            startup_delay: Duration::from_millis(10),
        }
    }
}

/// Fate of an injected flow.
#[derive(Debug)]
pub enum Injected {
    /// A handler took the flow; this is the remote end.
    Delivered(DuplexStream),
    Dropped,
    Forwarded,
}

impl Injected {
    pub fn into_stream(self) -> Option<DuplexStream> {
        match self {
            Injected::Delivered(stream) => Some(stream),
            _ => None,
        }
    }
}

fn deliver(handler: FlowHandler) -> DuplexStream {
    let (remote, local) = duplex(PIPE_BUFFER);
    tokio::spawn(handler(Box::new(local)));
    remote
}

fn inject(decision: FlowDecision) -> Injected {
    match decision {
        FlowDecision::Deliver(handler) => Injected::Delivered(deliver(handler)),
        FlowDecision::Drop => Injected::Dropped,
        FlowDecision::Forward => Injected::Forwarded,
    }
}

// ============================================================================
// Subsystem set
// ============================================================================

struct SimShared {
    options: SimOptions,
    builds: AtomicUsize,
    closed: Mutex<Vec<&'static str>>,
    stack: OnceLock<Arc<SimStack>>,
    backend: OnceLock<Arc<SimBackend>>,
}

impl SimShared {
    async fn build(&self, stage: SimStage) -> anyhow::Result<()> {
        if let Some((slow, delay)) = self.options.slow_at {
            if slow == stage {
                tokio::time::sleep(delay).await;
            }
        }
        self.builds.fetch_add(1, Ordering::SeqCst);
        self.check(stage)
    }

    fn check(&self, stage: SimStage) -> anyhow::Result<()> {
        if self.options.fail_at == Some(stage) {
            bail!("simulated {stage} failure");
        }
        Ok(())
    }

    fn record_close(&self, name: &'static str) {
        debug!(subsystem = name, "sim subsystem closed");
        self.closed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(name);
    }
}

/// Simulated subsystem factory. Clones share their state.
#[derive(Clone)]
pub struct SimSubsystems {
    shared: Arc<SimShared>,
}

impl SimSubsystems {
    pub fn new(options: SimOptions) -> Self {
        Self {
            shared: Arc::new(SimShared {
                options,
                builds: AtomicUsize::new(0),
                closed: Mutex::new(Vec::new()),
                stack: OnceLock::new(),
                backend: OnceLock::new(),
            }),
        }
    }

    /// Number of subsystem constructions attempted.
    pub fn build_count(&self) -> usize {
        self.shared.builds.load(Ordering::SeqCst)
    }

    /// Subsystems closed so far, in order.
    pub fn closed(&self) -> Vec<&'static str> {
        self.shared
            .closed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn stack(&self) -> Option<Arc<SimStack>> {
        self.shared.stack.get().cloned()
    }

    pub fn backend(&self) -> Option<Arc<SimBackend>> {
        self.shared.backend.get().cloned()
    }
}

impl Default for SimSubsystems {
    fn default() -> Self {
        Self::new(SimOptions::default())
    }
}

#[async_trait]
impl Subsystems for SimSubsystems {
    async fn net_monitor(&self) -> anyhow::Result<Arc<dyn NetMonitor>> {
        self.shared.build(SimStage::NetMonitor).await?;
        Ok(Arc::new(SimNetMonitor {
            shared: Arc::clone(&self.shared),
        }))
    }

    async fn packet_engine(&self, config: EngineConfig) -> anyhow::Result<Arc<dyn PacketEngine>> {
        self.shared.build(SimStage::Engine).await?;
        let port = match config.listen_port {
            0 => DEFAULT_LISTEN_PORT,
            p => p,
        };
        Ok(Arc::new(SimEngine {
            shared: Arc::clone(&self.shared),
            port,
        }))
    }

    async fn net_stack(
        &self,
        _engine: Arc<dyn PacketEngine>,
        resolver: Arc<dyn FlowResolver>,
    ) -> anyhow::Result<Arc<dyn NetStack>> {
        self.shared.build(SimStage::Stack).await?;
        let stack = Arc::new(SimStack {
            shared: Arc::clone(&self.shared),
            resolver,
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        let _ = self.shared.stack.set(Arc::clone(&stack));
        Ok(stack)
    }

    async fn backend(&self, params: BackendParams) -> anyhow::Result<Arc<dyn Backend>> {
        self.shared.build(SimStage::Backend).await?;
        let (events, _) = broadcast::channel(16);
        let backend = Arc::new_cyclic(|me| SimBackend {
            me: me.clone(),
            shared: Arc::clone(&self.shared),
            store: params.store,
            funnel: params.funnel,
            trust: params.trust,
            events,
            state: Mutex::new(BackendState::NoState),
            prefs: Mutex::new(Prefs::default()),
            auth_url: Mutex::new(None),
            certs: Mutex::new(HashMap::new()),
        });
        let _ = self.shared.backend.set(Arc::clone(&backend));
        Ok(backend)
    }
}

// ============================================================================
// Monitor and engine
// ============================================================================

struct SimNetMonitor {
    shared: Arc<SimShared>,
}

#[async_trait]
impl NetMonitor for SimNetMonitor {
    async fn close(&self) {
        self.shared.record_close("netmon");
    }
}

struct SimEngine {
    shared: Arc<SimShared>,
    port: u16,
}

#[async_trait]
impl PacketEngine for SimEngine {
    fn is_peer(&self, ip: IpAddr) -> bool {
        self.shared.options.peers.contains(&ip)
    }

    fn listen_port(&self) -> u16 {
        self.port
    }

    async fn close(&self) {
        self.shared.record_close("engine");
    }
}

// ============================================================================
// Stack
// ============================================================================

/// Simulated user-space stack.
pub struct SimStack {
    shared: Arc<SimShared>,
    resolver: Arc<dyn FlowResolver>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl SimStack {
    /// Offer a new TCP flow to the node, as if a packet from `src` to `dst`
    /// arrived on the overlay.
    pub fn inject_tcp(&self, src: SocketAddr, dst: SocketAddr) -> Injected {
        inject(self.resolver.resolve_tcp(src, dst))
    }

    pub fn inject_udp(&self, src: SocketAddr, dst: SocketAddr) -> Injected {
        inject(self.resolver.resolve_udp(src, dst))
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NetStack for SimStack {
    async fn start(&self, _backend: Arc<dyn Backend>) -> anyhow::Result<()> {
        self.shared.check(SimStage::StackStart)?;
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn dial_tcp(&self, dst: SocketAddr) -> io::Result<Conn> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "stack closed"));
        }
        if !self.shared.options.peers.contains(&dst.ip()) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("no peer at {dst}"),
            ));
        }
        let (local, remote) = duplex(PIPE_BUFFER);
        tokio::spawn(async move {
            let (mut reader, mut writer) = tokio::io::split(remote);
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
        });
        Ok(Box::new(local))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.shared.record_close("netstack");
    }
}

// ============================================================================
// Backend
// ============================================================================

type CertEntry = (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>);

/// Simulated control-plane backend.
pub struct SimBackend {
    me: Weak<SimBackend>,
    shared: Arc<SimShared>,
    store: Arc<dyn StateStore>,
    funnel: Arc<dyn FunnelResolver>,
    trust: Arc<TrustMonitor>,
    events: broadcast::Sender<BackendEvent>,
    state: Mutex<BackendState>,
    prefs: Mutex<Prefs>,
    auth_url: Mutex<Option<String>>,
    certs: Mutex<HashMap<String, CertEntry>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimBackend {
    fn set_state(&self, state: BackendState) {
        *lock(&self.state) = state;
        let _ = self.events.send(BackendEvent {
            state: Some(state),
            ..Default::default()
        });
    }

    /// Finish an interactive login.
    pub fn complete_login(&self) {
        lock(&self.auth_url).take();
        self.set_state(BackendState::Running);
    }

    /// Report an error on the event bus.
    pub fn report_error(&self, message: impl Into<String>) {
        let _ = self.events.send(BackendEvent {
            err_message: Some(message.into()),
            ..Default::default()
        });
    }

    /// Offer a TCP flow arriving over public ingress from `src`.
    pub fn inject_funnel(&self, src: SocketAddr, dst_port: u16) -> Injected {
        match self.funnel.resolve_funnel_tcp(src, dst_port) {
            Some(handler) => Injected::Delivered(deliver(handler)),
            None => Injected::Dropped,
        }
    }

    pub fn prefs(&self) -> Prefs {
        lock(&self.prefs).clone()
    }

    /// Monitor the backend would verify control connections against.
    pub fn trust_monitor(&self) -> Arc<TrustMonitor> {
        Arc::clone(&self.trust)
    }

    fn self_node(&self) -> SelfNode {
        let hostname = lock(&self.prefs).hostname.clone();
        let options = &self.shared.options;
        SelfNode {
            dns_name: options
                .cert_domains
                .first()
                .cloned()
                .unwrap_or_else(|| format!("{hostname}.sim")),
            hostname,
            capabilities: options.capabilities.clone(),
            funnel_ports: options.funnel_ports.clone(),
        }
    }

    fn issue(&self, server_name: &str) -> anyhow::Result<CertEntry> {
        let key = rcgen::KeyPair::generate()?;
        let params = rcgen::CertificateParams::new(vec![server_name.to_string()])?;
        let cert = params.self_signed(&key)?;
        Ok((
            vec![cert.der().clone()],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
        ))
    }
}

#[async_trait]
impl Backend for SimBackend {
    async fn start(&self, options: StartOptions) -> anyhow::Result<()> {
        self.shared.check(SimStage::BackendStart)?;
        *lock(&self.prefs) = options.prefs;

        let sim = &self.shared.options;
        if sim.needs_login && options.auth_key.is_none() {
            self.set_state(BackendState::NeedsLogin);
            return Ok(());
        }

        self.set_state(BackendState::Starting);
        let me = self.me.clone();
        let delay = sim.startup_delay;
        let error = sim.backend_error.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(backend) = me.upgrade() else {
                return;
            };
            if *lock(&backend.state) != BackendState::Starting {
                return;
            }
            match error {
                Some(message) => backend.report_error(message),
                None => backend.set_state(BackendState::Running),
            }
        });
        Ok(())
    }

    fn state(&self) -> BackendState {
        *lock(&self.state)
    }

    fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.events.subscribe()
    }

    fn status(&self) -> Status {
        let state = self.state();
        Status {
            backend_state: state,
            addrs: self.node_addrs().to_vec(),
            self_node: self.self_node(),
            cert_domains: self.shared.options.cert_domains.clone(),
            auth_url: lock(&self.auth_url).clone(),
        }
    }

    fn node_addrs(&self) -> NodeAddrs {
        match self.state() {
            BackendState::Running => self.shared.options.node_addrs,
            _ => NodeAddrs::default(),
        }
    }

    async fn start_login_interactive(&self) -> anyhow::Result<()> {
        let url = format!(
            "https://login.example.com/a/{}",
            hex::encode(rand::random::<[u8; 6]>())
        );
        *lock(&self.auth_url) = Some(url.clone());
        let _ = self.events.send(BackendEvent {
            browse_to_url: Some(url),
            ..Default::default()
        });
        Ok(())
    }

    async fn serve_config(&self) -> anyhow::Result<ServeConfig> {
        match self.store.read(SERVE_CONFIG_KEY)? {
            Some(bytes) => serde_json::from_slice(&bytes).context("corrupt serve config"),
            None => Ok(ServeConfig::default()),
        }
    }

    async fn set_serve_config(&self, config: ServeConfig) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec(&config)?;
        self.store.write(SERVE_CONFIG_KEY, &bytes)
    }

    async fn get_certificate(&self, server_name: &str) -> anyhow::Result<CertPair> {
        if !self
            .shared
            .options
            .cert_domains
            .iter()
            .any(|d| d == server_name)
        {
            bail!("no certificate for {server_name:?}");
        }

        let mut certs = lock(&self.certs);
        if !certs.contains_key(server_name) {
            let entry = self.issue(server_name)?;
            certs.insert(server_name.to_string(), entry);
        }
        let (chain, key) = &certs[server_name];
        Ok(CertPair {
            chain: chain.clone(),
            key: key.clone_key(),
        })
    }

    async fn shutdown(&self) {
        *lock(&self.state) = BackendState::Stopped;
        self.shared.record_close("backend");
    }
}

#[cfg(test)]
struct NoFunnel;

#[cfg(test)]
impl FunnelResolver for NoFunnel {
    fn resolve_funnel_tcp(&self, _src: SocketAddr, _dst_port: u16) -> Option<FlowHandler> {
        None
    }
}

/// A backend built outside any server.
#[cfg(test)]
pub(crate) async fn test_backend(options: SimOptions) -> (SimSubsystems, Arc<SimBackend>) {
    let sim = SimSubsystems::new(options);
    let monitor = sim.net_monitor().await.unwrap();
    let engine = sim
        .packet_engine(EngineConfig {
            listen_port: 0,
            net_monitor: monitor,
        })
        .await
        .unwrap();
    assert_eq!(engine.listen_port(), DEFAULT_LISTEN_PORT);
    Subsystems::backend(
        &sim,
        BackendParams {
            state_dir: std::env::temp_dir(),
            store: Arc::new(crate::store::MemStore::new()),
            engine,
            ephemeral: true,
            log_id: None,
            funnel: Arc::new(NoFunnel),
            trust: Arc::new(TrustMonitor::new()),
        },
    )
    .await
    .unwrap();
    let backend = sim.backend().unwrap();
    (sim, backend)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start_options(auth_key: Option<&str>) -> StartOptions {
        StartOptions {
            prefs: Prefs {
                hostname: "sim".into(),
                want_running: true,
                ..Default::default()
            },
            auth_key: auth_key.map(str::to_string),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_reaches_running() {
        let (sim, backend) = test_backend(SimOptions::default()).await;
        let mut events = backend.subscribe();
        backend.start(start_options(None)).await.unwrap();
        assert_eq!(backend.state(), BackendState::Starting);
        assert!(backend.node_addrs().is_empty());

        loop {
            let event = events.recv().await.unwrap();
            if event.state == Some(BackendState::Running) {
                break;
            }
        }
        assert!(!backend.node_addrs().is_empty());
        assert_eq!(sim.build_count(), 3);
    }

    #[tokio::test]
    async fn test_needs_login_unless_auth_key() {
        let options = SimOptions {
            needs_login: true,
            ..Default::default()
        };
        let (_, backend) = test_backend(options.clone()).await;
        backend.start(start_options(None)).await.unwrap();
        assert_eq!(backend.state(), BackendState::NeedsLogin);
        backend.start_login_interactive().await.unwrap();
        assert!(backend.status().auth_url.is_some());
        backend.complete_login();
        assert_eq!(backend.state(), BackendState::Running);
        assert!(backend.status().auth_url.is_none());

        let (_, backend) = test_backend(options).await;
        backend.start(start_options(Some("key"))).await.unwrap();
        assert_eq!(backend.state(), BackendState::Starting);
    }

    #[tokio::test]
    async fn test_serve_config_persisted() {
        let (_, backend) = test_backend(SimOptions::default()).await;
        assert!(backend.serve_config().await.unwrap().is_empty());

        let mut config = ServeConfig::default();
        config
            .allow_funnel
            .insert("node.example.ts.net:443".into(), true);
        backend.set_serve_config(config.clone()).await.unwrap();
        assert_eq!(backend.serve_config().await.unwrap(), config);
    }

    #[tokio::test]
    async fn test_certificates_only_for_cert_domains() {
        let (_, backend) = test_backend(SimOptions::default()).await;
        let pair = backend.get_certificate("node.example.ts.net").await.unwrap();
        assert_eq!(pair.chain.len(), 1);
        let again = backend.get_certificate("node.example.ts.net").await.unwrap();
        assert_eq!(pair.chain, again.chain);
        assert!(backend.get_certificate("other.example.com").await.is_err());
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let sim = SimSubsystems::new(SimOptions {
            fail_at: Some(SimStage::NetMonitor),
            ..Default::default()
        });
        let err = sim.net_monitor().await.err().unwrap();
        assert_eq!(err.to_string(), "simulated netmon failure");
        assert_eq!(sim.build_count(), 1);
    }
}
