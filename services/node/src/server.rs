//! The embeddable node.
//!
//! A [`Server`] owns every subsystem it builds: network monitor, packet
//! engine, user-space stack, dialer, state store, backend, local API and the
//! optional loopback surface. Startup runs once; its outcome (success or the
//! first error) is memoized and shared by every caller. Close tears the
//! subsystems down once.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, watch, OnceCell};
use tokio::task::AbortHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};
use vnet_networking::{lookup_port, parse_listen_addr, split_host_port, Network, NodeAddrs};
use vnet_tlsdial::{Roots, TrustMonitor};

use crate::backend::{Backend, BackendState, Prefs, StartOptions, Status};
use crate::config::{ensure_state_dir, force_login, ServerConfig, STATE_FILE};
use crate::conn::{Conn, FlowHandler};
use crate::dialer::Dialer;
use crate::error::Error;
use crate::funnel::{check_funnel_access, FunnelMode};
use crate::listener::Listener;
use crate::localapi::memnet::{mem_pipe, ChannelAddr, MemDialer};
use crate::localapi::{router, LocalClient, LOCAL_API_HOST};
use crate::logpipe::LogPipeline;
use crate::loopback::{Loopback, LoopbackInfo};
use crate::registry::{FallbackDecision, FallbackRegistration, ListenOn, Registry};
use crate::rollback::Rollback;
use crate::store::{FileStore, StateStore};
use crate::subsystems::{
    BackendParams, EngineConfig, FlowDecision, FlowResolver, FunnelResolver, NetMonitor, NetStack,
    PacketEngine, Subsystems,
};
use crate::tls::TlsListener;

/// Grace window for the log flush and the local API drain during close.
pub const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Interval of the login URL announcement loop.
pub const AUTH_URL_INTERVAL: Duration = Duration::from_secs(5);

// ============================================================================
// Flow dispatch
// ============================================================================

/// Resolver the stack and backend call into. Holds the registry and, once
/// the backend exists, the source of the node's own addresses.
struct Dispatch {
    registry: Arc<Registry>,
    backend: OnceLock<Arc<dyn Backend>>,
}

impl Dispatch {
    fn own_addrs(&self) -> NodeAddrs {
        self.backend
            .get()
            .map(|b| b.node_addrs())
            .unwrap_or_default()
    }
}

impl FlowResolver for Dispatch {
    fn resolve_tcp(&self, src: SocketAddr, dst: SocketAddr) -> FlowDecision {
        let claim = self.registry.match_tcp(src, dst, false, &self.own_addrs());
        trace!(%src, %dst, ?claim, "tcp flow");
        claim.into_decision()
    }

    fn resolve_udp(&self, src: SocketAddr, dst: SocketAddr) -> FlowDecision {
        let claim = self.registry.match_udp(dst, &self.own_addrs());
        trace!(%src, %dst, ?claim, "udp flow");
        claim.into_decision()
    }
}

impl FunnelResolver for Dispatch {
    fn resolve_funnel_tcp(&self, src: SocketAddr, dst_port: u16) -> Option<FlowHandler> {
        let claim = self
            .registry
            .match_funnel_tcp(src, dst_port, &self.own_addrs());
        trace!(%src, dst_port, ?claim, "funnel flow");
        claim.into_handler()
    }
}

// ============================================================================
// Running state
// ============================================================================

/// Everything a successful startup acquired.
struct Running {
    dir: PathBuf,
    log: Option<Arc<LogPipeline>>,
    net_mon: Arc<dyn NetMonitor>,
    engine: Arc<dyn PacketEngine>,
    stack: Arc<dyn NetStack>,
    dialer: Arc<Dialer>,
    backend: Arc<dyn Backend>,
    local_api: MemDialer,
    local_client: LocalClient,
    api_stop: watch::Sender<bool>,
    api_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    /// Process-wide shutdown signal; set once by close.
    shutdown: watch::Sender<bool>,
}

impl Running {
    fn record(&self, message: &str) {
        if let Some(log) = &self.log {
            log.record(message);
        }
    }

    async fn teardown(&self) {
        self.record("server closing");

        let log_drain = async {
            if let Some(log) = &self.log {
                log.shutdown().await;
            }
        };

        let api_task = self
            .api_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let api_abort: Option<AbortHandle> = api_task.as_ref().map(|t| t.abort_handle());
        let api_drain = async {
            if self.api_stop.send(true).is_err() {
                debug!("local api already stopped");
            }
            if let Some(task) = api_task {
                let _ = task.await;
            }
        };

        if timeout(CLOSE_GRACE, async { tokio::join!(log_drain, api_drain) })
            .await
            .is_err()
        {
            warn!(grace = ?CLOSE_GRACE, "log flush or local api drain did not finish in time");
            if let Some(abort) = api_abort {
                abort.abort();
            }
        }

        self.stack.close().await;
        if self.shutdown.send(true).is_err() {
            debug!("no shutdown receivers left");
        }
        self.backend.shutdown().await;
        self.engine.close().await;
        self.net_mon.close().await;
        self.dialer.close();
        self.local_api.close();
    }
}

// ============================================================================
// Server
// ============================================================================

/// An embeddable node on the virtual network.
///
/// Every operation that needs the network starts the server on first use.
pub struct Server {
    config: ServerConfig,
    subsystems: Arc<dyn Subsystems>,
    registry: Arc<Registry>,
    dispatch: Arc<Dispatch>,
    init: OnceCell<Result<Arc<Running>, Arc<Error>>>,
    loopback: tokio::sync::Mutex<Option<Loopback>>,
    roots: OnceLock<Roots>,
    trust: Arc<TrustMonitor>,
}

impl Server {
    pub fn new(config: ServerConfig, subsystems: impl Subsystems) -> Self {
        let registry = Registry::new();
        Self {
            config,
            subsystems: Arc::new(subsystems),
            dispatch: Arc::new(Dispatch {
                registry: Arc::clone(&registry),
                backend: OnceLock::new(),
            }),
            registry,
            init: OnceCell::new(),
            loopback: tokio::sync::Mutex::new(None),
            roots: OnceLock::new(),
            trust: Arc::new(TrustMonitor::new()),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Start the node if it is not started yet.
    ///
    /// Concurrent callers wait for the first one; all of them, and every
    /// later caller, see the same outcome.
    pub async fn start(&self) -> Result<(), Error> {
        self.running().await.map(|_| ())
    }

    async fn running(&self) -> Result<Arc<Running>, Error> {
        let outcome = self
            .init
            .get_or_init(|| async { self.init().await.map(Arc::new).map_err(Arc::new) })
            .await;
        match outcome {
            Ok(running) => Ok(Arc::clone(running)),
            Err(e) => Err(Error::Init(Arc::clone(e))),
        }
    }

    async fn init(&self) -> Result<Running, Error> {
        if self.registry.is_closed() {
            return Err(Error::ServerClosed);
        }
        self.config.validate()?;
        let dir = self.config.resolved_dir()?;
        ensure_state_dir(&dir)?;

        let mut rollback = Rollback::new();
        match self.acquire(&dir, &mut rollback).await {
            Ok(running) => {
                rollback.disarm();
                // Close ran while we were starting and is waiting on us.
                if self.registry.is_closed() {
                    info!("server closed during startup");
                    running.teardown().await;
                    return Err(Error::ServerClosed);
                }
                info!(dir = %running.dir.display(), "server started");
                running.record("server started");
                Ok(running)
            }
            Err(e) => {
                warn!(error = %e, "startup failed; releasing acquired subsystems");
                rollback.unwind().await;
                Err(e)
            }
        }
    }

    async fn acquire(&self, dir: &Path, rollback: &mut Rollback) -> Result<Running, Error> {
        let log = if self.config.log_pipeline {
            let pipeline = Arc::new(LogPipeline::open(dir).map_err(Error::subsystem("log pipeline"))?);
            let p = Arc::clone(&pipeline);
            rollback.push("log pipeline", move || async move { p.shutdown().await });
            Some(pipeline)
        } else {
            None
        };

        let net_mon = self
            .subsystems
            .net_monitor()
            .await
            .map_err(Error::subsystem("netmon"))?;
        let m = Arc::clone(&net_mon);
        rollback.push("netmon", move || async move { m.close().await });

        let engine = self
            .subsystems
            .packet_engine(EngineConfig {
                listen_port: self.config.port,
                net_monitor: Arc::clone(&net_mon),
            })
            .await
            .map_err(Error::subsystem("engine"))?;
        let e = Arc::clone(&engine);
        rollback.push("engine", move || async move { e.close().await });
        debug!(listen_port = engine.listen_port(), "packet engine created");

        let resolver: Arc<dyn FlowResolver> = self.dispatch.clone();
        let stack = self
            .subsystems
            .net_stack(Arc::clone(&engine), resolver)
            .await
            .map_err(Error::subsystem("netstack"))?;
        let s = Arc::clone(&stack);
        rollback.push("netstack", move || async move { s.close().await });

        let dialer = Arc::new(Dialer::new(Arc::clone(&engine), Arc::clone(&stack)));
        let d = Arc::clone(&dialer);
        rollback.push("dialer", move || async move { d.close() });

        let store: Arc<dyn StateStore> = match &self.config.store {
            Some(store) => Arc::clone(store),
            None => Arc::new(
                FileStore::open(dir.join(STATE_FILE)).map_err(Error::subsystem("state store"))?,
            ),
        };

        let funnel: Arc<dyn FunnelResolver> = self.dispatch.clone();
        let backend = self
            .subsystems
            .backend(BackendParams {
                state_dir: dir.to_path_buf(),
                store,
                engine: Arc::clone(&engine),
                ephemeral: self.config.ephemeral,
                log_id: log.as_ref().map(|l| l.public_id().to_string()),
                funnel,
                trust: Arc::clone(&self.trust),
            })
            .await
            .map_err(Error::subsystem("backend"))?;
        let b = Arc::clone(&backend);
        rollback.push("backend", move || async move { b.shutdown().await });
        if self.dispatch.backend.set(Arc::clone(&backend)).is_err() {
            debug!("flow dispatch already bound to a backend");
        }

        stack
            .start(Arc::clone(&backend))
            .await
            .map_err(Error::subsystem("netstack start"))?;

        let prefs = Prefs {
            hostname: self.config.resolved_hostname(),
            want_running: true,
            control_url: self.config.control_url.clone(),
            run_web_client: self.config.run_web_client,
        };
        let auth_key = self.config.resolved_auth_key();
        let has_auth_key = auth_key.is_some();
        info!(hostname = %prefs.hostname, "starting backend");
        backend
            .start(StartOptions { prefs, auth_key })
            .await
            .map_err(Error::subsystem("backend start"))?;

        let state = backend.state();
        if state == BackendState::NeedsLogin || force_login() {
            info!(%state, "starting interactive login");
            backend
                .start_login_interactive()
                .await
                .map_err(Error::subsystem("login"))?;
        } else if has_auth_key {
            info!(%state, "auth key is set but the node is already logged in; ignoring it");
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let tx = shutdown.clone();
        rollback.push("shutdown signal", move || async move {
            if tx.send(true).is_err() {
                debug!("no shutdown receivers left");
            }
        });
        tokio::spawn(auth_url_loop(Arc::clone(&backend), shutdown_rx));

        let (local_api, api_listener) = mem_pipe(ChannelAddr(LOCAL_API_HOST));
        let (api_stop, mut api_stop_rx) = watch::channel(false);
        let app = router(Arc::clone(&backend));
        let api_task = tokio::spawn(async move {
            let result = axum::serve(api_listener, app)
                .with_graceful_shutdown(async move {
                    let _ = api_stop_rx.wait_for(|stop| *stop).await;
                })
                .await;
            if let Err(e) = result {
                warn!(error = %e, "local api server failed");
            }
        });
        let local_client = LocalClient::new(local_api.clone());

        Ok(Running {
            dir: dir.to_path_buf(),
            log,
            net_mon,
            engine,
            stack,
            dialer,
            backend,
            local_api,
            local_client,
            api_stop,
            api_task: Mutex::new(Some(api_task)),
            shutdown,
        })
    }

    /// Start the node and wait until it is running with an address.
    ///
    /// Clears any persisted serve config on success. Bound it with
    /// `tokio::time::timeout` to give up early.
    pub async fn up(&self) -> Result<Status, Error> {
        let running = self.running().await?;
        let mut events = running.backend.subscribe();
        let mut shutdown = running.shutdown.subscribe();

        // The state is read after subscribing, so no transition is missed.
        while !(running.backend.state() == BackendState::Running
            && !running.backend.node_addrs().is_empty())
        {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => {
                        if let Some(msg) = event.err_message {
                            return Err(Error::Backend(msg));
                        }
                        if let Some(url) = event.browse_to_url {
                            info!(%url, "login required; visit the URL to authorize this node");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "backend events lagged; re-reading state");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Err(Error::ServerClosed),
                },
                _ = shutdown.wait_for(|stop| *stop) => return Err(Error::ServerClosed),
            }
        }

        let status = running.local_client.status().await?;
        if status.addrs.is_empty() {
            return Err(Error::NoAddress);
        }

        // Serve config from an earlier run does not describe this one.
        running
            .local_client
            .set_serve_config(&Default::default())
            .await?;
        Ok(status)
    }

    /// Shut the node down. The second call returns [`Error::ServerClosed`].
    pub async fn close(&self) -> Result<(), Error> {
        self.registry.begin_close()?;
        info!("closing server");

        // Waits behind a start in flight; otherwise later starts see the close.
        let outcome = self
            .init
            .get_or_init(|| async { Err(Arc::new(Error::ServerClosed)) })
            .await;
        if let Ok(running) = outcome {
            running.teardown().await;
        }
        if let Some(loopback) = self.loopback.lock().await.take() {
            loopback.close();
        }
        self.registry.close_all();
        Ok(())
    }

    /// Dial `address` over `network`, starting the node if needed.
    pub async fn dial(&self, network: &str, address: &str) -> Result<Conn, Error> {
        let running = self.running().await?;
        running.dialer.dial(network, address).await
    }

    /// Listen on the node's overlay interface.
    ///
    /// `network` is one of `""`, `tcp`, `tcp4`, `tcp6`, `udp`, `udp4`, `udp6`;
    /// `addr` is `host:port` with an empty host or an IP literal.
    pub async fn listen(&self, network: &str, addr: &str) -> Result<Listener, Error> {
        self.listen_on(network, addr, ListenOn::Tailnet).await
    }

    async fn listen_on(&self, network: &str, addr: &str, on: ListenOn) -> Result<Listener, Error> {
        let net: Network = network.parse()?;
        let (host, port) = parse_listen_addr(net, addr)?;
        self.start().await?;

        let ln = self.registry.register(on.keys(net, host, port), addr.to_string())?;
        info!(listener = %ln.id(), %net, addr, ?on, "listening");
        Ok(ln)
    }

    /// Listen for TLS on the overlay interface with certificates issued to
    /// this node.
    pub async fn listen_tls(&self, network: &str, addr: &str) -> Result<TlsListener, Error> {
        if network != "tcp" {
            return Err(Error::TcpOnly {
                op: "listen_tls",
                network: network.to_string(),
            });
        }
        let status = self.up().await?;
        if status.cert_domains.is_empty() {
            return Err(Error::HttpsDisabled);
        }
        let running = self.running().await?;
        let ln = self.listen(network, addr).await?;
        Ok(TlsListener::new(ln, Arc::clone(&running.backend)))
    }

    /// Listen for public ingress traffic on `addr` (`:443`, `:8443` or
    /// `:10000` unless the control plane allows others).
    pub async fn listen_funnel(
        &self,
        network: &str,
        addr: &str,
        mode: FunnelMode,
    ) -> Result<TlsListener, Error> {
        if network != "tcp" {
            return Err(Error::TcpOnly {
                op: "listen_funnel",
                network: network.to_string(),
            });
        }
        let (host, port) = split_host_port(addr)?;
        if !host.is_empty() {
            return Err(Error::FunnelHost(addr.to_string()));
        }
        let port = lookup_port(Network::Tcp, port)?;

        let status = self.up().await?;
        check_funnel_access(port, &status.self_node)?;
        let domain = status.cert_domains.first().ok_or(Error::HttpsDisabled)?;

        let running = self.running().await?;
        let client = &running.local_client;
        let mut serve = client.serve_config().await?;
        let host_port = format!("{domain}:{port}");
        if !serve.funnel_allowed(&host_port) {
            serve.allow_funnel.insert(host_port.clone(), true);
            client.set_serve_config(&serve).await?;
            info!(%host_port, "funnel allowed");
        }

        let ln = self.listen_on(network, addr, mode.listen_on()).await?;
        Ok(TlsListener::new(ln, Arc::clone(&running.backend)))
    }

    /// Add a handler consulted for TCP flows no listener claims. Handlers run
    /// in no particular order; the first to intercept wins.
    pub fn register_fallback_tcp_handler<F>(&self, handler: F) -> FallbackRegistration
    where
        F: Fn(SocketAddr, SocketAddr) -> FallbackDecision + Send + Sync + 'static,
    {
        self.registry.register_fallback(handler)
    }

    /// The node's own addresses; empty until the backend knows them.
    pub fn node_addrs(&self) -> NodeAddrs {
        self.dispatch.own_addrs()
    }

    /// Domains this node can get certificates for.
    pub fn cert_domains(&self) -> Vec<String> {
        self.dispatch
            .backend
            .get()
            .map(|b| b.status().cert_domains)
            .unwrap_or_default()
    }

    /// A client for the local API over the in-process transport.
    pub async fn local_client(&self) -> Result<LocalClient, Error> {
        Ok(self.running().await?.local_client.clone())
    }

    /// Address and credentials of the loopback surface, creating it on first
    /// use.
    pub async fn loopback(&self) -> Result<LoopbackInfo, Error> {
        let running = self.running().await?;
        let mut slot = self.loopback.lock().await;
        if self.registry.is_closed() {
            return Err(Error::ServerClosed);
        }
        if let Some(loopback) = slot.as_ref() {
            return Ok(loopback.info());
        }

        let loopback =
            Loopback::spawn(Arc::clone(&running.backend), Arc::clone(&running.dialer)).await?;
        let info = loopback.info();
        running.record(&format!("loopback surface on {}", info.addr));
        *slot = Some(loopback);
        Ok(info)
    }

    /// Client TLS config for `host` that trusts the system roots and falls
    /// back to the baked-in roots.
    pub fn tls_client_config(&self, host: &str) -> Result<rustls::ClientConfig, Error> {
        let roots = self.roots.get_or_init(Roots::load);
        Ok(vnet_tlsdial::config(host, roots, Arc::clone(&self.trust), None)?)
    }

    /// TLS verification outcomes of this server's client configs and backend.
    pub fn trust_monitor(&self) -> &Arc<TrustMonitor> {
        &self.trust
    }

    /// The listener registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }
}

/// Announce the login URL while the node waits for login.
async fn auth_url_loop(backend: Arc<dyn Backend>, mut shutdown: watch::Receiver<bool>) {
    let mut last_url: Option<String> = None;
    loop {
        if *shutdown.borrow() {
            return;
        }
        let state = backend.state();
        if !matches!(state, BackendState::NeedsLogin | BackendState::NoState) {
            debug!(%state, "login announcement done");
            return;
        }
        if let Some(url) = backend.status().auth_url {
            if last_url.as_deref() != Some(url.as_str()) {
                info!(%url, "to start this node, set an auth key or visit the URL");
                last_url = Some(url);
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(AUTH_URL_INTERVAL) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}
