//! The control-plane backend contract and the values that cross it.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use async_trait::async_trait;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use vnet_networking::NodeAddrs;

/// Connection state reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendState {
    NoState,
    NeedsLogin,
    NeedsMachineAuth,
    Stopped,
    Starting,
    Running,
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackendState::NoState => "NoState",
            BackendState::NeedsLogin => "NeedsLogin",
            BackendState::NeedsMachineAuth => "NeedsMachineAuth",
            BackendState::Stopped => "Stopped",
            BackendState::Starting => "Starting",
            BackendState::Running => "Running",
        };
        f.write_str(s)
    }
}

/// One notification on the backend's event bus.
#[derive(Debug, Clone, Default)]
pub struct BackendEvent {
    pub state: Option<BackendState>,
    pub err_message: Option<String>,
    pub browse_to_url: Option<String>,
}

/// Capabilities the control plane granted this node.
pub const CAP_HTTPS: &str = "https";
pub const CAP_FUNNEL: &str = "funnel";

/// This node as the control plane sees it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelfNode {
    pub hostname: String,
    pub dns_name: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Ports funnel may use; `None` means the default set.
    #[serde(default)]
    pub funnel_ports: Option<Vec<u16>>,
}

impl SelfNode {
    pub fn has_capability(&self, cap: &str) -> bool {
        self.capabilities.iter().any(|c| c == cap)
    }
}

/// Node status as served by the local API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub backend_state: BackendState,
    #[serde(default)]
    pub addrs: Vec<IpAddr>,
    pub self_node: SelfNode,
    #[serde(default)]
    pub cert_domains: Vec<String>,
    #[serde(default)]
    pub auth_url: Option<String>,
}

/// Persisted ingress configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServeConfig {
    /// `"<domain>:<port>"` entries allowed to receive funnel traffic.
    #[serde(default)]
    pub allow_funnel: BTreeMap<String, bool>,
}

impl ServeConfig {
    pub fn is_empty(&self) -> bool {
        self.allow_funnel.is_empty()
    }

    pub fn funnel_allowed(&self, host_port: &str) -> bool {
        self.allow_funnel.get(host_port).copied().unwrap_or(false)
    }
}

/// Preferences applied before the backend starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Prefs {
    pub hostname: String,
    pub want_running: bool,
    pub control_url: Option<String>,
    pub run_web_client: bool,
}

pub struct StartOptions {
    pub prefs: Prefs,
    pub auth_key: Option<String>,
}

impl fmt::Debug for StartOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartOptions")
            .field("prefs", &self.prefs)
            .field("auth_key", &self.auth_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// A certificate chain and its private key.
#[derive(Debug)]
pub struct CertPair {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

/// Node-state backend driven by the control plane.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Apply preferences and start connecting.
    async fn start(&self, options: StartOptions) -> anyhow::Result<()>;

    fn state(&self) -> BackendState;

    /// Subscribe to state changes. Events sent before the call are not seen.
    fn subscribe(&self) -> broadcast::Receiver<BackendEvent>;

    fn status(&self) -> Status;

    /// The node's own addresses from the current network map.
    fn node_addrs(&self) -> NodeAddrs;

    async fn start_login_interactive(&self) -> anyhow::Result<()>;

    async fn serve_config(&self) -> anyhow::Result<ServeConfig>;

    async fn set_serve_config(&self, config: ServeConfig) -> anyhow::Result<()>;

    /// Certificate for a TLS ClientHello naming `server_name`.
    async fn get_certificate(&self, server_name: &str) -> anyhow::Result<CertPair>;

    async fn shutdown(&self);
}
