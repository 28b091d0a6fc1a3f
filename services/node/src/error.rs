//! Node errors.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use vnet_networking::{Network, NetworkError};

/// Errors returned by the node's public operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad network string, address, or port.
    #[error(transparent)]
    Network(#[from] NetworkError),

    /// Operation only supports stream sockets.
    #[error("{op}: only tcp is supported, got {network:?}")]
    TcpOnly { op: &'static str, network: String },

    /// Funnel listeners bind every node address.
    #[error("funnel: host part of {0:?} must be empty")]
    FunnelHost(String),

    /// In-memory state stores lose identity across restarts.
    #[error("in-memory state store is only supported for ephemeral nodes")]
    MemStoreRequiresEphemeral,

    #[error("state directory {} is not a directory", .0.display())]
    NotADirectory(PathBuf),

    #[error("no state directory configured and no user config directory available")]
    NoStateDir,

    /// A collaborator failed during startup.
    #[error("{subsystem}: {source:#}")]
    Subsystem {
        subsystem: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// Startup failed earlier; every later call sees the same failure.
    #[error("startup failed: {0}")]
    Init(Arc<Error>),

    #[error("listener already open for {network}, {addr}")]
    AddrInUse { network: Network, addr: String },

    #[error("use of closed listener")]
    ListenerClosed,

    #[error("server closed")]
    ServerClosed,

    #[error("dialer closed")]
    DialerClosed,

    /// Error message reported by the control-plane backend.
    #[error("backend: {0}")]
    Backend(String),

    #[error("running, but no ip")]
    NoAddress,

    #[error("HTTPS must be enabled for this node")]
    HttpsDisabled,

    #[error("funnel not available: {0}")]
    FunnelDenied(String),

    #[error("local api: {0}")]
    LocalApi(String),

    #[error("tls: {0}")]
    Tls(#[from] rustls::Error),

    #[error(transparent)]
    TlsDial(#[from] vnet_tlsdial::TlsDialError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn subsystem(subsystem: &'static str) -> impl FnOnce(anyhow::Error) -> Self {
        move |source| Error::Subsystem { subsystem, source }
    }

    /// The underlying failure, looking through a memoized startup error.
    pub fn root(&self) -> &Error {
        match self {
            Error::Init(inner) => inner.root(),
            other => other,
        }
    }
}
