//! TLS client configuration for control-plane and log connections.
//!
//! Server certificates are accepted if they chain to either the platform's
//! trust store or a small set of roots compiled into the binary, so a node
//! keeps working on hosts with stale or missing system roots. Certificates
//! that fail both are flagged as a possible interception on the
//! [`TrustMonitor`].
//!
//! Setting `SSLKEYLOGFILE` writes session secrets in NSS key-log format. A
//! path that cannot be opened terminates the process.

use std::sync::Arc;

use rustls::client::ClientConfig;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::ServerName;
use rustls::{KeyLog, KeyLogFile};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{error, warn};

mod monitor;
mod roots;
mod verifier;

pub use monitor::TrustMonitor;
pub use roots::{baked_roots, system_roots, Roots};
pub use verifier::FallbackVerifier;

/// Environment switch that logs both verification results per handshake.
pub const DEBUG_ENV: &str = "VNET_DEBUG_TLS_DIAL";

const KEY_LOG_ENV: &str = "SSLKEYLOGFILE";

/// TLS dial errors.
#[derive(Debug, Error)]
pub enum TlsDialError {
    #[error("invalid server name {0:?}")]
    InvalidName(String),

    #[error("tls: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub(crate) fn debug_enabled() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| matches!(v.as_str(), "1" | "true"))
        .unwrap_or(false)
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Build a client config for `host`.
///
/// `base` is cloned and its verifier replaced; it must not carry a verifier
/// the caller relies on.
pub fn config(
    host: &str,
    roots: &Roots,
    monitor: Arc<TrustMonitor>,
    base: Option<ClientConfig>,
) -> Result<ClientConfig, TlsDialError> {
    let provider = provider();
    let verifier = FallbackVerifier::new(host, roots, monitor, Arc::clone(&provider));
    with_verifier(Arc::new(verifier), provider, base)
}

/// Build a client config that sends `host` as SNI but verifies the presented
/// chain against `cert_dns_name`.
pub fn config_with_expected_cert(
    host: &str,
    cert_dns_name: &str,
    roots: &Roots,
    monitor: Arc<TrustMonitor>,
    base: Option<ClientConfig>,
) -> Result<ClientConfig, TlsDialError> {
    if host == cert_dns_name {
        return config(host, roots, monitor, base);
    }
    let expected = ServerName::try_from(cert_dns_name.to_string())
        .map_err(|_| TlsDialError::InvalidName(cert_dns_name.to_string()))?;

    let provider = provider();
    let verifier =
        FallbackVerifier::new(host, roots, monitor, Arc::clone(&provider)).expecting(expected);
    with_verifier(Arc::new(verifier), provider, base)
}

fn with_verifier(
    verifier: Arc<FallbackVerifier>,
    provider: Arc<CryptoProvider>,
    base: Option<ClientConfig>,
) -> Result<ClientConfig, TlsDialError> {
    let mut conf = match base {
        Some(mut conf) => {
            conf.dangerous().set_certificate_verifier(verifier);
            conf
        }
        None => ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_no_client_auth(),
    };

    if let Some(key_log) = key_log() {
        conf.key_log = key_log;
    }
    Ok(conf)
}

fn key_log() -> Option<Arc<dyn KeyLog>> {
    let path = std::env::var_os(KEY_LOG_ENV)?;
    if path.is_empty() {
        return None;
    }

    let mut options = std::fs::OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    if let Err(e) = options.open(&path) {
        error!(path = ?path, error = %e, "cannot open SSLKEYLOGFILE");
        std::process::exit(1);
    }

    warn!(path = ?path, "writing TLS session secrets to SSLKEYLOGFILE");
    Some(Arc::new(KeyLogFile::new()))
}

/// Connect to `addr` (`host:port`) and complete a handshake verified by
/// [`config`].
pub async fn dial(
    addr: &str,
    roots: &Roots,
    monitor: Arc<TrustMonitor>,
) -> Result<TlsStream<TcpStream>, TlsDialError> {
    let host = match addr.rsplit_once(':') {
        Some((host, _)) => host.trim_start_matches('[').trim_end_matches(']'),
        None => return Err(TlsDialError::InvalidName(addr.to_string())),
    };
    let name = ServerName::try_from(host.to_string())
        .map_err(|_| TlsDialError::InvalidName(host.to_string()))?;

    let conf = config(host, roots, monitor, None)?;
    let stream = TcpStream::connect(addr).await?;
    let tls = TlsConnector::from(Arc::new(conf)).connect(name, stream).await?;
    Ok(tls)
}
