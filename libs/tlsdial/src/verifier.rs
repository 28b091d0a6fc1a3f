//! Certificate verification against system roots with a baked-in fallback.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, Error as RustlsError, RootCertStore, SignatureScheme};
use tracing::{debug, error, warn};

use crate::{debug_enabled, Roots, TrustMonitor};

/// Verifies a server chain first against the system roots and then against
/// the baked-in roots.
///
/// The handshake succeeds if either set accepts the chain. When neither does,
/// the system error is returned and the host is flagged as a possible
/// interception.
#[derive(Debug)]
pub struct FallbackVerifier {
    host: String,
    expected_name: Option<ServerName<'static>>,
    system: Option<Arc<WebPkiServerVerifier>>,
    baked: Option<Arc<WebPkiServerVerifier>>,
    monitor: Arc<TrustMonitor>,
    provider: Arc<CryptoProvider>,
}

impl FallbackVerifier {
    pub fn new(
        host: &str,
        roots: &Roots,
        monitor: Arc<TrustMonitor>,
        provider: Arc<CryptoProvider>,
    ) -> Self {
        Self {
            host: host.to_string(),
            expected_name: None,
            system: build(&roots.system, &provider),
            baked: build(&roots.baked, &provider),
            monitor,
            provider,
        }
    }

    /// Verify the presented chain against `name` instead of the SNI name.
    pub fn expecting(mut self, name: ServerName<'static>) -> Self {
        self.expected_name = Some(name);
        self
    }

    fn verify_with(
        verifier: Option<&Arc<WebPkiServerVerifier>>,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, RustlsError> {
        match verifier {
            Some(v) => {
                v.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
            }
            None => Err(RustlsError::InvalidCertificate(CertificateError::UnknownIssuer)),
        }
    }
}

fn build(store: &Arc<RootCertStore>, provider: &Arc<CryptoProvider>) -> Option<Arc<WebPkiServerVerifier>> {
    if store.is_empty() {
        return None;
    }
    match WebPkiServerVerifier::builder_with_provider(Arc::clone(store), Arc::clone(provider)).build() {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(error = %e, "unusable root set");
            None
        }
    }
}

impl ServerCertVerifier for FallbackVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, RustlsError> {
        let name = self.expected_name.as_ref().unwrap_or(server_name);

        let sys = Self::verify_with(self.system.as_ref(), end_entity, intermediates, name, ocsp_response, now);
        let baked = Self::verify_with(self.baked.as_ref(), end_entity, intermediates, name, ocsp_response, now);

        if debug_enabled() {
            debug!(host = %self.host, result = ?sys, "tlsdial: system roots");
            debug!(host = %self.host, result = ?baked, "tlsdial: baked roots");
        } else if baked.is_err() && self.monitor.warn_once(&self.host) {
            if sys.is_ok() {
                warn!(host = %self.host, "tlsdial: server cert is not a Let's Encrypt cert");
            } else {
                error!(host = %self.host, "tlsdial: server cert failed to verify and is not a Let's Encrypt cert");
            }
        }

        match (sys, baked) {
            (Ok(v), _) => {
                self.monitor.set_tls_error(&self.host, None);
                Ok(v)
            }
            (Err(_), Ok(v)) => {
                self.monitor.record_fallback_ok();
                self.monitor.set_tls_error(&self.host, None);
                Ok(v)
            }
            (Err(e), Err(_)) => {
                self.monitor.set_tls_error(
                    &self.host,
                    Some(format!("likely intercepted connection; certificate not trusted: {e}")),
                );
                Err(e)
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}
