//! Root certificate sets.

use std::sync::Arc;

use rustls::RootCertStore;
use tracing::debug;

/// Subject marker of the roots embedded as the fallback trust set.
const BAKED_SUBJECT_MARKER: &[u8] = b"ISRG Root X";

/// The two trust sets a verifier consults.
#[derive(Debug, Clone)]
pub struct Roots {
    pub(crate) system: Arc<RootCertStore>,
    pub(crate) baked: Arc<RootCertStore>,
}

impl Roots {
    pub fn new(system: RootCertStore, baked: RootCertStore) -> Self {
        Self {
            system: Arc::new(system),
            baked: Arc::new(baked),
        }
    }

    /// Platform trust store plus the baked-in roots.
    pub fn load() -> Self {
        Self::new(system_roots(), baked_roots())
    }
}

/// Load the platform's trust store. Unparsable entries are skipped.
pub fn system_roots() -> RootCertStore {
    let mut store = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();

    for err in native.errors {
        debug!(error = %err, "skipping native root");
    }
    let (added, ignored) = store.add_parsable_certificates(native.certs);
    debug!(added, ignored, "loaded system roots");

    store
}

/// The ISRG roots, taken from the compiled-in Mozilla set.
pub fn baked_roots() -> RootCertStore {
    RootCertStore::from_iter(
        webpki_roots::TLS_SERVER_ROOTS
            .iter()
            .filter(|anchor| contains(anchor.subject.as_ref(), BAKED_SUBJECT_MARKER))
            .cloned(),
    )
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
