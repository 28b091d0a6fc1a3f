//! Record of TLS verification outcomes, owned by whoever builds the configs.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Tracks per-host verification results for the lifetime of its owner.
///
/// One warning is logged per host that presents a certificate not chaining to
/// the baked-in roots; later handshakes with the same host stay quiet.
#[derive(Debug, Default)]
pub struct TrustMonitor {
    warned: Mutex<HashSet<String>>,
    fallback_ok: AtomicU64,
    errors: Mutex<HashMap<String, String>>,
}

impl TrustMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true the first time it is called for `host`.
    pub(crate) fn warn_once(&self, host: &str) -> bool {
        lock(&self.warned).insert(host.to_string())
    }

    pub fn has_warned(&self, host: &str) -> bool {
        lock(&self.warned).contains(host)
    }

    pub fn warned_count(&self) -> usize {
        lock(&self.warned).len()
    }

    pub(crate) fn record_fallback_ok(&self) {
        self.fallback_ok.fetch_add(1, Ordering::Relaxed);
    }

    /// Handshakes that only verified against the baked-in roots.
    pub fn fallback_ok(&self) -> u64 {
        self.fallback_ok.load(Ordering::Relaxed)
    }

    pub(crate) fn set_tls_error(&self, host: &str, error: Option<String>) {
        let mut errors = lock(&self.errors);
        match error {
            Some(e) => {
                errors.insert(host.to_string(), e);
            }
            None => {
                errors.remove(host);
            }
        }
    }

    /// The last verification failure for `host`, cleared by a later success.
    pub fn tls_error(&self, host: &str) -> Option<String> {
        lock(&self.errors).get(host).cloned()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
