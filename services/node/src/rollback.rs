//! Release stack for partially completed startup.

use std::future::Future;

use futures_util::future::BoxFuture;
use tracing::debug;

type Release = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Releases acquired resources in reverse order if startup fails.
#[derive(Default)]
pub(crate) struct Rollback {
    steps: Vec<(&'static str, Release)>,
}

impl Rollback {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push<F, Fut>(&mut self, name: &'static str, release: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.steps.push((name, Box::new(move || Box::pin(release()))));
    }

    /// Run every release, most recent first.
    pub(crate) async fn unwind(self) {
        for (name, release) in self.steps.into_iter().rev() {
            debug!(step = name, "rolling back");
            release().await;
        }
    }

    /// Startup succeeded; forget the releases.
    pub(crate) fn disarm(self) {
        debug!(steps = self.steps.len(), "startup complete");
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.steps.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn test_unwind_runs_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut rollback = Rollback::new();
        for name in ["netmon", "engine", "stack"] {
            let log = Arc::clone(&log);
            rollback.push(name, move || async move { log.lock().unwrap().push(name) });
        }
        assert_eq!(rollback.len(), 3);

        rollback.unwind().await;
        assert_eq!(*log.lock().unwrap(), vec!["stack", "engine", "netmon"]);
    }

    #[tokio::test]
    async fn test_disarm_runs_nothing() {
        let log = Arc::new(Mutex::new(Vec::<&str>::new()));
        let mut rollback = Rollback::new();
        let l = Arc::clone(&log);
        rollback.push("netmon", move || async move { l.lock().unwrap().push("netmon") });

        rollback.disarm();
        assert!(log.lock().unwrap().is_empty());
    }
}
