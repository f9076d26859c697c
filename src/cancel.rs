//! Run cancellation.
//!
//! Each pipeline run registers a [`CancelToken`] under its run id in a
//! [`RunRegistry`]. Cancelling the run flips the token; schedulers and
//! subtask runners watching it stop feeding work and abandon in-flight
//! tasks. Partial writes are left in place.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

/// Cloneable cancellation signal.
#[derive(Clone, Debug)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let closed = rx.wait_for(|cancelled| *cancelled).await.is_err();
        if closed {
            // Sender gone: the token can never fire.
            std::future::pending::<()>().await;
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancel tokens of the runs currently executing, keyed by run id.
#[derive(Default)]
pub struct RunRegistry {
    runs: Mutex<HashMap<String, CancelToken>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a run and return its token. Re-registering returns the
    /// existing token.
    pub fn register(&self, run_id: &str) -> CancelToken {
        let mut runs = self.runs.lock().unwrap();
        runs.entry(run_id.to_string()).or_default().clone()
    }

    /// Cancel a run. Returns false when no such run is registered.
    pub fn cancel(&self, run_id: &str) -> bool {
        let runs = self.runs.lock().unwrap();
        match runs.get(run_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, run_id: &str) {
        self.runs.lock().unwrap().remove(run_id);
    }

    pub fn running(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.runs.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_wakes_waiters() {
        let token = CancelToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        assert!(!token.is_cancelled());
        token.cancel();
        waiter.await.unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn registry_cancels_by_run_id() {
        let registry = RunRegistry::new();
        let a = registry.register("run-a");
        let b = registry.register("run-b");
        assert!(registry.cancel("run-a"));
        assert!(!registry.cancel("run-missing"));
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());

        registry.remove("run-a");
        assert_eq!(registry.running(), vec!["run-b".to_string()]);
    }
}
