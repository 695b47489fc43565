// shutdown.rs — Root cancellation signal shared by every task.
// A watch channel holding a single bool; subordinate operations
// either poll `is_triggered` or await `triggered` inside a select.

use std::sync::Arc;
use tokio::sync::watch;

/// Cloneable shutdown handle. The engine creates one on start and
/// hands clones to every monitor task, the maintenance loop, and
/// the rate limiter's blocking waits.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Shutdown {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Signal shutdown. Idempotent; wakes every waiter.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown has been triggered. Safe to call from
    /// any number of tasks concurrently.
    pub async fn triggered(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
        // Sender gone means the engine is being torn down; treat as
        // triggered so waiters unblock.
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Shutdown::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_trigger_wakes_waiters() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_triggered());

        let waiter = shutdown.clone();
        let handle = tokio::spawn(async move {
            waiter.triggered().await;
            true
        });

        shutdown.trigger();
        let woke = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(woke);
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_triggered_resolves_immediately_after_trigger() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        shutdown.triggered().await;
    }
}
