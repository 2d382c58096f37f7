//! Cooperative shutdown signalling.
//!
//! One [`ShutdownController`] per subsystem; workers hold cloned
//! [`Shutdown`] handles and check them at designated points in their
//! loops (top of loop, after each dequeue). Requesting shutdown is
//! sticky and wakes every pending [`Shutdown::requested`] wait promptly.

use tokio::sync::watch;
use tracing::info;

/// The requesting side of a shutdown signal.
pub struct ShutdownController {
    tx: watch::Sender<bool>,
}

impl ShutdownController {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Returns a handle workers can poll and await.
    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: self.tx.subscribe(),
        }
    }

    /// Requests shutdown. Idempotent.
    pub fn request(&self) {
        if !*self.tx.borrow() {
            info!("shutdown requested");
        }
        let _ = self.tx.send(true);
    }

    pub fn is_requested(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// A worker-side view of the shutdown flag.
#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// Non-blocking check of the sticky flag.
    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been requested. A dropped controller
    /// counts as a request; orphaned workers must not run forever.
    pub async fn requested(&mut self) {
        let _ = self.rx.wait_for(|requested| *requested).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn request_is_sticky_and_observable() {
        let controller = ShutdownController::new();
        let handle = controller.subscribe();
        assert!(!handle.is_requested());

        controller.request();
        controller.request(); // idempotent
        assert!(handle.is_requested());
        assert!(controller.is_requested());

        // a wait started after the request resolves immediately
        let mut handle = controller.subscribe();
        tokio::time::timeout(Duration::from_secs(1), handle.requested())
            .await
            .expect("requested() should resolve");
    }

    #[tokio::test]
    async fn wait_wakes_on_request() {
        let controller = ShutdownController::new();
        let mut handle = controller.subscribe();

        let waiter = tokio::spawn(async move { handle.requested().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        controller.request();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn dropped_controller_counts_as_request() {
        let controller = ShutdownController::new();
        let mut handle = controller.subscribe();
        drop(controller);

        tokio::time::timeout(Duration::from_secs(1), handle.requested())
            .await
            .expect("requested() should resolve after controller drop");
    }
}
