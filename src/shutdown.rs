//! Cancellable background tasks.

use std::future::Future;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Handle to a spawned loop that watches a shutdown flag between iterations.
pub struct BackgroundTask {
    name: &'static str,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl BackgroundTask {
    /// Spawn `body` with a receiver that flips to `true` on shutdown.
    pub fn spawn<F, Fut>(name: &'static str, body: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(body(shutdown_rx));
        Self {
            name,
            shutdown_tx,
            task,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal the loop and wait for it to exit. Work already in progress
    /// finishes first.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(err) = self.task.await {
            tracing::error!(task = self.name, error = %err, "background task failed");
        }
    }
}

/// Resolves once the flag is set or the sender is gone.
pub async fn signalled(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}
