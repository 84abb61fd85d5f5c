//! Task coordination for graceful shutdown
//!
//! Every long running task (suppliers, the pairer, pipe directions) is spawned
//! through a [`Graceful`] so that shutdown can cancel them and wait for them.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// How long [`Graceful::shutdown`] waits for spawned tasks to wind down
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Shutdown coordinator shared by all tasks of one proxy instance
#[derive(Debug, Clone, Default)]
pub struct Graceful {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl Graceful {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a task that shutdown will wait for
    pub fn spawn<F>(&self, task: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(task)
    }

    /// Resolves once shutdown has been requested
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// A token that is cancelled on shutdown but can also be cancelled on
    /// its own, e.g. to tear down a single pipe
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Cancel all tasks and wait for them to finish
    pub async fn shutdown(&self) -> eyre::Result<()> {
        self.token.cancel();
        self.tracker.close();

        tokio::time::timeout(SHUTDOWN_GRACE, self.tracker.wait())
            .await
            .map_err(|_| {
                eyre::eyre!(
                    "{} tasks still running {SHUTDOWN_GRACE:?} after shutdown",
                    self.tracker.len()
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_waits_for_tasks() {
        let graceful = Graceful::new();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();

        let g = graceful.clone();
        graceful.spawn(async move {
            g.cancelled().await;
            done_tx.send(()).unwrap();
        });

        graceful.shutdown().await.unwrap();
        assert!(graceful.is_cancelled());
        done_rx.await.unwrap();
    }

    #[tokio::test]
    async fn test_child_token_is_independent() {
        let graceful = Graceful::new();
        let child = graceful.child_token();
        child.cancel();
        assert!(!graceful.is_cancelled());

        let child = graceful.child_token();
        graceful.shutdown().await.unwrap();
        assert!(child.is_cancelled());
    }
}
