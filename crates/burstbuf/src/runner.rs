//! Bounded executor for long running external operations.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RunError {
    #[error("operation abandoned because the controller is shutting down")]
    Shutdown,
}

pub type RunResult<T> = Result<T, RunError>;

/// Runs submitted futures on the tokio runtime, at most `limit` at once.
///
/// Shutdown stops accepting new work, drops work that did not start yet,
/// lets running work finish within a grace period and then abandons it.
/// Abandoned and refused work resolves to [`RunError::Shutdown`].
#[derive(Clone)]
pub struct OperationRunner {
    semaphore: Arc<Semaphore>,
    tracker: TaskTracker,
    /// Cancelled when shutdown begins
    draining: CancellationToken,
    /// Cancelled when the grace period is over
    abort: CancellationToken,
}

impl OperationRunner {
    pub fn new(limit: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limit.max(1))),
            tracker: TaskTracker::new(),
            draining: CancellationToken::new(),
            abort: CancellationToken::new(),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.draining.is_cancelled()
    }

    pub fn submit<T, F>(&self, label: String, future: F) -> oneshot::Receiver<RunResult<T>>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        self.submit_after(label, Duration::ZERO, future)
    }

    /// Like [`OperationRunner::submit`], but waits `delay` before queueing for a slot.
    /// The wait does not count against the limit.
    pub fn submit_after<T, F>(
        &self,
        label: String,
        delay: Duration,
        future: F,
    ) -> oneshot::Receiver<RunResult<T>>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        if self.is_shutting_down() {
            log::debug!("Refusing {label}, runner is shutting down");
            let _ = sender.send(Err(RunError::Shutdown));
            return receiver;
        }
        let semaphore = self.semaphore.clone();
        let draining = self.draining.clone();
        let abort = self.abort.clone();
        self.tracker.spawn(async move {
            let permit = tokio::select! {
                biased;
                _ = draining.cancelled() => None,
                permit = async {
                    if !delay.is_zero() {
                        log::debug!("Delaying {label} by {}", humantime::format_duration(delay));
                        tokio::time::sleep(delay).await;
                    }
                    semaphore.acquire_owned().await.ok()
                } => permit,
            };
            let result = match permit {
                Some(_permit) => {
                    log::debug!("Starting {label}");
                    tokio::select! {
                        biased;
                        _ = abort.cancelled() => {
                            log::warn!("Abandoning {label} after shutdown grace period");
                            Err(RunError::Shutdown)
                        }
                        value = future => Ok(value),
                    }
                }
                None => {
                    log::debug!("Dropping queued {label}");
                    Err(RunError::Shutdown)
                }
            };
            let _ = sender.send(result);
        });
        receiver
    }

    /// Stops the runner; returns when all submitted work is resolved.
    pub async fn shutdown(&self, grace: Duration) {
        self.draining.cancel();
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            log::warn!(
                "{} operation(s) still running after {}",
                self.tracker.len(),
                humantime::format_duration(grace)
            );
            self.abort.cancel();
            self.tracker.wait().await;
        }
    }
}
