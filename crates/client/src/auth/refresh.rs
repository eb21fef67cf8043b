//! Scheduled token refresh.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Supplies a fresh token for a connection.
///
/// Implemented for any `Fn(String) -> impl Future<Output = anyhow::Result<String>>`,
/// where the argument is the connection name.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, connection: &str) -> anyhow::Result<String>;
}

#[async_trait]
impl<F, Fut> TokenRefresher for F
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<String>> + Send,
{
    async fn refresh(&self, connection: &str) -> anyhow::Result<String> {
        (self)(connection.to_string()).await
    }
}

/// Handle to a running refresh loop. Dropping it cancels the loop without
/// waiting; [`stop`](Self::stop) also waits for it to exit.
pub struct RefreshHandle {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
    interval: Duration,
}

impl RefreshHandle {
    pub(crate) fn new(cancel: CancellationToken, handle: JoinHandle<()>, interval: Duration) -> Self {
        Self {
            cancel,
            handle: Some(handle),
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the loop and wait for it to exit. A refresh already in flight is
    /// abandoned.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Token refresh task failed");
            }
        }
    }
}

impl Drop for RefreshHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
