use std::time::Duration;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Graceful shutdown: one cancellation token for every task plus a tracker
/// for fire-and-forget follow-ups that must be drained on exit.
#[derive(Debug, Clone)]
pub struct ShutdownGuard {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl ShutdownGuard {
    pub fn new() -> Self {
        Self { token: CancellationToken::new(), tracker: TaskTracker::new() }
    }

    /// The cancellation token that all tasks should monitor.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Spawn a background task that cancels the token on SIGTERM (or Ctrl+C off unix).
    pub fn spawn_signal_listener(&self) {
        let token = self.token.clone();
        tokio::spawn(async move {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        tokio::select! {
                            _ = sigterm.recv() => tracing::info!("received SIGTERM, initiating shutdown"),
                            _ = token.cancelled() => return,
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to register SIGTERM handler");
                        return;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                tokio::select! {
                    _ = signal::ctrl_c() => tracing::info!("received Ctrl+C, initiating shutdown"),
                    _ = token.cancelled() => return,
                }
            }
            token.cancel();
        });
    }

    /// Stop accepting tracked tasks and wait for the tracked ones, bounded by `grace`.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.tracker.close();
        let drained = tokio::time::timeout(grace, self.tracker.wait()).await.is_ok();
        if !drained {
            tracing::warn!(remaining = self.tracker.len(), "shutdown grace elapsed with tasks still running");
        }
        drained
    }
}

impl Default for ShutdownGuard {
    fn default() -> Self {
        Self::new()
    }
}
