use anyhow::Result;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::clock::deadline_after;

/// Fans a shutdown signal out to background loops and joins them with a
/// bounded wait
pub struct ShutdownCoordinator {
    signal: watch::Sender<bool>,
    handles: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            signal,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Receiver that flips to `true` once shutdown starts
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.signal.subscribe()
    }

    /// Track a background loop so `shutdown` can join it
    pub fn register(&self, name: impl Into<String>, handle: JoinHandle<()>) {
        self.handles.lock().push((name.into(), handle));
    }

    pub fn is_triggered(&self) -> bool {
        *self.signal.borrow()
    }

    pub fn trigger(&self) {
        self.signal.send_replace(true);
    }

    /// Wait for Ctrl-C, then trigger shutdown
    pub async fn wait_for_signal(&self) -> Result<()> {
        tokio::signal::ctrl_c().await?;
        info!("Shutdown signal received");
        self.trigger();
        Ok(())
    }

    /// Trigger shutdown and join every registered loop. Loops still
    /// running after `grace` are aborted. Returns how many were aborted.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        self.trigger();
        let handles: Vec<(String, JoinHandle<()>)> = std::mem::take(&mut *self.handles.lock());

        let deadline = deadline_after(grace);
        let mut aborted = 0;
        for (name, mut handle) in handles {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match timeout(remaining, &mut handle).await {
                Ok(Ok(())) => info!(task = %name, "Background task stopped"),
                Ok(Err(e)) => warn!(task = %name, error = %e, "Background task ended abnormally"),
                Err(_) => {
                    warn!(task = %name, "Background task did not stop in time, aborting");
                    handle.abort();
                    aborted += 1;
                }
            }
        }
        aborted
    }
}

impl std::fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("triggered", &self.is_triggered())
            .field("tasks", &self.handles.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_cooperative_loop_stops() {
        let coordinator = ShutdownCoordinator::new();
        let mut signal = coordinator.subscribe();
        coordinator.register(
            "loop",
            tokio::spawn(async move {
                let _ = signal.wait_for(|stop| *stop).await;
            }),
        );

        let aborted = coordinator.shutdown(Duration::from_secs(1)).await;
        assert_eq!(aborted, 0);
        assert!(coordinator.is_triggered());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_loop_is_aborted() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.register(
            "stuck",
            tokio::spawn(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }),
        );

        let aborted = coordinator.shutdown(Duration::from_millis(50)).await;
        assert_eq!(aborted, 1);
    }
}
