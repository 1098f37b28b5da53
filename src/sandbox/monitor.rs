// Opt-in background polling of the sandbox registry

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::registry::SandboxRegistry;

/// How long `stop` waits for the poll task before abandoning it.
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Periodically refreshes the registry on a tokio task.
///
/// Polls never overlap: the loop awaits each refresh before sleeping again.
pub struct SandboxMonitor {
    registry: Arc<SandboxRegistry>,
    interval: Duration,
    with_details: bool,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

impl SandboxMonitor {
    pub fn new(registry: Arc<SandboxRegistry>, interval: Duration) -> Self {
        Self {
            registry,
            interval,
            with_details: false,
            cancel: None,
            task: None,
        }
    }

    /// Also collect IP addresses and resource usage on every poll.
    pub fn with_details(mut self, enabled: bool) -> Self {
        self.with_details = enabled;
        self
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }
        let token = CancellationToken::new();
        let registry = Arc::clone(&self.registry);
        let interval = self.interval;
        let with_details = self.with_details;
        let child = token.clone();

        self.task = Some(tokio::spawn(async move {
            info!(interval_secs = interval.as_secs_f64(), "Sandbox monitor started");
            loop {
                let poll = async {
                    if with_details {
                        registry.refresh_details().await.map(|_| ())
                    } else {
                        registry.list_sandboxes().await.map(|_| ())
                    }
                };
                tokio::select! {
                    _ = child.cancelled() => break,
                    result = poll => {
                        if let Err(e) = result {
                            warn!(error = %e, recoverable = e.is_recoverable(), "Sandbox poll failed");
                        }
                    }
                }
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            debug!("Sandbox monitor loop exited");
        }));
        self.cancel = Some(token);
    }

    /// Cancel the loop and wait (bounded) for it to finish.
    pub async fn stop(&mut self) {
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(STOP_JOIN_TIMEOUT, &mut task).await.is_err() {
                warn!("Sandbox monitor did not stop in time, aborting");
                task.abort();
            }
        }
        info!("Sandbox monitor stopped");
    }
}

impl Drop for SandboxMonitor {
    fn drop(&mut self) {
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{EventBus, EventKind};
    use crate::sandbox::local::LocalBackend;
    use crate::sandbox::types::SandboxStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_monitor_polls_until_stopped() {
        let bus = Arc::new(EventBus::new());
        let backend = LocalBackend::new().with_sandbox("ubuntu-1", SandboxStatus::Running);
        let registry = Arc::new(SandboxRegistry::new(Arc::new(backend), Arc::clone(&bus)));

        let polls = Arc::new(AtomicUsize::new(0));
        let p = Arc::clone(&polls);
        bus.subscribe(EventKind::SandboxesRefreshed, move |_| {
            p.fetch_add(1, Ordering::SeqCst);
        });

        let mut monitor = SandboxMonitor::new(Arc::clone(&registry), Duration::from_millis(20));
        monitor.start();
        assert!(monitor.is_running());
        tokio::time::sleep(Duration::from_millis(150)).await;
        monitor.stop().await;
        assert!(!monitor.is_running());

        let seen = polls.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected several polls, saw {}", seen);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(polls.load(Ordering::SeqCst), seen);
        assert!(registry.is_running("ubuntu-1"));
    }
}
