//! One gateway per sandbox, run concurrently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::info;

use super::log_buffer::LogLine;
use super::probe::probe_gateway;
use super::process::{
    ManagedProcess, ProcessInfo, ProcessKind, ProcessSettings, ProcessStatus, StartRequest,
};
use crate::bus::{invoke_isolated, EventBus};
use crate::ports::PortAllocator;
use crate::sandbox::SandboxRegistry;

/// Receives `(sandbox, status, message)` for every managed gateway.
pub type GlobalCallback = Arc<dyn Fn(&str, ProcessStatus, Option<&str>) + Send + Sync>;

pub struct GatewayFleet {
    registry: Arc<SandboxRegistry>,
    ports: Arc<PortAllocator>,
    bus: Arc<EventBus>,
    settings: ProcessSettings,
    processes: AsyncMutex<HashMap<String, ManagedProcess>>,
    global_callbacks: Arc<Mutex<Vec<GlobalCallback>>>,
    probe_timeout: Duration,
}

impl GatewayFleet {
    pub fn new(
        registry: Arc<SandboxRegistry>,
        ports: Arc<PortAllocator>,
        bus: Arc<EventBus>,
        settings: ProcessSettings,
    ) -> Self {
        Self {
            registry,
            ports,
            bus,
            settings,
            processes: AsyncMutex::new(HashMap::new()),
            global_callbacks: Arc::new(Mutex::new(Vec::new())),
            probe_timeout: Duration::from_secs(3),
        }
    }

    /// Observe every gateway in the fleet.
    pub fn on_status<F>(&self, callback: F)
    where
        F: Fn(&str, ProcessStatus, Option<&str>) + Send + Sync + 'static,
    {
        if let Ok(mut callbacks) = self.global_callbacks.lock() {
            callbacks.push(Arc::new(callback));
        }
    }

    /// The handle for `sandbox`, created on first use.
    ///
    /// Per-sandbox observers can be attached with `ManagedProcess::on_status`.
    pub async fn process(&self, sandbox: &str) -> ManagedProcess {
        let mut processes = self.processes.lock().await;
        if let Some(existing) = processes.get(sandbox) {
            return existing.clone();
        }

        let process = ManagedProcess::new(
            sandbox,
            ProcessKind::Gateway,
            self.settings.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.ports),
            Arc::clone(&self.bus),
        );
        let globals = Arc::clone(&self.global_callbacks);
        let name = sandbox.to_string();
        process.on_status(move |status, message| {
            let snapshot: Vec<GlobalCallback> = match globals.lock() {
                Ok(list) => list.clone(),
                Err(_) => return,
            };
            for cb in snapshot {
                invoke_isolated("fleet status", || cb(&name, status, message));
            }
        });
        processes.insert(sandbox.to_string(), process.clone());
        process
    }

    async fn existing(&self, sandbox: &str) -> Option<ManagedProcess> {
        self.processes.lock().await.get(sandbox).cloned()
    }

    pub async fn start(&self, sandbox: &str, port: Option<u16>) -> bool {
        let process = self.process(sandbox).await;
        process
            .start(StartRequest {
                port,
                ..Default::default()
            })
            .await
    }

    /// Stop one gateway. Unknown sandboxes count as stopped.
    pub async fn stop(&self, sandbox: &str) -> bool {
        match self.existing(sandbox).await {
            Some(process) => process.stop().await,
            None => true,
        }
    }

    pub async fn restart(&self, sandbox: &str) -> bool {
        match self.existing(sandbox).await {
            Some(process) => process.restart().await,
            None => self.start(sandbox, None).await,
        }
    }

    pub async fn status(&self, sandbox: &str) -> ProcessStatus {
        self.existing(sandbox)
            .await
            .map(|p| p.status())
            .unwrap_or(ProcessStatus::Stopped)
    }

    pub async fn statuses(&self) -> HashMap<String, ProcessStatus> {
        self.processes
            .lock()
            .await
            .iter()
            .map(|(name, p)| (name.clone(), p.status()))
            .collect()
    }

    pub async fn infos(&self) -> Vec<ProcessInfo> {
        let mut infos: Vec<ProcessInfo> = self
            .processes
            .lock()
            .await
            .values()
            .map(|p| p.info())
            .collect();
        infos.sort_by(|a, b| a.sandbox.cmp(&b.sandbox));
        infos
    }

    pub async fn port(&self, sandbox: &str) -> Option<u16> {
        self.existing(sandbox).await.and_then(|p| p.port())
    }

    pub async fn logs(&self, sandbox: &str, n: usize) -> Vec<LogLine> {
        self.existing(sandbox)
            .await
            .map(|p| p.tail(n))
            .unwrap_or_default()
    }

    /// Stop every running gateway concurrently.
    pub async fn stop_all(&self) {
        let processes: Vec<ManagedProcess> =
            self.processes.lock().await.values().cloned().collect();
        let stops = processes.iter().map(|p| p.stop());
        futures_util::future::join_all(stops).await;
        info!(count = processes.len(), "All gateways stopped");
    }

    /// Running and answering a WebSocket handshake at the sandbox's address.
    pub async fn is_reachable(&self, sandbox: &str) -> bool {
        let process = match self.existing(sandbox).await {
            Some(p) if p.is_running() => p,
            _ => return false,
        };
        let port = match process.port() {
            Some(port) => port,
            None => return false,
        };
        let host = match self.registry.sandbox_ip(sandbox).await {
            Some(ip) => ip.to_string(),
            None => "127.0.0.1".to_string(),
        };
        probe_gateway(&host, port, self.probe_timeout).await
    }
}
