//! Bridge agent: runs inside a sandbox and connects back to the host's
//! automation server.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use super::log_buffer::LogLine;
use super::process::{ManagedProcess, ProcessKind, ProcessSettings, ProcessStatus, StartRequest};
use crate::bus::EventBus;
use crate::ports::PortAllocator;
use crate::sandbox::SandboxRegistry;

/// Address used when the sandbox reports no default route.
const FALLBACK_HOST: &str = "127.0.0.1";

pub struct BridgeManager {
    registry: Arc<SandboxRegistry>,
    ports: Arc<PortAllocator>,
    bus: Arc<EventBus>,
    settings: ProcessSettings,
    ipc_port: u16,
    current: AsyncMutex<Option<ManagedProcess>>,
}

impl BridgeManager {
    pub fn new(
        registry: Arc<SandboxRegistry>,
        ports: Arc<PortAllocator>,
        bus: Arc<EventBus>,
        settings: ProcessSettings,
        ipc_port: u16,
    ) -> Self {
        Self {
            registry,
            ports,
            bus,
            settings,
            ipc_port,
            current: AsyncMutex::new(None),
        }
    }

    pub fn ipc_port(&self) -> u16 {
        self.ipc_port
    }

    /// Host address as seen from inside the sandbox (its default gateway).
    pub async fn resolve_host_address(&self, sandbox: &str) -> String {
        let result = self
            .registry
            .execute_command(sandbox, "ip route show default", Duration::from_secs(10))
            .await;
        if result.success {
            if let Some(addr) = parse_default_route(&result.stdout) {
                return addr.to_string();
            }
        }
        debug!(sandbox = %sandbox, "No default route in sandbox, using loopback");
        FALLBACK_HOST.to_string()
    }

    /// Start the bridge in `sandbox`, replacing one running elsewhere.
    pub async fn start(&self, sandbox: &str) -> bool {
        let mut current = self.current.lock().await;
        if let Some(existing) = current.as_ref() {
            if existing.sandbox() != sandbox {
                existing.stop().await;
                *current = None;
            }
        }
        let process = current
            .get_or_insert_with(|| {
                ManagedProcess::new(
                    sandbox,
                    ProcessKind::Bridge,
                    self.settings.clone(),
                    Arc::clone(&self.registry),
                    Arc::clone(&self.ports),
                    Arc::clone(&self.bus),
                )
            })
            .clone();
        drop(current);

        if process.is_running() {
            return true;
        }
        let host = self.resolve_host_address(sandbox).await;
        info!(sandbox = %sandbox, host = %host, port = self.ipc_port, "Starting bridge");
        process
            .start(StartRequest::external(self.ipc_port, host))
            .await
    }

    pub async fn stop(&self) -> bool {
        let current = self.current.lock().await.clone();
        match current {
            Some(process) => process.stop().await,
            None => true,
        }
    }

    pub async fn status(&self) -> ProcessStatus {
        self.current
            .lock()
            .await
            .as_ref()
            .map(|p| p.status())
            .unwrap_or(ProcessStatus::Stopped)
    }

    pub async fn logs(&self, n: usize) -> Vec<LogLine> {
        self.current
            .lock()
            .await
            .as_ref()
            .map(|p| p.tail(n))
            .unwrap_or_default()
    }
}

/// `default via 172.20.0.1 dev eth0 proto kernel` -> `172.20.0.1`.
pub fn parse_default_route(output: &str) -> Option<Ipv4Addr> {
    output.lines().find_map(|line| {
        let mut tokens = line.split_whitespace();
        while let Some(token) = tokens.next() {
            if token == "via" {
                return tokens.next().and_then(|t| t.parse().ok());
            }
        }
        None
    })
}
