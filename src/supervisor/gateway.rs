//! Single gateway bound to the currently selected sandbox.

use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;
use tracing::info;

use super::log_buffer::LogLine;
use super::process::{
    ManagedProcess, ProcessInfo, ProcessKind, ProcessSettings, ProcessStatus, StartRequest,
    StatusCallback,
};
use crate::bus::{invoke_isolated, EventBus};
use crate::ports::PortAllocator;
use crate::sandbox::SandboxRegistry;
use crate::sync::{ConfigSyncEngine, HostAgentConfig};

/// Options for one gateway start.
#[derive(Debug, Clone, Default)]
pub struct GatewayStartOptions {
    /// Explicit port; assigned from the allocator when unset.
    pub port: Option<u16>,
    /// Host-side agent configuration to push before spawning. Its gateway
    /// port is overwritten with the port actually used.
    pub host_config: Option<HostAgentConfig>,
    /// Merge into the sandbox document instead of replacing it.
    pub merge: bool,
}

pub struct GatewayManager {
    registry: Arc<SandboxRegistry>,
    ports: Arc<PortAllocator>,
    bus: Arc<EventBus>,
    sync: Option<Arc<ConfigSyncEngine>>,
    settings: ProcessSettings,
    current: AsyncMutex<Option<ManagedProcess>>,
    callbacks: Arc<Mutex<Vec<StatusCallback>>>,
}

impl GatewayManager {
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
            sync: None,
            settings,
            current: AsyncMutex::new(None),
            callbacks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Enable config sync before spawn when a `HostAgentConfig` is supplied.
    pub fn with_sync(mut self, sync: Arc<ConfigSyncEngine>) -> Self {
        self.sync = Some(sync);
        self
    }

    /// Observe status changes of whichever sandbox's gateway is current.
    pub fn on_status<F>(&self, callback: F)
    where
        F: Fn(ProcessStatus, Option<&str>) + Send + Sync + 'static,
    {
        if let Ok(mut callbacks) = self.callbacks.lock() {
            callbacks.push(Arc::new(callback));
        }
    }

    fn make_process(&self, sandbox: &str) -> ManagedProcess {
        let process = ManagedProcess::new(
            sandbox,
            ProcessKind::Gateway,
            self.settings.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.ports),
            Arc::clone(&self.bus),
        );
        let callbacks = Arc::clone(&self.callbacks);
        process.on_status(move |status, message| {
            let snapshot: Vec<StatusCallback> = match callbacks.lock() {
                Ok(list) => list.clone(),
                Err(_) => return,
            };
            for cb in snapshot {
                invoke_isolated("gateway status", || cb(status, message));
            }
        });
        process
    }

    /// Start the gateway in `sandbox`, stopping a gateway running elsewhere first.
    pub async fn start(&self, sandbox: &str, options: GatewayStartOptions) -> bool {
        let mut current = self.current.lock().await;
        if let Some(existing) = current.as_ref() {
            if existing.sandbox() != sandbox {
                info!(from = %existing.sandbox(), to = %sandbox, "Switching gateway sandbox");
                existing.stop().await;
                *current = None;
            }
        }
        let process = current
            .get_or_insert_with(|| self.make_process(sandbox))
            .clone();
        drop(current);

        let request = StartRequest {
            port: options.port,
            ..Default::default()
        };
        let sync = self.sync.clone();
        let sandbox_name = sandbox.to_string();
        let host_config = options.host_config;
        let merge = options.merge;

        process
            .start_with(request, move |port| async move {
                let (mut config, sync) = match (host_config, sync) {
                    (Some(config), Some(sync)) => (config, sync),
                    _ => return Ok(()),
                };
                config.sandbox = sandbox_name;
                config.gateway.port = port;
                if sync.sync_host_to_sandbox(&config, merge).await {
                    Ok(())
                } else {
                    Err(format!("Failed to sync agent config into {}", config.sandbox))
                }
            })
            .await
    }

    pub async fn stop(&self) -> bool {
        let current = self.current.lock().await.clone();
        match current {
            Some(process) => process.stop().await,
            None => true,
        }
    }

    pub async fn restart(&self) -> bool {
        let current = self.current.lock().await.clone();
        match current {
            Some(process) => process.restart().await,
            None => false,
        }
    }

    pub async fn current(&self) -> Option<ManagedProcess> {
        self.current.lock().await.clone()
    }

    pub async fn status(&self) -> ProcessStatus {
        self.current
            .lock()
            .await
            .as_ref()
            .map(|p| p.status())
            .unwrap_or(ProcessStatus::Stopped)
    }

    pub async fn info(&self) -> Option<ProcessInfo> {
        self.current.lock().await.as_ref().map(|p| p.info())
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
