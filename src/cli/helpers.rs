//! Shared wiring for CLI commands.

use anyhow::Result;
use std::sync::Arc;

use crate::bus::EventBus;
use crate::config::{self, AppConfig, BackendKind};
use crate::ports::PortAllocator;
use crate::sandbox::{LocalBackend, SandboxBackend, SandboxRegistry, SandboxStatus, WslBackend};
use crate::supervisor::LogLine;
use crate::sync::{ConfigStore, ConfigSyncEngine};

/// Long-lived services, constructed once per invocation and passed down.
pub struct App {
    pub cfg: AppConfig,
    pub bus: Arc<EventBus>,
    pub registry: Arc<SandboxRegistry>,
    pub ports: Arc<PortAllocator>,
    pub sync: Arc<ConfigSyncEngine>,
    pub store: ConfigStore,
}

impl App {
    pub fn new(cfg: AppConfig) -> Result<Self> {
        cfg.validate()?;
        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(
            SandboxRegistry::new(build_backend(&cfg), Arc::clone(&bus))
                .with_timeouts(cfg.sandbox.timeouts())
                .with_default_user(cfg.sandbox.default_user.clone()),
        );
        let ports = Arc::new(PortAllocator::new(cfg.ports.start, cfg.ports.end));
        let sync = Arc::new(
            ConfigSyncEngine::new(Arc::clone(&registry), Arc::clone(&bus))
                .with_config_path(cfg.sync.sandbox_config_path.clone())
                .with_timeout(cfg.sandbox.timeouts().lifecycle),
        );
        let store = ConfigStore::new(config::store_dir_path(&cfg));
        Ok(Self {
            cfg,
            bus,
            registry,
            ports,
            sync,
            store,
        })
    }

    pub fn load() -> Result<Self> {
        Self::new(config::load_config(None)?)
    }
}

fn build_backend(cfg: &AppConfig) -> Arc<dyn SandboxBackend> {
    match cfg.sandbox.backend.resolve() {
        BackendKind::Wsl => Arc::new(WslBackend::new().with_import_version(cfg.sandbox.wsl_version)),
        _ => {
            let backend = LocalBackend::new();
            for name in &cfg.sandbox.local_sandboxes {
                backend.add_sandbox(name, SandboxStatus::Stopped);
            }
            Arc::new(backend)
        }
    }
}

pub fn print_log_line(line: &LogLine) {
    println!(
        "{} [{}] {}",
        line.timestamp.format("%H:%M:%S%.3f"),
        line.stream,
        line.line
    );
}

pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_human_bytes() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(1536), "1.5 KiB");
        assert_eq!(human_bytes(8 * 1024 * 1024 * 1024), "8.0 GiB");
    }
}
