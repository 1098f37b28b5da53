// Sandbox registry: enumeration, lifecycle commands and in-sandbox execution

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::backend::SandboxBackend;
use super::error::{Result, SandboxError};
use super::exec::run_with_timeout;
use super::parser::parse_list_output;
use super::types::{CommandResult, ResourceSnapshot, Sandbox, SandboxStatus};
use crate::bus::{Event, EventBus};

/// User that in-sandbox commands run as unless the caller says otherwise.
pub const DEFAULT_USER: &str = "root";

/// Timeouts for the host tool.
#[derive(Debug, Clone)]
pub struct RegistryTimeouts {
    pub list: Duration,
    pub lifecycle: Duration,
    pub import: Duration,
    pub probe: Duration,
}

impl Default for RegistryTimeouts {
    fn default() -> Self {
        Self {
            list: Duration::from_secs(15),
            lifecycle: Duration::from_secs(60),
            import: Duration::from_secs(600),
            probe: Duration::from_secs(10),
        }
    }
}

/// Tracks the sandboxes known to the host tool and issues commands against them.
pub struct SandboxRegistry {
    backend: Arc<dyn SandboxBackend>,
    bus: Arc<EventBus>,
    snapshot: Mutex<Vec<Sandbox>>,
    timeouts: RegistryTimeouts,
    default_user: String,
}

impl SandboxRegistry {
    pub fn new(backend: Arc<dyn SandboxBackend>, bus: Arc<EventBus>) -> Self {
        Self {
            backend,
            bus,
            snapshot: Mutex::new(Vec::new()),
            timeouts: RegistryTimeouts::default(),
            default_user: DEFAULT_USER.to_string(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: RegistryTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_default_user(mut self, user: impl Into<String>) -> Self {
        self.default_user = user.into();
        self
    }

    pub fn backend(&self) -> &Arc<dyn SandboxBackend> {
        &self.backend
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    // -----------------------------------------------------------------------
    // Enumeration
    // -----------------------------------------------------------------------

    /// Enumerate sandboxes and replace the snapshot.
    pub async fn list_sandboxes(&self) -> Result<Vec<Sandbox>> {
        let result = self.backend.list(self.timeouts.list).await;
        if result.timed_out {
            return Err(SandboxError::Timeout(self.timeouts.list));
        }
        if !result.success {
            return Err(SandboxError::Tool {
                message: "Failed to list sandboxes".to_string(),
                stderr: result.error_message(),
                exit_code: result.exit_code,
            });
        }

        let mut sandboxes = parse_list_output(&result.stdout);

        // Keep details gathered by an earlier refresh for sandboxes still
        // running; carry-over and replacement happen under one guard.
        {
            let mut snapshot = self.lock_snapshot();
            for sb in sandboxes.iter_mut().filter(|s| s.is_running()) {
                if let Some(old) = snapshot.iter().find(|o| o.name == sb.name && o.is_running()) {
                    sb.ip_address = old.ip_address;
                    sb.resources = old.resources.clone();
                }
            }
            *snapshot = sandboxes.clone();
        }
        self.bus.publish(Event::SandboxesRefreshed {
            sandboxes: sandboxes.clone(),
        });
        debug!(count = sandboxes.len(), backend = self.backend.kind(), "Sandbox list refreshed");
        Ok(sandboxes)
    }

    /// Enumerate, then collect IP address and resource usage for running sandboxes.
    ///
    /// Detail probes are best-effort; a failing probe leaves the field empty.
    pub async fn refresh_details(&self) -> Result<Vec<Sandbox>> {
        let mut sandboxes = self.list_sandboxes().await?;
        for sb in sandboxes.iter_mut().filter(|s| s.is_running()) {
            sb.ip_address = self.sandbox_ip(&sb.name).await;
            sb.resources = self.resource_snapshot(&sb.name).await;
        }
        self.replace_snapshot(sandboxes.clone());
        Ok(sandboxes)
    }

    fn replace_snapshot(&self, sandboxes: Vec<Sandbox>) {
        *self.lock_snapshot() = sandboxes.clone();
        self.bus.publish(Event::SandboxesRefreshed { sandboxes });
    }

    fn lock_snapshot(&self) -> std::sync::MutexGuard<'_, Vec<Sandbox>> {
        self.snapshot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> Vec<Sandbox> {
        self.lock_snapshot().clone()
    }

    pub fn get(&self, name: &str) -> Option<Sandbox> {
        self.lock_snapshot().iter().find(|s| s.name == name).cloned()
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.get(name).map(|s| s.is_running()).unwrap_or(false)
    }

    pub fn default_sandbox(&self) -> Option<Sandbox> {
        self.lock_snapshot().iter().find(|s| s.is_default).cloned()
    }

    /// Re-enumerate after a lifecycle change; a failure here does not undo the change.
    async fn resync(&self) {
        if let Err(e) = self.list_sandboxes().await {
            warn!(error = %e, "Sandbox re-enumeration failed");
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    pub async fn start_sandbox(&self, name: &str) -> bool {
        let result = self.backend.boot(name, self.timeouts.lifecycle).await;
        if !result.success {
            warn!(sandbox = %name, error = %result.error_message(), "Failed to start sandbox");
            return false;
        }
        self.resync().await;
        info!(sandbox = %name, "Sandbox started");
        self.bus.publish(Event::SandboxStarted {
            name: name.to_string(),
        });
        true
    }

    pub async fn stop_sandbox(&self, name: &str) -> bool {
        let result = self.backend.terminate(name, self.timeouts.lifecycle).await;
        if !result.success {
            warn!(sandbox = %name, error = %result.error_message(), "Failed to stop sandbox");
            return false;
        }
        self.resync().await;
        info!(sandbox = %name, "Sandbox stopped");
        self.bus.publish(Event::SandboxStopped {
            name: name.to_string(),
        });
        true
    }

    /// Start the sandbox unless the snapshot already shows it running.
    pub async fn ensure_running(&self, name: &str) -> bool {
        if self.is_running(name) {
            return true;
        }
        self.start_sandbox(name).await
    }

    pub async fn shutdown_all(&self) -> bool {
        let running: Vec<String> = self
            .snapshot()
            .into_iter()
            .filter(|s| s.is_running())
            .map(|s| s.name)
            .collect();
        let result = self.backend.shutdown_all(self.timeouts.lifecycle).await;
        if !result.success {
            warn!(error = %result.error_message(), "Failed to shut down sandboxes");
            return false;
        }
        self.resync().await;
        for name in running {
            self.bus.publish(Event::SandboxStopped { name });
        }
        info!("All sandboxes shut down");
        true
    }

    pub async fn unregister_sandbox(&self, name: &str) -> bool {
        if let Err(e) = validate_name(name) {
            warn!(error = %e, "Refusing to unregister sandbox");
            return false;
        }
        let result = self.backend.unregister(name, self.timeouts.lifecycle).await;
        if !result.success {
            warn!(sandbox = %name, error = %result.error_message(), "Failed to unregister sandbox");
            return false;
        }
        self.resync().await;
        info!(sandbox = %name, "Sandbox unregistered");
        self.bus.publish(Event::SandboxRemoved {
            name: name.to_string(),
        });
        true
    }

    pub async fn set_default_sandbox(&self, name: &str) -> bool {
        let result = self.backend.set_default(name, self.timeouts.lifecycle).await;
        if !result.success {
            warn!(sandbox = %name, error = %result.error_message(), "Failed to set default sandbox");
            return false;
        }
        self.resync().await;
        true
    }

    /// Create a sandbox from a root filesystem archive.
    ///
    /// The name and archive are checked before the host tool is invoked.
    pub async fn import_sandbox(
        &self,
        tar_path: &Path,
        name: &str,
        install_dir: &Path,
    ) -> CommandResult {
        if let Err(e) = validate_name(name) {
            return CommandResult::failure(e.to_string());
        }
        if !tar_path.is_file() {
            return CommandResult::failure(format!(
                "Archive not found: {}",
                tar_path.display()
            ));
        }

        info!(sandbox = %name, archive = %tar_path.display(), "Importing sandbox");
        let result = self
            .backend
            .import(name, install_dir, tar_path, self.timeouts.import)
            .await;
        if result.success {
            self.resync().await;
            self.bus.publish(Event::SandboxImported {
                name: name.to_string(),
            });
        } else {
            warn!(sandbox = %name, error = %result.error_message(), "Sandbox import failed");
        }
        result
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Run a shell command line inside a sandbox as the default user.
    pub async fn execute_command(
        &self,
        name: &str,
        command_line: &str,
        timeout: Duration,
    ) -> CommandResult {
        let user = self.default_user.clone();
        self.execute_command_as(name, &user, command_line, timeout).await
    }

    pub async fn execute_command_as(
        &self,
        name: &str,
        user: &str,
        command_line: &str,
        timeout: Duration,
    ) -> CommandResult {
        if let Err(e) = validate_name(name) {
            return CommandResult::failure(e.to_string());
        }
        debug!(sandbox = %name, user = %user, "Executing command in sandbox");
        let cmd = self.backend.command(name, Some(user), command_line);
        run_with_timeout(cmd, timeout).await
    }

    /// First IPv4 address reported by `hostname -I`.
    pub async fn sandbox_ip(&self, name: &str) -> Option<Ipv4Addr> {
        let result = self
            .execute_command(name, "hostname -I", self.timeouts.probe)
            .await;
        if !result.success {
            return None;
        }
        first_ipv4(&result.stdout)
    }

    async fn resource_snapshot(&self, name: &str) -> Option<ResourceSnapshot> {
        let script = "head -n1 /proc/stat; sleep 0.5; head -n1 /proc/stat; \
                      echo '--'; free -b; echo '--'; df -B1 /";
        let result = self.execute_command(name, script, self.timeouts.probe).await;
        if !result.success {
            debug!(sandbox = %name, "Resource probe failed");
            return None;
        }
        parse_resource_output(&result.stdout)
    }
}

/// Sandbox names may only contain letters, digits, '_', '-' and '.'.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(SandboxError::Validation("Sandbox name cannot be empty".to_string()));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
    {
        return Err(SandboxError::Validation(format!(
            "Invalid sandbox name '{}': only letters, digits, '_', '-' and '.' are allowed",
            name
        )));
    }
    Ok(())
}

fn first_ipv4(text: &str) -> Option<Ipv4Addr> {
    text.split_whitespace().find_map(|t| t.parse::<Ipv4Addr>().ok())
}

/// Parse the combined `/proc/stat` x2, `free -b`, `df -B1 /` output.
fn parse_resource_output(text: &str) -> Option<ResourceSnapshot> {
    let sections: Vec<&str> = text.split("--\n").collect();
    if sections.len() < 3 {
        return None;
    }

    let cpu_lines: Vec<Vec<u64>> = sections[0]
        .lines()
        .filter(|l| l.starts_with("cpu "))
        .map(|l| l.split_whitespace().skip(1).filter_map(|v| v.parse().ok()).collect())
        .collect();
    let cpu_percent = match cpu_lines.as_slice() {
        [a, b, ..] => cpu_usage(a, b),
        _ => 0.0,
    };

    let mut snapshot = ResourceSnapshot {
        cpu_percent,
        ..Default::default()
    };

    let columns = |line: &str| -> Vec<u64> {
        line.split_whitespace()
            .skip(1)
            .filter_map(|v| v.parse().ok())
            .collect()
    };

    if let Some(mem) = sections[1].lines().find(|l| l.starts_with("Mem:")) {
        let cols = columns(mem);
        snapshot.memory_total = cols.first().copied().unwrap_or(0);
        snapshot.memory_used = cols.get(1).copied().unwrap_or(0);
    }

    // df: Filesystem 1B-blocks Used Available Use% Mounted on
    if let Some(disk) = sections[2].lines().nth(1) {
        let cols = columns(disk);
        snapshot.disk_total = cols.first().copied().unwrap_or(0);
        snapshot.disk_used = cols.get(1).copied().unwrap_or(0);
    }

    Some(snapshot)
}

fn cpu_usage(before: &[u64], after: &[u64]) -> f64 {
    // user nice system idle iowait ...
    let idle = |v: &[u64]| v.get(3).copied().unwrap_or(0) + v.get(4).copied().unwrap_or(0);
    let total_before: u64 = before.iter().sum();
    let total_after: u64 = after.iter().sum();
    let total = total_after.saturating_sub(total_before);
    if total == 0 {
        return 0.0;
    }
    let idle_delta = idle(after).saturating_sub(idle(before));
    let busy = total.saturating_sub(idle_delta) as f64;
    (busy / total as f64 * 1000.0).round() / 10.0
}

impl std::fmt::Debug for SandboxRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxRegistry")
            .field("backend", &self.backend.kind())
            .field("sandboxes", &self.lock_snapshot().len())
            .finish()
    }
}

/// Count of sandboxes per status, for summaries.
pub fn status_counts(sandboxes: &[Sandbox]) -> HashMap<SandboxStatus, usize> {
    let mut counts = HashMap::new();
    for sb in sandboxes {
        *counts.entry(sb.status).or_insert(0) += 1;
    }
    counts
}
