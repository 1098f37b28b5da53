//! Reads, writes and merges the agent configuration document inside a sandbox.

use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::schema::{
    build_sandbox_document, channel_to_sandbox, host_config_from_document, managed_patch,
    managed_providers, HostAgentConfig,
};
use crate::bus::{Event, EventBus};
use crate::sandbox::exec::shell_path;
use crate::sandbox::{SandboxError, SandboxRegistry};

/// Default location of the agent's document inside a sandbox.
pub const DEFAULT_SANDBOX_CONFIG_PATH: &str = "~/.agent/config.json";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Failed to read sandbox config: {0}")]
    Read(String),

    #[error("Failed to write sandbox config: {0}")]
    Write(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),
}

pub struct ConfigSyncEngine {
    registry: Arc<SandboxRegistry>,
    bus: Arc<EventBus>,
    config_path: String,
    timeout: Duration,
}

impl ConfigSyncEngine {
    pub fn new(registry: Arc<SandboxRegistry>, bus: Arc<EventBus>) -> Self {
        Self {
            registry,
            bus,
            config_path: DEFAULT_SANDBOX_CONFIG_PATH.to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_config_path(mut self, path: impl Into<String>) -> Self {
        self.config_path = path.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn config_path(&self) -> &str {
        &self.config_path
    }

    /// Read the document at `path` (the default path when `None`).
    ///
    /// A missing file reads as an empty object.
    pub async fn read_from_sandbox(&self, name: &str, path: Option<&str>) -> Result<Value, SyncError> {
        let path = path.unwrap_or(&self.config_path);
        let script = format!("cat {p} 2>/dev/null || echo '{{}}'", p = shell_path(path));
        let result = self.registry.execute_command(name, &script, self.timeout).await;
        if !result.success {
            return Err(SyncError::Read(result.error_message()));
        }

        let text = result.stdout.trim();
        if text.is_empty() {
            return Ok(Value::Object(Map::new()));
        }
        let doc: Value = serde_json::from_str(text)
            .map_err(|e| SyncError::Read(format!("{} is not valid JSON: {}", path, e)))?;
        if !doc.is_object() {
            return Err(SyncError::Read(format!("{} is not a JSON object", path)));
        }
        Ok(doc)
    }

    /// Write `doc` to `path`, backing up any existing file first.
    pub async fn write_to_sandbox(&self, name: &str, doc: &Value, path: Option<&str>) -> bool {
        let path = path.unwrap_or(&self.config_path);
        let body = match serde_json::to_string_pretty(doc) {
            Ok(body) => body,
            Err(e) => {
                warn!(sandbox = %name, error = %e, "Failed to serialize sandbox config");
                return false;
            }
        };
        let script = write_script(path, &body, &backup_suffix());
        let result = self.registry.execute_command(name, &script, self.timeout).await;
        if !result.success {
            warn!(sandbox = %name, path = %path, error = %result.error_message(), "Failed to write sandbox config");
            return false;
        }
        debug!(sandbox = %name, path = %path, "Sandbox config written");
        true
    }

    /// Push a host configuration into its sandbox.
    ///
    /// With `merge`, only host-managed fields of the current document change;
    /// otherwise the full generated document replaces it.
    pub async fn sync_host_to_sandbox(&self, config: &HostAgentConfig, merge: bool) -> bool {
        let sandbox = config.sandbox.as_str();
        let doc = if merge {
            match self.read_from_sandbox(sandbox, None).await {
                Ok(current) => merge_into(&current, config),
                Err(e) => {
                    warn!(sandbox = %sandbox, error = %e, "Cannot merge into sandbox config");
                    return false;
                }
            }
        } else {
            build_sandbox_document(config)
        };

        if !self.write_to_sandbox(sandbox, &doc, None).await {
            return false;
        }
        info!(sandbox = %sandbox, merge, "Host config synced to sandbox");
        self.bus.publish(Event::ConfigUpdated {
            sandbox: sandbox.to_string(),
        });
        true
    }

    /// Build a host configuration from the sandbox's current document.
    pub async fn sync_sandbox_to_host(&self, name: &str) -> Result<HostAgentConfig, SyncError> {
        let doc = self.read_from_sandbox(name, None).await?;
        Ok(host_config_from_document(&doc, name))
    }
}

/// Apply the host-managed fields of `config` onto `base`.
///
/// Everything else in `base` is preserved. Applying twice gives the same
/// document as applying once.
pub fn merge_into(base: &Value, config: &HostAgentConfig) -> Value {
    let mut doc = match base {
        Value::Object(_) => base.clone(),
        _ => Value::Object(Map::new()),
    };

    for (path, value) in managed_patch(config) {
        set_path(&mut doc, &path, value);
    }

    for (name, block) in managed_providers(config) {
        let provider = object_at(&mut doc, &["providers", name.as_str()]);
        if let Value::Object(fields) = block {
            for (k, v) in fields {
                provider.insert(k, v);
            }
        }
    }

    for (id, host_block) in &config.channels {
        let enabled = config.channel_enabled(id);
        if enabled {
            // Enabled on the host: the host's block wins.
            let channels = object_at(&mut doc, &["channels"]);
            channels.insert(id.clone(), channel_to_sandbox(id, host_block));
        } else {
            // Otherwise only the flag moves, leaving sandbox-side credentials alone.
            let channel = object_at(&mut doc, &["channels", id.as_str()]);
            channel.insert("enabled".to_string(), Value::Bool(false));
        }
    }

    doc
}

/// Object at `path`, creating (or replacing non-object values with) empty objects on the way.
fn object_at<'a>(doc: &'a mut Value, path: &[&str]) -> &'a mut Map<String, Value> {
    let mut current = doc;
    for key in path {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let map = match current {
            Value::Object(map) => map,
            _ => unreachable!("replaced with an object above"),
        };
        current = map
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    match current {
        Value::Object(map) => map,
        _ => unreachable!("replaced with an object above"),
    }
}

fn set_path(doc: &mut Value, path: &[&str], value: Value) {
    if let Some((last, parents)) = path.split_last() {
        object_at(doc, parents).insert(last.to_string(), value);
    }
}

/// `YYYYmmdd_HHMMSS_micro` suffix for backups.
fn backup_suffix() -> String {
    chrono::Local::now().format("%Y%m%d_%H%M%S_%6f").to_string()
}

/// Shell script that backs up, creates the parent directory and writes `body`.
///
/// The heredoc delimiter is quoted (no expansion) and unique per write so no
/// document content can terminate it early.
fn write_script(path: &str, body: &str, suffix: &str) -> String {
    let target = shell_path(path);
    let backup = shell_path(&format!("{}.bak.{}", path, suffix));
    let delimiter = format!("SANDBOT_EOF_{}", uuid::Uuid::new_v4().simple());
    format!(
        "[ -f {target} ] && cp {target} {backup} || true\n\
         mkdir -p \"$(dirname {target})\"\n\
         cat > {target} <<'{delim}'\n\
         {body}\n\
         {delim}\n",
        target = target,
        backup = backup,
        delim = delimiter,
        body = body,
    )
}
