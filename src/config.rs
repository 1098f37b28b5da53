use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ipc::DEFAULT_IPC_PORT;
use crate::ports::{DEFAULT_PORT_END, DEFAULT_PORT_START};
use crate::sandbox::{RegistryTimeouts, DEFAULT_USER};
use crate::supervisor::ProcessSettings;
use crate::sync::DEFAULT_SANDBOX_CONFIG_PATH;

// ---------------------------------------------------------------------------
// Log config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// text | compact | pretty | json
    #[serde(default = "default_log_format")]
    pub format: String,
    /// local | utc | rfc3339 | custom
    #[serde(default = "default_timestamp_format")]
    pub timestamp_format: String,
    #[serde(default)]
    pub custom_timestamp_format: Option<String>,
    /// Defaults to `~/.sandbot/logs`.
    #[serde(default)]
    pub dir: Option<String>,
    /// Extra `target=level` directives, e.g. `{"tokio_tungstenite": "warn"}`.
    #[serde(default)]
    pub module_levels: HashMap<String, String>,
    #[serde(default = "default_true")]
    pub show_level: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default)]
    pub show_thread_names: bool,
    #[serde(default)]
    pub show_thread_ids: bool,
    #[serde(default)]
    pub show_file: bool,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}
fn default_timestamp_format() -> String {
    "local".into()
}
fn default_true() -> bool {
    true
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            timestamp_format: default_timestamp_format(),
            custom_timestamp_format: None,
            dir: None,
            module_levels: HashMap::new(),
            show_level: true,
            show_target: true,
            show_thread_names: false,
            show_thread_ids: false,
            show_file: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Sandbox config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// WSL on Windows, local elsewhere.
    Auto,
    Wsl,
    Local,
}

impl Default for BackendKind {
    fn default() -> Self {
        BackendKind::Auto
    }
}

impl BackendKind {
    pub fn resolve(self) -> BackendKind {
        match self {
            BackendKind::Auto if cfg!(target_os = "windows") => BackendKind::Wsl,
            BackendKind::Auto => BackendKind::Local,
            other => other,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxSection {
    #[serde(default)]
    pub backend: BackendKind,
    /// Sandboxes known to the local backend.
    #[serde(default)]
    pub local_sandboxes: Vec<String>,
    #[serde(default = "default_user")]
    pub default_user: String,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_list_timeout")]
    pub list_timeout_secs: u64,
    #[serde(default = "default_import_timeout")]
    pub import_timeout_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// WSL version requested when importing.
    #[serde(default = "default_wsl_version")]
    pub wsl_version: u8,
}

fn default_user() -> String {
    DEFAULT_USER.into()
}
fn default_command_timeout() -> u64 {
    60
}
fn default_list_timeout() -> u64 {
    15
}
fn default_import_timeout() -> u64 {
    600
}
fn default_poll_interval() -> u64 {
    5
}
fn default_wsl_version() -> u8 {
    2
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            backend: BackendKind::Auto,
            local_sandboxes: Vec::new(),
            default_user: default_user(),
            command_timeout_secs: default_command_timeout(),
            list_timeout_secs: default_list_timeout(),
            import_timeout_secs: default_import_timeout(),
            poll_interval_secs: default_poll_interval(),
            wsl_version: default_wsl_version(),
        }
    }
}

impl SandboxSection {
    pub fn timeouts(&self) -> RegistryTimeouts {
        RegistryTimeouts {
            list: Duration::from_secs(self.list_timeout_secs),
            lifecycle: Duration::from_secs(self.command_timeout_secs),
            import: Duration::from_secs(self.import_timeout_secs),
            ..RegistryTimeouts::default()
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortsConfig {
    #[serde(default = "default_port_start")]
    pub start: u16,
    #[serde(default = "default_port_end")]
    pub end: u16,
}

fn default_port_start() -> u16 {
    DEFAULT_PORT_START
}
fn default_port_end() -> u16 {
    DEFAULT_PORT_END
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            start: DEFAULT_PORT_START,
            end: DEFAULT_PORT_END,
        }
    }
}

// ---------------------------------------------------------------------------
// Supervised processes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessConfig {
    /// `{port}`, `{host}` and `{sandbox}` are substituted.
    pub command: String,
    #[serde(default)]
    pub cleanup_pattern: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default = "default_grace_ms")]
    pub grace_period_ms: u64,
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
}

fn default_grace_ms() -> u64 {
    2000
}
fn default_stop_timeout() -> u64 {
    5
}
fn default_restart_delay_ms() -> u64 {
    1000
}
fn default_log_capacity() -> usize {
    1000
}

impl ProcessConfig {
    fn with_command(command: &str, cleanup: &str) -> Self {
        Self {
            command: command.into(),
            cleanup_pattern: Some(cleanup.into()),
            user: None,
            grace_period_ms: default_grace_ms(),
            stop_timeout_secs: default_stop_timeout(),
            restart_delay_ms: default_restart_delay_ms(),
            log_capacity: default_log_capacity(),
        }
    }

    pub fn settings(&self) -> ProcessSettings {
        ProcessSettings {
            command_template: self.command.clone(),
            cleanup_pattern: self.cleanup_pattern.clone(),
            user: self.user.clone(),
            grace_period: Duration::from_millis(self.grace_period_ms),
            stop_timeout: Duration::from_secs(self.stop_timeout_secs),
            restart_delay: Duration::from_millis(self.restart_delay_ms),
            log_capacity: self.log_capacity,
        }
    }
}

fn default_gateway_process() -> ProcessConfig {
    ProcessConfig::with_command("agent gateway --port {port}", "agent gateway")
}

fn default_bridge_process() -> ProcessConfig {
    ProcessConfig::with_command(
        "agent bridge --host {host} --port {port}",
        "agent bridge",
    )
}

// ---------------------------------------------------------------------------
// Automation server and sync
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationConfig {
    #[serde(default = "default_automation_host")]
    pub host: String,
    #[serde(default = "default_automation_port")]
    pub port: u16,
}

fn default_automation_host() -> String {
    "127.0.0.1".into()
}
fn default_automation_port() -> u16 {
    DEFAULT_IPC_PORT
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            host: default_automation_host(),
            port: DEFAULT_IPC_PORT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    #[serde(default = "default_sandbox_config_path")]
    pub sandbox_config_path: String,
    /// Host directory with one JSON file per agent configuration.
    #[serde(default)]
    pub store_dir: Option<String>,
}

fn default_sandbox_config_path() -> String {
    DEFAULT_SANDBOX_CONFIG_PATH.into()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sandbox_config_path: default_sandbox_config_path(),
            store_dir: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Root config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub sandbox: SandboxSection,
    #[serde(default)]
    pub ports: PortsConfig,
    #[serde(default = "default_gateway_process")]
    pub gateway: ProcessConfig,
    #[serde(default = "default_bridge_process")]
    pub bridge: ProcessConfig,
    #[serde(default)]
    pub automation: AutomationConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            sandbox: SandboxSection::default(),
            ports: PortsConfig::default(),
            gateway: default_gateway_process(),
            bridge: default_bridge_process(),
            automation: AutomationConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        if self.ports.start == 0 || self.ports.start > self.ports.end {
            bail!(
                "invalid port range {}-{}",
                self.ports.start,
                self.ports.end
            );
        }
        if self.gateway.command.trim().is_empty() {
            bail!("gateway.command must not be empty");
        }
        if self.bridge.command.trim().is_empty() {
            bail!("bridge.command must not be empty");
        }
        if self.sandbox.default_user.trim().is_empty() {
            bail!("sandbox.defaultUser must not be empty");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Paths & loading
// ---------------------------------------------------------------------------

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".sandbot")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

fn expand_home(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest)
    } else {
        PathBuf::from(raw)
    }
}

pub fn log_dir_path(cfg: &AppConfig) -> PathBuf {
    match &cfg.log.dir {
        Some(dir) => expand_home(dir),
        None => config_dir().join("logs"),
    }
}

pub fn store_dir_path(cfg: &AppConfig) -> PathBuf {
    match &cfg.sync.store_dir {
        Some(dir) => expand_home(dir),
        None => crate::sync::store::default_store_dir(),
    }
}

pub fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let p = path.map(PathBuf::from).unwrap_or_else(config_path);

    let cfg = if p.exists() {
        let text = std::fs::read_to_string(&p)
            .with_context(|| format!("reading config from {}", p.display()))?;
        serde_json::from_str::<AppConfig>(&text)
            .with_context(|| format!("parsing config from {}", p.display()))?
    } else {
        AppConfig::default()
    };
    cfg.validate()
        .with_context(|| format!("validating config from {}", p.display()))?;
    Ok(cfg)
}

pub fn save_config(cfg: &AppConfig, path: Option<&Path>) -> Result<()> {
    let p = path.map(PathBuf::from).unwrap_or_else(config_path);

    if let Some(parent) = p.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(cfg)?;
    std::fs::write(&p, json)?;
    Ok(())
}
