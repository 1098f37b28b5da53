//! Host-side agent configuration and its translation to the sandbox document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tracing::warn;

use super::casing::{keys_to_host_casing, keys_to_sandbox_casing};
use crate::sandbox::paths::to_host_path;

// ---------------------------------------------------------------------------
// Host agent config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ProviderSettings {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewaySettings {
    #[serde(default = "default_gateway_host")]
    pub host: String,
    #[serde(default = "default_gateway_port")]
    pub port: u16,
}

fn default_gateway_host() -> String {
    "0.0.0.0".into()
}
fn default_gateway_port() -> u16 {
    18790
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            host: default_gateway_host(),
            port: default_gateway_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebSearchSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_max_results")]
    pub max_results: u32,
}

fn default_max_results() -> u32 {
    5
}

impl Default for WebSearchSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: String::new(),
            max_results: default_max_results(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_bridge_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub auto_connect: bool,
}

fn default_bridge_port() -> u16 {
    crate::ipc::DEFAULT_IPC_PORT
}
fn default_true() -> bool {
    true
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            host: String::new(),
            port: default_bridge_port(),
            auto_connect: true,
        }
    }
}

/// Host-side configuration of one sandboxed agent (snake_case on disk).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostAgentConfig {
    pub name: String,
    /// Sandbox the agent runs in.
    #[serde(default)]
    pub sandbox: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Workspace path as seen inside the sandbox.
    #[serde(default = "default_workspace")]
    pub workspace: String,
    #[serde(default)]
    pub workspace_host_path: Option<String>,
    /// The workspace lives on a host drive mount.
    #[serde(default)]
    pub sync_to_mount: bool,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_iterations")]
    pub max_tool_iterations: u32,
    #[serde(default = "default_memory_window")]
    pub memory_window: u32,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderSettings>,
    #[serde(default)]
    pub gateway: GatewaySettings,
    #[serde(default)]
    pub web_search: WebSearchSettings,
    #[serde(default)]
    pub bridge: BridgeSettings,
    /// Channel id -> snake_case settings object carrying an `enabled` flag.
    #[serde(default)]
    pub channels: BTreeMap<String, Value>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

fn default_model() -> String {
    "anthropic/claude-sonnet-4-5".into()
}
fn default_workspace() -> String {
    "~/.agent/workspace".into()
}
fn default_max_tokens() -> u32 {
    8192
}
fn default_temperature() -> f64 {
    0.7
}
fn default_max_iterations() -> u32 {
    20
}
fn default_memory_window() -> u32 {
    50
}

impl HostAgentConfig {
    pub fn new(name: impl Into<String>, sandbox: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sandbox: sandbox.into(),
            model: default_model(),
            workspace: default_workspace(),
            workspace_host_path: None,
            sync_to_mount: false,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            max_tool_iterations: default_max_iterations(),
            memory_window: default_memory_window(),
            providers: BTreeMap::new(),
            gateway: GatewaySettings::default(),
            web_search: WebSearchSettings::default(),
            bridge: BridgeSettings::default(),
            channels: BTreeMap::new(),
            created_at: None,
            updated_at: None,
        }
    }

    /// Whether the host marks a channel as enabled.
    pub fn channel_enabled(&self, id: &str) -> bool {
        self.channels
            .get(id)
            .and_then(|c| c.get("enabled"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Channel table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Bool,
    Text,
    OptionalText,
    List,
    Port,
}

impl FieldKind {
    fn default_value(&self) -> Value {
        match self {
            FieldKind::Bool => Value::Bool(false),
            FieldKind::Text => Value::String(String::new()),
            FieldKind::OptionalText | FieldKind::Port => Value::Null,
            FieldKind::List => Value::Array(Vec::new()),
        }
    }
}

/// Known channel and the host-side (snake_case) fields it carries.
#[derive(Debug)]
pub struct ChannelSpec {
    pub id: &'static str,
    pub fields: &'static [(&'static str, FieldKind)],
}

pub const CHANNELS: &[ChannelSpec] = &[
    ChannelSpec {
        id: "telegram",
        fields: &[
            ("enabled", FieldKind::Bool),
            ("token", FieldKind::Text),
            ("allow_from", FieldKind::List),
            ("proxy", FieldKind::OptionalText),
        ],
    },
    ChannelSpec {
        id: "discord",
        fields: &[
            ("enabled", FieldKind::Bool),
            ("token", FieldKind::Text),
            ("allow_from", FieldKind::List),
        ],
    },
    ChannelSpec {
        id: "feishu",
        fields: &[
            ("enabled", FieldKind::Bool),
            ("app_id", FieldKind::Text),
            ("app_secret", FieldKind::Text),
            ("encrypt_key", FieldKind::OptionalText),
            ("verification_token", FieldKind::OptionalText),
            ("allow_from", FieldKind::List),
        ],
    },
    ChannelSpec {
        id: "slack",
        fields: &[
            ("enabled", FieldKind::Bool),
            ("bot_token", FieldKind::Text),
            ("app_token", FieldKind::Text),
            ("allow_from", FieldKind::List),
        ],
    },
    ChannelSpec {
        id: "whatsapp",
        fields: &[
            ("enabled", FieldKind::Bool),
            ("bridge_url", FieldKind::Text),
            ("allow_from", FieldKind::List),
        ],
    },
    ChannelSpec {
        id: "dingtalk",
        fields: &[
            ("enabled", FieldKind::Bool),
            ("client_id", FieldKind::Text),
            ("client_secret", FieldKind::Text),
            ("allow_from", FieldKind::List),
        ],
    },
    ChannelSpec {
        id: "qq",
        fields: &[
            ("enabled", FieldKind::Bool),
            ("app_id", FieldKind::Text),
            ("secret", FieldKind::Text),
            ("allow_from", FieldKind::List),
        ],
    },
    ChannelSpec {
        id: "email",
        fields: &[
            ("enabled", FieldKind::Bool),
            ("imap_host", FieldKind::Text),
            ("imap_port", FieldKind::Port),
            ("smtp_host", FieldKind::Text),
            ("smtp_port", FieldKind::Port),
            ("username", FieldKind::Text),
            ("password", FieldKind::Text),
            ("allow_from", FieldKind::List),
        ],
    },
];

pub fn channel_spec(id: &str) -> Option<&'static ChannelSpec> {
    CHANNELS.iter().find(|c| c.id == id)
}

/// Host channel block -> sandbox channel block.
///
/// Known channels get every declared field (defaults fill the gaps); extra
/// fields and unknown channels pass through with their keys recased.
pub fn channel_to_sandbox(id: &str, host_block: &Value) -> Value {
    let mut block = match host_block {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    if let Some(spec) = channel_spec(id) {
        for (field, kind) in spec.fields {
            block
                .entry(field.to_string())
                .or_insert_with(|| kind.default_value());
        }
    }
    keys_to_sandbox_casing(&Value::Object(block))
}

/// Sandbox channel block -> host channel block.
pub fn channel_to_host(id: &str, sandbox_block: &Value) -> Value {
    let mut host = keys_to_host_casing(sandbox_block);
    if let (Some(spec), Value::Object(map)) = (channel_spec(id), &mut host) {
        for (field, kind) in spec.fields {
            map.entry(field.to_string())
                .or_insert_with(|| kind.default_value());
        }
    }
    host
}

// ---------------------------------------------------------------------------
// Document construction
// ---------------------------------------------------------------------------

fn provider_block(p: &ProviderSettings) -> Value {
    json!({
        "apiKey": p.api_key,
        "apiBase": p.api_base,
        "model": p.model,
    })
}

fn web_search_key(config: &HostAgentConfig) -> &str {
    if config.web_search.enabled {
        &config.web_search.api_key
    } else {
        ""
    }
}

/// The complete sandbox document for a host configuration.
pub fn build_sandbox_document(config: &HostAgentConfig) -> Value {
    let providers: Map<String, Value> = config
        .providers
        .iter()
        .map(|(name, p)| (name.clone(), provider_block(p)))
        .collect();
    let channels: Map<String, Value> = config
        .channels
        .iter()
        .map(|(id, block)| (id.clone(), channel_to_sandbox(id, block)))
        .collect();

    json!({
        "agents": {
            "defaults": {
                "workspace": config.workspace,
                "model": config.model,
                "maxTokens": config.max_tokens,
                "temperature": config.temperature,
                "maxToolIterations": config.max_tool_iterations,
                "memoryWindow": config.memory_window,
            }
        },
        "providers": providers,
        "gateway": {
            "host": config.gateway.host,
            "port": config.gateway.port,
        },
        "tools": {
            "web": {
                "search": {
                    "apiKey": web_search_key(config),
                    "maxResults": config.web_search.max_results,
                }
            },
            "bridge": {
                "enabled": config.bridge.enabled,
                "host": config.bridge.host,
                "port": config.bridge.port,
                "autoConnect": config.bridge.auto_connect,
            }
        },
        "channels": channels,
    })
}

/// The host-managed subset, as `(path, value)` pairs in sandbox casing.
///
/// Channels are not included; their merge rule depends on the enabled flag.
pub fn managed_patch(config: &HostAgentConfig) -> Vec<(Vec<&'static str>, Value)> {
    vec![
        (vec!["agents", "defaults", "model"], json!(config.model)),
        (vec!["agents", "defaults", "workspace"], json!(config.workspace)),
        (vec!["gateway", "host"], json!(config.gateway.host)),
        (vec!["gateway", "port"], json!(config.gateway.port)),
        (vec!["tools", "web", "search", "apiKey"], json!(web_search_key(config))),
        (vec!["tools", "bridge", "port"], json!(config.bridge.port)),
    ]
}

/// Provider blocks as patched by a merge.
pub fn managed_providers(config: &HostAgentConfig) -> Vec<(String, Value)> {
    config
        .providers
        .iter()
        .map(|(name, p)| (name.clone(), provider_block(p)))
        .collect()
}

// ---------------------------------------------------------------------------
// Reverse extraction
// ---------------------------------------------------------------------------

fn lookup<'a>(doc: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(doc, |v, key| v.get(key))
}

fn str_at(doc: &Value, path: &[&str]) -> Option<String> {
    lookup(doc, path).and_then(Value::as_str).map(str::to_string)
}

/// Integer at `path` that fits `T`; out-of-range values are skipped.
fn int_at<T: TryFrom<u64>>(doc: &Value, path: &[&str]) -> Option<T> {
    let raw = lookup(doc, path).and_then(Value::as_u64)?;
    match T::try_from(raw) {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(field = %path.join("."), value = raw, "Ignoring out-of-range value in sandbox document");
            None
        }
    }
}

/// Build a host configuration for `sandbox` from its sandbox document.
pub fn host_config_from_document(doc: &Value, sandbox: &str) -> HostAgentConfig {
    let mut config = HostAgentConfig::new(sandbox, sandbox);
    let defaults = ["agents", "defaults"];

    if let Some(model) = str_at(doc, &[defaults[0], defaults[1], "model"]) {
        config.model = model;
    }
    if let Some(workspace) = str_at(doc, &[defaults[0], defaults[1], "workspace"]) {
        if let Some(host_path) = to_host_path(&workspace) {
            config.workspace_host_path = Some(host_path);
            config.sync_to_mount = true;
        }
        config.workspace = workspace;
    }
    if let Some(v) = int_at(doc, &[defaults[0], defaults[1], "maxTokens"]) {
        config.max_tokens = v;
    }
    if let Some(v) = lookup(doc, &[defaults[0], defaults[1], "temperature"]).and_then(Value::as_f64) {
        config.temperature = v;
    }
    if let Some(v) = int_at(doc, &[defaults[0], defaults[1], "maxToolIterations"]) {
        config.max_tool_iterations = v;
    }
    if let Some(v) = int_at(doc, &[defaults[0], defaults[1], "memoryWindow"]) {
        config.memory_window = v;
    }

    if let Some(Value::Object(providers)) = doc.get("providers") {
        for (name, block) in providers {
            if let Ok(p) = serde_json::from_value::<ProviderSettings>(keys_to_host_casing(block)) {
                config.providers.insert(name.clone(), p);
            }
        }
    }

    if let Some(host) = str_at(doc, &["gateway", "host"]) {
        config.gateway.host = host;
    }
    if let Some(port) = int_at::<u16>(doc, &["gateway", "port"]).filter(|p| *p != 0) {
        config.gateway.port = port;
    }

    if let Some(key) = str_at(doc, &["tools", "web", "search", "apiKey"]) {
        config.web_search.enabled = !key.is_empty();
        config.web_search.api_key = key;
    }
    if let Some(v) = int_at(doc, &["tools", "web", "search", "maxResults"]) {
        config.web_search.max_results = v;
    }

    if let Some(bridge) = lookup(doc, &["tools", "bridge"]) {
        if let Ok(b) = serde_json::from_value::<BridgeSettings>(keys_to_host_casing(bridge)) {
            config.bridge = b;
        }
    }

    if let Some(Value::Object(channels)) = doc.get("channels") {
        for (id, block) in channels {
            config.channels.insert(id.clone(), channel_to_host(id, block));
        }
    }

    config
}
