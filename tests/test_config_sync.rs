#![cfg(unix)]

mod common;

use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

use sandbot::bus::{Event, EventKind};
use sandbot::sandbox::SandboxStatus;
use sandbot::sync::{ConfigSyncEngine, HostAgentConfig, ProviderSettings};

struct Fixture {
    engine: ConfigSyncEngine,
    path: std::path::PathBuf,
    _dir: tempfile::TempDir,
    updates: Arc<Mutex<Vec<String>>>,
}

fn fixture() -> Fixture {
    let (registry, bus) = common::local_registry(&[("ubuntu-1", SandboxStatus::Running)]);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agent").join("config.json");

    let updates = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&updates);
    bus.subscribe(EventKind::ConfigUpdated, move |event| {
        if let Event::ConfigUpdated { sandbox } = event {
            sink.lock().unwrap().push(sandbox.clone());
        }
    });

    let engine = ConfigSyncEngine::new(registry, bus)
        .with_config_path(path.to_string_lossy().into_owned());
    Fixture {
        engine,
        path,
        _dir: dir,
        updates,
    }
}

fn host_config() -> HostAgentConfig {
    let mut config = HostAgentConfig::new("main", "ubuntu-1");
    config.model = "openai/gpt-4o".into();
    config.gateway.port = 18791;
    config.providers.insert(
        "openrouter".into(),
        ProviderSettings {
            api_key: "sk-or-1".into(),
            ..Default::default()
        },
    );
    config
}

fn read_file(path: &std::path::Path) -> Value {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

fn backups(path: &std::path::Path) -> usize {
    let parent = path.parent().unwrap();
    std::fs::read_dir(parent)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("config.json.bak."))
        .count()
}

#[tokio::test]
async fn test_missing_document_scenario() {
    let fx = fixture();
    let doc = fx.engine.read_from_sandbox("ubuntu-1", None).await.unwrap();
    assert_eq!(doc, json!({}));

    assert!(fx.engine.sync_host_to_sandbox(&host_config(), true).await);
    let written = read_file(&fx.path);
    let mut keys: Vec<&String> = written.as_object().unwrap().keys().collect();
    keys.sort();
    assert_eq!(keys, vec!["agents", "gateway", "providers", "tools"]);
    assert_eq!(written["agents"]["defaults"]["model"], "openai/gpt-4o");
    assert_eq!(written["gateway"]["port"], 18791);
    assert_eq!(written["providers"]["openrouter"]["apiKey"], "sk-or-1");
    assert_eq!(backups(&fx.path), 0);
    assert_eq!(*fx.updates.lock().unwrap(), vec!["ubuntu-1".to_string()]);
}

#[tokio::test]
async fn test_merge_preserves_unmanaged_sections() {
    let fx = fixture();
    std::fs::create_dir_all(fx.path.parent().unwrap()).unwrap();
    let original = json!({
        "agents": {"defaults": {"model": "old", "maxTokens": 1000}},
        "mcpServers": {"files": {"command": "npx", "args": ["-y", "server-files", "/tmp"]}},
        "channels": {"telegram": {"enabled": true, "token": "sandbox-token"}},
    });
    std::fs::write(&fx.path, serde_json::to_string_pretty(&original).unwrap()).unwrap();

    let mut config = host_config();
    config
        .channels
        .insert("telegram".into(), json!({"enabled": false, "token": "host-token"}));
    assert!(fx.engine.sync_host_to_sandbox(&config, true).await);

    let written = read_file(&fx.path);
    assert_eq!(written["mcpServers"], original["mcpServers"]);
    assert_eq!(written["agents"]["defaults"]["maxTokens"], 1000);
    assert_eq!(written["agents"]["defaults"]["model"], "openai/gpt-4o");
    // Disabled on the host: only the flag changes.
    assert_eq!(written["channels"]["telegram"]["enabled"], false);
    assert_eq!(written["channels"]["telegram"]["token"], "sandbox-token");
    assert_eq!(backups(&fx.path), 1);
}

#[tokio::test]
async fn test_enabled_channel_overwrites_sandbox_block() {
    let fx = fixture();
    std::fs::create_dir_all(fx.path.parent().unwrap()).unwrap();
    std::fs::write(
        &fx.path,
        r#"{"channels": {"telegram": {"enabled": false, "token": "old", "proxy": "socks5://x"}}}"#,
    )
    .unwrap();

    let mut config = host_config();
    config.channels.insert(
        "telegram".into(),
        json!({"enabled": true, "token": "new", "allow_from": ["42"]}),
    );
    assert!(fx.engine.sync_host_to_sandbox(&config, true).await);

    let telegram = &read_file(&fx.path)["channels"]["telegram"];
    assert_eq!(telegram["enabled"], true);
    assert_eq!(telegram["token"], "new");
    assert_eq!(telegram["allowFrom"], json!(["42"]));
    assert_eq!(telegram["proxy"], Value::Null);
}

#[tokio::test]
async fn test_merge_is_idempotent() {
    let fx = fixture();
    std::fs::create_dir_all(fx.path.parent().unwrap()).unwrap();
    std::fs::write(&fx.path, r#"{"extra": [1, 2, 3], "gateway": {"cors": true}}"#).unwrap();

    let config = host_config();
    assert!(fx.engine.sync_host_to_sandbox(&config, true).await);
    let once = read_file(&fx.path);
    assert!(fx.engine.sync_host_to_sandbox(&config, true).await);
    let twice = read_file(&fx.path);
    assert_eq!(once, twice);
    assert_eq!(backups(&fx.path), 2);
}

#[tokio::test]
async fn test_replace_and_pull_back() {
    let fx = fixture();
    std::fs::create_dir_all(fx.path.parent().unwrap()).unwrap();
    std::fs::write(&fx.path, r#"{"extra": true}"#).unwrap();

    let config = host_config();
    assert!(fx.engine.sync_host_to_sandbox(&config, false).await);
    let written = read_file(&fx.path);
    assert!(written.get("extra").is_none());
    assert_eq!(written["tools"]["bridge"]["port"], config.bridge.port);

    let pulled = fx.engine.sync_sandbox_to_host("ubuntu-1").await.unwrap();
    assert_eq!(pulled.sandbox, "ubuntu-1");
    assert_eq!(pulled.model, "openai/gpt-4o");
    assert_eq!(pulled.gateway.port, 18791);
    assert_eq!(pulled.providers["openrouter"].api_key, "sk-or-1");
}

#[tokio::test]
async fn test_invalid_document_is_read_error() {
    let fx = fixture();
    std::fs::create_dir_all(fx.path.parent().unwrap()).unwrap();
    std::fs::write(&fx.path, "{ not json").unwrap();

    assert!(fx.engine.read_from_sandbox("ubuntu-1", None).await.is_err());
    // A merge never overwrites a document it could not read.
    assert!(!fx.engine.sync_host_to_sandbox(&host_config(), true).await);
    assert_eq!(std::fs::read_to_string(&fx.path).unwrap(), "{ not json");
}
