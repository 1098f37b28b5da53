#![cfg(unix)]

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use sandbot::bus::{Event, EventKind};
use sandbot::ports::PortAllocator;
use sandbot::sandbox::SandboxStatus;
use sandbot::supervisor::{
    BridgeManager, GatewayFleet, GatewayManager, GatewayStartOptions, LogStream, ManagedProcess,
    ProcessKind, ProcessSettings, ProcessStatus, StartRequest,
};
use sandbot::sync::{ConfigSyncEngine, HostAgentConfig};

fn settings(command: &str) -> ProcessSettings {
    ProcessSettings {
        command_template: command.to_string(),
        cleanup_pattern: None,
        grace_period: Duration::from_millis(300),
        stop_timeout: Duration::from_secs(2),
        restart_delay: Duration::from_millis(50),
        ..ProcessSettings::default()
    }
}

fn ports() -> Arc<PortAllocator> {
    let (start, end) = common::free_range(20);
    Arc::new(PortAllocator::new(start, end))
}

#[tokio::test]
async fn test_fresh_sandbox_start_scenario() {
    let (registry, bus) = common::local_registry(&[("ubuntu-1", SandboxStatus::Stopped)]);
    let sandboxes = registry.list_sandboxes().await.unwrap();
    assert_eq!(sandboxes.len(), 1);
    assert_eq!(sandboxes[0].status, SandboxStatus::Stopped);

    let ports = ports();
    let (start, end) = ports.range();
    let process = ManagedProcess::new(
        "ubuntu-1",
        ProcessKind::Gateway,
        settings("echo listening on {port}; exec sleep 30"),
        Arc::clone(&registry),
        Arc::clone(&ports),
        bus,
    );

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    process.on_status(move |status, _| sink.lock().unwrap().push(status));

    assert!(process.start(StartRequest::default()).await);
    assert_eq!(process.status(), ProcessStatus::Running);
    let port = process.port().expect("port assigned");
    assert!(port >= start && port <= end);
    assert!(process.pid().is_some());
    assert!(registry.is_running("ubuntu-1"));
    assert_eq!(ports.port_for("ubuntu-1:gateway"), Some(port));

    // Starting again is a no-op success.
    assert!(process.start(StartRequest::default()).await);

    let lines = process.tail(10);
    assert!(lines
        .iter()
        .any(|l| l.stream == LogStream::Stdout && l.line == format!("listening on {}", port)));

    assert!(process.stop().await);
    assert_eq!(process.status(), ProcessStatus::Stopped);
    assert!(process.pid().is_none());
    assert_eq!(ports.port_for("ubuntu-1:gateway"), None);

    let seen = seen.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            ProcessStatus::Starting,
            ProcessStatus::Running,
            ProcessStatus::Stopping,
            ProcessStatus::Stopped
        ]
    );
}

#[tokio::test]
async fn test_early_exit_ends_in_error() {
    let (registry, bus) = common::local_registry(&[("ubuntu-1", SandboxStatus::Running)]);
    let ports = ports();
    let process = ManagedProcess::new(
        "ubuntu-1",
        ProcessKind::Gateway,
        settings("echo boom; exit 3"),
        registry,
        Arc::clone(&ports),
        bus,
    );

    assert!(!process.start(StartRequest::default()).await);
    assert_eq!(process.status(), ProcessStatus::Error);
    let error = process.last_error().unwrap_or_default();
    assert!(error.contains("boom"), "unexpected error text: {}", error);
    assert_eq!(ports.port_for("ubuntu-1:gateway"), None);

    // Stop after a crash is a no-op success and leaves the status alone.
    assert!(process.stop().await);
    assert_eq!(process.status(), ProcessStatus::Error);
}

#[tokio::test]
async fn test_silent_early_exit_reports_exit_status() {
    let (registry, bus) = common::local_registry(&[("ubuntu-1", SandboxStatus::Running)]);
    let process = ManagedProcess::new(
        "ubuntu-1",
        ProcessKind::Gateway,
        settings("exit 7"),
        registry,
        ports(),
        bus,
    );
    assert!(!process.start(StartRequest::default()).await);
    let error = process.last_error().unwrap_or_default();
    assert!(error.contains("exited during startup"), "unexpected error text: {}", error);
}

#[tokio::test]
async fn test_exit_after_grace_reads_as_stopped() {
    let (registry, bus) = common::local_registry(&[("ubuntu-1", SandboxStatus::Running)]);
    let ports = ports();
    let process = ManagedProcess::new(
        "ubuntu-1",
        ProcessKind::Gateway,
        settings("sleep 0.8"),
        registry,
        Arc::clone(&ports),
        bus,
    );
    assert!(process.start(StartRequest::default()).await);
    assert_eq!(process.status(), ProcessStatus::Running);

    let mut waited = Duration::ZERO;
    while process.status() == ProcessStatus::Running && waited < Duration::from_secs(5) {
        tokio::time::sleep(Duration::from_millis(50)).await;
        waited += Duration::from_millis(50);
    }
    assert_eq!(process.status(), ProcessStatus::Stopped);
    assert!(process.last_error().unwrap_or_default().contains("exited"));
    assert_eq!(ports.port_for("ubuntu-1:gateway"), None);
    assert!(process.stop().await);
}

#[tokio::test]
async fn test_reserved_port_conflict_fails_start() {
    let (registry, bus) = common::local_registry(&[("ubuntu-1", SandboxStatus::Running)]);
    let ports = ports();
    let (start, _) = ports.range();
    assert_eq!(ports.reserve_port("other:gateway", start), Ok(true));

    let process = ManagedProcess::new(
        "ubuntu-1",
        ProcessKind::Gateway,
        settings("exec sleep 30"),
        registry,
        Arc::clone(&ports),
        bus,
    );
    assert!(!process.start(StartRequest::with_port(start)).await);
    assert_eq!(process.status(), ProcessStatus::Error);
    assert_eq!(ports.port_for("other:gateway"), Some(start));
}

#[tokio::test]
async fn test_status_and_logs_reach_the_bus() {
    let (registry, bus) = common::local_registry(&[("ubuntu-1", SandboxStatus::Running)]);
    let statuses = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&statuses);
    bus.subscribe(EventKind::AgentStatusChanged, move |event| {
        if let Event::AgentStatusChanged { status, .. } = event {
            sink.lock().unwrap().push(*status);
        }
    });
    let mut queue = bus.receiver();

    let process = ManagedProcess::new(
        "ubuntu-1",
        ProcessKind::Gateway,
        settings("echo hello >&2; exec sleep 30"),
        registry,
        ports(),
        Arc::clone(&bus),
    );
    assert!(process.start(StartRequest::default()).await);
    assert!(process.stop().await);

    assert!(statuses.lock().unwrap().contains(&ProcessStatus::Running));
    let mut saw_log = false;
    while let Ok(event) = queue.try_recv() {
        if let Event::AgentLog { stream, line, .. } = event {
            saw_log |= stream == LogStream::Stderr && line == "hello";
        }
    }
    assert!(saw_log);
}

#[tokio::test]
async fn test_fleet_runs_gateways_side_by_side() {
    let (registry, bus) = common::local_registry(&[
        ("alpha", SandboxStatus::Stopped),
        ("beta", SandboxStatus::Stopped),
    ]);
    let fleet = GatewayFleet::new(registry, ports(), bus, settings("exec sleep 30"));

    let changes = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&changes);
    fleet.on_status(move |sandbox, status, _| {
        sink.lock().unwrap().push((sandbox.to_string(), status));
    });

    let (a, b) = tokio::join!(fleet.start("alpha", None), fleet.start("beta", None));
    assert!(a && b);
    let pa = fleet.port("alpha").await.unwrap();
    let pb = fleet.port("beta").await.unwrap();
    assert_ne!(pa, pb);
    assert_eq!(fleet.infos().await.len(), 2);

    assert!(fleet.stop("ghost").await);
    assert_eq!(fleet.status("ghost").await, ProcessStatus::Stopped);

    fleet.stop_all().await;
    let statuses = fleet.statuses().await;
    assert!(statuses.values().all(|s| *s == ProcessStatus::Stopped));
    assert!(changes
        .lock()
        .unwrap()
        .contains(&("beta".to_string(), ProcessStatus::Running)));
}

#[tokio::test]
async fn test_explicit_port_outside_range_starts() {
    let (registry, bus) = common::local_registry(&[("ubuntu-1", SandboxStatus::Running)]);
    let ports = ports();
    let (start, end) = ports.range();
    let outside = common::free_range(0).0;
    if (start..=end).contains(&outside) {
        return;
    }

    let process = ManagedProcess::new(
        "ubuntu-1",
        ProcessKind::Gateway,
        settings("exec sleep 30"),
        registry,
        Arc::clone(&ports),
        bus,
    );
    assert!(process.start(StartRequest::with_port(outside)).await);
    assert_eq!(process.status(), ProcessStatus::Running);
    assert_eq!(process.port(), Some(outside));
    assert_eq!(ports.port_for("ubuntu-1:gateway"), Some(outside));

    assert!(process.stop().await);
    assert_eq!(ports.port_for("ubuntu-1:gateway"), None);
}

struct GatewayFixture {
    manager: GatewayManager,
    ports: Arc<PortAllocator>,
    path: std::path::PathBuf,
    _dir: tempfile::TempDir,
}

fn gateway_fixture(sandboxes: &[(&str, SandboxStatus)]) -> GatewayFixture {
    let (registry, bus) = common::local_registry(sandboxes);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agent").join("config.json");
    let sync = ConfigSyncEngine::new(Arc::clone(&registry), Arc::clone(&bus))
        .with_config_path(path.to_string_lossy().into_owned());
    let ports = ports();
    let manager = GatewayManager::new(registry, Arc::clone(&ports), bus, settings("exec sleep 30"))
        .with_sync(Arc::new(sync));
    GatewayFixture {
        manager,
        ports,
        path,
        _dir: dir,
    }
}

fn synced_options() -> GatewayStartOptions {
    let mut config = HostAgentConfig::new("main", "ubuntu-1");
    config.gateway.port = 1;
    GatewayStartOptions {
        port: None,
        host_config: Some(config),
        merge: true,
    }
}

#[tokio::test]
async fn test_gateway_writes_assigned_port_before_spawn() {
    let fx = gateway_fixture(&[("ubuntu-1", SandboxStatus::Running)]);

    assert!(fx.manager.start("ubuntu-1", synced_options()).await);
    let process = fx.manager.current().await.unwrap();
    let port = process.port().expect("port assigned");

    let doc: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&fx.path).unwrap()).unwrap();
    assert_eq!(doc["gateway"]["port"], port);

    assert!(fx.manager.stop().await);
    assert!(fx.ports.in_use().is_empty());
}

#[tokio::test]
async fn test_gateway_sync_failure_is_start_error() {
    let fx = gateway_fixture(&[("ubuntu-1", SandboxStatus::Running)]);
    std::fs::create_dir_all(fx.path.parent().unwrap()).unwrap();
    std::fs::write(&fx.path, "{ not json").unwrap();

    assert!(!fx.manager.start("ubuntu-1", synced_options()).await);
    assert_eq!(fx.manager.status().await, ProcessStatus::Error);
    let info = fx.manager.info().await.unwrap();
    assert!(info.last_error.is_some());
    assert!(fx.ports.in_use().is_empty());
    assert_eq!(std::fs::read_to_string(&fx.path).unwrap(), "{ not json");
}

#[tokio::test]
async fn test_gateway_switching_sandbox_stops_previous() {
    let fx = gateway_fixture(&[
        ("ubuntu-1", SandboxStatus::Running),
        ("debian-1", SandboxStatus::Running),
    ]);

    assert!(fx.manager.start("ubuntu-1", GatewayStartOptions::default()).await);
    let first = fx.manager.current().await.unwrap();
    assert!(fx.ports.port_for("ubuntu-1:gateway").is_some());

    assert!(fx.manager.start("debian-1", GatewayStartOptions::default()).await);
    assert_eq!(first.status(), ProcessStatus::Stopped);
    assert_eq!(fx.ports.port_for("ubuntu-1:gateway"), None);

    let second = fx.manager.current().await.unwrap();
    assert_eq!(second.sandbox(), "debian-1");
    assert_eq!(second.status(), ProcessStatus::Running);
    assert!(fx.ports.port_for("debian-1:gateway").is_some());

    assert!(fx.manager.stop().await);
}

#[tokio::test]
async fn test_bridge_never_touches_ipc_port() {
    let (registry, bus) = common::local_registry(&[("ubuntu-1", SandboxStatus::Running)]);
    let ports = ports();
    let ipc_port = common::free_range(0).0;
    assert_eq!(ports.reserve_port("automation", ipc_port), Ok(true));

    let bridge = BridgeManager::new(
        registry,
        Arc::clone(&ports),
        bus,
        settings("echo bridge {host}:{port}; exec sleep 30"),
        ipc_port,
    );
    assert!(bridge.start("ubuntu-1").await);
    assert_eq!(bridge.status().await, ProcessStatus::Running);
    assert_eq!(ports.port_for("ubuntu-1:bridge"), None);
    assert!(bridge
        .logs(10)
        .await
        .iter()
        .any(|l| l.line.ends_with(&format!(":{}", ipc_port))));

    assert!(bridge.stop().await);
    assert_eq!(bridge.status().await, ProcessStatus::Stopped);
    assert_eq!(ports.port_for("automation"), Some(ipc_port));
    assert_eq!(ports.in_use().len(), 1);
}
