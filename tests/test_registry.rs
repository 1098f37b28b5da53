#![cfg(unix)]

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sandbot::bus::EventKind;
use sandbot::sandbox::{SandboxError, SandboxStatus};

#[tokio::test]
async fn test_command_timeout_is_a_result() {
    let (registry, _) = common::local_registry(&[("ubuntu", SandboxStatus::Running)]);

    let started = Instant::now();
    let result = registry
        .execute_command("ubuntu", "sleep 5", Duration::from_millis(300))
        .await;
    assert!(!result.success);
    assert!(result.timed_out);
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_execute_captures_output_and_exit_code() {
    let (registry, _) = common::local_registry(&[("ubuntu", SandboxStatus::Running)]);

    let ok = registry
        .execute_command("ubuntu", "echo hello; echo oops >&2", Duration::from_secs(5))
        .await;
    assert!(ok.success);
    assert_eq!(ok.stdout.trim(), "hello");
    assert_eq!(ok.stderr.trim(), "oops");

    let failed = registry
        .execute_command("ubuntu", "exit 3", Duration::from_secs(5))
        .await;
    assert!(!failed.success);
    assert_eq!(failed.exit_code, 3);
    assert!(!failed.timed_out);
}

#[tokio::test]
async fn test_invalid_name_fails_before_invoking_tool() {
    let (registry, _) = common::local_registry(&[]);
    let result = registry
        .execute_command("bad name; rm -rf /", "echo never", Duration::from_secs(5))
        .await;
    assert!(!result.success);
    assert!(result.stdout.is_empty());
    assert!(result.stderr.contains("Invalid sandbox name"));
}

#[tokio::test]
async fn test_listing_and_lifecycle() {
    let (registry, bus) = common::local_registry(&[
        ("ubuntu", SandboxStatus::Stopped),
        ("debian", SandboxStatus::Running),
    ]);
    let started = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&started);
    bus.subscribe(EventKind::SandboxStarted, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let listed = registry.list_sandboxes().await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(registry.default_sandbox().unwrap().name, "ubuntu");
    assert!(registry.is_running("debian"));
    assert!(!registry.is_running("ubuntu"));

    assert!(registry.start_sandbox("ubuntu").await);
    assert!(registry.is_running("ubuntu"));
    assert!(registry.ensure_running("ubuntu").await);
    assert_eq!(started.load(Ordering::SeqCst), 1);

    assert!(registry.stop_sandbox("ubuntu").await);
    assert!(!registry.is_running("ubuntu"));

    assert!(!registry.start_sandbox("ghost").await);

    assert!(registry.shutdown_all().await);
    assert!(registry.snapshot().iter().all(|s| !s.is_running()));
}

#[tokio::test]
async fn test_import_checks_archive_first() {
    let (registry, _) = common::local_registry(&[]);
    let dir = tempfile::tempdir().unwrap();
    let install_dir = dir.path().join("install");

    let missing = registry
        .import_sandbox(&dir.path().join("missing.tar"), "fresh", &install_dir)
        .await;
    assert!(!missing.success);
    assert!(missing.stderr.contains("Archive not found"));
    assert!(!install_dir.exists());

    let archive = dir.path().join("rootfs.tar");
    std::fs::write(&archive, b"not really a tarball").unwrap();
    let bad_name = registry.import_sandbox(&archive, "", &install_dir).await;
    assert!(!bad_name.success);

    let imported = registry.import_sandbox(&archive, "fresh", &install_dir).await;
    assert!(imported.success, "{}", imported.error_message());
    assert!(install_dir.is_dir());
    let sandbox = registry.get("fresh").unwrap();
    assert_eq!(sandbox.status, SandboxStatus::Stopped);
    assert!(sandbox.is_default);

    let duplicate = registry.import_sandbox(&archive, "fresh", &install_dir).await;
    assert!(!duplicate.success);
}

#[tokio::test]
async fn test_default_and_unregister() {
    let (registry, _) = common::local_registry(&[
        ("ubuntu", SandboxStatus::Stopped),
        ("debian", SandboxStatus::Stopped),
    ]);
    registry.list_sandboxes().await.unwrap();

    assert!(registry.set_default_sandbox("debian").await);
    assert_eq!(registry.default_sandbox().unwrap().name, "debian");
    assert!(!registry.set_default_sandbox("ghost").await);

    assert!(registry.unregister_sandbox("ubuntu").await);
    assert!(registry.get("ubuntu").is_none());
    assert!(!registry.unregister_sandbox("ubuntu").await);
    assert!(!registry.unregister_sandbox("../etc").await);
}

#[test]
fn test_validate_name() {
    use sandbot::sandbox::registry::validate_name;
    assert!(validate_name("Ubuntu-22.04").is_ok());
    assert!(validate_name("my_box").is_ok());
    assert!(matches!(validate_name(""), Err(SandboxError::Validation(_))));
    assert!(matches!(validate_name("a b"), Err(SandboxError::Validation(_))));
    assert!(matches!(validate_name("x;y"), Err(SandboxError::Validation(_))));
}
