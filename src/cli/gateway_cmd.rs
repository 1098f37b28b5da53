//! Gateway commands.
//!
//! `start` runs the gateway in the foreground and streams its output; the
//! other actions work against whatever gateway is running in the sandbox.

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use super::helpers::{print_log_line, App};
use crate::bus::Event;
use crate::config;
use crate::sandbox::exec::shell_quote;
use crate::supervisor::{
    probe_gateway, render_command, GatewayManager, GatewayStartOptions, LogLine, ProcessStatus,
};

#[derive(Subcommand)]
pub enum GatewayAction {
    /// Start the gateway and follow its output until Ctrl-C.
    Start {
        sandbox: String,
        /// Port to bind; assigned from the configured range when omitted.
        #[arg(short, long)]
        port: Option<u16>,
        /// Stored agent configuration to push first (the default one when omitted).
        #[arg(short, long)]
        agent: Option<String>,
        /// Replace the sandbox document instead of merging into it.
        #[arg(long)]
        replace: bool,
    },
    /// Kill gateway processes inside the sandbox.
    Stop { sandbox: String },
    /// Show whether the gateway is running and reachable.
    Status { sandbox: String },
    /// Print recent gateway output from the host log.
    Logs {
        sandbox: String,
        #[arg(short = 'n', long, default_value_t = 50)]
        lines: usize,
    },
    /// WebSocket handshake against the gateway.
    Probe {
        sandbox: String,
        #[arg(short, long)]
        port: Option<u16>,
        #[arg(long)]
        host: Option<String>,
    },
}

pub async fn cmd_gateway(action: GatewayAction) -> Result<()> {
    match action {
        GatewayAction::Start { sandbox, port, agent, replace } => {
            start_foreground(sandbox, port, agent, replace).await
        }
        GatewayAction::Stop { sandbox } => stop(sandbox).await,
        GatewayAction::Status { sandbox } => status(sandbox).await,
        GatewayAction::Logs { sandbox, lines } => logs(sandbox, lines),
        GatewayAction::Probe { sandbox, port, host } => probe(sandbox, port, host).await,
    }
}

async fn start_foreground(
    sandbox: String,
    port: Option<u16>,
    agent: Option<String>,
    replace: bool,
) -> Result<()> {
    let app = App::load()?;
    let agent = match agent {
        Some(name) => Some(name),
        None => app.store.default_name()?,
    };
    let host_config = match agent {
        Some(name) => Some(
            app.store
                .load(&name)
                .with_context(|| format!("loading agent config {}", name))?,
        ),
        None => None,
    };

    let manager = GatewayManager::new(
        Arc::clone(&app.registry),
        Arc::clone(&app.ports),
        Arc::clone(&app.bus),
        app.cfg.gateway.settings(),
    )
    .with_sync(Arc::clone(&app.sync));

    let mut events = app.bus.receiver();
    let started = manager
        .start(
            &sandbox,
            GatewayStartOptions {
                port,
                host_config,
                merge: !replace,
            },
        )
        .await;
    if !started {
        let info = manager.info().await;
        let reason = info
            .and_then(|i| i.last_error)
            .unwrap_or_else(|| "unknown error".to_string());
        bail!("Gateway failed to start in {}: {}", sandbox, reason);
    }
    if let Some(info) = manager.info().await {
        println!(
            "✓ Gateway running in {} on port {} (pid {})",
            sandbox,
            info.port.unwrap_or_default(),
            info.pid.unwrap_or_default()
        );
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("Stopping gateway...");
                manager.stop().await;
                break;
            }
            event = events.recv() => match event {
                Ok(Event::AgentLog { sandbox: sb, stream, line, timestamp, .. }) if sb == sandbox => {
                    print_log_line(&LogLine { timestamp, stream, line });
                }
                Ok(Event::AgentStatusChanged { sandbox: sb, status, message, .. }) if sb == sandbox => {
                    if matches!(status, ProcessStatus::Stopped | ProcessStatus::Error) {
                        println!("Gateway {}: {}", status, message.unwrap_or_default());
                        break;
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "Log output lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    }
    Ok(())
}

/// Gateway port recorded in the sandbox document.
async fn document_port(app: &App, sandbox: &str) -> Option<u16> {
    let doc = app.sync.read_from_sandbox(sandbox, None).await.ok()?;
    doc.pointer("/gateway/port")
        .and_then(|p| p.as_u64())
        .and_then(|p| u16::try_from(p).ok())
}

fn cleanup_pattern(app: &App, sandbox: &str, port: u16) -> String {
    let pattern = app
        .cfg
        .gateway
        .cleanup_pattern
        .clone()
        .unwrap_or_else(|| app.cfg.gateway.command.clone());
    render_command(&pattern, port, "", sandbox)
}

async fn stop(sandbox: String) -> Result<()> {
    let app = App::load()?;
    let port = document_port(&app, &sandbox).await.unwrap_or_default();
    let pattern = cleanup_pattern(&app, &sandbox, port);
    let result = app
        .registry
        .execute_command(
            &sandbox,
            &format!("pkill -f {}", shell_quote(&pattern)),
            Duration::from_secs(app.cfg.gateway.stop_timeout_secs.max(1)),
        )
        .await;
    // pkill exits 1 when nothing matched.
    match result.exit_code {
        0 => println!("✓ Gateway stopped in {}", sandbox),
        1 => println!("No gateway running in {}", sandbox),
        _ => bail!("Failed to stop gateway: {}", result.error_message()),
    }
    Ok(())
}

async fn status(sandbox: String) -> Result<()> {
    let app = App::load()?;
    app.registry.list_sandboxes().await?;
    let Some(sb) = app.registry.get(&sandbox) else {
        bail!("Unknown sandbox: {}", sandbox);
    };
    println!("Sandbox:   {} ({})", sb.name, sb.status);
    if !sb.is_running() {
        println!("Gateway:   stopped");
        return Ok(());
    }

    let port = document_port(&app, &sandbox).await;
    let pattern = cleanup_pattern(&app, &sandbox, port.unwrap_or_default());
    let pids = app
        .registry
        .execute_command(
            &sandbox,
            &format!("pgrep -f {}", shell_quote(&pattern)),
            Duration::from_secs(10),
        )
        .await;
    let pids: Vec<&str> = pids.stdout.split_whitespace().collect();
    if pids.is_empty() {
        println!("Gateway:   stopped");
    } else {
        println!("Gateway:   running (pid {})", pids.join(", "));
    }

    if let Some(port) = port {
        let host = match app.registry.sandbox_ip(&sandbox).await {
            Some(ip) => ip.to_string(),
            None => "127.0.0.1".to_string(),
        };
        let reachable = probe_gateway(&host, port, Duration::from_secs(3)).await;
        println!(
            "Endpoint:  ws://{}:{}/ws ({})",
            host,
            port,
            if reachable { "reachable" } else { "unreachable" }
        );
    }
    Ok(())
}

async fn probe(sandbox: String, port: Option<u16>, host: Option<String>) -> Result<()> {
    let app = App::load()?;
    let port = match port {
        Some(port) => port,
        None => document_port(&app, &sandbox)
            .await
            .with_context(|| format!("no gateway port configured in {}", sandbox))?,
    };
    let host = match host {
        Some(host) => host,
        None => app
            .registry
            .sandbox_ip(&sandbox)
            .await
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "127.0.0.1".to_string()),
    };
    if probe_gateway(&host, port, Duration::from_secs(3)).await {
        println!("✓ ws://{}:{}/ws is reachable", host, port);
        Ok(())
    } else {
        bail!("ws://{}:{}/ws is not reachable", host, port)
    }
}

fn logs(sandbox: String, lines: usize) -> Result<()> {
    let cfg = config::load_config(None)?;
    let dir = config::log_dir_path(&cfg);
    let Some(path) = latest_log_file(&dir)? else {
        println!("No log files in {}", dir.display());
        return Ok(());
    };
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    for line in agent_lines(&text, &sandbox, lines) {
        println!("{}", line);
    }
    Ok(())
}

fn latest_log_file(dir: &Path) -> Result<Option<std::path::PathBuf>> {
    if !dir.exists() {
        return Ok(None);
    }
    let mut files: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("sandbot."))
                .unwrap_or(false)
        })
        .collect();
    // Date-stamped names sort chronologically.
    files.sort();
    Ok(files.pop())
}

/// Last `n` gateway output lines for `sandbox`, in text or JSON log format.
fn agent_lines<'a>(text: &'a str, sandbox: &str, n: usize) -> Vec<&'a str> {
    let text_field = format!("sandbox={}", sandbox);
    let json_field = format!("\"sandbox\":\"{}\"", sandbox);
    let matching: Vec<&str> = text
        .lines()
        .filter(|l| l.contains("sandbot::agent"))
        .filter(|l| l.contains("kind=gateway") || l.contains("\"kind\":\"gateway\""))
        .filter(|l| {
            l.split_whitespace().any(|tok| tok == text_field) || l.contains(&json_field)
        })
        .collect();
    let skip = matching.len().saturating_sub(n);
    matching.into_iter().skip(skip).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_lines_filter() {
        let log = "\
2026-01-01 10:00:00.000  INFO sandbot::agent: hello sandbox=ubuntu kind=gateway stream=stdout
2026-01-01 10:00:01.000  INFO sandbot::agent: other sandbox=ubuntu-2 kind=gateway stream=stdout
2026-01-01 10:00:02.000  INFO sandbot::supervisor: unrelated sandbox=ubuntu
2026-01-01 10:00:03.000  WARN sandbot::agent: bridge sandbox=ubuntu kind=bridge stream=stderr
2026-01-01 10:00:04.000  WARN sandbot::agent: oops sandbox=ubuntu kind=gateway stream=stderr
";
        let lines = agent_lines(log, "ubuntu", 10);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("hello"));
        assert!(lines[1].contains("oops"));

        let last = agent_lines(log, "ubuntu", 1);
        assert_eq!(last.len(), 1);
        assert!(last[0].contains("oops"));
    }

    #[test]
    fn test_latest_log_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(latest_log_file(dir.path()).unwrap().is_none());
        std::fs::write(dir.path().join("sandbot.2026-01-01.log"), "").unwrap();
        std::fs::write(dir.path().join("sandbot.2026-01-02.log"), "").unwrap();
        std::fs::write(dir.path().join("other.txt"), "").unwrap();
        let latest = latest_log_file(dir.path()).unwrap().unwrap();
        assert!(latest.ends_with("sandbot.2026-01-02.log"));
    }
}
