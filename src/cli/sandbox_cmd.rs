//! Sandbox lifecycle commands.

use anyhow::{bail, Result};
use std::path::PathBuf;
use std::time::Duration;

use super::helpers::{human_bytes, App};

pub async fn cmd_list(details: bool, json: bool) -> Result<()> {
    let app = App::load()?;
    let listed = if details {
        app.registry.refresh_details().await
    } else {
        app.registry.list_sandboxes().await
    };
    let sandboxes = match listed {
        Ok(sandboxes) => sandboxes,
        Err(e) if json => {
            println!("{}", e.to_error_report(None, None).to_json()?);
            bail!("Failed to list sandboxes");
        }
        Err(e) => return Err(e.into()),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&sandboxes)?);
        return Ok(());
    }
    if sandboxes.is_empty() {
        println!("No sandboxes.");
        return Ok(());
    }
    for sb in &sandboxes {
        let marker = if sb.is_default { "*" } else { " " };
        print!("{} {:<24} {:<10} v{}", marker, sb.name, sb.status, sb.version);
        if let Some(ip) = sb.ip_address {
            print!("  {}", ip);
        }
        if let Some(res) = &sb.resources {
            print!(
                "  cpu {:.1}%  mem {}/{}  disk {}/{}",
                res.cpu_percent,
                human_bytes(res.memory_used),
                human_bytes(res.memory_total),
                human_bytes(res.disk_used),
                human_bytes(res.disk_total)
            );
        }
        println!();
    }
    Ok(())
}

pub async fn cmd_start(name: String) -> Result<()> {
    let app = App::load()?;
    if !app.registry.start_sandbox(&name).await {
        bail!("Failed to start sandbox {}", name);
    }
    println!("✓ Started {}", name);
    Ok(())
}

pub async fn cmd_stop(name: String) -> Result<()> {
    let app = App::load()?;
    if !app.registry.stop_sandbox(&name).await {
        bail!("Failed to stop sandbox {}", name);
    }
    println!("✓ Stopped {}", name);
    Ok(())
}

pub async fn cmd_shutdown() -> Result<()> {
    let app = App::load()?;
    if !app.registry.shutdown_all().await {
        bail!("Failed to shut down sandboxes");
    }
    println!("✓ All sandboxes shut down");
    Ok(())
}

pub async fn cmd_exec(
    name: String,
    user: Option<String>,
    timeout: Option<u64>,
    command: Vec<String>,
) -> Result<()> {
    let app = App::load()?;
    if command.is_empty() {
        bail!("No command given");
    }
    let line = command.join(" ");
    let timeout =
        Duration::from_secs(timeout.unwrap_or(app.cfg.sandbox.command_timeout_secs));
    let result = match user {
        Some(user) => app.registry.execute_command_as(&name, &user, &line, timeout).await,
        None => app.registry.execute_command(&name, &line, timeout).await,
    };

    print!("{}", result.stdout);
    eprint!("{}", result.stderr);
    if !result.success {
        bail!("{}", result.error_message());
    }
    Ok(())
}

pub async fn cmd_import(archive: PathBuf, name: String, install_dir: PathBuf) -> Result<()> {
    let app = App::load()?;
    let result = app
        .registry
        .import_sandbox(&archive, &name, &install_dir)
        .await;
    if !result.success {
        bail!("Import failed: {}", result.error_message());
    }
    println!("✓ Imported {} into {}", name, install_dir.display());
    Ok(())
}

pub async fn cmd_unregister(name: String) -> Result<()> {
    let app = App::load()?;
    if !app.registry.unregister_sandbox(&name).await {
        bail!("Failed to unregister sandbox {}", name);
    }
    println!("✓ Unregistered {}", name);
    Ok(())
}

pub async fn cmd_set_default(name: String) -> Result<()> {
    let app = App::load()?;
    if !app.registry.set_default_sandbox(&name).await {
        bail!("Failed to make {} the default sandbox", name);
    }
    println!("✓ {} is now the default sandbox", name);
    Ok(())
}
