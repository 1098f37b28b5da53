//! Configuration sync commands.

use anyhow::{bail, Context, Result};
use clap::Subcommand;

use super::helpers::App;

#[derive(Subcommand)]
pub enum SyncAction {
    /// Write a stored agent configuration into its sandbox.
    Push {
        /// Agent configuration name (the default one when omitted).
        agent: Option<String>,
        /// Target a different sandbox than the configuration names.
        #[arg(long)]
        sandbox: Option<String>,
        /// Replace the sandbox document instead of merging into it.
        #[arg(long)]
        replace: bool,
    },
    /// Read a sandbox document back into a host configuration.
    Pull {
        sandbox: String,
        /// Name to store it under (the sandbox name when omitted).
        #[arg(long)]
        name: Option<String>,
        /// Print only; do not write the host configuration.
        #[arg(long)]
        dry_run: bool,
    },
}

pub async fn cmd_sync(action: SyncAction) -> Result<()> {
    let app = App::load()?;
    match action {
        SyncAction::Push { agent, sandbox, replace } => {
            let name = match agent {
                Some(name) => name,
                None => app
                    .store
                    .default_name()?
                    .context("No default agent configuration; pass a name")?,
            };
            let mut config = app.store.load(&name)?;
            if let Some(sandbox) = sandbox {
                config.sandbox = sandbox;
            }
            if config.sandbox.is_empty() {
                bail!("Agent config '{}' names no sandbox; pass --sandbox", name);
            }
            if !app.sync.sync_host_to_sandbox(&config, !replace).await {
                bail!("Failed to sync '{}' into {}", name, config.sandbox);
            }
            println!("✓ Synced '{}' into {}", name, config.sandbox);
        }
        SyncAction::Pull { sandbox, name, dry_run } => {
            let mut config = app.sync.sync_sandbox_to_host(&sandbox).await?;
            let name = name.unwrap_or_else(|| sandbox.clone());
            if app.store.exists(&name) {
                let existing = app.store.load(&name)?;
                config.created_at = existing.created_at;
                config.workspace_host_path = existing.workspace_host_path;
                config.sync_to_mount = existing.sync_to_mount;
            }
            config.name = name.clone();

            if dry_run {
                println!("{}", serde_json::to_string_pretty(&config)?);
                return Ok(());
            }
            app.store.save(&mut config)?;
            println!("✓ Pulled {} into agent config '{}'", sandbox, name);
        }
    }
    Ok(())
}
