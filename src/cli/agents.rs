//! Stored agent configurations.

use anyhow::{bail, Result};
use clap::Subcommand;

use crate::config;
use crate::sync::{ConfigStore, HostAgentConfig};

#[derive(Subcommand)]
pub enum AgentsAction {
    /// List stored configurations.
    List,
    /// Print one configuration as JSON.
    Show { name: String },
    /// Create a configuration with default settings.
    Create {
        name: String,
        /// Sandbox the agent runs in.
        #[arg(long)]
        sandbox: String,
        #[arg(long)]
        model: Option<String>,
    },
    /// Make a configuration the default.
    SetDefault { name: String },
    /// Delete a configuration.
    Delete { name: String },
}

pub async fn cmd_agents(action: AgentsAction) -> Result<()> {
    let cfg = config::load_config(None)?;
    let store = ConfigStore::new(config::store_dir_path(&cfg));

    match action {
        AgentsAction::List => {
            let names = store.list()?;
            if names.is_empty() {
                println!("No agent configurations.");
                return Ok(());
            }
            let default = store.default_name()?;
            for name in names {
                let marker = if default.as_deref() == Some(name.as_str()) { "*" } else { " " };
                match store.load(&name) {
                    Ok(agent) => println!("{} {:<20} {:<20} {}", marker, name, agent.sandbox, agent.model),
                    Err(e) => println!("{} {:<20} (unreadable: {})", marker, name, e),
                }
            }
        }
        AgentsAction::Show { name } => {
            let agent = store.load(&name)?;
            println!("{}", serde_json::to_string_pretty(&agent)?);
        }
        AgentsAction::Create { name, sandbox, model } => {
            if store.exists(&name) {
                bail!("Agent config '{}' already exists", name);
            }
            let mut agent = HostAgentConfig::new(name.clone(), sandbox);
            if let Some(model) = model {
                agent.model = model;
            }
            store.save(&mut agent)?;
            println!("✓ Created agent config '{}'", name);
        }
        AgentsAction::SetDefault { name } => {
            store.set_default(&name)?;
            println!("✓ '{}' is now the default agent config", name);
        }
        AgentsAction::Delete { name } => {
            if store.delete(&name)? {
                println!("✓ Deleted agent config '{}'", name);
            } else {
                println!("Agent config '{}' not found.", name);
            }
        }
    }
    Ok(())
}
