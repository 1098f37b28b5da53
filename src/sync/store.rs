//! Host-side persistence of agent configurations.
//!
//! Layout under the store directory (default `~/.sandbot/agents`):
//! one `<name>.json` per configuration plus `index.json` holding the
//! default configuration name and the schema version.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::schema::HostAgentConfig;

pub const SCHEMA_VERSION: u32 = 1;
const INDEX_FILE: &str = "index.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigIndex {
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

impl Default for ConfigIndex {
    fn default() -> Self {
        Self {
            default: None,
            schema_version: SCHEMA_VERSION,
        }
    }
}

pub fn default_store_dir() -> PathBuf {
    crate::config::config_dir().join("agents")
}

pub struct ConfigStore {
    dir: PathBuf,
}

impl ConfigStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty()
            || name == INDEX_FILE.trim_end_matches(".json")
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
            || name.starts_with('.')
        {
            bail!("Invalid configuration name '{}'", name);
        }
        Ok(self.dir.join(format!("{}.json", name)))
    }

    /// Names of all stored configurations, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.dir)
            .with_context(|| format!("reading {}", self.dir.display()))?
        {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match path.file_stem().and_then(|s| s.to_str()) {
                Some(stem) if stem != "index" => names.push(stem.to_string()),
                _ => {}
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path_for(name).map(|p| p.exists()).unwrap_or(false)
    }

    pub fn load(&self, name: &str) -> Result<HostAgentConfig> {
        let path = self.path_for(name)?;
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading agent config from {}", path.display()))?;
        let config: HostAgentConfig = serde_json::from_str(&text)
            .with_context(|| format!("parsing agent config from {}", path.display()))?;
        Ok(config)
    }

    /// Persist a configuration, stamping `created_at` on first save and `updated_at` always.
    ///
    /// The first configuration saved becomes the default.
    pub fn save(&self, config: &mut HostAgentConfig) -> Result<()> {
        let path = self.path_for(&config.name)?;
        std::fs::create_dir_all(&self.dir)?;

        let now = Utc::now();
        if config.created_at.is_none() {
            config.created_at = Some(now);
        }
        config.updated_at = Some(now);

        let json = serde_json::to_string_pretty(config)?;
        std::fs::write(&path, json)
            .with_context(|| format!("writing agent config to {}", path.display()))?;
        debug!(name = %config.name, path = %path.display(), "Agent config saved");

        let mut index = self.load_index()?;
        if index.default.is_none() {
            index.default = Some(config.name.clone());
            self.save_index(&index)?;
        }
        Ok(())
    }

    /// Delete a configuration. Returns false if it did not exist.
    pub fn delete(&self, name: &str) -> Result<bool> {
        let path = self.path_for(name)?;
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&path)?;

        let mut index = self.load_index()?;
        if index.default.as_deref() == Some(name) {
            index.default = self.list()?.into_iter().next();
            self.save_index(&index)?;
        }
        info!(name = %name, "Agent config deleted");
        Ok(true)
    }

    pub fn default_name(&self) -> Result<Option<String>> {
        Ok(self.load_index()?.default)
    }

    pub fn set_default(&self, name: &str) -> Result<()> {
        if !self.exists(name) {
            bail!("No agent config named '{}'", name);
        }
        let mut index = self.load_index()?;
        index.default = Some(name.to_string());
        self.save_index(&index)
    }

    pub fn load_index(&self) -> Result<ConfigIndex> {
        let path = self.dir.join(INDEX_FILE);
        if !path.exists() {
            return Ok(ConfigIndex::default());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let index = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(index)
    }

    fn save_index(&self, index: &ConfigIndex) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_string_pretty(index)?;
        std::fs::write(self.dir.join(INDEX_FILE), json)?;
        Ok(())
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new(default_store_dir())
    }
}
