use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf};

use crate::cache::DEFAULT_LOCATION_CACHE_SIZE;
use crate::remote::DEFAULT_COST;

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    pub git_annex_bin: String,
    pub cost: u32,
    pub location_cache_size: usize,
    pub extraction_root: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            git_annex_bin: "git-annex".to_string(),
            cost: DEFAULT_COST,
            location_cache_size: DEFAULT_LOCATION_CACHE_SIZE,
            extraction_root: dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("annex-bridge")
                .join("extract"),
        }
    }
}

impl Config {
    pub fn config_dir() -> Result<PathBuf> {
        let dir = dirs::home_dir()
            .context("No home directory")?
            .join(".annex-bridge");
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn load() -> Result<Self> {
        let config_path = Self::config_dir()?.join("config.json");
        if config_path.exists() {
            let content = fs::read_to_string(&config_path)?;
            Ok(serde_json::from_str(&content)?)
        } else {
            let default = Self::default();
            default.save()?;
            Ok(default)
        }
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_dir()?.join("config.json");
        fs::write(&config_path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}
