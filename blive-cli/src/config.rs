use blive_danmu::BliveConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{AppError, Result};

const APP_DIR: &str = "blive";
const CONFIG_FILE: &str = "config.toml";

/// Persisted CLI configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Room used when none is given on the command line.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_id: Option<u64>,
    pub blive: BliveConfig,
}

impl AppConfig {
    pub fn default_path() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
            .ok_or_else(|| AppError::Config("no configuration directory on this platform".into()))
    }

    fn resolve(path: Option<&Path>) -> Result<PathBuf> {
        match path {
            Some(path) => Ok(path.to_path_buf()),
            None => Self::default_path(),
        }
    }

    /// Load the configuration, writing the defaults first if the file is missing.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = Self::resolve(path)?;
        if !path.exists() {
            let config = Self::default();
            config.save_to(&path)?;
            info!(path = %path.display(), "Created default configuration");
            return Ok(config);
        }

        let content = fs::read_to_string(&path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn save(&self, path: Option<&Path>) -> Result<()> {
        self.save_to(&Self::resolve(path)?)
    }

    fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.show()?)?;
        Ok(())
    }

    pub fn reset(path: Option<&Path>) -> Result<()> {
        Self::default().save(path)
    }

    pub fn show(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
