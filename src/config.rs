use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::persona::Persona;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Config {
    pub base_url: Option<String>,
    pub persona: Option<String>,
    pub streaming: Option<bool>,
    /// "direct" reveals deltas as they arrive; "paced" buffers the reply and
    /// replays it with small randomized pauses.
    pub reveal: Option<String>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let content = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn save_persona(persona: Persona) -> Result<()> {
        let mut config = Self::load().unwrap_or_else(|_| Self::new());
        config.persona = Some(persona.as_str().to_string());
        config.save()
    }

    /// Resolution order: explicit flag (handled by the caller), env var,
    /// config file, then the backend's default bind address.
    pub fn resolve_base_url(&self) -> String {
        std::env::var("SUGYA_BASE_URL")
            .ok()
            .filter(|v| !v.is_empty())
            .or_else(|| self.base_url.clone())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
    }

    /// Invalid persona names in the file fall back to the general persona.
    pub fn resolve_persona(&self) -> Persona {
        self.persona
            .as_deref()
            .and_then(Persona::from_str)
            .unwrap_or(Persona::Chavruta)
    }

    pub fn resolve_streaming(&self) -> bool {
        self.streaming.unwrap_or(true)
    }

    pub fn paced_reveal(&self) -> bool {
        matches!(self.reveal.as_deref(), Some("paced"))
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir =
            dirs::config_dir().ok_or_else(|| anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("sugya").join("config.json"))
    }

    /// Where the log file lives; shares the config directory.
    pub fn log_path() -> Result<PathBuf> {
        let config_dir =
            dirs::config_dir().ok_or_else(|| anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("sugya").join("sugya.log"))
    }
}
