use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use crate::types::{DEFAULT_MAX_STEPS, DEFAULT_RETRY_BUDGET, Dialect, Locale};

pub const SETTINGS_FILE: &str = "ui_config.json";

/// Per-session engine configuration. Fixed once the session starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub locale: Locale,
    pub dialect: Dialect,
    pub max_steps: usize,
    /// Extra model attempts allowed per turn after a reply fails to parse or validate.
    pub retry_budget: usize,
    pub device_id: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            locale: Locale::default(),
            dialect: Dialect::default(),
            max_steps: DEFAULT_MAX_STEPS,
            retry_budget: DEFAULT_RETRY_BUDGET,
            device_id: None,
        }
    }
}

/// Everything the agent binary remembers between runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub api_key: String,
    pub base_url: String,
    pub model_name: String,
    pub device_id: String,
    pub lang: Locale,
    pub dialect: Dialect,
    pub max_steps: usize,
    pub retry_budget: usize,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            model_name: "gpt-4o".to_string(),
            device_id: String::new(),
            lang: Locale::Cn,
            dialect: Dialect::TextMarkup,
            max_steps: DEFAULT_MAX_STEPS,
            retry_budget: DEFAULT_RETRY_BUDGET,
        }
    }
}

impl AgentSettings {
    /// Defaults overlaid with `OPENAI_API_KEY`, `OPENAI_BASE_URL` and `MODEL_NAME`.
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            settings.api_key = key;
        }
        if let Ok(url) = std::env::var("OPENAI_BASE_URL") {
            settings.base_url = url;
        }
        if let Ok(model) = std::env::var("MODEL_NAME") {
            settings.model_name = model;
        }
        settings
    }

    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .map(|dir| dir.join("phone-pilot"))
            .unwrap_or_else(|| PathBuf::from("."))
            .join(SETTINGS_FILE)
    }

    /// Reads saved settings, falling back to the environment when no file exists.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::from_env());
        }
        let file = std::fs::File::open(path)
            .with_context(|| format!("opening settings {}", path.display()))?;
        let reader = BufReader::new(file);
        let settings: Self = serde_json::from_reader(reader)
            .with_context(|| format!("parsing settings {}", path.display()))?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("writing settings {}", path.display()))?;

        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    pub fn session_config(&self) -> SessionConfig {
        let device_id = self.device_id.trim();
        SessionConfig {
            locale: self.lang,
            dialect: self.dialect,
            max_steps: self.max_steps.max(1),
            retry_budget: self.retry_budget,
            device_id: (!device_id.is_empty()).then(|| device_id.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(SETTINGS_FILE);
        let settings = AgentSettings {
            api_key: "sk-test".into(),
            device_id: "emulator-5554".into(),
            lang: Locale::En,
            dialect: Dialect::Native,
            max_steps: 30,
            ..AgentSettings::default()
        };
        settings.save(&path).unwrap();
        assert_eq!(AgentSettings::load(&path).unwrap(), settings);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE);
        std::fs::write(&path, r#"{"lang": "en", "max_steps": 5}"#).unwrap();
        let settings = AgentSettings::load(&path).unwrap();
        assert_eq!(settings.lang, Locale::En);
        assert_eq!(settings.max_steps, 5);
        assert_eq!(settings.retry_budget, DEFAULT_RETRY_BUDGET);
        assert_eq!(settings.dialect, Dialect::TextMarkup);
    }

    #[test]
    fn session_config_from_settings() {
        let settings = AgentSettings {
            device_id: "  ".into(),
            max_steps: 0,
            ..AgentSettings::default()
        };
        let config = settings.session_config();
        assert_eq!(config.device_id, None);
        assert_eq!(config.max_steps, 1);
    }
}
