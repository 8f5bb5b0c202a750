use std::path::Path;

use error_stack::{Report, ResultExt};
use serde::Deserialize;

use crate::error::ConfigError;

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Connection URL of the alarm database (e.g. `sqlite:./data/alarms.db`).
    pub database_url: String,
    pub telegram_bot_token: String,
    #[serde(default)]
    pub general: GeneralConfig,
}

#[derive(Debug, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

pub fn load(path: &Path) -> Result<AppConfig, Report<ConfigError>> {
    let content = std::fs::read_to_string(path)
        .change_context(ConfigError::ReadFile)
        .attach_with(|| format!("path: {}", path.display()))?;

    let config: AppConfig = toml::from_str(&content).change_context(ConfigError::Parse {
        reason: "invalid TOML syntax or schema mismatch".into(),
    })?;

    validate(&config)?;
    Ok(config)
}

fn validate(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    if config.database_url.trim().is_empty() {
        return Err(Report::new(ConfigError::Validation {
            field: "database_url must not be empty".into(),
        }));
    }
    if config.telegram_bot_token.trim().is_empty() {
        return Err(Report::new(ConfigError::Validation {
            field: "telegram_bot_token must not be empty".into(),
        }));
    }
    if !matches!(config.general.log_format.as_str(), "text" | "json") {
        return Err(Report::new(ConfigError::Validation {
            field: format!(
                "general.log_format \"{}\" is not valid (expected \"text\" or \"json\")",
                config.general.log_format
            ),
        }));
    }
    Ok(())
}
