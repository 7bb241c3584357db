use anyhow::Result;
use std::sync::Arc;
use tokio::fs;
use tracing::info;

use super::Config;
use crate::constants::defaults;
use crate::errors::ConfigError;
use crate::schedule::Schedule;

/// Environment variable overriding the config directory
pub const CONFIG_DIR_ENV: &str = "AUTOBUILD_CONFIG_DIR";

pub struct ConfigManager {
    current_config: Arc<Config>,
}

impl ConfigManager {
    pub async fn new(config_dir: String) -> Result<Self> {
        let config = Self::load_configuration(&config_dir).await?;
        Ok(Self {
            current_config: Arc::new(config),
        })
    }

    /// Load from `AUTOBUILD_CONFIG_DIR`, or the default directory.
    pub async fn from_env() -> Result<Self> {
        let config_dir =
            std::env::var(CONFIG_DIR_ENV).unwrap_or_else(|_| defaults::CONFIG_DIR.to_string());
        Self::new(config_dir).await
    }

    pub fn get_current_config(&self) -> Arc<Config> {
        self.current_config.clone()
    }

    async fn load_configuration(config_dir: &str) -> Result<Config, ConfigError> {
        let main_config_path = format!("{}/main.toml", config_dir);
        let content =
            fs::read_to_string(&main_config_path)
                .await
                .map_err(|e| ConfigError::LoadFailed {
                    path: main_config_path.clone(),
                    reason: e.to_string(),
                })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            reason: e.to_string(),
        })?;
        Self::validate(&config)?;

        info!(
            "Loaded config from {}: database {}, tick '{}', locks {:?}",
            main_config_path, config.database_path, config.tick_schedule, config.locks.backend
        );
        Ok(config)
    }

    fn validate(config: &Config) -> Result<(), ConfigError> {
        let invalid = |field: &str, reason: String| ConfigError::InvalidValue {
            field: field.to_string(),
            reason,
        };

        if config.database_path.trim().is_empty() {
            return Err(invalid("database_path", "must not be empty".to_string()));
        }
        if config.max_concurrent_evaluations == 0 {
            return Err(invalid(
                "max_concurrent_evaluations",
                "must be greater than zero".to_string(),
            ));
        }

        let tick_fields = config.tick_schedule.split_whitespace().count();
        if !(6..=7).contains(&tick_fields) {
            return Err(invalid(
                "tick_schedule",
                format!("expected 6 or 7 fields (with seconds), got {}", tick_fields),
            ));
        }

        let quiet_hours = Schedule::daily(&config.quiet_hours.default_schedule)
            .map_err(|e| invalid("quiet_hours.default_schedule", e.to_string()))?;
        if quiet_hours.time_of_day().is_none() {
            return Err(invalid(
                "quiet_hours.default_schedule",
                "must fire exactly once per day".to_string(),
            ));
        }

        if config.locks.lease_seconds == 0 {
            return Err(invalid("locks.lease_seconds", "must be greater than zero".to_string()));
        }
        if matches!(&config.job_queue.url, Some(url) if url.trim().is_empty()) {
            return Err(invalid("job_queue.url", "must not be empty when set".to_string()));
        }

        Ok(())
    }
}
