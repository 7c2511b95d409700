use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::notify::schedule::{self, Slot, TzSpec};
use crate::storage::file_store;
use crate::utils::errors::SentinelError;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub paths: PathsConfig,
    pub delivery: DeliveryConfig,
    pub bot: BotConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PathsConfig {
    pub data_dir: PathBuf,
    pub filters_file: PathBuf,
    pub recipients_file: PathBuf,
    pub queue_file: PathBuf,
    pub failures_file: PathBuf,
    pub notified_file: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeliveryConfig {
    /// Platform calls per second.
    pub rate: f64,
    /// Combined backlog depth that triggers warnings.
    pub backlog_warn: usize,
    pub notified_ttl_days: u32,
    /// Process-wide regular-delivery slots, "HH:MM,HH:MM".
    pub schedule: String,
    /// Default zone for recipients without one.
    pub timezone: String,
    /// Recipient id that receives operator notices.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_recipient: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BotConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token: String,
    #[serde(default)]
    pub test_dc: bool,
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tg-sentinel")
}

impl Default for Config {
    fn default() -> Self {
        Self::with_data_dir(default_data_dir())
    }
}

impl Config {
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            paths: PathsConfig {
                filters_file: data_dir.join("filters.json"),
                recipients_file: data_dir.join("recipients.json"),
                queue_file: data_dir.join("queue.json"),
                failures_file: data_dir.join("failures.json"),
                notified_file: data_dir.join("notified.json"),
                data_dir,
            },
            delivery: DeliveryConfig {
                rate: 1.0,
                backlog_warn: 100,
                notified_ttl_days: 30,
                schedule: "09:00,14:00,19:00".to_string(),
                timezone: "UTC".to_string(),
                admin_recipient: None,
            },
            bot: BotConfig {
                token: String::new(),
                test_dc: false,
            },
        }
    }

    pub fn load() -> Result<Self> {
        let data_dir = std::env::var("TG_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_data_dir());
        let config_file = data_dir.join("config.toml");

        fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

        let mut config = if config_file.exists() {
            info!("loading configuration from {}", config_file.display());
            let content = fs::read_to_string(&config_file)
                .with_context(|| format!("failed to read {}", config_file.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("failed to parse {}", config_file.display()))?
        } else {
            warn!("no config file found, writing defaults to {}", config_file.display());
            let config = Self::with_data_dir(data_dir);
            config.save(&config_file)?;
            config
        };

        config.load_from_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &std::path::Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("failed to encode configuration")?;
        // The config may carry the bot token, so it gets the same
        // owner-only treatment as every other secret on disk.
        file_store::write_atomic_sync(path, content.as_bytes())
    }

    fn load_from_env(&mut self) -> Result<()> {
        for (var, path) in [
            ("TG_FILTERS_FILE", &mut self.paths.filters_file),
            ("TG_RECIPIENTS_FILE", &mut self.paths.recipients_file),
            ("TG_QUEUE_FILE", &mut self.paths.queue_file),
            ("TG_FAILURES_FILE", &mut self.paths.failures_file),
            ("TG_NOTIFIED_FILE", &mut self.paths.notified_file),
        ] {
            if let Ok(value) = std::env::var(var) {
                *path = PathBuf::from(value);
            }
        }

        if let Ok(value) = std::env::var("TG_SEND_RATE") {
            self.delivery.rate = value
                .parse()
                .with_context(|| format!("TG_SEND_RATE {value:?} is not a number"))?;
        }
        if let Ok(value) = std::env::var("TG_BACKLOG_WARN") {
            self.delivery.backlog_warn = value
                .parse()
                .with_context(|| format!("TG_BACKLOG_WARN {value:?} is not a number"))?;
        }
        if let Ok(value) = std::env::var("TG_NOTIFIED_TTL_DAYS") {
            self.delivery.notified_ttl_days = value
                .parse()
                .with_context(|| format!("TG_NOTIFIED_TTL_DAYS {value:?} is not a number"))?;
        }
        if let Ok(value) = std::env::var("TG_SCHEDULE") {
            self.delivery.schedule = value;
        }
        if let Ok(value) = std::env::var("TG_TIMEZONE") {
            self.delivery.timezone = value;
        }
        if let Ok(value) = std::env::var("TG_ADMIN_RECIPIENT") {
            self.delivery.admin_recipient = Some(value).filter(|v| !v.is_empty());
        }
        if let Ok(value) = std::env::var("TG_BOT_TOKEN") {
            self.bot.token = value;
        }
        if let Ok(value) = std::env::var("TG_BOT_TEST_DC") {
            self.bot.test_dc = matches!(value.as_str(), "1" | "true" | "yes");
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.delivery.rate <= 0.0 {
            return Err(SentinelError::Config(format!(
                "delivery rate must be positive, got {}",
                self.delivery.rate
            ))
            .into());
        }
        if self.delivery.notified_ttl_days == 0 {
            return Err(
                SentinelError::Config("notified TTL must be at least one day".into()).into(),
            );
        }
        self.schedule_slots()?;
        self.timezone()?;
        Ok(())
    }

    pub fn schedule_slots(&self) -> Result<Vec<Slot>> {
        schedule::parse_schedule_csv(&self.delivery.schedule).map_err(Into::into)
    }

    pub fn timezone(&self) -> Result<TzSpec> {
        self.delivery.timezone.parse().map_err(anyhow::Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.schedule_slots().unwrap().len(), 3);
        assert_eq!(config.timezone().unwrap(), TzSpec::UTC);
    }

    #[test]
    fn bad_values_fail_validation() {
        let mut config = Config::default();
        config.delivery.rate = 0.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.delivery.schedule = "25:99".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.delivery.timezone = "Atlantis/Lost".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.delivery.notified_ttl_days = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::with_data_dir(dir.path().to_path_buf());
        config.bot.token = "123:abc".to_string();
        config.delivery.admin_recipient = Some("me".to_string());

        let path = dir.path().join("config.toml");
        config.save(&path).unwrap();

        let loaded: Config = toml::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.bot.token, "123:abc");
        assert_eq!(loaded.delivery.admin_recipient.as_deref(), Some("me"));
        assert_eq!(loaded.paths.queue_file, config.paths.queue_file);
    }
}
