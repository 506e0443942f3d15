// Configuration management for the contact tracer CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/contact-tracer/config.json
// - Linux: ~/.config/contact-tracer/config.json
// - Windows: %APPDATA%\contact-tracer\config.json

use anyhow::{Context, Result};
use contact_tracer_core::TracerConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const APP_DIR: &str = "contact-tracer";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Encounter log location (defaults to the data directory)
    pub storage_path: Option<String>,

    /// Derive identifiers from this user id instead of fresh randomness
    pub user_id: Option<String>,

    /// Also write logs to a daily rolling file in the data directory
    pub log_to_file: bool,

    /// Engine settings
    pub tracer: TracerConfig,
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join(APP_DIR);

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the data directory path (cross-platform)
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to determine data directory")?
            .join(APP_DIR);

        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        Ok(data_dir)
    }

    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Where the encounter log lives
    pub fn encounter_db(&self) -> Result<PathBuf> {
        match &self.storage_path {
            Some(path) => Ok(PathBuf::from(path)),
            None => Ok(Self::data_dir()?.join("encounters")),
        }
    }

    /// Load config from file, or create default if not exists
    pub fn load() -> Result<Self> {
        let config_file = Self::config_file()?;

        if config_file.exists() {
            Self::load_from(&config_file)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
        let config: Config =
            serde_json::from_str(&contents).context("Failed to parse config file")?;
        config
            .tracer
            .validate()
            .context("Config file contains invalid tracer settings")?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Set a config value and save
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.apply(key, value)?;
        self.save()
    }

    /// Set a config value in memory. The tracer settings must stay valid.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        let mut next = self.clone();
        let t = &mut next.tracer;

        match key {
            "storage_path" => next.storage_path = optional(value),
            "user_id" => next.user_id = optional(value),
            "log_to_file" => next.log_to_file = value.parse().context("Invalid boolean value")?,
            "rotation.validity_secs" => t.rotation.validity_secs = number(value)?,
            "rotation.lookback" => t.rotation.lookback = number(value)?,
            "rotation.rotation_lead_secs" => t.rotation.rotation_lead_secs = number(value)?,
            "rotation.tick_interval_ms" => t.rotation.tick_interval_ms = number(value)?,
            "scan.scan_interval_ms" => t.scan.scan_interval_ms = number(value)?,
            "scan.duty_cycle_percent" => t.scan.duty_cycle_percent = number(value)?,
            "scan.sighting_channel_capacity" => t.scan.sighting_channel_capacity = number(value)?,
            "encounter.gap_timeout_secs" => t.encounter.gap_timeout_secs = number(value)?,
            "encounter.sweep_interval_secs" => t.encounter.sweep_interval_secs = number(value)?,
            "retention.retention_days" => t.retention.retention_days = number(value)?,
            "retention.purge_interval_secs" => t.retention.purge_interval_secs = number(value)?,
            "retry.max_attempts" => t.retry.max_attempts = number(value)?,
            "retry.initial_backoff_ms" => t.retry.initial_backoff_ms = number(value)?,
            "retry.max_backoff_ms" => t.retry.max_backoff_ms = number(value)?,
            "supervision_interval_secs" => t.supervision_interval_secs = number(value)?,
            "event_capacity" => t.event_capacity = number(value)?,
            _ => anyhow::bail!("Unknown config key: {}", key),
        }

        next.tracer.validate()?;
        *self = next;
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        self.list()
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        let t = &self.tracer;
        let entries: Vec<(&str, String)> = vec![
            (
                "storage_path",
                self.storage_path.clone().unwrap_or_else(|| "(auto)".to_string()),
            ),
            (
                "user_id",
                self.user_id.clone().unwrap_or_else(|| "(random identifiers)".to_string()),
            ),
            ("log_to_file", self.log_to_file.to_string()),
            ("rotation.validity_secs", t.rotation.validity_secs.to_string()),
            ("rotation.lookback", t.rotation.lookback.to_string()),
            ("rotation.rotation_lead_secs", t.rotation.rotation_lead_secs.to_string()),
            ("rotation.tick_interval_ms", t.rotation.tick_interval_ms.to_string()),
            ("scan.scan_interval_ms", t.scan.scan_interval_ms.to_string()),
            ("scan.duty_cycle_percent", t.scan.duty_cycle_percent.to_string()),
            ("scan.sighting_channel_capacity", t.scan.sighting_channel_capacity.to_string()),
            ("encounter.gap_timeout_secs", t.encounter.gap_timeout_secs.to_string()),
            ("encounter.sweep_interval_secs", t.encounter.sweep_interval_secs.to_string()),
            ("retention.retention_days", t.retention.retention_days.to_string()),
            ("retention.purge_interval_secs", t.retention.purge_interval_secs.to_string()),
            ("retry.max_attempts", t.retry.max_attempts.to_string()),
            ("retry.initial_backoff_ms", t.retry.initial_backoff_ms.to_string()),
            ("retry.max_backoff_ms", t.retry.max_backoff_ms.to_string()),
            ("supervision_interval_secs", t.supervision_interval_secs.to_string()),
            ("event_capacity", t.event_capacity.to_string()),
        ];

        entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }
}

fn optional(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn number<T: std::str::FromStr>(value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid number: {}", value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.storage_path.is_none());
        assert!(!config.log_to_file);
        assert_eq!(config.get("encounter.gap_timeout_secs").as_deref(), Some("300"));
    }

    #[test]
    fn test_apply_updates_nested_values() {
        let mut config = Config::default();
        config.apply("scan.duty_cycle_percent", "25").unwrap();
        config.apply("user_id", "alice").unwrap();

        assert_eq!(config.tracer.scan.duty_cycle_percent, 25);
        assert_eq!(config.get("user_id").as_deref(), Some("alice"));

        config.apply("user_id", "").unwrap();
        assert!(config.user_id.is_none());
    }

    #[test]
    fn test_apply_rejects_invalid_values() {
        let mut config = Config::default();
        assert!(config.apply("scan.duty_cycle_percent", "0").is_err());
        assert!(config.apply("scan.duty_cycle_percent", "abc").is_err());
        assert!(config.apply("no.such.key", "1").is_err());

        // Rejected changes leave the config untouched
        assert_eq!(config.tracer.scan.duty_cycle_percent, 100);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::default();
        config.apply("retention.retention_days", "7").unwrap();
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.tracer.retention.retention_days, 7);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"log_to_file": true}"#).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert!(loaded.log_to_file);
        assert_eq!(loaded.tracer.rotation.validity_secs, 900);
    }
}
