// Service configuration

use crate::encounter::EncounterConfig;
use crate::events::DEFAULT_EVENT_CAPACITY;
use crate::identity::RotationConfig;
use crate::transport::ble::{RetryPolicy, ScanConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    pub retention_days: u64,
    pub purge_interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention_days: 14,
            purge_interval_secs: 3_600,
        }
    }
}

impl RetentionConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days.saturating_mul(86_400))
    }
}

/// Everything the tracer service needs, with defaults for every field
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TracerConfig {
    pub rotation: RotationConfig,
    pub scan: ScanConfig,
    pub encounter: EncounterConfig,
    pub retention: RetentionConfig,
    pub retry: RetryPolicy,
    /// How often failed controllers are restarted
    pub supervision_interval_secs: u64,
    /// Buffered events per subscriber before the oldest are skipped
    pub event_capacity: usize,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            rotation: RotationConfig::default(),
            scan: ScanConfig::default(),
            encounter: EncounterConfig::default(),
            retention: RetentionConfig::default(),
            retry: RetryPolicy::default(),
            supervision_interval_secs: 30,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl TracerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let rotation = &self.rotation;
        if rotation.validity_secs == 0 {
            return Err(invalid("rotation.validity_secs", "must be > 0"));
        }
        if rotation.lookback == 0 {
            return Err(invalid("rotation.lookback", "must be > 0"));
        }
        if rotation.rotation_lead_secs >= rotation.validity_secs {
            return Err(invalid(
                "rotation.rotation_lead_secs",
                "must be shorter than the validity window",
            ));
        }
        if rotation.tick_interval_ms == 0 {
            return Err(invalid("rotation.tick_interval_ms", "must be > 0"));
        }

        self.scan
            .validate()
            .map_err(|e| invalid("scan", e.to_string()))?;

        if self.encounter.gap_timeout_secs == 0 {
            return Err(invalid("encounter.gap_timeout_secs", "must be > 0"));
        }
        if self.encounter.sweep_interval_secs == 0 {
            return Err(invalid("encounter.sweep_interval_secs", "must be > 0"));
        }

        if self.retention.retention_days == 0 {
            return Err(invalid("retention.retention_days", "must be > 0"));
        }
        if self.retention.purge_interval_secs == 0 {
            return Err(invalid("retention.purge_interval_secs", "must be > 0"));
        }

        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be > 0"));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(invalid(
                "retry.initial_backoff_ms",
                "must not exceed retry.max_backoff_ms",
            ));
        }

        if self.supervision_interval_secs == 0 {
            return Err(invalid("supervision_interval_secs", "must be > 0"));
        }
        if self.event_capacity == 0 {
            return Err(invalid("event_capacity", "must be > 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = TracerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.rotation.validity_secs, 900);
        assert_eq!(config.encounter.gap_timeout_secs, 300);
        assert_eq!(config.retention.retention(), Duration::from_secs(14 * 86_400));
        assert_eq!(config.supervision_interval_secs, 30);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: TracerConfig =
            serde_json::from_str(r#"{"encounter":{"gap_timeout_secs":120,"sweep_interval_secs":30}}"#)
                .unwrap();
        assert_eq!(config.encounter.gap_timeout_secs, 120);
        assert_eq!(config.scan.duty_cycle_percent, 100);
        assert_eq!(config.retention.retention_days, 14);
    }

    #[test]
    fn test_lead_must_fit_in_window() {
        let mut config = TracerConfig::default();
        config.rotation.rotation_lead_secs = 900;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("rotation.rotation_lead_secs"));
    }

    #[test]
    fn test_invalid_scan_config_rejected() {
        let mut config = TracerConfig::default();
        config.scan.duty_cycle_percent = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_bounds_checked() {
        let mut config = TracerConfig::default();
        config.retry.initial_backoff_ms = 10_000;
        assert!(config.validate().is_err());
    }
}
