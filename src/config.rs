//! Layered configuration surface (§6): compiled-in defaults, then an
//! optional TOML file, then `RESERVE_*` environment overrides, in that
//! precedence order. Validated eagerly: a bad config is a startup error,
//! never a silently-ignored default.

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;

use crate::error::{ConfigError, Result};

/// One physical court: a fixed number and its direct Acuity scheduling URL.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CourtConfig {
    pub number: u32,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// How far ahead of the target datetime the booking window opens.
    pub booking_window_hours: i64,
    /// Scheduler tick interval.
    pub check_interval_seconds: u64,
    /// Retry ceiling before a request is marked `expired`.
    pub max_retry_attempts: u32,
    /// Periodic per-court page refresh interval while idle.
    pub browser_refresh_interval_seconds: u64,
    /// The static set of configured courts.
    pub courts: Vec<CourtConfig>,
    /// IANA timezone name used for all date arithmetic.
    pub timezone: String,
    /// Default per-attempt speed multiplier (§4.4; `normal` preset is 2.5).
    pub speed_multiplier: f64,
    /// Whether newly-created requests default to the `experienced` timing
    /// preset (minimal affectations, multiplier 5.0).
    pub experienced_mode: bool,
    /// How far ahead of window-open the scheduler starts considering a
    /// request imminent (§4.7 "dispatch horizon").
    pub dispatch_horizon_seconds: i64,
    /// Path of the queue's durable JSON document.
    pub queue_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            booking_window_hours: 48,
            check_interval_seconds: 5,
            max_retry_attempts: 8,
            browser_refresh_interval_seconds: 300,
            courts: Vec::new(),
            timezone: "America/Guatemala".to_string(),
            speed_multiplier: 2.5,
            experienced_mode: false,
            dispatch_horizon_seconds: 30,
            queue_path: "data/reservation_queue.json".to_string(),
        }
    }
}

impl Config {
    /// Loads defaults, overlays an optional TOML file, then overlays
    /// `RESERVE_*` environment variables, and validates the result.
    pub fn load(file_path: Option<&Path>) -> Result<Self> {
        let mut config = Config::default();

        if let Some(path) = file_path {
            let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
                path: path.display().to_string(),
                source: e,
            })?;
            config = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
                path: path.display().to_string(),
                source: e,
            })?;
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("RESERVE_BOOKING_WINDOW_HOURS") {
            if let Ok(v) = v.parse() {
                self.booking_window_hours = v;
            }
        }
        if let Ok(v) = std::env::var("RESERVE_CHECK_INTERVAL_SECONDS") {
            if let Ok(v) = v.parse() {
                self.check_interval_seconds = v;
            }
        }
        if let Ok(v) = std::env::var("RESERVE_MAX_RETRY_ATTEMPTS") {
            if let Ok(v) = v.parse() {
                self.max_retry_attempts = v;
            }
        }
        if let Ok(v) = std::env::var("RESERVE_SPEED_MULTIPLIER") {
            if let Ok(v) = v.parse() {
                self.speed_multiplier = v;
            }
        }
        if let Ok(v) = std::env::var("RESERVE_EXPERIENCED_MODE") {
            if let Ok(v) = v.parse() {
                self.experienced_mode = v;
            }
        }
        if let Ok(v) = std::env::var("RESERVE_TIMEZONE") {
            self.timezone = v;
        }
        if let Ok(v) = std::env::var("RESERVE_QUEUE_PATH") {
            self.queue_path = v;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.courts.is_empty() {
            return Err(ConfigError::Invalid("courts list must not be empty".to_string()).into());
        }

        let mut seen = HashSet::new();
        for court in &self.courts {
            if !seen.insert(court.number) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate court number {}",
                    court.number
                ))
                .into());
            }
            if court.url.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "court {} has an empty url",
                    court.number
                ))
                .into());
            }
        }

        if self.booking_window_hours <= 0 {
            return Err(ConfigError::Invalid("booking_window_hours must be positive".to_string()).into());
        }
        if self.check_interval_seconds == 0 {
            return Err(ConfigError::Invalid("check_interval_seconds must be positive".to_string()).into());
        }
        if self.max_retry_attempts == 0 {
            return Err(ConfigError::Invalid("max_retry_attempts must be positive".to_string()).into());
        }
        if self.speed_multiplier <= 0.0 {
            return Err(ConfigError::Invalid("speed_multiplier must be positive".to_string()).into());
        }

        Ok(())
    }

    pub fn court_numbers(&self) -> Vec<u32> {
        self.courts.iter().map(|c| c.number).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_courts() -> Vec<CourtConfig> {
        vec![
            CourtConfig { number: 1, url: "https://example.test/court/1".to_string() },
            CourtConfig { number: 2, url: "https://example.test/court/2".to_string() },
        ]
    }

    #[test]
    fn defaults_with_courts_validate() {
        let mut config = Config::default();
        config.courts = sample_courts();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_courts_rejected() {
        let config = Config::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn duplicate_court_numbers_rejected() {
        let mut config = Config::default();
        config.courts = vec![
            CourtConfig { number: 1, url: "https://example.test/a".to_string() },
            CourtConfig { number: 1, url: "https://example.test/b".to_string() },
        ];
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_override_applies_on_top_of_defaults() {
        let mut config = Config::default();
        config.courts = sample_courts();
        std::env::set_var("RESERVE_MAX_RETRY_ATTEMPTS", "3");
        config.apply_env_overrides();
        std::env::remove_var("RESERVE_MAX_RETRY_ATTEMPTS");
        assert_eq!(config.max_retry_attempts, 3);
    }
}
