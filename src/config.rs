//! Process configuration.
//!
//! Scheduler settings come from environment variables (a `.env` file is
//! honoured); the deals bot reads its own JSON file on every tick.

use std::env;
use std::fmt::Display;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use crate::database::DEFAULT_HISTORY_CAP;
use crate::error::ConfigError;
use crate::fetcher::{FetcherConfig, Politeness};
use crate::tracker::TrackerConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub database_url: String,
    pub refresh_interval: Duration,
    pub skip_threshold: Duration,
    pub worker_count: usize,
    pub fetch_timeout: Duration,
    pub image_timeout: Duration,
    pub history_cap: u32,
    pub politeness_min: Duration,
    pub politeness_max: Duration,
    pub shutdown_grace: Duration,
    pub deals_config_path: PathBuf,
    pub run_on_startup: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "sqlite:data/price_tracker.db".to_string(),
            refresh_interval: Duration::from_secs(360 * 60),
            skip_threshold: Duration::from_secs(360 * 60),
            worker_count: 4,
            fetch_timeout: Duration::from_secs(15),
            image_timeout: Duration::from_secs(15),
            history_cap: DEFAULT_HISTORY_CAP,
            politeness_min: Duration::from_millis(2000),
            politeness_max: Duration::from_millis(5000),
            shutdown_grace: Duration::from_secs(30),
            deals_config_path: PathBuf::from("bot_config.json"),
            run_on_startup: true,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build settings from any key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let settings = Self {
            database_url: lookup("DATABASE_URL").unwrap_or(defaults.database_url),
            refresh_interval: minutes(parse_var(
                &lookup,
                "REFRESH_INTERVAL_MINUTES",
                defaults.refresh_interval.as_secs() / 60,
            )?),
            skip_threshold: minutes(parse_var(
                &lookup,
                "SKIP_THRESHOLD_MINUTES",
                defaults.skip_threshold.as_secs() / 60,
            )?),
            worker_count: parse_var(&lookup, "WORKER_COUNT", defaults.worker_count)?,
            fetch_timeout: Duration::from_secs(parse_var(
                &lookup,
                "FETCH_TIMEOUT_SECS",
                defaults.fetch_timeout.as_secs(),
            )?),
            image_timeout: Duration::from_secs(parse_var(
                &lookup,
                "IMAGE_TIMEOUT_SECS",
                defaults.image_timeout.as_secs(),
            )?),
            history_cap: parse_var(&lookup, "HISTORY_CAP", defaults.history_cap)?,
            politeness_min: millis(parse_var(
                &lookup,
                "POLITENESS_MIN_MS",
                millis_of(defaults.politeness_min),
            )?),
            politeness_max: millis(parse_var(
                &lookup,
                "POLITENESS_MAX_MS",
                millis_of(defaults.politeness_max),
            )?),
            shutdown_grace: Duration::from_secs(parse_var(
                &lookup,
                "SHUTDOWN_GRACE_SECS",
                defaults.shutdown_grace.as_secs(),
            )?),
            deals_config_path: lookup("DEALS_CONFIG_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.deals_config_path),
            run_on_startup: match lookup("RUN_ON_STARTUP") {
                Some(raw) => parse_bool("RUN_ON_STARTUP", &raw)?,
                None => defaults.run_on_startup,
            },
        };

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count < 1 {
            return Err(invalid("WORKER_COUNT", self.worker_count, "must be at least 1"));
        }
        if self.history_cap < 1 {
            return Err(invalid("HISTORY_CAP", self.history_cap, "must be at least 1"));
        }
        if self.refresh_interval.is_zero() {
            return Err(invalid("REFRESH_INTERVAL_MINUTES", 0, "must be at least 1"));
        }
        if self.fetch_timeout.is_zero() {
            return Err(invalid("FETCH_TIMEOUT_SECS", 0, "must be at least 1"));
        }
        if self.image_timeout.is_zero() {
            return Err(invalid("IMAGE_TIMEOUT_SECS", 0, "must be at least 1"));
        }
        if self.politeness_max < self.politeness_min {
            return Err(invalid(
                "POLITENESS_MAX_MS",
                millis_of(self.politeness_max),
                "must not be below POLITENESS_MIN_MS",
            ));
        }
        Ok(())
    }

    pub fn fetcher_config(&self) -> FetcherConfig {
        FetcherConfig {
            timeout: self.fetch_timeout,
            image_timeout: self.image_timeout,
        }
    }

    pub fn politeness(&self) -> Politeness {
        Politeness::new(self.politeness_min, self.politeness_max)
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            workers: self.worker_count,
            skip_threshold: chrono::Duration::seconds(
                i64::try_from(self.skip_threshold.as_secs()).unwrap_or(i64::MAX / 1000),
            ),
            skip_slack: chrono::Duration::seconds(
                i64::try_from(self.refresh_interval.as_secs() / 10).unwrap_or(i64::MAX / 1000),
            ),
            politeness: self.politeness(),
            shutdown_grace: self.shutdown_grace,
            ..TrackerConfig::default()
        }
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key: key.to_string(),
            value: raw.clone(),
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, raw, "expected true or false")),
    }
}

fn invalid(key: &str, value: impl Display, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn minutes(value: u64) -> Duration {
    Duration::from_secs(value.saturating_mul(60))
}

fn millis(value: u64) -> Duration {
    Duration::from_millis(value)
}

fn millis_of(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Deals bot settings, stored as JSON next to the process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DealsConfig {
    pub enabled: bool,
    /// Local wall-clock time of the daily run, "HH:MM".
    pub run_time: String,
    pub max_products: usize,
    /// Minimum discount in percent.
    pub min_discount: f64,
    pub bot_username: String,
    pub bot_email: String,
    pub categories: Vec<String>,
    pub listing_urls: Vec<String>,
}

impl Default for DealsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            run_time: "09:00".to_string(),
            max_products: 10,
            min_discount: 10.0,
            bot_username: "amazon_bot".to_string(),
            bot_email: "bot@amazontracker.sa".to_string(),
            categories: ["electronics", "home", "kitchen", "fashion", "beauty", "toys", "sports"]
                .into_iter()
                .map(String::from)
                .collect(),
            listing_urls: [
                "https://www.amazon.sa/-/en/gp/goldbox",
                "https://www.amazon.sa/-/ar/gp/goldbox",
                "https://www.amazon.sa/-/en/deals-and-promotions/b/?ie=UTF8&node=15195542031",
                "https://www.amazon.sa/-/ar/deals-and-promotions/b/?ie=UTF8&node=15195542031",
                "https://www.amazon.sa/s?k=discount&rh=p_n_deal_type%3A26931847031",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

impl DealsConfig {
    /// Read the file at `path`; a missing file means all defaults.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(ConfigError::DealsFile {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                });
            }
        };

        Self::parse(&raw).map_err(|reason| ConfigError::DealsFile {
            path: path.display().to_string(),
            reason,
        })
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        let config: Self = serde_json::from_str(raw).map_err(|e| e.to_string())?;
        config.scheduled_time()?;
        if !(0.0..=100.0).contains(&config.min_discount) {
            return Err(format!(
                "min_discount must be between 0 and 100, got {}",
                config.min_discount
            ));
        }
        if config.bot_username.trim().is_empty() {
            return Err("bot_username must not be empty".to_string());
        }
        Ok(config)
    }

    pub fn scheduled_time(&self) -> Result<NaiveTime, String> {
        NaiveTime::parse_from_str(self.run_time.trim(), "%H:%M")
            .map_err(|e| format!("run_time {:?} is not HH:MM: {e}", self.run_time))
    }
}
