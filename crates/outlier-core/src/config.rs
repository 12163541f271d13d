//! Runtime configuration read from the environment.

use crate::error::ConfigError;
use crate::window::WindowConfig;
use chrono::Duration;
use std::path::PathBuf;
use std::str::FromStr;

pub const DEFAULT_DB_PATH: &str = "outlier_detector.db";
pub const DEFAULT_WINDOW_SECS: i64 = 300;
pub const DEFAULT_GRACE_SECS: i64 = 60;
pub const DEFAULT_MODELS: &str = "lof,iforest,knn";
pub const DEFAULT_MODEL_DIR: &str = "models";
pub const DEFAULT_EVICTION_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_MAX_ENTITIES: usize = 10_000;
pub const DEFAULT_DETECT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8000";

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub db_path: PathBuf,
    pub window_length: Duration,
    pub grace_period: Duration,
    /// Model ids to load on startup and on every reload.
    /// An odd count avoids the tie that resolves to "anomaly".
    pub model_ids: Vec<String>,
    pub model_dir: PathBuf,
    pub eviction_interval: std::time::Duration,
    pub max_entities: usize,
    pub detect_timeout: std::time::Duration,
    pub listen_addr: String,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            window_length: Duration::seconds(DEFAULT_WINDOW_SECS),
            grace_period: Duration::seconds(DEFAULT_GRACE_SECS),
            model_ids: parse_model_list(DEFAULT_MODELS),
            model_dir: PathBuf::from(DEFAULT_MODEL_DIR),
            eviction_interval: std::time::Duration::from_secs(DEFAULT_EVICTION_INTERVAL_SECS),
            max_entities: DEFAULT_MAX_ENTITIES,
            detect_timeout: std::time::Duration::from_millis(DEFAULT_DETECT_TIMEOUT_MS),
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
        }
    }
}

impl DetectorConfig {
    /// Load from the process environment, reading `.env` first if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys take their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let window_secs: i64 = parse_or(&lookup, "OUTLIER_WINDOW_SECS", DEFAULT_WINDOW_SECS)?;
        let grace_secs: i64 = parse_or(&lookup, "OUTLIER_GRACE_SECS", DEFAULT_GRACE_SECS)?;
        let eviction_secs: u64 = parse_or(
            &lookup,
            "OUTLIER_EVICTION_INTERVAL_SECS",
            DEFAULT_EVICTION_INTERVAL_SECS,
        )?;
        let max_entities: usize =
            parse_or(&lookup, "OUTLIER_MAX_ENTITIES", DEFAULT_MAX_ENTITIES)?;
        let timeout_ms: u64 =
            parse_or(&lookup, "OUTLIER_DETECT_TIMEOUT_MS", DEFAULT_DETECT_TIMEOUT_MS)?;

        if window_secs <= 0 {
            return Err(invalid("OUTLIER_WINDOW_SECS", window_secs, "must be positive"));
        }
        if grace_secs <= 0 {
            return Err(invalid("OUTLIER_GRACE_SECS", grace_secs, "must be positive"));
        }
        if eviction_secs == 0 {
            return Err(invalid(
                "OUTLIER_EVICTION_INTERVAL_SECS",
                eviction_secs,
                "must be positive",
            ));
        }
        if max_entities == 0 {
            return Err(invalid("OUTLIER_MAX_ENTITIES", max_entities, "must be positive"));
        }

        let model_ids = match lookup("OUTLIER_MODELS") {
            Some(raw) => {
                let ids = parse_model_list(&raw);
                if ids.is_empty() {
                    return Err(invalid("OUTLIER_MODELS", raw, "no model ids listed"));
                }
                ids
            }
            None => defaults.model_ids,
        };

        Ok(Self {
            db_path: lookup("OUTLIER_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            window_length: Duration::seconds(window_secs),
            grace_period: Duration::seconds(grace_secs),
            model_ids,
            model_dir: lookup("OUTLIER_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.model_dir),
            eviction_interval: std::time::Duration::from_secs(eviction_secs),
            max_entities,
            detect_timeout: std::time::Duration::from_millis(timeout_ms),
            listen_addr: lookup("OUTLIER_LISTEN_ADDR").unwrap_or(defaults.listen_addr),
        })
    }

    pub fn window_config(&self) -> WindowConfig {
        WindowConfig {
            window_length: self.window_length,
            grace_period: self.grace_period,
            max_entities: self.max_entities,
        }
    }
}

fn parse_model_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn invalid(key: &'static str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
