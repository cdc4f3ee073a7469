//! Engine configuration from `CIVICSYNC_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use civicsync_observability::{LogConfig, LogFormat};
use serde::Serialize;
use thiserror::Error;

use crate::backoff::DEFAULT_MAX_RETRIES;
use crate::orchestrator::OrchestratorSettings;

pub const DEFAULT_API_URL: &str = "http://localhost:8080";
pub const DB_FILE_NAME: &str = "civicsync.db";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: '{value}' ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("could not determine a data directory; set CIVICSYNC_DATA_DIR")]
    NoDataDir,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineConfig {
    pub api_url: String,
    #[serde(skip_serializing)]
    pub auth_token: Option<String>,
    pub data_dir: PathBuf,
    pub max_retries: u32,
    pub request_timeout: Duration,
    pub cache_capacity: usize,
    pub sync_interval_unmetered: Duration,
    pub sync_interval_cellular: Duration,
    pub preflight_health_check: bool,
    pub connectivity_poll_interval: Duration,
    pub log: LogConfig,
}

impl EngineConfig {
    /// Defaults with an explicit data directory (tests, embedding hosts).
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            auth_token: None,
            data_dir: data_dir.into(),
            max_retries: DEFAULT_MAX_RETRIES,
            request_timeout: Duration::from_millis(15_000),
            cache_capacity: 256,
            sync_interval_unmetered: Duration::from_secs(30),
            sync_interval_cellular: Duration::from_secs(120),
            preflight_health_check: true,
            connectivity_poll_interval: Duration::from_secs(15),
            log: LogConfig::default(),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source; unset or blank means default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let data_dir = match get("CIVICSYNC_DATA_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => dirs::data_dir()
                .map(|d| d.join("civicsync"))
                .ok_or(ConfigError::NoDataDir)?,
        };
        let mut config = Self::with_data_dir(data_dir);

        if let Some(url) = get("CIVICSYNC_API_URL") {
            config.api_url = url.trim().trim_end_matches('/').to_string();
        }
        config.auth_token = get("CIVICSYNC_AUTH_TOKEN");

        if let Some(raw) = get("CIVICSYNC_MAX_RETRIES") {
            config.max_retries = parse("CIVICSYNC_MAX_RETRIES", &raw)?;
        }
        if let Some(raw) = get("CIVICSYNC_REQUEST_TIMEOUT_MS") {
            let ms: u64 = parse("CIVICSYNC_REQUEST_TIMEOUT_MS", &raw)?;
            if ms == 0 {
                return Err(invalid("CIVICSYNC_REQUEST_TIMEOUT_MS", &raw, "must be positive"));
            }
            config.request_timeout = Duration::from_millis(ms);
        }
        if let Some(raw) = get("CIVICSYNC_CACHE_CAPACITY") {
            config.cache_capacity = parse("CIVICSYNC_CACHE_CAPACITY", &raw)?;
            if config.cache_capacity == 0 {
                return Err(invalid("CIVICSYNC_CACHE_CAPACITY", &raw, "must be positive"));
            }
        }
        if let Some(raw) = get("CIVICSYNC_SYNC_INTERVAL_UNMETERED_SECS") {
            config.sync_interval_unmetered =
                Duration::from_secs(parse("CIVICSYNC_SYNC_INTERVAL_UNMETERED_SECS", &raw)?);
        }
        if let Some(raw) = get("CIVICSYNC_SYNC_INTERVAL_CELLULAR_SECS") {
            config.sync_interval_cellular =
                Duration::from_secs(parse("CIVICSYNC_SYNC_INTERVAL_CELLULAR_SECS", &raw)?);
        }
        if let Some(raw) = get("CIVICSYNC_PREFLIGHT_HEALTH_CHECK") {
            config.preflight_health_check = parse_bool("CIVICSYNC_PREFLIGHT_HEALTH_CHECK", &raw)?;
        }
        if let Some(raw) = get("CIVICSYNC_CONNECTIVITY_POLL_SECS") {
            let secs: u64 = parse("CIVICSYNC_CONNECTIVITY_POLL_SECS", &raw)?;
            if secs == 0 {
                return Err(invalid("CIVICSYNC_CONNECTIVITY_POLL_SECS", &raw, "must be positive"));
            }
            config.connectivity_poll_interval = Duration::from_secs(secs);
        }
        if let Some(raw) = get("CIVICSYNC_LOG_FORMAT") {
            config.log.format = raw
                .parse::<LogFormat>()
                .map_err(|e| invalid("CIVICSYNC_LOG_FORMAT", &raw, e.to_string()))?;
        }
        if let Some(level) = get("CIVICSYNC_LOG_LEVEL") {
            config.log.level = level.trim().to_string();
        }

        Ok(config)
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE_NAME)
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            unmetered_interval: self.sync_interval_unmetered,
            cellular_interval: self.sync_interval_cellular,
            preflight_health_check: self.preflight_health_check,
            connectivity_poll_interval: self.connectivity_poll_interval,
        }
    }
}

fn invalid(var: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse<T>(var: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: core::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| invalid(var, raw, e.to_string()))
}

fn parse_bool(var: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(var, raw, "expected true/false")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from(vars: &[(&str, &str)]) -> Result<EngineConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EngineConfig::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = from(&[("CIVICSYNC_DATA_DIR", "/tmp/civic")]).unwrap();
        assert_eq!(cfg.api_url, DEFAULT_API_URL);
        assert_eq!(cfg.max_retries, 5);
        assert_eq!(cfg.request_timeout, Duration::from_secs(15));
        assert_eq!(cfg.cache_capacity, 256);
        assert!(cfg.preflight_health_check);
        assert_eq!(cfg.connectivity_poll_interval, Duration::from_secs(15));
        assert_eq!(cfg.log.format, LogFormat::Json);
        assert_eq!(cfg.db_path(), PathBuf::from("/tmp/civic/civicsync.db"));
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = from(&[
            ("CIVICSYNC_DATA_DIR", "/data"),
            ("CIVICSYNC_API_URL", "https://civic.example/api/"),
            ("CIVICSYNC_AUTH_TOKEN", "tok"),
            ("CIVICSYNC_MAX_RETRIES", "3"),
            ("CIVICSYNC_REQUEST_TIMEOUT_MS", "2500"),
            ("CIVICSYNC_SYNC_INTERVAL_CELLULAR_SECS", "300"),
            ("CIVICSYNC_PREFLIGHT_HEALTH_CHECK", "off"),
            ("CIVICSYNC_CONNECTIVITY_POLL_SECS", "5"),
            ("CIVICSYNC_LOG_FORMAT", "pretty"),
            ("CIVICSYNC_LOG_LEVEL", "debug"),
        ])
        .unwrap();
        assert_eq!(cfg.api_url, "https://civic.example/api");
        assert_eq!(cfg.auth_token.as_deref(), Some("tok"));
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.request_timeout, Duration::from_millis(2500));
        assert_eq!(cfg.orchestrator_settings().cellular_interval, Duration::from_secs(300));
        assert!(!cfg.preflight_health_check);
        assert_eq!(
            cfg.orchestrator_settings().connectivity_poll_interval,
            Duration::from_secs(5)
        );
        assert_eq!(cfg.log.format, LogFormat::Pretty);
        assert_eq!(cfg.log.level, "debug");
    }

    #[test]
    fn bad_numbers_are_rejected() {
        let err = from(&[("CIVICSYNC_DATA_DIR", "/d"), ("CIVICSYNC_MAX_RETRIES", "many")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "CIVICSYNC_MAX_RETRIES", .. }));

        let err = from(&[("CIVICSYNC_DATA_DIR", "/d"), ("CIVICSYNC_CACHE_CAPACITY", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "CIVICSYNC_CACHE_CAPACITY", .. }));

        let err = from(&[("CIVICSYNC_DATA_DIR", "/d"), ("CIVICSYNC_CONNECTIVITY_POLL_SECS", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "CIVICSYNC_CONNECTIVITY_POLL_SECS", .. }));
    }

    #[test]
    fn token_never_serializes() {
        let mut cfg = EngineConfig::with_data_dir("/d");
        cfg.auth_token = Some("secret".into());
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(!json.contains("secret"));
    }
}
