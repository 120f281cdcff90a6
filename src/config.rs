//! Controller configuration from `FERRY_*` environment variables
//!
//! - `FERRY_HEALTH_PORT` - port for health, metrics and operator API (default 8080)
//! - `FERRY_DATABASE_URL` - PostgreSQL URL; unset runs on the in-memory store
//! - `FERRY_GATEWAY_TIMEOUT_SECS` - bound on each cluster call (default 5)
//! - `FERRY_WATCH_NAMESPACE` - namespace to watch; unset watches all
//! - `FERRY_EVENT_BUFFER` - queue depth per capturer (default 256)
//! - `FERRY_CDEVENTS_ENABLED` - `true`/`1` to emit CDEvents
//! - `FERRY_CDEVENTS_SINK_URL` - where CDEvents are POSTed

use crate::capture::watch::DEFAULT_BUFFER;
use crate::capture::WatchConfig;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_HEALTH_PORT: u16 = 8080;

pub const DEFAULT_GATEWAY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} has invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub health_port: u16,
    pub database_url: Option<String>,
    pub gateway_timeout: Duration,
    pub watch: WatchConfig,
    pub cdevents_enabled: bool,
    pub cdevents_sink_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            health_port: DEFAULT_HEALTH_PORT,
            database_url: None,
            gateway_timeout: DEFAULT_GATEWAY_TIMEOUT,
            watch: WatchConfig::default(),
            cdevents_enabled: false,
            cdevents_sink_url: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; empty values count as unset
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let health_port = parse(&get, "FERRY_HEALTH_PORT")?.unwrap_or(DEFAULT_HEALTH_PORT);
        let timeout_secs: u64 = parse(&get, "FERRY_GATEWAY_TIMEOUT_SECS")?
            .unwrap_or(DEFAULT_GATEWAY_TIMEOUT.as_secs());
        if timeout_secs == 0 {
            return Err(invalid("FERRY_GATEWAY_TIMEOUT_SECS", "0", "must be positive"));
        }
        let buffer: usize = parse(&get, "FERRY_EVENT_BUFFER")?.unwrap_or(DEFAULT_BUFFER);
        if buffer == 0 {
            return Err(invalid("FERRY_EVENT_BUFFER", "0", "must be positive"));
        }

        Ok(Self {
            health_port,
            database_url: get("FERRY_DATABASE_URL"),
            gateway_timeout: Duration::from_secs(timeout_secs),
            watch: WatchConfig {
                namespace: get("FERRY_WATCH_NAMESPACE"),
                buffer,
            },
            cdevents_enabled: get("FERRY_CDEVENTS_ENABLED")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            cdevents_sink_url: get("FERRY_CDEVENTS_SINK_URL"),
        })
    }
}

fn invalid(name: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        name,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse<T>(
    get: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    get(name)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| invalid(name, &raw, &e.to_string()))
        })
        .transpose()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.health_port, 8080);
        assert_eq!(config.gateway_timeout, Duration::from_secs(5));
        assert_eq!(config.watch.buffer, 256);
        assert!(config.database_url.is_none());
    }

    #[test]
    fn test_all_variables_read() {
        let config = Config::from_lookup(lookup(&[
            ("FERRY_HEALTH_PORT", "9090"),
            ("FERRY_DATABASE_URL", "postgres://ferry@db/ferry"),
            ("FERRY_GATEWAY_TIMEOUT_SECS", "10"),
            ("FERRY_WATCH_NAMESPACE", "shop"),
            ("FERRY_EVENT_BUFFER", "64"),
            ("FERRY_CDEVENTS_ENABLED", "1"),
            ("FERRY_CDEVENTS_SINK_URL", "http://sink.local/events"),
        ]))
        .unwrap();

        assert_eq!(config.health_port, 9090);
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://ferry@db/ferry")
        );
        assert_eq!(config.gateway_timeout, Duration::from_secs(10));
        assert_eq!(config.watch.namespace.as_deref(), Some("shop"));
        assert_eq!(config.watch.buffer, 64);
        assert!(config.cdevents_enabled);
        assert_eq!(
            config.cdevents_sink_url.as_deref(),
            Some("http://sink.local/events")
        );
    }

    #[test]
    fn test_empty_values_count_as_unset() {
        let config = Config::from_lookup(lookup(&[
            ("FERRY_DATABASE_URL", ""),
            ("FERRY_WATCH_NAMESPACE", "  "),
            ("FERRY_CDEVENTS_ENABLED", "yes"),
        ]))
        .unwrap();
        assert!(config.database_url.is_none());
        assert!(config.watch.namespace.is_none());
        assert!(!config.cdevents_enabled);
    }

    #[test]
    fn test_invalid_numbers_rejected() {
        let err = Config::from_lookup(lookup(&[("FERRY_HEALTH_PORT", "http")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { name: "FERRY_HEALTH_PORT", .. }
        ));

        let err = Config::from_lookup(lookup(&[("FERRY_GATEWAY_TIMEOUT_SECS", "0")])).unwrap_err();
        assert!(err.to_string().contains("must be positive"));

        assert!(Config::from_lookup(lookup(&[("FERRY_EVENT_BUFFER", "-1")])).is_err());
    }
}
