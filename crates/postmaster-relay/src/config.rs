//! Relay configuration.
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `POSTMASTER_HEARTBEAT_SECS` | 10 | Keepalive interval in seconds |
//! | `POSTMASTER_STORE_CAPACITY` | 1000 | Events kept by a panel's store |

use std::{env, str::FromStr, time::Duration};

use postmaster_core::{DEFAULT_CAPACITY, StoreConfig};
use thiserror::Error;

use crate::heartbeat::HEARTBEAT_INTERVAL;

const HEARTBEAT_VAR: &str = "POSTMASTER_HEARTBEAT_SECS";
const CAPACITY_VAR: &str = "POSTMASTER_STORE_CAPACITY";

/// Configuration error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {message}")]
    InvalidValue { var: &'static str, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayConfig {
    pub heartbeat_interval: Duration,
    pub store_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: HEARTBEAT_INTERVAL,
            store_capacity: DEFAULT_CAPACITY,
        }
    }
}

impl RelayConfig {
    /// Read from the process environment. Unset variables keep their default.
    ///
    /// # Errors
    /// Returns [`ConfigError`] if a variable is not a positive integer.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Read through `lookup` instead of the process environment.
    ///
    /// # Errors
    /// Returns [`ConfigError`] if a variable is not a positive integer.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(secs) = parse_positive::<u64>(HEARTBEAT_VAR, lookup(HEARTBEAT_VAR))? {
            config.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Some(capacity) = parse_positive::<usize>(CAPACITY_VAR, lookup(CAPACITY_VAR))? {
            config.store_capacity = capacity;
        }
        Ok(config)
    }

    #[must_use]
    pub const fn store_config(&self) -> StoreConfig {
        StoreConfig::new(self.store_capacity)
    }
}

fn parse_positive<T>(var: &'static str, raw: Option<String>) -> Result<Option<T>, ConfigError>
where
    T: FromStr + Default + PartialEq,
    T::Err: std::fmt::Display,
{
    let Some(raw) = raw else {
        return Ok(None);
    };

    let value = raw.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
        var,
        message: format!("'{raw}': {e}"),
    })?;
    if value == T::default() {
        return Err(ConfigError::InvalidValue {
            var,
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |var| vars.get(var).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = RelayConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, RelayConfig::default());
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.store_capacity, 1000);
    }

    #[test]
    fn test_overrides() {
        let config = RelayConfig::from_lookup(lookup(&[
            (HEARTBEAT_VAR, "3"),
            (CAPACITY_VAR, " 50 "),
        ]))
        .unwrap();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(3));
        assert_eq!(config.store_config().capacity, 50);
    }

    #[test]
    fn test_zero_is_rejected() {
        let err = RelayConfig::from_lookup(lookup(&[(CAPACITY_VAR, "0")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                var: CAPACITY_VAR,
                message: "must be greater than zero".to_string(),
            }
        );
    }

    #[test]
    fn test_garbage_is_rejected() {
        let err = RelayConfig::from_lookup(lookup(&[(HEARTBEAT_VAR, "soon")])).unwrap_err();
        assert!(err.to_string().starts_with("invalid value for POSTMASTER_HEARTBEAT_SECS"));
    }
}
