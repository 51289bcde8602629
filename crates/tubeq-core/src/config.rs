//! Consumer configuration.
//!
//! # Defaults
//! - reserve timeout: 30 minutes
//! - error release delay: 15 seconds
//! - release priority: 1024
//!
//! # Environment
//! `from_env` overrides any of them:
//! - `TUBEQ_RESERVE_TIMEOUT_SECS`
//! - `TUBEQ_ERROR_DELAY_SECS`
//! - `TUBEQ_RELEASE_PRIORITY`
//!
//! Durations are whole seconds and must fit the broker's 32-bit range
//! ([`MAX_DURATION_SECS`]); anything else is a [`ConfigError::Invalid`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const ENV_RESERVE_TIMEOUT_SECS: &str = "TUBEQ_RESERVE_TIMEOUT_SECS";
pub const ENV_ERROR_DELAY_SECS: &str = "TUBEQ_ERROR_DELAY_SECS";
pub const ENV_RELEASE_PRIORITY: &str = "TUBEQ_RELEASE_PRIORITY";

/// Largest duration, in seconds, a broker accepts for delays and timeouts.
pub const MAX_DURATION_SECS: u64 = u32::MAX as u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Upper bound for one reserve call. Hitting it is not an error.
    pub reserve_timeout: Duration,

    /// Delay used when a processor reports an error without choosing a delay.
    pub error_release_delay: Duration,

    /// Priority applied to every release.
    pub release_priority: u32,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            reserve_timeout: Duration::from_secs(30 * 60),
            error_release_delay: Duration::from_secs(15),
            release_priority: 1024,
        }
    }
}

impl ConsumerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (unset keys keep their default).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(timeout) = parse_secs(&lookup, ENV_RESERVE_TIMEOUT_SECS)? {
            config.reserve_timeout = timeout;
        }
        if let Some(delay) = parse_secs(&lookup, ENV_ERROR_DELAY_SECS)? {
            config.error_release_delay = delay;
        }
        if let Some(priority) = parse::<u32>(&lookup, ENV_RELEASE_PRIORITY)? {
            config.release_priority = priority;
        }
        Ok(config)
    }
}

fn parse_secs(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<Duration>, ConfigError> {
    match parse::<u64>(lookup, key)? {
        Some(secs) if secs > MAX_DURATION_SECS => Err(ConfigError::Invalid {
            key,
            value: secs.to_string(),
        }),
        secs => Ok(secs.map(Duration::from_secs)),
    }
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}
