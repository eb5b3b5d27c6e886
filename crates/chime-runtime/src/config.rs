#![forbid(unsafe_code)]

//! Runtime configuration loaded from TOML.
//!
//! ```toml
//! [heartbeat]
//! interval_ms = 250
//! backlog = 8
//!
//! [events]
//! cache_capacity = 512
//! ```
//!
//! Every key is optional; missing keys take their defaults. Unknown keys are
//! rejected so typos surface at load time. Environment overrides
//! (`CHIME_HEARTBEAT_INTERVAL_MS`, `CHIME_EVENT_CACHE_CAPACITY`) are applied
//! by [`RuntimeConfig::with_env_overrides`].

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chime_core::{DEFAULT_CACHE_CAPACITY, NotifyingEntity};
use serde::{Deserialize, Serialize};

use crate::heartbeat::{DEFAULT_BACKLOG, DEFAULT_INTERVAL, HeartbeatConfig};

/// Overrides `[heartbeat] interval_ms`.
pub const ENV_HEARTBEAT_INTERVAL_MS: &str = "CHIME_HEARTBEAT_INTERVAL_MS";
/// Overrides `[events] cache_capacity`.
pub const ENV_EVENT_CACHE_CAPACITY: &str = "CHIME_EVENT_CACHE_CAPACITY";

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

/// `[heartbeat]` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HeartbeatSection {
    pub interval_ms: u64,
    /// Ticks queued per listener before ticks are dropped for it.
    pub backlog: usize,
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_INTERVAL.as_millis() as u64,
            backlog: DEFAULT_BACKLOG,
        }
    }
}

/// `[events]` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EventsSection {
    /// Distinct property names cached per notifier. `0` disables caching.
    pub cache_capacity: usize,
}

impl Default for EventsSection {
    fn default() -> Self {
        Self {
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    pub heartbeat: HeartbeatSection,
    pub events: EventsSection,
}

impl RuntimeConfig {
    /// Parse and validate a TOML document.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] for malformed TOML or unknown keys,
    /// [`ConfigError::Invalid`] for out-of-range values.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Io`] if the file cannot be read, otherwise as
    /// [`from_toml_str`](Self::from_toml_str).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let input = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&input)?;
        tracing::debug!(path = %path.display(), ?config, "runtime config loaded");
        Ok(config)
    }

    /// Apply overrides from the process environment.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] if an override is not a valid number.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// As [`with_env_overrides`](Self::with_env_overrides).
    pub fn with_overrides_from(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(raw) = lookup(ENV_HEARTBEAT_INTERVAL_MS) {
            self.heartbeat.interval_ms =
                parse_override(ENV_HEARTBEAT_INTERVAL_MS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_EVENT_CACHE_CAPACITY) {
            self.events.cache_capacity = parse_override(ENV_EVENT_CACHE_CAPACITY, &raw)?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] when `heartbeat.interval_ms` or
    /// `heartbeat.backlog` is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat.interval_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "heartbeat.interval_ms",
                message: "must be greater than zero".into(),
            });
        }
        if self.heartbeat.backlog == 0 {
            return Err(ConfigError::Invalid {
                key: "heartbeat.backlog",
                message: "must be greater than zero".into(),
            });
        }
        Ok(())
    }

    /// Heartbeat settings derived from this config.
    #[must_use]
    pub fn heartbeat_config(&self) -> HeartbeatConfig {
        HeartbeatConfig::new(Duration::from_millis(self.heartbeat.interval_ms))
            .with_backlog(self.heartbeat.backlog)
    }

    /// A fresh entity sized by `[events] cache_capacity`.
    #[must_use]
    pub fn new_entity(&self) -> NotifyingEntity {
        NotifyingEntity::with_cache_capacity(self.events.cache_capacity)
    }
}

fn parse_override<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|err: T::Err| ConfigError::Invalid {
        key,
        message: format!("{raw:?}: {err}"),
    })
}
