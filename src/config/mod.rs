//! Engine configuration.
//!
//! [`Config`] is constructed once by the host and handed to the engine at
//! startup. It derives [`serde::Deserialize`] so it can be loaded from any
//! serde format; durations are expressed as (fractional) seconds.

use std::time::Duration;

use serde::{Deserialize, Deserializer};
use thiserror::Error;

/// Errors returned by [`Config::validate`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
}

/// Defaults and limits applied by the engine.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use edgecache::config::Config;
///
/// let config = Config::default()
///     .with_default_ttl(Duration::from_secs(60))
///     .with_default_grace(Duration::ZERO);
///
/// assert!(config.validate().is_ok());
/// assert_eq!(config.default_keep, Duration::ZERO);
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// TTL for heuristically cacheable responses without explicit freshness.
    #[serde(deserialize_with = "seconds")]
    pub default_ttl: Duration,
    /// Grace when `stale-while-revalidate` is absent or invalid.
    #[serde(deserialize_with = "seconds")]
    pub default_grace: Duration,
    /// Window after grace during which an object is kept as a validation basis.
    #[serde(deserialize_with = "seconds")]
    pub default_keep: Duration,
    /// Lifetime of a hit-for-miss marker when the response itself has no TTL.
    #[serde(deserialize_with = "seconds")]
    pub hit_for_miss_ttl: Duration,
    /// TTL given to grace-only responses so they are retained.
    #[serde(deserialize_with = "seconds")]
    pub grace_only_ttl: Duration,
    /// Largest body, in bytes, that will be stored.
    pub max_object_size: usize,
    #[serde(deserialize_with = "seconds")]
    pub backend_timeout: Duration,
    #[serde(deserialize_with = "seconds")]
    pub sweep_interval: Duration,
    /// Ask backends for gzip and gunzip on delivery for clients without it.
    pub gzip_support: bool,
    /// How many times one request may restart its lookup after waiting on
    /// a sibling fetch that produced nothing usable.
    pub max_restarts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(120),
            default_grace: Duration::from_secs(10),
            default_keep: Duration::ZERO,
            hit_for_miss_ttl: Duration::from_secs(120),
            grace_only_ttl: Duration::from_millis(1),
            max_object_size: 8 * 1024 * 1024,
            backend_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(1),
            gzip_support: true,
            max_restarts: 4,
        }
    }
}

impl Config {
    /// Checks the limits the engine relies on.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Zero`] naming the first field that must be
    /// positive but is not.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_object_size == 0 {
            return Err(ConfigError::Zero {
                field: "max_object_size",
            });
        }
        let durations = [
            ("backend_timeout", self.backend_timeout),
            ("sweep_interval", self.sweep_interval),
            ("grace_only_ttl", self.grace_only_ttl),
        ];
        match durations.into_iter().find(|(_, d)| d.is_zero()) {
            Some((field, _)) => Err(ConfigError::Zero { field }),
            None => Ok(()),
        }
    }

    #[must_use]
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_default_grace(mut self, grace: Duration) -> Self {
        self.default_grace = grace;
        self
    }

    #[must_use]
    pub fn with_default_keep(mut self, keep: Duration) -> Self {
        self.default_keep = keep;
        self
    }

    #[must_use]
    pub fn with_hit_for_miss_ttl(mut self, ttl: Duration) -> Self {
        self.hit_for_miss_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_grace_only_ttl(mut self, ttl: Duration) -> Self {
        self.grace_only_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_max_object_size(mut self, bytes: usize) -> Self {
        self.max_object_size = bytes;
        self
    }

    #[must_use]
    pub fn with_backend_timeout(mut self, timeout: Duration) -> Self {
        self.backend_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    #[must_use]
    pub fn with_gzip_support(mut self, enabled: bool) -> Self {
        self.gzip_support = enabled;
        self
    }

    #[must_use]
    pub fn with_max_restarts(mut self, restarts: u32) -> Self {
        self.max_restarts = restarts;
        self
    }
}

fn seconds<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
}
