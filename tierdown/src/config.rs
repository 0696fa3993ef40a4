//! JSON configuration of the aggregator and its retention levels.
//!
//! ```json
//! {
//!   "aggregator": { "pool_size": 4, "frequency": "15m", "dry_run": false },
//!   "retention": {
//!     "levels": [
//!       { "name": "raw", "frequency": 300, "block_count": 3, "block_size": 3600, "next": "hourly" },
//!       { "name": "hourly", "frequency": 3600, "block_count": 2, "block_size": 604800 }
//!     ],
//!     "aggregation": { "rules": [ { "pattern": "*.count", "function": "sum" } ] }
//!   }
//! }
//! ```
//!
//! Durations are given either as a number of seconds or as a string with a
//! unit suffix (`ms`, `s`, `m`, `h`, `d`).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::access::AccessSettings;
use crate::error::{ConfigError, Result};
use crate::retention::{AggregationPolicy, RetentionConfiguration, RetentionLevel};

/// The whole configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierdownConfig {
    /// Scheduling and store-access settings.
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    /// Level graph and aggregation policy.
    pub retention: RetentionSection,
}

/// Scheduling and store-access settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Worker threads running table tasks.
    pub pool_size: usize,
    /// Interval between runs of the periodic trigger.
    #[serde(with = "duration_serde")]
    pub frequency: Duration,
    /// Pause after each table task.
    #[serde(with = "duration_serde")]
    pub sleep_after_each_table: Duration,
    /// Disables every mutating store call.
    pub dry_run: bool,
    /// Initial wait after a write timeout.
    #[serde(with = "duration_serde")]
    pub wait_after_write_timeout: Duration,
    /// Retries of a timed-out write.
    pub max_write_retries: u32,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            pool_size: 10,
            frequency: Duration::from_secs(15 * 60),
            sleep_after_each_table: Duration::ZERO,
            dry_run: false,
            wait_after_write_timeout: Duration::ZERO,
            max_write_retries: 2,
        }
    }
}

impl AggregatorConfig {
    /// Store-access settings derived from this section.
    pub fn access_settings(&self) -> AccessSettings {
        AccessSettings {
            dry_run: self.dry_run,
            wait_after_write_timeout: self.wait_after_write_timeout,
            max_write_retries: self.max_write_retries,
        }
    }

    /// Checks the scheduling settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidPoolSize`] or
    /// [`ConfigError::ZeroRunFrequency`].
    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(ConfigError::InvalidPoolSize {
                size: self.pool_size,
            }
            .into());
        }
        if self.frequency.is_zero() {
            return Err(ConfigError::ZeroRunFrequency.into());
        }
        Ok(())
    }
}

/// Level graph and aggregation policy as written in the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionSection {
    /// All retention levels.
    pub levels: Vec<RetentionLevel>,
    /// How series are reduced.
    #[serde(default)]
    pub aggregation: AggregationPolicy,
}

impl TierdownConfig {
    /// Reads and validates a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Load`] or [`ConfigError::Parse`] when the file
    /// cannot be read or decoded, or any validation error.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| ConfigError::Load {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Self = serde_json::from_str(&json).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.aggregator.validate()?;
        Ok(config)
    }

    /// Builds the validated retention configuration.
    ///
    /// # Errors
    ///
    /// Returns the first problem found in the level graph.
    pub fn retention(&self) -> Result<RetentionConfiguration> {
        RetentionConfiguration::new(
            self.retention.levels.clone(),
            self.retention.aggregation.clone(),
        )
    }
}

/// Where the run controller gets its retention configuration from.
///
/// Asked once at the start of every run, so implementations may pick up
/// changes between runs.
pub trait ConfigSource: Send + Sync {
    /// Returns the configuration for the next run.
    ///
    /// # Errors
    ///
    /// Returns an error if no valid configuration is available.
    fn refresh(&self) -> Result<Arc<RetentionConfiguration>>;
}

/// A fixed configuration.
#[derive(Debug, Clone)]
pub struct StaticConfig(Arc<RetentionConfiguration>);

impl StaticConfig {
    /// Wraps `config`.
    pub fn new(config: RetentionConfiguration) -> Self {
        Self(Arc::new(config))
    }
}

impl ConfigSource for StaticConfig {
    fn refresh(&self) -> Result<Arc<RetentionConfiguration>> {
        Ok(Arc::clone(&self.0))
    }
}

/// A JSON file re-read on every refresh.
#[derive(Debug, Clone)]
pub struct FileConfig {
    path: PathBuf,
}

impl FileConfig {
    /// Reads configuration from `path` on each refresh.
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    /// The configuration file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigSource for FileConfig {
    fn refresh(&self) -> Result<Arc<RetentionConfiguration>> {
        let config = TierdownConfig::load(&self.path)?;
        tracing::debug!(path = %self.path.display(), "configuration reloaded");
        Ok(Arc::new(config.retention()?))
    }
}

/// Parses `"500ms"`, `"90s"`, `"15m"`, `"2h"`, `"1d"`, or a bare number of
/// seconds.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidDuration`] for anything else.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let invalid = |reason: &str| ConfigError::InvalidDuration {
        value: s.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Err(invalid("empty duration").into());
    }

    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split);
    let value: u64 = digits.parse().map_err(|_| invalid("missing number"))?;

    let millis = match unit {
        "ms" => Some(value),
        "" | "s" => value.checked_mul(1000),
        "m" => value.checked_mul(60_000),
        "h" => value.checked_mul(3_600_000),
        "d" => value.checked_mul(86_400_000),
        _ => return Err(invalid("unknown unit, use ms, s, m, h, or d").into()),
    };
    millis
        .map(Duration::from_millis)
        .ok_or_else(|| invalid("duration too large").into())
}

mod duration_serde {
    use std::time::Duration;

    use serde::de::{self, Deserializer, Visitor};
    use serde::{Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(DurationVisitor)
    }

    struct DurationVisitor;

    impl Visitor<'_> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("a number of seconds or a string like \"15m\"")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
            Ok(Duration::from_secs(v))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
            u64::try_from(v)
                .map(Duration::from_secs)
                .map_err(|_| E::custom("duration cannot be negative"))
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<Duration, E> {
            Duration::try_from_secs_f64(v).map_err(E::custom)
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
            super::parse_duration(v).map_err(E::custom)
        }
    }
}
