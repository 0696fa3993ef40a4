//! Error types for the tierdown rollup engine.

use std::path::PathBuf;

use thiserror::Error;

/// The main error type for all tierdown operations.
///
/// Configuration problems and store problems are kept in separate variants so
/// operators can tell "fix the config" apart from "retry later".
#[derive(Error, Debug)]
pub enum TierdownError {
    /// The retention or aggregator configuration is invalid.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The store rejected or failed an operation.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The run controller could not make progress.
    #[error("run error: {0}")]
    Run(#[from] RunError),
}

impl TierdownError {
    /// Returns `true` if this error is caused by the configuration rather
    /// than by the store or the runtime.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Returns `true` if retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_transient())
    }
}

/// Errors in the retention level graph or aggregator settings.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A level name is not usable inside a table name.
    #[error("invalid level name '{name}': {reason}")]
    InvalidLevelName {
        /// The offending name.
        name: String,
        /// Why the name was rejected.
        reason: String,
    },

    /// Two levels share the same name.
    #[error("level '{name}' is defined more than once")]
    DuplicateLevel {
        /// The duplicated name.
        name: String,
    },

    /// A numeric level attribute is zero.
    #[error("level '{level}': {field} must be greater than zero")]
    ZeroAttribute {
        /// The level being validated.
        level: String,
        /// The attribute that was zero.
        field: &'static str,
    },

    /// A level names a successor that is not configured.
    #[error("level '{level}' names unknown successor '{successor}'")]
    UnknownSuccessor {
        /// The level with the dangling reference.
        level: String,
        /// The successor name that could not be resolved.
        successor: String,
    },

    /// The successor relation contains a cycle.
    #[error("successor chain contains a cycle through levels {levels:?}")]
    SuccessorCycle {
        /// Levels that could not be ordered.
        levels: Vec<String>,
    },

    /// A target level's frequency does not divide its block size.
    #[error("level '{level}': frequency ({frequency}) does not divide block size ({block_size})")]
    FrequencyDoesNotDivideBlockSize {
        /// The target level.
        level: String,
        /// Its frequency in seconds.
        frequency: u64,
        /// Its block size in seconds.
        block_size: u64,
    },

    /// A target level's frequency is not a multiple of its source's frequency.
    #[error(
        "target level '{target}' frequency ({target_frequency}) is not a multiple of source level '{source_level}' frequency ({source_frequency})"
    )]
    FrequencyNotMultiple {
        /// The source level name.
        source_level: String,
        /// The source level's frequency in seconds.
        source_frequency: u64,
        /// The target level name.
        target: String,
        /// The target level's frequency in seconds.
        target_frequency: u64,
    },

    /// An aggregation rule pattern is unusable.
    #[error("invalid aggregation pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// The pattern text.
        pattern: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The worker pool size is zero.
    #[error("invalid pool size: {size} (must be > 0)")]
    InvalidPoolSize {
        /// The invalid size.
        size: usize,
    },

    /// A duration string could not be parsed.
    #[error("invalid duration '{value}': {reason}")]
    InvalidDuration {
        /// The text that failed to parse.
        value: String,
        /// Why it failed.
        reason: String,
    },

    /// The run frequency is zero.
    #[error("run frequency must be greater than zero")]
    ZeroRunFrequency,

    /// The configuration file could not be read.
    #[error("failed to read configuration '{}': {source}", path.display())]
    Load {
        /// The configuration file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for the expected model.
    #[error("failed to parse configuration '{}': {source}", path.display())]
    Parse {
        /// The configuration file path.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

/// Errors reported by a [`Store`](crate::store::Store) implementation.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A write was not acknowledged in time. The write may or may not have
    /// been applied.
    #[error("write to table '{table}' timed out")]
    WriteTimeout {
        /// The table being written.
        table: String,
    },

    /// The table does not exist.
    #[error("table '{table}' does not exist")]
    TableNotFound {
        /// The missing table.
        table: String,
    },

    /// File system access failed.
    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        /// The path being accessed.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Stored table data could not be decoded.
    #[error("table data '{}' is corrupted: {reason}", path.display())]
    Corrupted {
        /// The file holding the table.
        path: PathBuf,
        /// Description of the corruption.
        reason: String,
    },

    /// The store is unreachable or refused the request.
    #[error("store unavailable: {reason}")]
    Unavailable {
        /// Description of the failure.
        reason: String,
    },
}

impl StoreError {
    /// Returns `true` for errors the access layer absorbs with a backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::WriteTimeout { .. })
    }
}

/// Errors raised by the run controller itself.
#[derive(Error, Debug)]
pub enum RunError {
    /// The worker pool has been shut down and cannot accept tasks.
    #[error("worker pool is shut down")]
    PoolClosed,

    /// A table task panicked.
    #[error("task for table '{table}' panicked: {message}")]
    TaskPanicked {
        /// The source table of the task.
        table: String,
        /// The panic payload, if it was a string.
        message: String,
    },

    /// A worker thread could not be started.
    #[error("failed to spawn worker thread: {source}")]
    SpawnWorker {
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Type alias for `Result<T, TierdownError>`.
pub type Result<T> = std::result::Result<T, TierdownError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let config: TierdownError = ConfigError::ZeroRunFrequency.into();
        assert!(config.is_configuration());
        assert!(!config.is_transient());

        let timeout: TierdownError = StoreError::WriteTimeout {
            table: "t_raw_b1".to_string(),
        }
        .into();
        assert!(!timeout.is_configuration());
        assert!(timeout.is_transient());

        let missing: TierdownError = StoreError::TableNotFound {
            table: "t_raw_b1".to_string(),
        }
        .into();
        assert!(!missing.is_transient());
    }

    #[test]
    fn test_error_messages() {
        let err = ConfigError::FrequencyDoesNotDivideBlockSize {
            level: "hourly".to_string(),
            frequency: 7,
            block_size: 3600,
        };
        assert_eq!(
            err.to_string(),
            "level 'hourly': frequency (7) does not divide block size (3600)"
        );
    }
}
