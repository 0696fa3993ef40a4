//! Mapping between wall-clock time, level blocks, and table names.
//!
//! Each level divides time since the epoch into blocks of `block_size`
//! seconds. Block `i` covers `[i * block_size, (i + 1) * block_size)` and is
//! stored in exactly one table:
//!
//! ```text
//! t_<level>_b<block>        e.g. level "raw", block 471_240 -> t_raw_b471240
//! ```
//!
//! Level names only contain ASCII letters and digits, so the `_b` separator is
//! unambiguous. Names that do not follow this layout, or that reference a
//! level missing from the current configuration, are rejected by [`parse`].

use std::fmt;

use crate::retention::{RetentionConfiguration, RetentionLevel};

/// Prefix of every table managed by tierdown.
pub const TABLE_PREFIX: &str = "t_";

/// Separator between level name and block index.
pub const BLOCK_SEPARATOR: &str = "_b";

/// Half-open time interval `[start, end)` in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interval {
    /// Inclusive start.
    pub start: u64,
    /// Exclusive end.
    pub end: u64,
}

impl Interval {
    /// Returns `true` if `timestamp` lies in the interval.
    pub fn contains(&self, timestamp: u64) -> bool {
        self.start <= timestamp && timestamp < self.end
    }
}

/// Block index of `timestamp` within `level`.
pub fn block_index_of(level: &RetentionLevel, timestamp: u64) -> u64 {
    timestamp / level.block_size()
}

/// Time interval covered by block `block` of `level`.
pub fn interval_of(level: &RetentionLevel, block: u64) -> Interval {
    let start = block.saturating_mul(level.block_size());
    Interval {
        start,
        end: start.saturating_add(level.block_size()),
    }
}

/// Returns `true` once `block` has aged out of the level's window of live
/// blocks, i.e. `block <= block_index_of(now) - block_count`.
///
/// While fewer than `block_count` blocks have elapsed since the epoch nothing
/// is due.
pub fn is_due(level: &RetentionLevel, block: u64, now: u64) -> bool {
    block_index_of(level, now)
        .checked_sub(level.block_count())
        .is_some_and(|newest_due| block <= newest_due)
}

/// Canonical table name of `block` in `level`.
pub fn canonical_name(level: &RetentionLevel, block: u64) -> String {
    format!("{TABLE_PREFIX}{}{BLOCK_SEPARATOR}{block}", level.name())
}

/// Why a table name was not accepted by [`parse`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameRejection {
    /// The name does not follow `t_<level>_b<block>`.
    Malformed,
    /// The block index is not a canonical unsigned decimal number.
    BadBlockIndex,
    /// The level is not part of the current configuration.
    UnknownLevel(String),
}

impl fmt::Display for NameRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed => write!(
                f,
                "does not match {TABLE_PREFIX}<level>{BLOCK_SEPARATOR}<block>"
            ),
            Self::BadBlockIndex => write!(f, "block index is not a canonical number"),
            Self::UnknownLevel(level) => write!(f, "level '{level}' is not configured"),
        }
    }
}

/// Parses a table name into its configured level and block index.
///
/// # Errors
///
/// Returns a [`NameRejection`] describing why the name was not accepted.
pub fn parse<'a>(
    name: &str,
    config: &'a RetentionConfiguration,
) -> std::result::Result<(&'a RetentionLevel, u64), NameRejection> {
    let rest = name.strip_prefix(TABLE_PREFIX).ok_or(NameRejection::Malformed)?;
    let (level_name, block) = rest
        .split_once(BLOCK_SEPARATOR)
        .ok_or(NameRejection::Malformed)?;

    if level_name.is_empty() || !level_name.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(NameRejection::Malformed);
    }

    let canonical = !block.is_empty()
        && block.bytes().all(|b| b.is_ascii_digit())
        && (block == "0" || !block.starts_with('0'));
    if !canonical {
        return Err(NameRejection::BadBlockIndex);
    }
    let block: u64 = block.parse().map_err(|_| NameRejection::BadBlockIndex)?;

    let level = config
        .level(level_name)
        .ok_or_else(|| NameRejection::UnknownLevel(level_name.to_string()))?;

    Ok((level, block))
}

/// One physical table: a block of a retention level.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RetentionTable {
    level: RetentionLevel,
    block: u64,
}

impl RetentionTable {
    /// Creates the table for `block` of `level`.
    pub fn new(level: RetentionLevel, block: u64) -> Self {
        Self { level, block }
    }

    /// Creates the table of `level` that contains `timestamp`.
    pub fn containing(level: &RetentionLevel, timestamp: u64) -> Self {
        Self::new(level.clone(), block_index_of(level, timestamp))
    }

    /// Parses a physical table name against `config`.
    ///
    /// # Errors
    ///
    /// Returns a [`NameRejection`] if the name is malformed or names an
    /// unknown level.
    pub fn from_name(
        name: &str,
        config: &RetentionConfiguration,
    ) -> std::result::Result<Self, NameRejection> {
        parse(name, config).map(|(level, block)| Self::new(level.clone(), block))
    }

    /// The level this table belongs to.
    pub fn level(&self) -> &RetentionLevel {
        &self.level
    }

    /// The block index.
    pub fn block(&self) -> u64 {
        self.block
    }

    /// The covered time interval.
    pub fn interval(&self) -> Interval {
        interval_of(&self.level, self.block)
    }

    /// Returns `true` if `timestamp` falls into this table.
    pub fn contains(&self, timestamp: u64) -> bool {
        self.interval().contains(timestamp)
    }

    /// Returns `true` if this table is due at `now`.
    pub fn is_due(&self, now: u64) -> bool {
        is_due(&self.level, self.block, now)
    }

    /// The physical table name.
    pub fn name(&self) -> String {
        canonical_name(&self.level, self.block)
    }
}

impl fmt::Display for RetentionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}
