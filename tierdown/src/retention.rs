//! Retention levels, their successor graph, and the aggregation policy.
//!
//! Levels are stored in an arena ordered by name; the successor of a level is
//! an index into that arena rather than a reference. The processing order is
//! computed once, when the configuration is built:
//!
//! ```text
//! raw ──► hourly ──► daily          order: raw, hourly, daily, fast, ...
//! fast ──► hourly                    (every level before its successor)
//! ```
//!
//! Running finer levels first lets a successor table written earlier in a run
//! become due and be aggregated again later in the same run.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::reduce::{AggregationFn, check_divisibility};

/// A named resolution tier of the rollup policy.
///
/// # Example
///
/// ```rust
/// use tierdown::retention::RetentionLevel;
///
/// // 5 minute points, one table per hour, keep 3 hours before rolling up.
/// let raw = RetentionLevel::new("raw", 300, 3, 3600, Some("hourly"));
/// assert_eq!(raw.next(), Some("hourly"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RetentionLevel {
    name: String,
    frequency: u64,
    block_count: u64,
    block_size: u64,
    next: Option<String>,
}

impl RetentionLevel {
    /// Creates a level. Validation happens when the level becomes part of a
    /// [`RetentionConfiguration`].
    pub fn new(
        name: impl Into<String>,
        frequency: u64,
        block_count: u64,
        block_size: u64,
        next: Option<&str>,
    ) -> Self {
        Self {
            name: name.into(),
            frequency,
            block_count,
            block_size,
            next: next.map(str::to_string),
        }
    }

    /// Unique level name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Seconds represented by one point of this level.
    pub fn frequency(&self) -> u64 {
        self.frequency
    }

    /// Number of live blocks kept before a block becomes due.
    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    /// Seconds spanned by one block (one table).
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Name of the successor level, if any.
    pub fn next(&self) -> Option<&str> {
        self.next.as_deref()
    }

    fn validate(&self) -> Result<()> {
        validate_level_name(&self.name)?;

        for (field, value) in [
            ("frequency", self.frequency),
            ("block_count", self.block_count),
            ("block_size", self.block_size),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroAttribute {
                    level: self.name.clone(),
                    field,
                }
                .into());
            }
        }

        Ok(())
    }
}

impl std::fmt::Display for RetentionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}(frequency={}s, blocks={}, block_size={}s",
            self.name, self.frequency, self.block_count, self.block_size
        )?;
        match &self.next {
            Some(next) => write!(f, ", next={next})"),
            None => write!(f, ")"),
        }
    }
}

/// Checks that `name` can be embedded in a table name.
///
/// Level names are restricted to ASCII letters and digits, which keeps the
/// table-name separator out of them.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidLevelName`] for empty names or names with
/// other characters.
pub fn validate_level_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ConfigError::InvalidLevelName {
            name: name.to_string(),
            reason: "name cannot be empty".to_string(),
        }
        .into());
    }

    if let Some(c) = name.chars().find(|c| !c.is_ascii_alphanumeric()) {
        return Err(ConfigError::InvalidLevelName {
            name: name.to_string(),
            reason: format!("character {c:?} is not an ASCII letter or digit"),
        }
        .into());
    }

    Ok(())
}

/// Series-name pattern with `*` wildcards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SeriesPattern(String);

impl SeriesPattern {
    /// Creates a pattern.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidPattern`] for empty patterns.
    pub fn new(pattern: impl Into<String>) -> Result<Self> {
        let pattern = pattern.into();
        if pattern.is_empty() {
            return Err(ConfigError::InvalidPattern {
                pattern,
                reason: "pattern cannot be empty".to_string(),
            }
            .into());
        }
        Ok(Self(pattern))
    }

    /// Returns `true` if `series` matches, `*` standing for any run of
    /// characters (including none).
    pub fn matches(&self, series: &str) -> bool {
        let pattern = self.0.as_bytes();
        let text = series.as_bytes();

        let (mut p, mut t) = (0, 0);
        let mut star: Option<(usize, usize)> = None;

        while t < text.len() {
            if p < pattern.len() && pattern[p] == b'*' {
                star = Some((p, t));
                p += 1;
            } else if p < pattern.len() && pattern[p] == text[t] {
                p += 1;
                t += 1;
            } else if let Some((star_p, star_t)) = star {
                // Let the last star swallow one more character.
                p = star_p + 1;
                t = star_t + 1;
                star = Some((star_p, star_t + 1));
            } else {
                return false;
            }
        }

        pattern[p..].iter().all(|&b| b == b'*')
    }

    /// The pattern text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SeriesPattern {
    type Error = crate::error::TierdownError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<SeriesPattern> for String {
    fn from(value: SeriesPattern) -> Self {
        value.0
    }
}

/// One aggregation rule: series matching `pattern` use `function`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationRule {
    /// Series-name pattern.
    pub pattern: SeriesPattern,
    /// Reduction applied to matching series.
    pub function: AggregationFn,
}

/// Maps series names to reduction functions. The first matching rule wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationPolicy {
    /// Ordered rules.
    #[serde(default)]
    pub rules: Vec<AggregationRule>,
    /// Function used when no rule matches.
    #[serde(default = "default_function")]
    pub default: AggregationFn,
}

fn default_function() -> AggregationFn {
    AggregationFn::Average
}

impl Default for AggregationPolicy {
    fn default() -> Self {
        Self::uniform(default_function())
    }
}

impl AggregationPolicy {
    /// A policy that applies `function` to every series.
    pub fn uniform(function: AggregationFn) -> Self {
        Self {
            rules: Vec::new(),
            default: function,
        }
    }

    /// Returns the reduction function for `series`.
    pub fn function_for(&self, series: &str) -> AggregationFn {
        self.rules
            .iter()
            .find(|rule| rule.pattern.matches(series))
            .map_or(self.default, |rule| rule.function)
    }
}

/// The validated set of retention levels plus the aggregation policy.
///
/// Immutable once built. Cycles and dangling successor names are rejected by
/// [`RetentionConfiguration::new`].
#[derive(Debug, Clone)]
pub struct RetentionConfiguration {
    /// Levels sorted by name.
    levels: Vec<RetentionLevel>,
    /// Name to arena index.
    by_name: HashMap<String, usize>,
    /// Successor index for each level.
    successors: Vec<Option<usize>>,
    /// Processing order as arena indices.
    order: Vec<usize>,
    policy: AggregationPolicy,
}

impl RetentionConfiguration {
    /// Validates `levels` and precomputes the processing order.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if a level is invalid, names are duplicated,
    /// a successor is unknown, or the successor relation has a cycle.
    pub fn new(mut levels: Vec<RetentionLevel>, policy: AggregationPolicy) -> Result<Self> {
        for level in &levels {
            level.validate()?;
        }

        levels.sort_by(|a, b| a.name.cmp(&b.name));

        let mut by_name = HashMap::with_capacity(levels.len());
        for (index, level) in levels.iter().enumerate() {
            if by_name.insert(level.name.clone(), index).is_some() {
                return Err(ConfigError::DuplicateLevel {
                    name: level.name.clone(),
                }
                .into());
            }
        }

        let successors = levels
            .iter()
            .map(|level| match &level.next {
                None => Ok(None),
                Some(next) => by_name.get(next).copied().map(Some).ok_or_else(|| {
                    ConfigError::UnknownSuccessor {
                        level: level.name.clone(),
                        successor: next.clone(),
                    }
                    .into()
                }),
            })
            .collect::<Result<Vec<_>>>()?;

        let order = topological_order(&levels, &successors)?;

        let config = Self {
            levels,
            by_name,
            successors,
            order,
            policy,
        };
        config.warn_on_divisibility();
        Ok(config)
    }

    /// Looks up a level by name.
    pub fn level(&self, name: &str) -> Option<&RetentionLevel> {
        self.by_name.get(name).map(|&index| &self.levels[index])
    }

    /// All levels, sorted by name.
    pub fn levels(&self) -> impl Iterator<Item = &RetentionLevel> {
        self.levels.iter()
    }

    /// Number of configured levels.
    pub fn len(&self) -> usize {
        self.levels.len()
    }

    /// Returns `true` if no level is configured.
    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Levels in processing order: every level precedes its successor, and
    /// independent chains are ordered by name.
    pub fn order(&self) -> impl Iterator<Item = &RetentionLevel> {
        self.order.iter().map(|&index| &self.levels[index])
    }

    /// The successor of `level`, or `None` for terminal or unknown levels.
    pub fn next_level(&self, level: &RetentionLevel) -> Option<&RetentionLevel> {
        let index = *self.by_name.get(&level.name)?;
        self.successors[index].map(|next| &self.levels[next])
    }

    /// The reduction function for `series`.
    pub fn function_for(&self, series: &str) -> AggregationFn {
        self.policy.function_for(series)
    }

    /// The aggregation policy.
    pub fn policy(&self) -> &AggregationPolicy {
        &self.policy
    }

    fn warn_on_divisibility(&self) {
        for (index, successor) in self.successors.iter().enumerate() {
            let Some(successor) = successor else { continue };
            let (source, target) = (&self.levels[index], &self.levels[*successor]);
            if let Err(e) = check_divisibility(source, target) {
                tracing::warn!(
                    source = source.name(),
                    target = target.name(),
                    "tables of this level will fail to aggregate: {e}"
                );
            }
        }
    }
}

/// Kahn's algorithm over the successor edges, always taking the smallest
/// ready index so the order is stable.
fn topological_order(levels: &[RetentionLevel], successors: &[Option<usize>]) -> Result<Vec<usize>> {
    let mut in_degree = vec![0usize; levels.len()];
    for next in successors.iter().flatten() {
        in_degree[*next] += 1;
    }

    let mut ready: BTreeSet<usize> = (0..levels.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(levels.len());

    while let Some(index) = ready.pop_first() {
        order.push(index);
        if let Some(next) = successors[index] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.insert(next);
            }
        }
    }

    if order.len() < levels.len() {
        let levels = levels
            .iter()
            .enumerate()
            .filter(|(i, _)| in_degree[*i] > 0)
            .map(|(_, level)| level.name.clone())
            .collect();
        return Err(ConfigError::SuccessorCycle { levels }.into());
    }

    Ok(order)
}
