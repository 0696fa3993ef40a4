//! The storage collaborator contract and an in-memory implementation.
//!
//! The rollup engine only needs a handful of table-level operations from the
//! wide-column store. Implementations must tolerate concurrent use from all
//! worker threads; no locking is applied on the engine side. Creation and
//! dropping are idempotent at this boundary so that races between tasks are
//! harmless.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use crate::error::StoreError;
use crate::reduce::Point;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Operations the rollup engine requires from the storage backend.
///
/// Reads return owned collections rather than lazy iterators. A series is
/// reduced as a whole, and a later row for the same series and timestamp
/// replaces an earlier one, so an implementation has to see every row of a
/// table before it can hand out a single point. Tables are bounded by one
/// block of one level.
pub trait Store: Send + Sync {
    /// All physical table names currently present.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be queried.
    fn list_table_names(&self) -> StoreResult<BTreeSet<String>>;

    /// Distinct series names present in `table`.
    ///
    /// # Errors
    ///
    /// Returns an error if the table is missing or cannot be read.
    fn list_series_names(&self, table: &str) -> StoreResult<Vec<String>>;

    /// All `(timestamp, value)` pairs of `series` in `table`, in no particular order.
    ///
    /// # Errors
    ///
    /// Returns an error if the table is missing or cannot be read.
    fn read_points(&self, table: &str, series: &str) -> StoreResult<Vec<(u64, f64)>>;

    /// Writes one point. A point with the same series and timestamp replaces
    /// the previous value.
    ///
    /// # Errors
    ///
    /// [`StoreError::WriteTimeout`] signals a transient overload; the write
    /// may or may not have been applied.
    fn write_point(&self, table: &str, point: &Point) -> StoreResult<()>;

    /// Creates `table` unless it exists. Returns `true` if it was created.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot create the table.
    fn create_table_if_absent(&self, table: &str) -> StoreResult<bool>;

    /// Drops `table`. Returns `false` if it did not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot drop the table.
    fn drop_table(&self, table: &str) -> StoreResult<bool>;
}

type Rows = BTreeMap<(String, u64), f64>;

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<String, Rows>,
    /// Number of upcoming writes that fail with a write timeout.
    pending_timeouts: usize,
    creates: usize,
    writes: usize,
    drops: usize,
}

/// Thread-safe in-process store.
///
/// Rows are keyed by `(series, timestamp)`, so rewriting a bucket is an upsert.
///
/// # Example
///
/// ```rust
/// use tierdown::reduce::Point;
/// use tierdown::store::{MemoryStore, Store};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let store = MemoryStore::new();
/// store.create_table_if_absent("t_raw_b1")?;
/// store.write_point("t_raw_b1", &Point::new("cpu", 3600, 0.5))?;
/// assert_eq!(store.read_points("t_raw_b1", "cpu")?, vec![(3600, 0.5)]);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates `table` if needed and stores `points` in it, bypassing
    /// timeout injection and mutation counters.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lock is poisoned.
    pub fn insert(&self, table: &str, points: &[Point]) -> StoreResult<()> {
        let mut state = self.lock()?;
        let rows = state.tables.entry(table.to_string()).or_default();
        for point in points {
            rows.insert((point.series.clone(), point.timestamp), point.value);
        }
        Ok(())
    }

    /// All points of `table` ordered by series then timestamp, or `None` if
    /// the table does not exist.
    pub fn points(&self, table: &str) -> Option<Vec<Point>> {
        let state = self.lock().ok()?;
        state.tables.get(table).map(|rows| {
            rows.iter()
                .map(|((series, timestamp), value)| Point::new(series.clone(), *timestamp, *value))
                .collect()
        })
    }

    /// Makes the next `count` calls to [`Store::write_point`] fail with
    /// [`StoreError::WriteTimeout`] without applying the write.
    pub fn fail_next_writes(&self, count: usize) {
        if let Ok(mut state) = self.lock() {
            state.pending_timeouts = count;
        }
    }

    /// Number of `(creates, writes, drops)` that changed the store.
    pub fn mutation_counts(&self) -> (usize, usize, usize) {
        self.lock()
            .map(|s| (s.creates, s.writes, s.drops))
            .unwrap_or_default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, MemoryState>> {
        self.state.lock().map_err(|_| StoreError::Unavailable {
            reason: "memory store lock poisoned".to_string(),
        })
    }
}

fn missing(table: &str) -> StoreError {
    StoreError::TableNotFound {
        table: table.to_string(),
    }
}

impl Store for MemoryStore {
    fn list_table_names(&self) -> StoreResult<BTreeSet<String>> {
        Ok(self.lock()?.tables.keys().cloned().collect())
    }

    fn list_series_names(&self, table: &str) -> StoreResult<Vec<String>> {
        let state = self.lock()?;
        let rows = state.tables.get(table).ok_or_else(|| missing(table))?;
        let series: BTreeSet<&String> = rows.keys().map(|(series, _)| series).collect();
        Ok(series.into_iter().cloned().collect())
    }

    fn read_points(&self, table: &str, series: &str) -> StoreResult<Vec<(u64, f64)>> {
        let state = self.lock()?;
        let rows = state.tables.get(table).ok_or_else(|| missing(table))?;
        Ok(rows
            .iter()
            .filter(|((name, _), _)| name == series)
            .map(|((_, timestamp), value)| (*timestamp, *value))
            .collect())
    }

    fn write_point(&self, table: &str, point: &Point) -> StoreResult<()> {
        let mut state = self.lock()?;
        if state.pending_timeouts > 0 {
            state.pending_timeouts -= 1;
            return Err(StoreError::WriteTimeout {
                table: table.to_string(),
            });
        }
        let rows = state.tables.get_mut(table).ok_or_else(|| missing(table))?;
        rows.insert((point.series.clone(), point.timestamp), point.value);
        state.writes += 1;
        Ok(())
    }

    fn create_table_if_absent(&self, table: &str) -> StoreResult<bool> {
        let mut state = self.lock()?;
        if state.tables.contains_key(table) {
            return Ok(false);
        }
        state.tables.insert(table.to_string(), Rows::new());
        state.creates += 1;
        Ok(true)
    }

    fn drop_table(&self, table: &str) -> StoreResult<bool> {
        let mut state = self.lock()?;
        let dropped = state.tables.remove(table).is_some();
        if dropped {
            state.drops += 1;
        }
        Ok(dropped)
    }
}
