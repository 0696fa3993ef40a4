//! Directory-backed [`Store`] for running the engine against local files.
//!
//! # File Layout
//!
//! ```text
//! store_dir/
//! ├── t_raw_b471240.jsonl      <- one table, one JSON row per line
//! ├── t_raw_b471241.jsonl
//! └── t_hourly_b2804.jsonl
//! ```
//!
//! Writes append a line; when reading, a later row for the same series and
//! timestamp replaces an earlier one, giving the same upsert behaviour as a
//! keyed wide-column table.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::reduce::Point;
use crate::store::{Store, StoreResult};

/// Extension of table files.
const TABLE_EXTENSION: &str = "jsonl";

/// One stored row. Non-finite values are stored as `null`.
#[derive(Debug, Serialize, Deserialize)]
struct Row {
    series: String,
    timestamp: u64,
    value: Option<f64>,
}

/// A store keeping each table in its own JSON-lines file.
#[derive(Debug)]
pub struct DirStore {
    path: PathBuf,
    /// Serializes appends so concurrent tasks never interleave lines.
    write_lock: Mutex<()>,
}

impl DirStore {
    /// Opens (creating if necessary) the store directory.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the directory cannot be created.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path).map_err(|e| StoreError::Io {
            path: path.clone(),
            source: e,
        })?;
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    /// The store directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn table_path(&self, table: &str) -> StoreResult<PathBuf> {
        let valid = !table.is_empty()
            && table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(StoreError::Unavailable {
                reason: format!("'{table}' is not a valid table name for a directory store"),
            });
        }
        Ok(self.path.join(format!("{table}.{TABLE_EXTENSION}")))
    }

    fn read_rows(&self, table: &str) -> StoreResult<BTreeMap<(String, u64), f64>> {
        let path = self.table_path(table)?;
        let data = fs::read_to_string(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => StoreError::TableNotFound {
                table: table.to_string(),
            },
            _ => StoreError::Io {
                path: path.clone(),
                source: e,
            },
        })?;

        let mut rows = BTreeMap::new();
        for (line_no, line) in data.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let row: Row = serde_json::from_str(line).map_err(|e| StoreError::Corrupted {
                path: path.clone(),
                reason: format!("line {}: {e}", line_no + 1),
            })?;
            rows.insert((row.series, row.timestamp), row.value.unwrap_or(f64::NAN));
        }
        Ok(rows)
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, ()>> {
        self.write_lock.lock().map_err(|_| StoreError::Unavailable {
            reason: "directory store lock poisoned".to_string(),
        })
    }
}

impl Store for DirStore {
    fn list_table_names(&self) -> StoreResult<BTreeSet<String>> {
        let io_err = |e: io::Error| StoreError::Io {
            path: self.path.clone(),
            source: e,
        };

        let mut names = BTreeSet::new();
        for entry in fs::read_dir(&self.path).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(TABLE_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.insert(stem.to_string());
            }
        }
        Ok(names)
    }

    fn list_series_names(&self, table: &str) -> StoreResult<Vec<String>> {
        let rows = self.read_rows(table)?;
        let series: BTreeSet<String> = rows.into_keys().map(|(series, _)| series).collect();
        Ok(series.into_iter().collect())
    }

    fn read_points(&self, table: &str, series: &str) -> StoreResult<Vec<(u64, f64)>> {
        Ok(self
            .read_rows(table)?
            .into_iter()
            .filter(|((name, _), _)| name == series)
            .map(|((_, timestamp), value)| (timestamp, value))
            .collect())
    }

    fn write_point(&self, table: &str, point: &Point) -> StoreResult<()> {
        let path = self.table_path(table)?;
        let row = Row {
            series: point.series.clone(),
            timestamp: point.timestamp,
            value: point.value.is_finite().then_some(point.value),
        };
        let mut line = serde_json::to_string(&row).map_err(|e| StoreError::Corrupted {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        line.push('\n');

        let _guard = self.lock()?;
        let mut file = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => StoreError::TableNotFound {
                    table: table.to_string(),
                },
                _ => StoreError::Io {
                    path: path.clone(),
                    source: e,
                },
            })?;
        file.write_all(line.as_bytes())
            .map_err(|e| StoreError::Io { path, source: e })
    }

    fn create_table_if_absent(&self, table: &str) -> StoreResult<bool> {
        let path = self.table_path(table)?;
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(StoreError::Io { path, source: e }),
        }
    }

    fn drop_table(&self, table: &str) -> StoreResult<bool> {
        let path = self.table_path(table)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::Io { path, source: e }),
        }
    }
}
