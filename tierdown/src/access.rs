//! Store access on behalf of rollup tasks.
//!
//! [`AccessLayer`] is the single gateway tasks use to reach the [`Store`]. It
//! owns the cross-cutting store policy:
//!
//! - dry run turns every create, write, and drop into a logged no-op
//! - write timeouts are absorbed with a backoff instead of failing the task
//! - table listings are parsed, and unusable names skipped with a warning
//! - create and drop notifications are emitted only for real changes

use std::sync::Arc;
use std::time::Duration;

use crate::block::RetentionTable;
use crate::error::{Result, StoreError};
use crate::events::{Event, EventKind, EventSink};
use crate::reduce::Point;
use crate::retention::RetentionConfiguration;
use crate::store::Store;

/// Store-side settings of the access layer.
#[derive(Debug, Clone, PartialEq)]
pub struct AccessSettings {
    /// Disables all mutating store calls.
    pub dry_run: bool,
    /// Wait after the first write timeout; doubles for each retry.
    pub wait_after_write_timeout: Duration,
    /// Retries of a timed-out write before moving on.
    pub max_write_retries: u32,
}

impl Default for AccessSettings {
    fn default() -> Self {
        Self {
            dry_run: false,
            wait_after_write_timeout: Duration::ZERO,
            max_write_retries: 2,
        }
    }
}

/// Summary of one [`AccessLayer::write_points`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    /// Points acknowledged by the store.
    pub written: usize,
    /// Write timeouts absorbed along the way.
    pub timeouts: usize,
    /// Points whose every attempt timed out. They may still have landed.
    pub unconfirmed: usize,
}

/// Gateway between tasks and the store.
pub struct AccessLayer {
    store: Arc<dyn Store>,
    events: Arc<dyn EventSink>,
    settings: AccessSettings,
}

impl AccessLayer {
    /// Creates an access layer over `store`.
    pub fn new(store: Arc<dyn Store>, events: Arc<dyn EventSink>, settings: AccessSettings) -> Self {
        if settings.dry_run {
            tracing::warn!("running with dry run: the store will NOT be modified");
        }
        Self {
            store,
            events,
            settings,
        }
    }

    /// The access settings.
    pub fn settings(&self) -> &AccessSettings {
        &self.settings
    }

    /// Returns `true` if mutating calls are disabled.
    pub fn is_dry_run(&self) -> bool {
        self.settings.dry_run
    }

    /// The event sink shared with tasks.
    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    /// Lists all tables that parse against `config`.
    ///
    /// Malformed names and names referencing unknown levels are logged and
    /// skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot list its tables.
    pub fn load_tables(&self, config: &RetentionConfiguration) -> Result<Vec<RetentionTable>> {
        let names = self.store.list_table_names()?;
        let mut tables = Vec::with_capacity(names.len());

        for name in names {
            match RetentionTable::from_name(&name, config) {
                Ok(table) => tables.push(table),
                Err(reason) => tracing::warn!(table = %name, "skipping table: {reason}"),
            }
        }

        Ok(tables)
    }

    /// Distinct series names of `table`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot read the table.
    pub fn load_series_names(&self, table: &RetentionTable) -> Result<Vec<String>> {
        Ok(self.store.list_series_names(&table.name())?)
    }

    /// Unordered points of `series` in `table`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot read the table.
    pub fn load_points(&self, table: &RetentionTable, series: &str) -> Result<Vec<(u64, f64)>> {
        Ok(self.store.read_points(&table.name(), series)?)
    }

    /// Creates `table` unless it already exists.
    ///
    /// Relies on the store's idempotent create; the table listing is never
    /// consulted here.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot create the table.
    pub fn create_table_if_absent(&self, table: &RetentionTable) -> Result<()> {
        let name = table.name();
        if self.settings.dry_run {
            tracing::debug!(table = %name, "dry run: not creating table");
            return Ok(());
        }

        if self.store.create_table_if_absent(&name)? {
            self.events.emit(Event::now(EventKind::TableCreated { table: name }));
        }
        Ok(())
    }

    /// Writes `points` into `table`, one at a time.
    ///
    /// A write timeout is absorbed: the layer waits, retries up to
    /// `max_write_retries` times with doubling waits, then moves on to the
    /// next point.
    ///
    /// # Errors
    ///
    /// Returns the first non-transient store error.
    pub fn write_points(&self, table: &RetentionTable, points: &[Point]) -> Result<WriteSummary> {
        let mut summary = WriteSummary::default();

        if self.settings.dry_run {
            tracing::debug!(table = %table, count = points.len(), "dry run: not writing points");
            return Ok(summary);
        }

        let name = table.name();
        for point in points {
            let mut wait = self.settings.wait_after_write_timeout;
            let mut attempt = 0;
            loop {
                match self.store.write_point(&name, point) {
                    Ok(()) => {
                        summary.written += 1;
                        break;
                    }
                    Err(StoreError::WriteTimeout { .. }) => {
                        summary.timeouts += 1;
                        tracing::info!(
                            table = %name,
                            series = %point.series,
                            timestamp = point.timestamp,
                            attempt,
                            "write timed out, waiting {wait:?}"
                        );
                        std::thread::sleep(wait);

                        if attempt >= self.settings.max_write_retries {
                            tracing::info!(
                                table = %name,
                                series = %point.series,
                                timestamp = point.timestamp,
                                "giving up on point after {} attempts; it may have been applied",
                                attempt + 1
                            );
                            summary.unconfirmed += 1;
                            break;
                        }
                        attempt += 1;
                        wait = wait.saturating_mul(2);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }

        Ok(summary)
    }

    /// Drops `table`. Dropping a table that is already gone is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails to drop the table.
    pub fn drop_table(&self, table: &RetentionTable) -> Result<()> {
        let name = table.name();

        if self.settings.dry_run {
            tracing::debug!(table = %name, "dry run: not dropping table");
            return Ok(());
        }

        if self.store.drop_table(&name)? {
            self.events.emit(Event::now(EventKind::TableDropped { table: name }));
        } else {
            tracing::debug!(table = %name, "table was already dropped");
        }
        Ok(())
    }
}
