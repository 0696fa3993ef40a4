//! Migration of one source table into its successor level.
//!
//! # State Machine
//!
//! ```text
//! Started ─► Enumerating ─► Reducing(k/N) ⇄ Writing(k/N) ─► Dropped ─► Done
//!    │            │               │               │             │
//!    └────────────┴───────────────┴───────────────┴─────────────┴─► Failed
//! ```
//!
//! A terminal source level skips straight from `Started` to dropping the
//! table. The source table is only dropped after every series has been
//! written, so a failed task leaves it in place for the next run.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use crate::access::AccessLayer;
use crate::block::{RetentionTable, block_index_of};
use crate::error::{Result, RunError, TierdownError};
use crate::events::{Event, EventKind};
use crate::reduce::{Point, check_divisibility, reduce};
use crate::retention::{RetentionConfiguration, RetentionLevel};

/// Progress of a [`TableTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Created, nothing done yet.
    Started,
    /// Listing the series of the source table.
    Enumerating,
    /// Reducing series `current` (1-based) of `total`.
    Reducing {
        /// Series being reduced.
        current: usize,
        /// Number of series in the table.
        total: usize,
    },
    /// Writing the reduced points of series `current` of `total`.
    Writing {
        /// Series being written.
        current: usize,
        /// Number of series in the table.
        total: usize,
    },
    /// The source table has been dropped.
    Dropped,
    /// Finished successfully.
    Done,
    /// Stopped by an error.
    Failed,
}

/// What a finished task did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskReport {
    /// The source table.
    pub table: String,
    /// Series migrated.
    pub series: usize,
    /// Points read from the source table.
    pub points_read: usize,
    /// Aggregated points produced.
    pub points_reduced: usize,
    /// Aggregated points acknowledged by the store.
    pub points_written: usize,
    /// Write timeouts absorbed.
    pub write_timeouts: usize,
}

/// The unit of work migrating one due table.
pub struct TableTask {
    access: Arc<AccessLayer>,
    config: Arc<RetentionConfiguration>,
    table: RetentionTable,
    next_level: Option<RetentionLevel>,
    sleep_after: Duration,
    state: TaskState,
}

impl TableTask {
    /// Creates a task migrating `table` into `next_level`, or just dropping
    /// it when `next_level` is `None`.
    pub fn new(
        access: Arc<AccessLayer>,
        config: Arc<RetentionConfiguration>,
        table: RetentionTable,
        next_level: Option<RetentionLevel>,
        sleep_after: Duration,
    ) -> Self {
        Self {
            access,
            config,
            table,
            next_level,
            sleep_after,
            state: TaskState::Started,
        }
    }

    /// The source table.
    pub fn table(&self) -> &RetentionTable {
        &self.table
    }

    /// Current progress.
    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Runs the task to a terminal state, pauses for the configured
    /// inter-task delay, and emits the terminated notification.
    ///
    /// A panic while migrating is caught and reported like any other
    /// failure, so exactly one terminated notification is emitted.
    ///
    /// # Errors
    ///
    /// Returns the error that moved the task to [`TaskState::Failed`],
    /// [`RunError::TaskPanicked`] for a panic.
    pub fn run(mut self) -> Result<TaskReport> {
        match &self.next_level {
            Some(next) => tracing::info!(table = %self.table, to = next.name(), "aggregating table"),
            None => tracing::info!(table = %self.table, "dropping table of terminal level"),
        }

        let result = catch_unwind(AssertUnwindSafe(|| self.execute())).unwrap_or_else(|payload| {
            Err(RunError::TaskPanicked {
                table: self.table.name(),
                message: panic_message(payload.as_ref()),
            }
            .into())
        });
        match &result {
            Ok(report) => {
                self.transition(TaskState::Done);
                tracing::debug!(
                    table = %self.table,
                    series = report.series,
                    written = report.points_written,
                    "table task finished"
                );
            }
            Err(e) => {
                self.transition(TaskState::Failed);
                log_failure(&self.table, e);
            }
        }

        std::thread::sleep(self.sleep_after);

        self.access.events().emit(Event::now(EventKind::TaskTerminated {
            table: self.table.name(),
            success: result.is_ok(),
        }));
        result
    }

    fn execute(&mut self) -> Result<TaskReport> {
        let mut report = TaskReport {
            table: self.table.name(),
            ..TaskReport::default()
        };

        if let Some(target) = self.next_level.clone() {
            check_divisibility(self.table.level(), &target)?;

            self.transition(TaskState::Enumerating);
            let names = self.access.load_series_names(&self.table)?;
            let total = names.len();

            for (index, name) in names.iter().enumerate() {
                self.migrate_series(&target, name, index + 1, total, &mut report)?;
                report.series += 1;
            }
        }

        self.access.drop_table(&self.table)?;
        self.transition(TaskState::Dropped);
        Ok(report)
    }

    fn migrate_series(
        &mut self,
        target: &RetentionLevel,
        series: &str,
        current: usize,
        total: usize,
        report: &mut TaskReport,
    ) -> Result<()> {
        self.transition(TaskState::Reducing { current, total });
        let points = self.access.load_points(&self.table, series)?;
        report.points_read += points.len();

        let function = self.config.function_for(series);
        let reduced = reduce(series, points, target.frequency(), function);
        report.points_reduced += reduced.len();

        // Buckets normally share one target block; split if they do not.
        let mut by_block: BTreeMap<u64, Vec<Point>> = BTreeMap::new();
        for point in reduced {
            by_block
                .entry(block_index_of(target, point.timestamp))
                .or_default()
                .push(point);
        }

        self.transition(TaskState::Writing { current, total });
        for (block, points) in by_block {
            let destination = RetentionTable::new(target.clone(), block);
            self.access.create_table_if_absent(&destination)?;

            let summary = self.access.write_points(&destination, &points)?;
            report.points_written += summary.written;
            report.write_timeouts += summary.timeouts;

            self.access.events().emit(Event::now(EventKind::PointsWritten {
                series: series.to_string(),
                table: destination.name(),
                level: target.name().to_string(),
                count: points.len(),
            }));
        }

        Ok(())
    }

    fn transition(&mut self, state: TaskState) {
        tracing::trace!(table = %self.table, from = ?self.state, to = ?state, "task state");
        self.state = state;
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

fn log_failure(table: &RetentionTable, error: &TierdownError) {
    match error {
        TierdownError::Config(e) => {
            tracing::error!(table = %table, "configuration prevents aggregation: {e}");
        }
        TierdownError::Store(e) => {
            tracing::warn!(table = %table, "a problem with the store occurred: {e}");
        }
        TierdownError::Run(e) => {
            tracing::warn!(table = %table, "unexpected failure: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AccessSettings;
    use crate::events::CollectingSink;
    use crate::reduce::AggregationFn;
    use crate::retention::AggregationPolicy;
    use crate::store::{MemoryStore, Store, StoreResult};
    use std::collections::BTreeSet;

    fn config(policy: AggregationPolicy) -> Arc<RetentionConfiguration> {
        Arc::new(
            RetentionConfiguration::new(
                vec![
                    RetentionLevel::new("lvla", 300, 3, 3600, Some("lvlb")),
                    RetentionLevel::new("lvlb", 3600, 2, 604_800, None),
                    RetentionLevel::new("odd", 700, 2, 7000, None),
                    RetentionLevel::new("src", 300, 3, 3600, Some("odd")),
                ],
                policy,
            )
            .unwrap(),
        )
    }

    fn access(store: &Arc<MemoryStore>, sink: &CollectingSink, dry_run: bool) -> Arc<AccessLayer> {
        Arc::new(AccessLayer::new(
            store.clone(),
            Arc::new(sink.clone()),
            AccessSettings {
                dry_run,
                ..AccessSettings::default()
            },
        ))
    }

    fn task(
        store: &Arc<MemoryStore>,
        sink: &CollectingSink,
        config: &Arc<RetentionConfiguration>,
        level: &str,
        block: u64,
    ) -> TableTask {
        let level = config.level(level).unwrap();
        let next = config.next_level(level).cloned();
        TableTask::new(
            access(store, sink, false),
            Arc::clone(config),
            RetentionTable::new(level.clone(), block),
            next,
            Duration::ZERO,
        )
    }

    /// Many random-ish tables; every source point must end up in the bucket
    /// and table of the next level that contain it.
    #[test]
    fn test_every_point_lands_in_its_bucket() {
        let config = config(AggregationPolicy::uniform(AggregationFn::Max));
        let level = config.level("lvla").unwrap().clone();
        let next = config.level("lvlb").unwrap().clone();
        let store = Arc::new(MemoryStore::new());
        let sink = CollectingSink::new();

        let names = ["name01", "name02", "name03"];
        let mut seeded = Vec::new();
        let mut seed = 17u64;
        for block in [3u64, 170, 171, 500, 999] {
            let table = RetentionTable::new(level.clone(), block);
            let interval = table.interval();
            let mut points = Vec::new();
            for _ in 0..20 {
                seed = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
                let name = names[(seed >> 33) as usize % names.len()];
                let timestamp = interval.start + (seed >> 20) % (interval.end - interval.start);
                points.push(Point::new(name, timestamp, (seed % 1000) as f64));
            }
            store.insert(&table.name(), &points).unwrap();
            seeded.push((table, points));
        }

        for (table, _) in &seeded {
            task(&store, &sink, &config, "lvla", table.block()).run().unwrap();
        }

        for (table, points) in &seeded {
            assert!(store.points(&table.name()).is_none(), "{table} not dropped");
            for point in points {
                let destination = RetentionTable::containing(&next, point.timestamp);
                let written = store.points(&destination.name()).unwrap();
                let bucket = point.timestamp - point.timestamp % next.frequency();
                let aggregated = written
                    .iter()
                    .find(|p| p.series == point.series && p.timestamp == bucket)
                    .unwrap();
                assert!(aggregated.value >= point.value);
            }
        }
    }

    #[test]
    fn test_terminal_level_only_drops() {
        let config = config(AggregationPolicy::default());
        let store = Arc::new(MemoryStore::new());
        let sink = CollectingSink::new();
        store.insert("t_lvlb_b2", &[Point::new("cpu", 2 * 604_800, 1.0)]).unwrap();

        let report = task(&store, &sink, &config, "lvlb", 2).run().unwrap();

        assert_eq!(report.series, 0);
        assert!(store.list_table_names().unwrap().is_empty());
        assert_eq!(
            sink.kinds(),
            vec![
                EventKind::TableDropped {
                    table: "t_lvlb_b2".to_string()
                },
                EventKind::TaskTerminated {
                    table: "t_lvlb_b2".to_string(),
                    success: true
                },
            ]
        );
    }

    #[test]
    fn test_divisibility_violation_fails_task() {
        let config = config(AggregationPolicy::default());
        let store = Arc::new(MemoryStore::new());
        let sink = CollectingSink::new();
        store.insert("t_src_b1", &[Point::new("cpu", 3600, 1.0)]).unwrap();

        let err = task(&store, &sink, &config, "src", 1).run().unwrap_err();

        assert!(err.is_configuration());
        assert!(store.points("t_src_b1").is_some(), "source must survive");
        assert_eq!(
            sink.kinds(),
            vec![EventKind::TaskTerminated {
                table: "t_src_b1".to_string(),
                success: false
            }]
        );
    }

    #[test]
    fn test_dry_run_reduces_without_mutation() {
        let config = config(AggregationPolicy::uniform(AggregationFn::Sum));
        let store = Arc::new(MemoryStore::new());
        let sink = CollectingSink::new();
        store
            .insert(
                "t_lvla_b1",
                &[
                    Point::new("cpu", 3600, 1.0),
                    Point::new("cpu", 3900, 2.0),
                    Point::new("mem", 4200, 5.0),
                ],
            )
            .unwrap();

        let level = config.level("lvla").unwrap();
        let report = TableTask::new(
            access(&store, &sink, true),
            Arc::clone(&config),
            RetentionTable::new(level.clone(), 1),
            config.next_level(level).cloned(),
            Duration::ZERO,
        )
        .run()
        .unwrap();

        assert_eq!(report.series, 2);
        assert_eq!(report.points_reduced, 2);
        assert_eq!(report.points_written, 0);
        assert_eq!(store.mutation_counts(), (0, 0, 0));
        assert!(sink.kinds().contains(&EventKind::PointsWritten {
            series: "cpu".to_string(),
            table: "t_lvlb_b0".to_string(),
            level: "lvlb".to_string(),
            count: 1,
        }));
    }

    #[test]
    fn test_missing_source_table_fails() {
        let config = config(AggregationPolicy::default());
        let store = Arc::new(MemoryStore::new());
        let sink = CollectingSink::new();

        let err = task(&store, &sink, &config, "lvla", 7).run().unwrap_err();
        assert!(!err.is_configuration());
    }

    /// A store whose point reads blow up, like a buggy driver.
    struct PanickingReads(MemoryStore);

    impl Store for PanickingReads {
        fn list_table_names(&self) -> StoreResult<BTreeSet<String>> {
            self.0.list_table_names()
        }

        fn list_series_names(&self, table: &str) -> StoreResult<Vec<String>> {
            self.0.list_series_names(table)
        }

        fn read_points(&self, _table: &str, _series: &str) -> StoreResult<Vec<(u64, f64)>> {
            panic!("driver bug")
        }

        fn write_point(&self, table: &str, point: &Point) -> StoreResult<()> {
            self.0.write_point(table, point)
        }

        fn create_table_if_absent(&self, table: &str) -> StoreResult<bool> {
            self.0.create_table_if_absent(table)
        }

        fn drop_table(&self, table: &str) -> StoreResult<bool> {
            self.0.drop_table(table)
        }
    }

    #[test]
    fn test_panic_is_reported_as_failure() {
        let config = config(AggregationPolicy::default());
        let inner = MemoryStore::new();
        inner.insert("t_lvla_b1", &[Point::new("cpu", 3600, 1.0)]).unwrap();
        let store = Arc::new(PanickingReads(inner));
        let sink = CollectingSink::new();

        let level = config.level("lvla").unwrap();
        let access = Arc::new(AccessLayer::new(
            store.clone(),
            Arc::new(sink.clone()),
            AccessSettings::default(),
        ));
        let err = TableTask::new(
            access,
            Arc::clone(&config),
            RetentionTable::new(level.clone(), 1),
            config.next_level(level).cloned(),
            Duration::ZERO,
        )
        .run()
        .unwrap_err();

        assert!(matches!(
            err,
            TierdownError::Run(RunError::TaskPanicked { ref message, .. }) if message == "driver bug"
        ));
        assert!(store.0.points("t_lvla_b1").is_some(), "source must survive");
        assert_eq!(
            sink.kinds(),
            vec![EventKind::TaskTerminated {
                table: "t_lvla_b1".to_string(),
                success: false
            }]
        );
    }
}
