//! End-to-end rollup scenarios against the in-memory store.
//!
//! These tests drive full runs through the controller and verify what ends up
//! in the store and in the emitted notifications: simple rollup into the next
//! level, dry run, foreign tables, multi-level cascades, write-timeout
//! retries, and cooperative shutdown.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tierdown::access::AccessSettings;
use tierdown::config::StaticConfig;
use tierdown::events::{CollectingSink, Event, EventKind, EventSink, FanOut};
use tierdown::reduce::{AggregationFn, Point};
use tierdown::report::RunReporter;
use tierdown::retention::{AggregationPolicy, RetentionConfiguration, RetentionLevel};
use tierdown::run::{RunController, RunSettings, RunState, ShutdownHandle};
use tierdown::store::{MemoryStore, Store, StoreResult};

const HOUR: u64 = 3600;
const WEEK: u64 = 604_800;

/// `raw` (5 min points, hourly tables, keep 3) feeding `hourly` (hourly
/// points, weekly tables, keep 2).
fn raw_hourly(function: AggregationFn) -> RetentionConfiguration {
    RetentionConfiguration::new(
        vec![
            RetentionLevel::new("raw", 300, 3, HOUR, Some("hourly")),
            RetentionLevel::new("hourly", HOUR, 2, WEEK, None),
        ],
        AggregationPolicy::uniform(function),
    )
    .unwrap()
}

fn controller(
    config: RetentionConfiguration,
    store: &Arc<MemoryStore>,
    sink: Arc<dyn EventSink>,
    access: AccessSettings,
) -> RunController {
    RunController::new(
        Arc::new(StaticConfig::new(config)),
        store.clone(),
        sink,
        RunSettings {
            pool_size: 4,
            sleep_after_each_table: Duration::ZERO,
            access,
        },
    )
    .unwrap()
}

fn submitted(kinds: &[EventKind]) -> Vec<String> {
    let mut tables: Vec<String> = kinds
        .iter()
        .filter_map(|kind| match kind {
            EventKind::TaskSubmitted { table } => Some(table.clone()),
            _ => None,
        })
        .collect();
    tables.sort();
    tables
}

#[test]
fn test_max_rollup_into_hourly_and_drop() {
    let store = Arc::new(MemoryStore::new());
    // Block 100 of raw covers [360000, 363600): one hourly bucket.
    store
        .insert(
            "t_raw_b100",
            &[
                Point::new("cpu", 100 * HOUR, 0.25),
                Point::new("cpu", 100 * HOUR + 300, 0.75),
                Point::new("cpu", 100 * HOUR + 600, 0.5),
            ],
        )
        .unwrap();

    let sink = CollectingSink::new();
    let mut controller = controller(
        raw_hourly(AggregationFn::Max),
        &store,
        Arc::new(sink.clone()),
        AccessSettings::default(),
    );
    let summary = controller.run_at(110 * HOUR);

    assert!(summary.is_success());
    assert_eq!(summary.tasks_submitted, 1);
    assert!(store.points("t_raw_b100").is_none());
    assert_eq!(
        store.points("t_hourly_b0").unwrap(),
        vec![Point::new("cpu", 100 * HOUR, 0.75)]
    );

    let kinds = sink.kinds();
    assert!(kinds.contains(&EventKind::TableCreated {
        table: "t_hourly_b0".to_string()
    }));
    assert!(kinds.contains(&EventKind::TableDropped {
        table: "t_raw_b100".to_string()
    }));
    assert!(kinds.contains(&EventKind::PointsWritten {
        series: "cpu".to_string(),
        table: "t_hourly_b0".to_string(),
        level: "hourly".to_string(),
        count: 1,
    }));
}

#[test]
fn test_dry_run_changes_nothing() {
    let store = Arc::new(MemoryStore::new());
    let points = [
        Point::new("cpu", 100 * HOUR, 0.25),
        Point::new("cpu", 100 * HOUR + 300, 0.75),
        Point::new("cpu", 100 * HOUR + 600, 0.5),
    ];
    store.insert("t_raw_b100", &points).unwrap();

    let sink = CollectingSink::new();
    let mut controller = controller(
        raw_hourly(AggregationFn::Max),
        &store,
        Arc::new(sink.clone()),
        AccessSettings {
            dry_run: true,
            ..AccessSettings::default()
        },
    );
    assert!(controller.run_at(110 * HOUR).is_success());

    assert_eq!(store.mutation_counts(), (0, 0, 0));
    assert_eq!(store.points("t_raw_b100").unwrap(), points.to_vec());
    assert!(store.points("t_hourly_b0").is_none());

    let kinds = sink.kinds();
    assert!(kinds.contains(&EventKind::PointsWritten {
        series: "cpu".to_string(),
        table: "t_hourly_b0".to_string(),
        level: "hourly".to_string(),
        count: 1,
    }));
    assert!(
        !kinds
            .iter()
            .any(|k| matches!(k, EventKind::TableCreated { .. } | EventKind::TableDropped { .. }))
    );
}

#[test]
fn test_foreign_tables_are_never_submitted() {
    let store = Arc::new(MemoryStore::new());
    for name in ["garbage_xyz", "t_daily_b1", "t_raw_b007", "t_raw_b5"] {
        store.insert(name, &[Point::new("cpu", 5 * HOUR, 1.0)]).unwrap();
    }

    let sink = CollectingSink::new();
    let mut controller = controller(
        raw_hourly(AggregationFn::Average),
        &store,
        Arc::new(sink.clone()),
        AccessSettings::default(),
    );
    assert!(controller.run_at(110 * HOUR).is_success());

    assert_eq!(submitted(&sink.kinds()), vec!["t_raw_b5"]);
    let tables = store.list_table_names().unwrap();
    assert!(tables.contains("garbage_xyz"));
    assert!(tables.contains("t_daily_b1"));
    assert!(tables.contains("t_raw_b007"));
    assert!(!tables.contains("t_raw_b5"));
}

#[test]
fn test_single_run_cascades_through_levels() {
    let config = RetentionConfiguration::new(
        vec![
            RetentionLevel::new("fine", 60, 1, 600, Some("medium")),
            RetentionLevel::new("medium", 600, 1, 6_000, Some("coarse")),
            RetentionLevel::new("coarse", 6_000, 1, 60_000, None),
        ],
        AggregationPolicy::uniform(AggregationFn::Sum),
    )
    .unwrap();

    let store = Arc::new(MemoryStore::new());
    store
        .insert(
            "t_fine_b0",
            &[
                Point::new("requests", 0, 1.0),
                Point::new("requests", 60, 2.0),
                Point::new("requests", 540, 3.0),
            ],
        )
        .unwrap();
    store
        .insert("t_fine_b1", &[Point::new("requests", 600, 4.0)])
        .unwrap();

    let sink = CollectingSink::new();
    let mut controller = controller(
        config,
        &store,
        Arc::new(sink.clone()),
        AccessSettings::default(),
    );
    // fine: blocks <= 32 due; medium: blocks <= 2 due; coarse: nothing due.
    let summary = controller.run_at(20_000);

    assert!(summary.is_success());
    assert_eq!(summary.levels_processed, 3);
    assert_eq!(
        submitted(&sink.kinds()),
        vec!["t_fine_b0", "t_fine_b1", "t_medium_b0"]
    );
    assert_eq!(
        store.list_table_names().unwrap().into_iter().collect::<Vec<_>>(),
        vec!["t_coarse_b0"]
    );
    assert_eq!(
        store.points("t_coarse_b0").unwrap(),
        vec![Point::new("requests", 0, 10.0)]
    );
}

#[test]
fn test_write_timeout_does_not_abort_task() {
    let store = Arc::new(MemoryStore::new());
    store
        .insert(
            "t_raw_b100",
            &[
                Point::new("cpu", 100 * HOUR, 1.0),
                Point::new("disk", 100 * HOUR, 2.0),
                Point::new("mem", 100 * HOUR, 3.0),
            ],
        )
        .unwrap();
    store.insert("t_hourly_b0", &[]).unwrap();
    store.fail_next_writes(1);

    let sink = CollectingSink::new();
    let mut controller = controller(
        raw_hourly(AggregationFn::Average),
        &store,
        Arc::new(sink.clone()),
        AccessSettings {
            wait_after_write_timeout: Duration::from_millis(1),
            ..AccessSettings::default()
        },
    );
    let summary = controller.run_at(110 * HOUR);

    assert!(summary.is_success());
    assert_eq!(summary.tasks_failed, 0);
    assert!(store.points("t_raw_b100").is_none());
    assert_eq!(store.points("t_hourly_b0").unwrap().len(), 3);
}

#[test]
fn test_exhausted_write_retries_still_drop_source() {
    let store = Arc::new(MemoryStore::new());
    store
        .insert(
            "t_raw_b100",
            &[
                Point::new("cpu", 100 * HOUR, 1.0),
                Point::new("disk", 100 * HOUR, 2.0),
            ],
        )
        .unwrap();
    store.insert("t_hourly_b0", &[]).unwrap();
    // One attempt plus two retries for the first point.
    store.fail_next_writes(3);

    let mut controller = controller(
        raw_hourly(AggregationFn::Average),
        &store,
        Arc::new(CollectingSink::new()),
        AccessSettings::default(),
    );
    let summary = controller.run_at(110 * HOUR);

    assert_eq!(summary.tasks_succeeded, 1);
    assert!(store.points("t_raw_b100").is_none());
    assert_eq!(
        store.points("t_hourly_b0").unwrap(),
        vec![Point::new("disk", 100 * HOUR, 2.0)]
    );
}

/// Requests shutdown as soon as the first task is submitted.
struct StopOnSubmit {
    handle: Mutex<Option<ShutdownHandle>>,
}

impl EventSink for StopOnSubmit {
    fn emit(&self, event: Event) {
        if matches!(event.kind, EventKind::TaskSubmitted { .. })
            && let Ok(handle) = self.handle.lock()
            && let Some(handle) = handle.as_ref()
        {
            handle.request();
        }
    }
}

#[test]
fn test_shutdown_stops_at_level_boundary() {
    let config = RetentionConfiguration::new(
        vec![
            RetentionLevel::new("fine", 60, 1, 600, Some("medium")),
            RetentionLevel::new("medium", 600, 1, 6_000, None),
        ],
        AggregationPolicy::default(),
    )
    .unwrap();

    let store = Arc::new(MemoryStore::new());
    store.insert("t_fine_b0", &[Point::new("cpu", 0, 1.0)]).unwrap();
    store.insert("t_medium_b0", &[Point::new("cpu", 0, 1.0)]).unwrap();

    let stopper = Arc::new(StopOnSubmit {
        handle: Mutex::new(None),
    });
    let sink = CollectingSink::new();
    let sinks: Vec<Arc<dyn EventSink>> = vec![stopper.clone(), Arc::new(sink.clone())];
    let fan_out = FanOut::new(sinks);
    let mut controller = controller(config, &store, Arc::new(fan_out), AccessSettings::default());
    *stopper.handle.lock().unwrap() = Some(controller.shutdown_handle());

    let summary = controller.run_at(20_000);

    assert_eq!(summary.state, RunState::Aborted);
    assert_eq!(summary.levels_processed, 1);
    // The in-flight task of the first level still finished.
    assert!(store.points("t_fine_b0").is_none());
    assert_eq!(submitted(&sink.kinds()), vec!["t_fine_b0"]);
    assert_eq!(
        sink.kinds().last(),
        Some(&EventKind::RunFinished { success: false })
    );

    controller.shutdown();
}

#[test]
fn test_reporter_sees_whole_run() {
    let store = Arc::new(MemoryStore::new());
    for block in [100u64, 101, 102] {
        store
            .insert(
                &format!("t_raw_b{block}"),
                &[
                    Point::new("cpu", block * HOUR, 1.0),
                    Point::new("mem", block * HOUR + 300, 2.0),
                ],
            )
            .unwrap();
    }

    let reporter = Arc::new(RunReporter::new());
    let mut controller = controller(
        raw_hourly(AggregationFn::Average),
        &store,
        reporter.clone(),
        AccessSettings::default(),
    );
    assert!(controller.run_at(110 * HOUR).is_success());

    let stats = reporter.statistics();
    assert_eq!(stats.success, Some(true));
    assert_eq!(stats.tasks_submitted, 3);
    assert_eq!(stats.tasks_terminated, 3);
    assert_eq!(stats.tasks_remaining(), 0);
    assert_eq!(stats.points_per_level.get("hourly"), Some(&6));
    assert_eq!(stats.tables_created.len(), 1);
    assert_eq!(stats.tables_dropped.len(), 3);
}

#[test]
fn test_second_run_is_idempotent() {
    let store = Arc::new(MemoryStore::new());
    store
        .insert("t_raw_b100", &[Point::new("cpu", 100 * HOUR, 1.0)])
        .unwrap();

    let mut controller = controller(
        raw_hourly(AggregationFn::Average),
        &store,
        Arc::new(CollectingSink::new()),
        AccessSettings::default(),
    );
    let first = controller.run_at(110 * HOUR);
    let second = controller.run_at(110 * HOUR);

    assert_eq!(first.tasks_submitted, 1);
    assert!(second.is_success());
    assert_eq!(second.tasks_submitted, 0);
    assert_eq!(
        store.points("t_hourly_b0").unwrap(),
        vec![Point::new("cpu", 100 * HOUR, 1.0)]
    );
}

/// Delegates to a memory store but panics on every point read.
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
fn test_panicking_task_still_terminates() {
    let inner = MemoryStore::new();
    inner
        .insert("t_raw_b1", &[Point::new("cpu", HOUR, 1.0)])
        .unwrap();
    let store = Arc::new(PanickingReads(inner));

    let reporter = Arc::new(RunReporter::new());
    let sink = CollectingSink::new();
    let sinks: Vec<Arc<dyn EventSink>> = vec![reporter.clone(), Arc::new(sink.clone())];
    let mut controller = RunController::new(
        Arc::new(StaticConfig::new(raw_hourly(AggregationFn::Max))),
        store.clone(),
        Arc::new(FanOut::new(sinks)),
        RunSettings {
            pool_size: 1,
            sleep_after_each_table: Duration::ZERO,
            access: AccessSettings::default(),
        },
    )
    .unwrap();

    let summary = controller.run_at(110 * HOUR);

    assert!(summary.is_success());
    assert_eq!(summary.tasks_failed, 1);
    assert!(sink.kinds().contains(&EventKind::TaskTerminated {
        table: "t_raw_b1".to_string(),
        success: false
    }));
    let stats = reporter.statistics();
    assert_eq!(stats.tasks_remaining(), 0);
    assert_eq!(stats.tasks_failed, 1);
    assert!(store.0.points("t_raw_b1").is_some());
}
