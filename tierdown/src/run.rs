//! One full rollup pass over every retention level.
//!
//! A run walks the levels in processing order. For each level it lists the
//! store, keeps the due tables of that level, submits one [`TableTask`] per
//! table to the worker pool, and waits for all of them before moving on. The
//! barrier lets tables written for level N+1 be picked up in the same run
//! when they are already due (a cascade).
//!
//! # State Machine
//!
//! ```text
//! Idle ─► Running ─┬─► Completed
//!                  ├─► Aborted   (shutdown requested between levels)
//!                  └─► Failed    (control loop error)
//! ```
//!
//! Errors and panics in the control loop end the run as `Failed`; they are
//! never propagated to the caller.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::access::{AccessLayer, AccessSettings};
use crate::block::RetentionTable;
use crate::config::{AggregatorConfig, ConfigSource};
use crate::error::Result;
use crate::events::{Event, EventKind, EventSink};
use crate::pool::{TaskGroup, WorkerPool};
use crate::retention::{RetentionConfiguration, RetentionLevel};
use crate::store::Store;
use crate::task::TableTask;

/// Lifecycle of the most recent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// No run has started yet.
    Idle,
    /// A run is in progress.
    Running,
    /// Every level was processed.
    Completed,
    /// Stopped between levels because shutdown was requested.
    Aborted,
    /// The control loop hit an error.
    Failed,
}

/// Settings of a [`RunController`].
#[derive(Debug, Clone, PartialEq)]
pub struct RunSettings {
    /// Worker threads.
    pub pool_size: usize,
    /// Pause applied by each task after it finishes.
    pub sleep_after_each_table: Duration,
    /// Store access policy.
    pub access: AccessSettings,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self::from(&AggregatorConfig::default())
    }
}

impl From<&AggregatorConfig> for RunSettings {
    fn from(config: &AggregatorConfig) -> Self {
        Self {
            pool_size: config.pool_size,
            sleep_after_each_table: config.sleep_after_each_table,
            access: config.access_settings(),
        }
    }
}

/// What a run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// Terminal state.
    pub state: RunState,
    /// The `now` used for due-ness, in seconds since the epoch.
    pub now: u64,
    /// Levels whose barrier was reached.
    pub levels_processed: usize,
    /// Tasks submitted.
    pub tasks_submitted: usize,
    /// Tasks that finished successfully.
    pub tasks_succeeded: usize,
    /// Tasks that failed or panicked.
    pub tasks_failed: usize,
}

impl RunSummary {
    fn new(now: u64) -> Self {
        Self {
            state: RunState::Running,
            now,
            levels_processed: 0,
            tasks_submitted: 0,
            tasks_succeeded: 0,
            tasks_failed: 0,
        }
    }

    /// Returns `true` if the run completed. Failed tasks do not make a run
    /// unsuccessful.
    pub fn is_success(&self) -> bool {
        self.state == RunState::Completed
    }
}

/// Cloneable handle requesting a cooperative stop.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle(Arc<AtomicBool>);

impl ShutdownHandle {
    /// Asks running and future runs to stop at the next level boundary.
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns `true` once a stop was requested.
    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Coordinator of rollup runs.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
///
/// use tierdown::config::StaticConfig;
/// use tierdown::events::NullSink;
/// use tierdown::retention::{AggregationPolicy, RetentionConfiguration, RetentionLevel};
/// use tierdown::run::{RunController, RunSettings};
/// use tierdown::store::MemoryStore;
///
/// # fn main() -> tierdown::Result<()> {
/// let config = RetentionConfiguration::new(
///     vec![RetentionLevel::new("raw", 300, 3, 3600, None)],
///     AggregationPolicy::default(),
/// )?;
/// let mut controller = RunController::new(
///     Arc::new(StaticConfig::new(config)),
///     Arc::new(MemoryStore::new()),
///     Arc::new(NullSink),
///     RunSettings { pool_size: 2, ..RunSettings::default() },
/// )?;
///
/// assert!(controller.run_at(10 * 3600).is_success());
/// controller.shutdown();
/// # Ok(())
/// # }
/// ```
pub struct RunController {
    source: Arc<dyn ConfigSource>,
    access: Arc<AccessLayer>,
    pool: WorkerPool,
    sleep_after: Duration,
    shutdown: ShutdownHandle,
    state: RunState,
}

impl RunController {
    /// Creates a controller and its worker pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool size is zero or workers cannot be spawned.
    pub fn new(
        source: Arc<dyn ConfigSource>,
        store: Arc<dyn Store>,
        events: Arc<dyn EventSink>,
        settings: RunSettings,
    ) -> Result<Self> {
        let pool = WorkerPool::new(settings.pool_size)?;
        Ok(Self {
            source,
            access: Arc::new(AccessLayer::new(store, events, settings.access)),
            pool,
            sleep_after: settings.sleep_after_each_table,
            shutdown: ShutdownHandle::default(),
            state: RunState::Idle,
        })
    }

    /// State of the most recent run.
    pub fn state(&self) -> RunState {
        self.state
    }

    /// Handle for requesting a stop from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Runs one pass with the current wall-clock time.
    pub fn run(&mut self) -> RunSummary {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        self.run_at(now)
    }

    /// Runs one pass treating `now` (seconds since the epoch) as the current
    /// time.
    pub fn run_at(&mut self, now: u64) -> RunSummary {
        let mut summary = RunSummary::new(now);
        self.state = RunState::Running;
        self.emit(EventKind::RunStarted);

        let outcome = catch_unwind(AssertUnwindSafe(|| self.execute(now, &mut summary)));
        summary.state = match outcome {
            Ok(Ok(state)) => state,
            Ok(Err(e)) => {
                tracing::error!(now, "run failed: {e}");
                RunState::Failed
            }
            Err(_) => {
                tracing::error!(now, "run failed: control loop panicked");
                RunState::Failed
            }
        };

        self.state = summary.state;
        self.emit(EventKind::RunFinished {
            success: summary.is_success(),
        });
        tracing::debug!(
            state = ?summary.state,
            levels = summary.levels_processed,
            submitted = summary.tasks_submitted,
            failed = summary.tasks_failed,
            "run ended"
        );
        summary
    }

    /// Requests a stop and waits for in-flight tasks to drain.
    pub fn shutdown(&self) {
        self.shutdown.request();
        self.pool.shutdown();
    }

    fn execute(&self, now: u64, summary: &mut RunSummary) -> Result<RunState> {
        if self.shutdown.is_requested() {
            tracing::info!("shutdown requested, not starting run");
            return Ok(RunState::Aborted);
        }

        let config = self.source.refresh()?;

        for level in config.order() {
            let tables = self.due_tables(&config, level, now)?;
            tracing::debug!(level = level.name(), due = tables.len(), "processing level");

            let group = TaskGroup::new();
            let submitted = self.submit(&group, &config, level, tables, summary);

            // Barrier: the next level must see what this one wrote.
            let outcome = group.join();
            summary.tasks_succeeded += outcome.succeeded;
            summary.tasks_failed += outcome.failed;
            submitted?;
            summary.levels_processed += 1;

            if self.shutdown.is_requested() {
                tracing::info!(level = level.name(), "shutdown requested, stopping run");
                return Ok(RunState::Aborted);
            }
        }

        Ok(RunState::Completed)
    }

    fn due_tables(
        &self,
        config: &RetentionConfiguration,
        level: &RetentionLevel,
        now: u64,
    ) -> Result<Vec<RetentionTable>> {
        let tables = self
            .access
            .load_tables(config)?
            .into_iter()
            .filter(|table| table.level().name() == level.name())
            .filter(|table| {
                let due = table.is_due(now);
                if !due {
                    tracing::trace!(table = %table, "not due yet");
                }
                due
            })
            .collect();
        Ok(tables)
    }

    fn submit(
        &self,
        group: &TaskGroup,
        config: &Arc<RetentionConfiguration>,
        level: &RetentionLevel,
        tables: Vec<RetentionTable>,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let next = config.next_level(level).cloned();

        for table in tables {
            let name = table.name();
            let task = TableTask::new(
                Arc::clone(&self.access),
                Arc::clone(config),
                table,
                next.clone(),
                self.sleep_after,
            );

            self.emit(EventKind::TaskSubmitted { table: name.clone() });
            if let Err(e) = group.spawn(&self.pool, move || task.run().is_ok()) {
                self.emit(EventKind::TaskTerminated {
                    table: name,
                    success: false,
                });
                return Err(e);
            }
            summary.tasks_submitted += 1;
        }
        Ok(())
    }

    fn emit(&self, kind: EventKind) {
        self.access.events().emit(Event::now(kind));
    }
}
