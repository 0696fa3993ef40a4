//! Run statistics built from lifecycle events.
//!
//! [`RunReporter`] is an [`EventSink`]: plug it into the engine directly, or
//! feed it from a channel with [`RunReporter::consume`]. It keeps the
//! statistics of the latest run next to totals over every run it has seen,
//! and logs the milestones.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::mpsc::Receiver;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use crate::events::{Event, EventKind, EventSink};

/// Counters of one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunStatistics {
    /// When the run started.
    pub started_at: Option<SystemTime>,
    /// When the run finished.
    pub finished_at: Option<SystemTime>,
    /// Outcome, once finished.
    pub success: Option<bool>,
    /// Tasks handed to the pool.
    pub tasks_submitted: usize,
    /// Tasks that finished, successfully or not.
    pub tasks_terminated: usize,
    /// Tasks that finished with an error.
    pub tasks_failed: usize,
    /// Aggregated points per destination level.
    pub points_per_level: BTreeMap<String, usize>,
    /// Destination tables that received points.
    pub tables_written: BTreeSet<String>,
    /// Tables created during the run.
    pub tables_created: BTreeSet<String>,
    /// Tables dropped during the run.
    pub tables_dropped: BTreeSet<String>,
}

impl RunStatistics {
    /// Tasks submitted but not terminated.
    pub fn tasks_remaining(&self) -> usize {
        self.tasks_submitted.saturating_sub(self.tasks_terminated)
    }

    /// Aggregated points over all levels.
    pub fn points_written(&self) -> usize {
        self.points_per_level.values().sum()
    }

    /// Wall time between start and finish, if both were seen.
    pub fn duration(&self) -> Option<Duration> {
        let (start, end) = (self.started_at?, self.finished_at?);
        end.duration_since(start).ok()
    }

    fn apply(&mut self, event: &Event) {
        match &event.kind {
            EventKind::RunStarted => {
                *self = Self {
                    started_at: Some(event.at),
                    ..Self::default()
                };
                tracing::info!("run started");
            }
            EventKind::RunFinished { success } => {
                self.finished_at = Some(event.at);
                self.success = Some(*success);
                self.log_finish(*success);
            }
            EventKind::TaskSubmitted { .. } => self.tasks_submitted += 1,
            EventKind::TaskTerminated { success, .. } => {
                self.tasks_terminated += 1;
                if !success {
                    self.tasks_failed += 1;
                }
            }
            EventKind::TableCreated { table } => {
                self.tables_created.insert(table.clone());
            }
            EventKind::TableDropped { table } => {
                self.tables_dropped.insert(table.clone());
            }
            EventKind::PointsWritten {
                table,
                level,
                count,
                ..
            } => {
                if self.tables_written.insert(table.clone()) {
                    tracing::info!(table = %table, level = %level, "writing to table");
                }
                *self.points_per_level.entry(level.clone()).or_default() += count;
            }
        }
    }

    fn log_finish(&self, success: bool) {
        if success {
            tracing::info!(
                tasks = self.tasks_terminated,
                failed = self.tasks_failed,
                points = self.points_written(),
                created = self.tables_created.len(),
                dropped = self.tables_dropped.len(),
                "run finished, took {:?}",
                self.duration().unwrap_or_default()
            );
        } else {
            tracing::warn!(
                tasks = self.tasks_terminated,
                failed = self.tasks_failed,
                "run failed"
            );
        }

        let remaining = self.tasks_remaining();
        if remaining > 0 {
            tracing::warn!(remaining, "tasks did not finish");
        }
    }
}

/// Counters accumulated over all runs a reporter has seen.
///
/// Unlike [`RunStatistics`] these are never reset by `RunStarted`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LifetimeTotals {
    /// Runs started.
    pub runs: usize,
    /// Runs that finished unsuccessfully.
    pub runs_failed: usize,
    /// Tasks handed to the pool.
    pub tasks_submitted: usize,
    /// Tasks that finished, successfully or not.
    pub tasks_terminated: usize,
    /// Tasks that finished with an error.
    pub tasks_failed: usize,
    /// Aggregated points over all levels.
    pub points_written: usize,
}

impl LifetimeTotals {
    fn apply(&mut self, event: &Event) {
        match &event.kind {
            EventKind::RunStarted => self.runs += 1,
            EventKind::RunFinished { success } => {
                if !success {
                    self.runs_failed += 1;
                }
            }
            EventKind::TaskSubmitted { .. } => self.tasks_submitted += 1,
            EventKind::TaskTerminated { success, .. } => {
                self.tasks_terminated += 1;
                if !success {
                    self.tasks_failed += 1;
                }
            }
            EventKind::PointsWritten { count, .. } => self.points_written += count,
            EventKind::TableCreated { .. } | EventKind::TableDropped { .. } => {}
        }
    }
}

#[derive(Debug, Default)]
struct ReporterState {
    current: RunStatistics,
    totals: LifetimeTotals,
}

/// Collects [`RunStatistics`] for the most recent run and [`LifetimeTotals`]
/// across runs.
#[derive(Debug, Default)]
pub struct RunReporter {
    state: Mutex<ReporterState>,
}

impl RunReporter {
    /// Creates a reporter with empty statistics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the current run's statistics.
    pub fn statistics(&self) -> RunStatistics {
        self.lock().current.clone()
    }

    /// Snapshot of the totals over every run seen so far.
    pub fn totals(&self) -> LifetimeTotals {
        self.lock().totals
    }

    fn lock(&self) -> MutexGuard<'_, ReporterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies events from `receiver` until every sender is gone.
    pub fn consume(&self, receiver: &Receiver<Event>) {
        for event in receiver {
            self.emit(event);
        }
    }
}

impl EventSink for RunReporter {
    fn emit(&self, event: Event) {
        let mut state = self.lock();
        state.totals.apply(&event);
        state.current.apply(&event);
    }
}
