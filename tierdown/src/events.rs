//! Lifecycle notifications emitted by the rollup engine.
//!
//! The engine only depends on the narrow [`EventSink`] capability. Reporting,
//! metrics publishing, and tests subscribe by providing a sink: a channel
//! sender, a collecting buffer, or [`NullSink`] when nobody listens.

use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

/// What happened.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// A run began.
    RunStarted,
    /// A run reached a terminal state.
    RunFinished {
        /// `false` if the run was aborted or failed.
        success: bool,
    },
    /// A table task was handed to the worker pool.
    TaskSubmitted {
        /// The source table.
        table: String,
    },
    /// A table task finished.
    TaskTerminated {
        /// The source table.
        table: String,
        /// `false` if the task failed.
        success: bool,
    },
    /// A destination table was created.
    TableCreated {
        /// The new table.
        table: String,
    },
    /// A fully migrated (or terminal) table was dropped.
    TableDropped {
        /// The dropped table.
        table: String,
    },
    /// Aggregated points were written (or would have been, in dry run).
    PointsWritten {
        /// The series written.
        series: String,
        /// The destination table.
        table: String,
        /// The destination level.
        level: String,
        /// Number of points.
        count: usize,
    },
}

/// A timestamped notification.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// When the event was emitted.
    pub at: SystemTime,
    /// What happened.
    pub kind: EventKind,
}

impl Event {
    /// Creates an event stamped with the current time.
    pub fn now(kind: EventKind) -> Self {
        Self {
            at: SystemTime::now(),
            kind,
        }
    }
}

/// Receiver of lifecycle notifications.
///
/// Implementations must be cheap and must not block: events are emitted from
/// worker threads in the middle of store I/O.
pub trait EventSink: Send + Sync {
    /// Delivers one event.
    fn emit(&self, event: Event);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: Event) {}
}

/// Forwards events over a channel; a disconnected receiver is ignored.
#[derive(Debug)]
pub struct ChannelSink {
    sender: Mutex<Sender<Event>>,
}

impl ChannelSink {
    /// Wraps a channel sender.
    pub fn new(sender: Sender<Event>) -> Self {
        Self {
            sender: Mutex::new(sender),
        }
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: Event) {
        if let Ok(sender) = self.sender.lock() {
            let _ = sender.send(event);
        }
    }
}

/// Keeps every event in memory; mainly for tests and one-shot tools.
#[derive(Debug, Default, Clone)]
pub struct CollectingSink {
    events: Arc<Mutex<Vec<Event>>>,
}

impl CollectingSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the event kinds received so far.
    pub fn kinds(&self) -> Vec<EventKind> {
        self.events
            .lock()
            .map(|events| events.iter().map(|e| e.kind.clone()).collect())
            .unwrap_or_default()
    }

    /// Snapshot of all events received so far.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Delivers every event to each of several sinks, in order.
pub struct FanOut {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanOut {
    /// Creates a fan-out over `sinks`.
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanOut {
    fn emit(&self, event: Event) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.emit(event.clone());
            }
            last.emit(event);
        }
    }
}
