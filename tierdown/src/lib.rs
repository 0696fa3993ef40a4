//! # tierdown
//!
//! Scheduled rollup of time-series tables across retention levels.
//!
//! Data lives in one table per level and time block (`t_raw_b7` holds block 7
//! of level `raw`). Once a block has aged out of its level's window, tierdown
//! reduces every series in it to the coarser frequency of the successor
//! level, writes the result into the successor's table, and drops the source
//! table. Terminal levels are simply dropped.
//!
//! **Status**: This crate is in early development. The API is not yet stable.
//!
//! ## Key Properties
//!
//! - Levels are processed finest first, with a barrier per level, so a
//!   single run can cascade through several levels
//! - Tables of one level are migrated in parallel on a bounded worker pool
//! - Reductions are order-insensitive: the same points always give the same
//!   aggregate, whatever order the store returns them in
//! - Dry run executes every reduction without touching the store
//! - Failures stay local: a write timeout is retried, a failing task does not
//!   affect its siblings, and a failing run never takes the process down
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use tierdown::config::StaticConfig;
//! use tierdown::events::NullSink;
//! use tierdown::reduce::{AggregationFn, Point};
//! use tierdown::retention::{AggregationPolicy, RetentionConfiguration, RetentionLevel};
//! use tierdown::run::{RunController, RunSettings};
//! use tierdown::store::{MemoryStore, Store};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // 5 minute points in hourly tables, rolled up into hourly points.
//! let config = RetentionConfiguration::new(
//!     vec![
//!         RetentionLevel::new("raw", 300, 3, 3600, Some("hourly")),
//!         RetentionLevel::new("hourly", 3600, 2, 604_800, None),
//!     ],
//!     AggregationPolicy::uniform(AggregationFn::Max),
//! )?;
//!
//! let store = Arc::new(MemoryStore::new());
//! store.insert("t_raw_b1", &[
//!     Point::new("cpu", 3600, 0.2),
//!     Point::new("cpu", 3900, 0.9),
//! ])?;
//!
//! let mut controller = RunController::new(
//!     Arc::new(StaticConfig::new(config)),
//!     store.clone(),
//!     Arc::new(NullSink),
//!     RunSettings::default(),
//! )?;
//! assert!(controller.run_at(10 * 3600).is_success());
//!
//! assert_eq!(store.read_points("t_hourly_b0", "cpu")?, vec![(3600, 0.9)]);
//! assert!(!store.list_table_names()?.contains("t_raw_b1"));
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`RunController`] — One pass over all levels; owns the worker pool
//! - [`TableTask`] — Migrates a single due table into its successor level
//! - [`RetentionConfiguration`] — Validated level graph and processing order
//! - [`Store`] — Storage collaborator; [`MemoryStore`] and [`DirStore`] ship
//!   with the crate
//!
//! ## Modules
//!
//! - [`retention`] — Retention levels, successor graph, aggregation policy
//! - [`block`] — Block addressing and table naming
//! - [`reduce`] — Bucketing and reduction functions
//! - [`task`] — Per-table migration
//! - [`run`] — Run controller
//! - [`pool`] — Worker pool and wait-groups
//! - [`access`] — Dry run, write-timeout retries, and table filtering
//! - [`store`] / [`dir_store`] — Store contract and implementations
//! - [`events`] — Lifecycle notifications
//! - [`report`] — Run statistics from notifications
//! - [`config`] — JSON configuration
//! - [`error`] — Error types

pub mod access;
pub mod block;
pub mod config;
pub mod dir_store;
pub mod error;
pub mod events;
pub mod pool;
pub mod reduce;
pub mod report;
pub mod retention;
pub mod run;
pub mod store;
pub mod task;

// Re-export primary API types at crate root for convenience.
pub use block::RetentionTable;
pub use config::TierdownConfig;
pub use dir_store::DirStore;
pub use error::{Result, TierdownError};
pub use reduce::{AggregationFn, Point};
pub use retention::{RetentionConfiguration, RetentionLevel};
pub use run::{RunController, RunSettings, RunSummary};
pub use store::{MemoryStore, Store};
pub use task::TableTask;
