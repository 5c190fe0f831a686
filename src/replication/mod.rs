//! Replication Module
//!
//! Watermark-tracked windowed copy from the hot store to the cold store.
//!
//! - [`planner`] decides which `[start, end)` window a table copies next
//! - [`Replicator`] moves one window's rows
//! - [`CycleDriver`] runs planner, replicator and watermark update per table
//! - [`LagReporter`] compares hot and cold maxima for `status`

pub mod planner;
mod cycle;
mod lag;
mod replicator;

pub use cycle::{
    CycleDriver, CycleState, CycleSummary, SkipReason, TableFailure, TableOutcome, TableReport,
};
pub use lag::{lag_minutes, LagReport, LagReporter, UNINITIALIZED_LAG_MINUTES};
pub use planner::{plan_window, Plan, PlanInput, Window};
pub use replicator::{CopyStats, Replicator};
