//! Cycle Driver
//!
//! One externally triggered pass over the configured tables. Each table
//! goes through
//!
//! ```text
//! Idle -> PlanningWindow -> Replicating -> AdvancingWatermark -> Idle
//!              |                 |
//!              +-> Idle (no-op)  +-> Idle (failed, watermark untouched)
//! ```
//!
//! Tables run sequentially in configuration order. A failure is recorded
//! in that table's [`TableOutcome`] and the driver moves on; nothing retries
//! within a cycle, the next trigger does.

use std::sync::Arc;

use tracing::Instrument;
use uuid::Uuid;

use crate::config::{ReplicationConfig, TableConfig};
use crate::error::Error;
use crate::state::WatermarkStore;

use super::planner::{plan_window, Plan, PlanInput, Window};
use super::replicator::{CopyStats, Replicator};

/// Working state a table failed in; `Idle` is implicit between tables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    PlanningWindow,
    Replicating,
    AdvancingWatermark,
}

impl std::fmt::Display for CycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CycleState::PlanningWindow => write!(f, "planning"),
            CycleState::Replicating => write!(f, "replicating"),
            CycleState::AdvancingWatermark => write!(f, "advancing-watermark"),
        }
    }
}

/// Why a table had nothing to do this cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Watermark already at `now - safety_lag`
    UpToDate { watermark: i64 },
    /// `now - safety_lag <= 0`
    ClockGuard { safety_end: i64 },
}

/// Successful table result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableReport {
    Skipped(SkipReason),
    Replicated {
        window: Window,
        stats: CopyStats,
        watermark: i64,
    },
}

/// Failed table result
#[derive(Debug)]
pub struct TableFailure {
    /// State the table was in when it failed
    pub stage: CycleState,
    /// Window being copied, if planning got that far
    pub window: Option<Window>,
    pub error: Error,
}

/// Result of one table in one cycle
#[derive(Debug)]
pub struct TableOutcome {
    pub table: String,
    pub result: std::result::Result<TableReport, TableFailure>,
}

impl TableOutcome {
    pub fn is_failure(&self) -> bool {
        self.result.is_err()
    }
}

/// Everything one cycle did
#[derive(Debug)]
pub struct CycleSummary {
    pub run_id: Uuid,
    pub now_ms: i64,
    pub outcomes: Vec<TableOutcome>,
}

impl CycleSummary {
    /// Tables that copied a window
    pub fn replicated(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.result, Ok(TableReport::Replicated { .. })))
            .count()
    }

    /// Tables with nothing eligible
    pub fn skipped(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.result, Ok(TableReport::Skipped(_))))
            .count()
    }

    /// Tables that failed
    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_failure()).count()
    }

    /// Rows copied across all tables
    pub fn rows_copied(&self) -> u64 {
        self.outcomes
            .iter()
            .filter_map(|o| match &o.result {
                Ok(TableReport::Replicated { stats, .. }) => Some(stats.rows_written),
                _ => None,
            })
            .sum()
    }

    /// Check if any table could not reach its stores at all
    pub fn has_hard_failure(&self) -> bool {
        self.outcomes.iter().any(|o| match &o.result {
            Err(f) => f.error.is_connectivity(),
            Ok(_) => false,
        })
    }
}

/// Drives one replication cycle across the configured tables
pub struct CycleDriver {
    watermarks: Arc<dyn WatermarkStore>,
    replicator: Replicator,
    replication: ReplicationConfig,
}

impl CycleDriver {
    pub fn new(
        watermarks: Arc<dyn WatermarkStore>,
        replicator: Replicator,
        replication: ReplicationConfig,
    ) -> Self {
        Self {
            watermarks,
            replicator,
            replication,
        }
    }

    /// Run one cycle over `tables` with `now_ms` as the current time
    pub async fn run_cycle(&self, tables: &[TableConfig], now_ms: i64) -> CycleSummary {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("cycle", %run_id);

        async move {
            tracing::info!(tables = tables.len(), now_ms, "Starting replication cycle");

            let mut outcomes = Vec::with_capacity(tables.len());
            for table in tables {
                let result = self.run_table(table, now_ms).await;
                outcomes.push(TableOutcome {
                    table: table.name.clone(),
                    result,
                });
            }

            let summary = CycleSummary {
                run_id,
                now_ms,
                outcomes,
            };
            tracing::info!(
                replicated = summary.replicated(),
                skipped = summary.skipped(),
                failed = summary.failed(),
                rows = summary.rows_copied(),
                "Replication cycle complete"
            );
            summary
        }
        .instrument(span)
        .await
    }

    async fn run_table(
        &self,
        table: &TableConfig,
        now_ms: i64,
    ) -> std::result::Result<TableReport, TableFailure> {
        // PlanningWindow
        let window_ms = table.window_ms(&self.replication).map_err(|error| {
            tracing::error!(table = %table.name, "Skipping misconfigured table: {}", error);
            TableFailure {
                stage: CycleState::PlanningWindow,
                window: None,
                error,
            }
        })?;

        let watermark = self.watermarks.get(&table.name).await;
        let input = PlanInput {
            watermark_ts: watermark,
            now_ts: now_ms,
            safety_lag_ms: self.replication.safety_lag_ms,
            window_ms,
            initial_lookback_ms: self.replication.initial_lookback_ms,
        };

        let window = match plan_window(&table.name, &input) {
            Plan::Copy(window) => window,
            Plan::UpToDate => {
                tracing::debug!(table = %table.name, watermark, "No eligible window");
                return Ok(TableReport::Skipped(SkipReason::UpToDate { watermark }));
            }
            Plan::ClockGuard { safety_end } => {
                tracing::warn!(
                    table = %table.name,
                    now_ms,
                    safety_lag_ms = self.replication.safety_lag_ms,
                    "now - safety_lag is not positive, skipping table"
                );
                return Ok(TableReport::Skipped(SkipReason::ClockGuard { safety_end }));
            }
        };

        // Replicating
        let stats = match self.replicator.replicate(table, &window).await {
            Ok(stats) => stats,
            Err(error) => {
                tracing::error!(
                    table = %table.name,
                    start = window.start_ts,
                    end = window.end_ts,
                    retryable = error.is_retryable(),
                    "Replication failed, watermark stays at {}: {}",
                    watermark,
                    error
                );
                return Err(TableFailure {
                    stage: CycleState::Replicating,
                    window: Some(window),
                    error,
                });
            }
        };

        // AdvancingWatermark
        if let Err(error) = self.watermarks.set(&table.name, window.end_ts).await {
            tracing::error!(
                table = %table.name,
                start = window.start_ts,
                end = window.end_ts,
                rows = stats.rows_written,
                "Rows written but watermark not persisted; window will be copied again: {}",
                error
            );
            return Err(TableFailure {
                stage: CycleState::AdvancingWatermark,
                window: Some(window),
                error,
            });
        }

        tracing::info!(
            table = %table.name,
            start = window.start_ts,
            end = window.end_ts,
            rows = stats.rows_written,
            "Window replicated"
        );

        Ok(TableReport::Replicated {
            watermark: window.end_ts,
            window,
            stats,
        })
    }
}
