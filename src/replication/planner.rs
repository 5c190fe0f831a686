//! Window Planner
//!
//! Computes the next `[start, end)` interval to copy for one table from its
//! watermark and the current time. The trailing `safety_lag_ms` keeps the
//! window clear of timestamps the hot store may still be receiving out of
//! order.

use serde::Serialize;

/// Half-open replication interval for one table, valid for a single cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Window {
    pub table: String,
    pub start_ts: i64,
    pub end_ts: i64,
}

impl Window {
    /// Check if `ts` falls inside `[start_ts, end_ts)`
    pub fn contains(&self, ts: i64) -> bool {
        ts >= self.start_ts && ts < self.end_ts
    }

    /// Window width in milliseconds
    pub fn width_ms(&self) -> i64 {
        self.end_ts - self.start_ts
    }
}

impl std::fmt::Display for Window {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}, {})", self.table, self.start_ts, self.end_ts)
    }
}

/// Inputs for one planning decision
#[derive(Debug, Clone, Copy)]
pub struct PlanInput {
    pub watermark_ts: i64,
    pub now_ts: i64,
    pub safety_lag_ms: i64,
    pub window_ms: i64,
    pub initial_lookback_ms: i64,
}

/// Planner result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    /// Copy this window
    Copy(Window),
    /// Nothing eligible yet: caught up to `now - safety_lag`
    UpToDate,
    /// `now - safety_lag <= 0`: clock or configuration problem
    ClockGuard { safety_end: i64 },
}

/// Plan the next window for `table`
pub fn plan_window(table: &str, input: &PlanInput) -> Plan {
    let safety_end = input.now_ts.saturating_sub(input.safety_lag_ms);
    if safety_end <= 0 {
        return Plan::ClockGuard { safety_end };
    }

    // Never replicated: bounded backfill instead of full history. The start
    // is clamped to the epoch so the first window always ends past 0, which
    // is the "never replicated" watermark.
    let last = if input.watermark_ts == 0 {
        safety_end.saturating_sub(input.initial_lookback_ms).max(0)
    } else {
        input.watermark_ts
    };

    let end = last.saturating_add(input.window_ms).min(safety_end);
    if end <= last {
        return Plan::UpToDate;
    }

    Plan::Copy(Window {
        table: table.to_string(),
        start_ts: last,
        end_ts: end,
    })
}
