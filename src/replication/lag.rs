//! Lag Reporter
//!
//! Read-only comparison of the newest timestamp in the hot and cold copies
//! of a table. Never touches watermark state, so it can run alongside a
//! replication cycle.

use std::sync::Arc;

use serde::Serialize;

use crate::config::TableConfig;
use crate::error::Result;
use crate::store::{ColdWriter, HotReader, TableStats};

/// Lag reported while the cold copy is still empty
pub const UNINITIALIZED_LAG_MINUTES: i64 = 999_999;

const MS_PER_MINUTE: i64 = 60_000;

/// Replication lag of one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LagReport {
    pub table: String,
    pub hot_max_ts: Option<i64>,
    pub cold_max_ts: Option<i64>,
    pub lag_minutes: i64,
}

impl LagReport {
    /// Build a report from the two maxima
    pub fn new(table: &str, hot_max_ts: Option<i64>, cold_max_ts: Option<i64>) -> Self {
        Self {
            table: table.to_string(),
            hot_max_ts,
            cold_max_ts,
            lag_minutes: lag_minutes(hot_max_ts, cold_max_ts),
        }
    }

    /// Check if the cold copy has no data yet
    pub fn is_uninitialized(&self) -> bool {
        self.lag_minutes == UNINITIALIZED_LAG_MINUTES
    }
}

/// Minutes between the hot and cold maxima
///
/// An empty cold copy yields [`UNINITIALIZED_LAG_MINUTES`] so it stands out
/// from a healthy near-zero lag. An empty hot copy has nothing to lag behind.
pub fn lag_minutes(hot_max_ts: Option<i64>, cold_max_ts: Option<i64>) -> i64 {
    let hot = hot_max_ts.filter(|ts| *ts > 0);
    let cold = cold_max_ts.filter(|ts| *ts > 0);
    match (hot, cold) {
        (_, None) => UNINITIALIZED_LAG_MINUTES,
        (None, Some(_)) => 0,
        (Some(hot), Some(cold)) => (hot - cold) / MS_PER_MINUTE,
    }
}

/// Computes per-table lag from both stores
#[derive(Clone)]
pub struct LagReporter {
    hot: Arc<dyn HotReader>,
    cold: Arc<dyn ColdWriter>,
}

impl LagReporter {
    pub fn new(hot: Arc<dyn HotReader>, cold: Arc<dyn ColdWriter>) -> Self {
        Self { hot, cold }
    }

    /// Lag of one table
    pub async fn lag(&self, table: &TableConfig) -> Result<LagReport> {
        let hot_max_ts = self.hot.max_timestamp(table).await?;
        let cold_max_ts = self.cold.max_timestamp(table).await?;
        Ok(LagReport::new(&table.name, hot_max_ts, cold_max_ts))
    }

    /// Lag of every table, in order; one table's error does not hide the rest
    pub async fn lag_all(&self, tables: &[TableConfig]) -> Vec<(String, Result<LagReport>)> {
        let mut reports = Vec::with_capacity(tables.len());
        for table in tables {
            let report = self.lag(table).await;
            if let Err(e) = &report {
                tracing::warn!(table = %table.name, "Lag query failed: {}", e);
            }
            reports.push((table.name.clone(), report));
        }
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, Value};

    fn table(name: &str) -> TableConfig {
        TableConfig {
            name: name.into(),
            class: Default::default(),
            window_ms: None,
            timestamp_column: "timestamp".into(),
        }
    }

    #[test]
    fn test_lag_minutes() {
        assert_eq!(lag_minutes(Some(10_000_000), Some(7_600_000)), 40);
        assert_eq!(lag_minutes(Some(10_000_000), Some(10_000_000)), 0);
        assert_eq!(lag_minutes(Some(10_000_000), None), UNINITIALIZED_LAG_MINUTES);
        assert_eq!(lag_minutes(Some(10_000_000), Some(0)), UNINITIALIZED_LAG_MINUTES);
        assert_eq!(lag_minutes(None, None), UNINITIALIZED_LAG_MINUTES);
        assert_eq!(lag_minutes(None, Some(5)), 0);
    }

    #[tokio::test]
    async fn test_reporter() {
        let hot = Arc::new(MemoryStore::new("hot"));
        let cold = Arc::new(MemoryStore::new("cold"));
        hot.insert("trades", &["timestamp"], vec![vec![Value::Int(10_000_000)]]).unwrap();
        cold.insert("trades", &["timestamp"], vec![vec![Value::Int(7_600_000)]]).unwrap();
        hot.insert("funding_rates", &["timestamp"], vec![vec![Value::Int(10_000_000)]]).unwrap();
        hot.insert("orderbooks", &["timestamp"], vec![vec![Value::Int(1)]]).unwrap();
        cold.fail_table("orderbooks").unwrap();

        let reporter = LagReporter::new(hot, cold);
        let reports = reporter
            .lag_all(&[table("trades"), table("funding_rates"), table("orderbooks")])
            .await;

        let trades = reports[0].1.as_ref().unwrap();
        assert_eq!(trades.lag_minutes, 40);
        assert_eq!(trades.hot_max_ts, Some(10_000_000));

        let funding = reports[1].1.as_ref().unwrap();
        assert!(funding.is_uninitialized());
        assert_eq!(funding.cold_max_ts, None);

        assert!(reports[2].1.is_err());
    }
}
