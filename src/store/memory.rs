//! In-memory Store
//!
//! A hot or cold store held in process memory. Used by the test suite and
//! for failure injection: individual tables can be made to fail reads or
//! writes, and the whole store can be marked unreachable.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{ColdWriter, HotReader, RowBatch, TableStats, Value};
use crate::config::TableConfig;
use crate::error::{Error, Result};
use crate::replication::Window;

#[derive(Default)]
struct MemoryState {
    tables: HashMap<String, RowBatch>,
    failing: HashSet<String>,
    unreachable: bool,
    writes: u64,
}

/// Store keeping every table as a [`RowBatch`]
pub struct MemoryStore {
    name: &'static str,
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    /// Create an empty store; `name` labels errors ("hot" / "cold")
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(MemoryState::default()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| Error::Internal("memory store mutex poisoned".into()))
    }

    /// Append rows to `table`, creating it with `columns` if needed
    pub fn insert(&self, table: &str, columns: &[&str], rows: Vec<Vec<Value>>) -> Result<()> {
        let mut state = self.lock()?;
        let batch = state
            .tables
            .entry(table.to_string())
            .or_insert_with(|| RowBatch::new(columns.iter().map(|c| c.to_string()).collect()));
        batch.rows.extend(rows);
        Ok(())
    }

    /// Create an empty table
    pub fn create_table(&self, table: &str, columns: &[&str]) -> Result<()> {
        self.insert(table, columns, Vec::new())
    }

    /// Rows currently stored in `table`
    pub fn row_count(&self, table: &str) -> usize {
        self.lock()
            .map(|s| s.tables.get(table).map(|b| b.len()).unwrap_or(0))
            .unwrap_or(0)
    }

    /// Snapshot of a table's rows
    pub fn rows(&self, table: &str) -> Option<RowBatch> {
        self.lock().ok()?.tables.get(table).cloned()
    }

    /// Make every call touching `table` fail
    pub fn fail_table(&self, table: &str) -> Result<()> {
        self.lock()?.failing.insert(table.to_string());
        Ok(())
    }

    /// Undo [`MemoryStore::fail_table`]
    pub fn heal_table(&self, table: &str) -> Result<()> {
        self.lock()?.failing.remove(table);
        Ok(())
    }

    /// Make every call fail as a connectivity error
    pub fn set_unreachable(&self, unreachable: bool) -> Result<()> {
        self.lock()?.unreachable = unreachable;
        Ok(())
    }

    /// Number of successful `write_rows` calls
    pub fn write_calls(&self) -> u64 {
        self.lock().map(|s| s.writes).unwrap_or(0)
    }

    fn check(&self, state: &MemoryState, table: &str) -> Result<()> {
        if state.unreachable {
            return Err(Error::ConnectionFailed {
                store: self.name.to_string(),
                reason: "store marked unreachable".into(),
            });
        }
        if state.failing.contains(table) {
            return Err(Error::Query {
                store: self.name.to_string(),
                reason: format!("injected failure for {}", table),
            });
        }
        Ok(())
    }
}

fn timestamp_index(batch: &RowBatch, table: &TableConfig) -> Result<usize> {
    batch
        .column_index(&table.timestamp_column)
        .ok_or_else(|| Error::Query {
            store: "memory".into(),
            reason: format!(
                "table {} has no column {}",
                table.name, table.timestamp_column
            ),
        })
}

#[async_trait]
impl TableStats for MemoryStore {
    async fn max_timestamp(&self, table: &TableConfig) -> Result<Option<i64>> {
        let state = self.lock()?;
        self.check(&state, &table.name)?;

        let Some(batch) = state.tables.get(&table.name) else {
            return Ok(None);
        };
        let idx = timestamp_index(batch, table)?;
        Ok(batch.rows.iter().filter_map(|r| r[idx].as_millis()).max())
    }
}

#[async_trait]
impl HotReader for MemoryStore {
    async fn read_window(&self, table: &TableConfig, window: &Window) -> Result<RowBatch> {
        let state = self.lock()?;
        self.check(&state, &table.name)?;

        let batch = state.tables.get(&table.name).ok_or_else(|| Error::Query {
            store: self.name.to_string(),
            reason: format!("unknown table {}", table.name),
        })?;
        let idx = timestamp_index(batch, table)?;

        let mut out = RowBatch::new(batch.columns.clone());
        out.rows = batch
            .rows
            .iter()
            .filter(|r| r[idx].as_millis().map(|ts| window.contains(ts)).unwrap_or(false))
            .cloned()
            .collect();
        Ok(out)
    }
}

#[async_trait]
impl ColdWriter for MemoryStore {
    async fn write_rows(&self, table: &TableConfig, rows: &RowBatch) -> Result<u64> {
        let mut state = self.lock()?;
        self.check(&state, &table.name)?;

        let target = state
            .tables
            .entry(table.name.clone())
            .or_insert_with(|| RowBatch::new(rows.columns.clone()));

        // Columns are matched by name, like a keyed INSERT
        for row in &rows.rows {
            let aligned = target
                .columns
                .iter()
                .map(|c| {
                    rows.column_index(c)
                        .map(|i| row[i].clone())
                        .unwrap_or(Value::Null)
                })
                .collect();
            target.rows.push(aligned);
        }
        state.writes += 1;
        Ok(rows.len() as u64)
    }
}
