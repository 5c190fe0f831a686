//! State Management Module
//!
//! Persistent per-table watermarks and the run lock.
//!
//! A watermark is the UTC millisecond timestamp up to which a table has
//! been durably copied to the cold store. `0` means the table has never been
//! replicated.

mod file;
mod lock;
mod tracker;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{StateBackend, StateConfig};
use crate::error::Result;

pub use file::FileWatermarkStore;
pub use lock::RunLock;
pub use tracker::SqliteWatermarkStore;

/// Keyed map of table name to last replicated timestamp
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    /// Persisted watermark, or `0` when unknown or unreadable
    async fn get(&self, table: &str) -> i64;

    /// Durably replace the watermark for `table`
    async fn set(&self, table: &str, timestamp_ms: i64) -> Result<()>;

    /// Every persisted watermark, sorted by table name
    async fn all(&self) -> Result<Vec<(String, i64)>>;
}

/// Open the configured watermark backend
pub fn open(config: &StateConfig) -> Result<Arc<dyn WatermarkStore>> {
    let store: Arc<dyn WatermarkStore> = match config.backend {
        StateBackend::File => Arc::new(FileWatermarkStore::new(config.path.clone())?),
        StateBackend::Sqlite => Arc::new(SqliteWatermarkStore::new(&config.path)?),
    };
    Ok(store)
}
