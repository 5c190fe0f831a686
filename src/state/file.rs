//! File Watermark Store
//!
//! Keeps every table's watermark in one JSON object:
//!
//! ```json
//! {
//!   "funding_rates": 1718000000000,
//!   "trades": 1718003400000
//! }
//! ```
//!
//! Updates are read-modify-write: the new map is written to a sibling
//! temporary file, fsynced, then renamed over the original. A crash leaves
//! either the old map or the new one on disk, never a torn file.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::WatermarkStore;
use crate::error::{Error, Result};

/// Watermark map persisted as a JSON file
pub struct FileWatermarkStore {
    path: PathBuf,
    /// Serializes read-modify-write cycles within this process
    write_lock: Mutex<()>,
}

impl FileWatermarkStore {
    /// Create a store at `path`, creating parent directories
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    fn load(&self) -> Result<BTreeMap<String, i64>> {
        match fs::read_to_string(&self.path) {
            Ok(content) if content.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn persist(&self, map: &BTreeMap<String, i64>) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(map)?;

        let mut file = File::create(&tmp)?;
        file.write_all(&body)?;
        file.write_all(b"\n")?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp, &self.path)?;

        // Make the rename itself durable
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }
}

#[async_trait]
impl WatermarkStore for FileWatermarkStore {
    async fn get(&self, table: &str) -> i64 {
        match self.load() {
            Ok(map) => map.get(table).copied().unwrap_or(0),
            Err(e) => {
                tracing::warn!(
                    table,
                    path = %self.path.display(),
                    "Unreadable watermark file, treating table as never replicated: {}",
                    e
                );
                0
            }
        }
    }

    async fn set(&self, table: &str, timestamp_ms: i64) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut map = match self.load() {
            Ok(map) => map,
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    "Replacing unreadable watermark file: {}",
                    e
                );
                BTreeMap::new()
            }
        };
        map.insert(table.to_string(), timestamp_ms);

        self.persist(&map).map_err(|e| {
            Error::State(format!(
                "Failed to persist watermark {}={} to {}: {}",
                table,
                timestamp_ms,
                self.path.display(),
                e
            ))
        })
    }

    async fn all(&self) -> Result<Vec<(String, i64)>> {
        Ok(self.load()?.into_iter().collect())
    }
}
