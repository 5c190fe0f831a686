//! SQLite Watermark Store
//!
//! Persistent watermark storage backed by SQLite, for deployments that
//! prefer an embedded database over a plain JSON file.

use std::path::Path;

use async_trait::async_trait;
use rusqlite::{params, Connection};
use tokio::sync::Mutex;

use super::WatermarkStore;
use crate::error::{Error, Result};

/// Watermark store backed by a `table_watermarks` table
pub struct SqliteWatermarkStore {
    /// Database connection
    conn: Mutex<Connection>,
}

impl SqliteWatermarkStore {
    /// Create or open the watermark database
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// In-memory database, mostly useful for tests
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        // Initialize schema
        conn.execute_batch(
            r#"
            PRAGMA synchronous = FULL;

            CREATE TABLE IF NOT EXISTS table_watermarks (
                table_name TEXT PRIMARY KEY,
                watermark_ms INTEGER NOT NULL,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    async fn try_get(&self, table: &str) -> Result<i64> {
        let conn = self.conn.lock().await;
        let result: std::result::Result<i64, _> = conn.query_row(
            "SELECT watermark_ms FROM table_watermarks WHERE table_name = ?1",
            params![table],
            |row| row.get(0),
        );

        match result {
            Ok(ts) => Ok(ts),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(0),
            Err(e) => Err(Error::State(format!("Failed to get watermark: {}", e))),
        }
    }
}

#[async_trait]
impl WatermarkStore for SqliteWatermarkStore {
    async fn get(&self, table: &str) -> i64 {
        match self.try_get(table).await {
            Ok(ts) => ts,
            Err(e) => {
                tracing::warn!(table, "Treating table as never replicated: {}", e);
                0
            }
        }
    }

    async fn set(&self, table: &str, timestamp_ms: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO table_watermarks (table_name, watermark_ms) VALUES (?1, ?2)
            ON CONFLICT(table_name) DO UPDATE SET
                watermark_ms = ?2,
                updated_at = CURRENT_TIMESTAMP
            "#,
            params![table, timestamp_ms],
        )?;
        Ok(())
    }

    async fn all(&self) -> Result<Vec<(String, i64)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT table_name, watermark_ms FROM table_watermarks ORDER BY table_name",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut watermarks = Vec::new();
        for result in rows {
            watermarks.push(result?);
        }

        Ok(watermarks)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::State(format!("SQLite error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_watermarks_basic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.db");

        let store = SqliteWatermarkStore::new(&path).unwrap();
        assert_eq!(store.get("trades").await, 0);

        store.set("trades", 100).await.unwrap();
        store.set("orderbooks", 50).await.unwrap();
        store.set("trades", 250).await.unwrap();
        assert_eq!(store.get("trades").await, 250);
        drop(store);

        let store = SqliteWatermarkStore::new(&path).unwrap();
        assert_eq!(store.get("trades").await, 250);
        assert_eq!(
            store.all().await.unwrap(),
            vec![("orderbooks".to_string(), 50), ("trades".to_string(), 250)]
        );
    }

    #[tokio::test]
    async fn test_set_overwrites_unconditionally() {
        let store = SqliteWatermarkStore::in_memory().unwrap();
        store.set("trades", 500).await.unwrap();
        store.set("trades", 100).await.unwrap();
        assert_eq!(store.get("trades").await, 100);
    }
}
