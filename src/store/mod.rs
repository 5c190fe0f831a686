//! Store Adapters
//!
//! The engine never assumes the hot and cold stores are reachable from one
//! connection. It reads through a [`HotReader`], writes through a
//! [`ColdWriter`], and both sides exchange rows as a [`RowBatch`].
//!
//! Every adapter returned by [`connect_hot`] / [`connect_cold`] is wrapped in
//! [`Timed`], so no call can hang longer than the configured query timeout.

mod http;
mod memory;
mod mysql;
mod value;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{StoreConfig, StoreKind, TableConfig};
use crate::error::{Error, Result};
use crate::replication::Window;

pub use http::HttpStore;
pub use memory::MemoryStore;
pub use mysql::MySqlStore;
pub use value::{parse_timestamp, RowBatch, Value, TIMESTAMP_FORMAT};

/// Per-table timestamp statistics
#[async_trait]
pub trait TableStats: Send + Sync {
    /// Largest timestamp present in `table`, `None` when the table is empty
    async fn max_timestamp(&self, table: &TableConfig) -> Result<Option<i64>>;
}

/// Read access to the hot store
#[async_trait]
pub trait HotReader: TableStats {
    /// All rows with `window.start_ts <= timestamp < window.end_ts`
    async fn read_window(&self, table: &TableConfig, window: &Window) -> Result<RowBatch>;
}

/// Write access to the cold store
#[async_trait]
pub trait ColdWriter: TableStats {
    /// Append `rows` to `table`, returning the row count the store confirmed
    async fn write_rows(&self, table: &TableConfig, rows: &RowBatch) -> Result<u64>;
}

/// Adapter wrapper that bounds every call with a timeout
pub struct Timed<S> {
    inner: S,
    store: &'static str,
    timeout: Duration,
}

impl<S> Timed<S> {
    pub fn new(store: &'static str, timeout: Duration, inner: S) -> Self {
        Self {
            inner,
            store,
            timeout,
        }
    }

    async fn bounded<T>(&self, fut: impl Future<Output = Result<T>> + Send) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionTimeout {
                store: self.store.to_string(),
                secs: self.timeout.as_secs(),
            }),
        }
    }
}

#[async_trait]
impl<S: TableStats> TableStats for Timed<S> {
    async fn max_timestamp(&self, table: &TableConfig) -> Result<Option<i64>> {
        self.bounded(self.inner.max_timestamp(table)).await
    }
}

#[async_trait]
impl<S: HotReader> HotReader for Timed<S> {
    async fn read_window(&self, table: &TableConfig, window: &Window) -> Result<RowBatch> {
        self.bounded(self.inner.read_window(table, window)).await
    }
}

#[async_trait]
impl<S: ColdWriter> ColdWriter for Timed<S> {
    async fn write_rows(&self, table: &TableConfig, rows: &RowBatch) -> Result<u64> {
        self.bounded(self.inner.write_rows(table, rows)).await
    }
}

/// Connect to the hot store
pub async fn connect_hot(config: &StoreConfig) -> Result<Arc<dyn HotReader>> {
    let timeout = config.query_timeout();
    let reader: Arc<dyn HotReader> = match config.kind {
        StoreKind::Http => {
            Arc::new(Timed::new("hot", timeout, HttpStore::connect("hot", config).await?))
        }
        StoreKind::Mysql => {
            Arc::new(Timed::new("hot", timeout, MySqlStore::connect("hot", config).await?))
        }
    };
    Ok(reader)
}

/// Connect to the cold store
pub async fn connect_cold(
    config: &StoreConfig,
    insert_batch_size: usize,
) -> Result<Arc<dyn ColdWriter>> {
    let timeout = config.query_timeout();
    let writer: Arc<dyn ColdWriter> = match config.kind {
        StoreKind::Http => Arc::new(Timed::new(
            "cold",
            timeout,
            HttpStore::connect("cold", config).await?.with_batch_size(insert_batch_size),
        )),
        StoreKind::Mysql => Arc::new(Timed::new(
            "cold",
            timeout,
            MySqlStore::connect("cold", config).await?.with_batch_size(insert_batch_size),
        )),
    };
    Ok(writer)
}

/// Quote an identifier, splitting `db.table` into its parts
pub(crate) fn quote_ident(name: &str) -> String {
    name.split('.')
        .map(|part| format!("`{}`", part.replace('`', "``")))
        .collect::<Vec<_>>()
        .join(".")
}

/// Fully qualified, quoted table name
pub(crate) fn qualified_table(database: &str, table: &str) -> String {
    if table.contains('.') {
        quote_ident(table)
    } else {
        format!("{}.{}", quote_ident(database), quote_ident(table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Stalled;

    #[async_trait]
    impl TableStats for Stalled {
        async fn max_timestamp(&self, _table: &TableConfig) -> Result<Option<i64>> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Some(1))
        }
    }

    fn table() -> TableConfig {
        TableConfig {
            name: "trades".into(),
            class: Default::default(),
            window_ms: None,
            timestamp_column: "timestamp".into(),
        }
    }

    #[tokio::test]
    async fn test_timed_call_expires() {
        let store = Timed::new("hot", Duration::from_millis(20), Stalled);
        let err = store.max_timestamp(&table()).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionTimeout { ref store, .. } if store == "hot"));
        assert!(err.is_connectivity());
    }

    #[test]
    fn test_identifiers() {
        assert_eq!(quote_ident("trades"), "`trades`");
        assert_eq!(qualified_table("market_data", "trades"), "`market_data`.`trades`");
        assert_eq!(qualified_table("market_data", "archive.trades"), "`archive`.`trades`");
    }
}
