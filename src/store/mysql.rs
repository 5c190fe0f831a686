//! MySQL Store
//!
//! Store adapter for MySQL and MariaDB. Writes run in a transaction with
//! bound parameters, so servers that only emulate the wire protocol
//! without `BEGIN` or prepared statements (such as the ClickHouse MySQL
//! interface) need the HTTP adapter instead. Timestamp columns are expected
//! to be `DATETIME`/`TIMESTAMP` with millisecond precision or better.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use sqlx::mysql::{MySqlArguments, MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::query::Query;
use sqlx::{Column, MySql, Row, TypeInfo, ValueRef};

use super::{qualified_table, quote_ident, ColdWriter, HotReader, RowBatch, TableStats, Value};
use crate::config::{StoreConfig, TableConfig};
use crate::error::{Error, Result};
use crate::replication::Window;

/// Placeholder limit of a single MySQL prepared statement
const MAX_PLACEHOLDERS: usize = 65_535;

/// MySQL-protocol store adapter
pub struct MySqlStore {
    pool: MySqlPool,
    database: String,
    store: &'static str,
    batch_size: usize,
}

impl MySqlStore {
    /// Open a connection pool and verify one connection
    pub async fn connect(store: &'static str, config: &StoreConfig) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(config.connect_timeout())
            .connect_with(connect_options(config))
            .await
            .map_err(|e| Error::ConnectionFailed {
                store: store.to_string(),
                reason: format!("{}:{}: {}", config.host, config.effective_port(), e),
            })?;

        tracing::debug!(store, host = %config.host, "Connected to MySQL store");

        Ok(Self {
            pool,
            database: config.database.clone(),
            store,
            batch_size: usize::MAX,
        })
    }

    /// Limit rows per INSERT statement
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    fn query_error(&self, e: sqlx::Error) -> Error {
        let e = Error::Database(e);
        if e.is_connectivity() {
            return e;
        }
        Error::Query {
            store: self.store.to_string(),
            reason: e.to_string(),
        }
    }
}

/// Connection options; credentials are passed as-is, never through a URL
fn connect_options(config: &StoreConfig) -> MySqlConnectOptions {
    MySqlConnectOptions::new()
        .host(&config.host)
        .port(config.effective_port())
        .username(&config.user)
        .password(&config.password)
        .database(&config.database)
}

/// Decode one column of a row into the common value type
fn decode_column(row: &MySqlRow, index: usize) -> Result<Value> {
    if row.try_get_raw(index)?.is_null() {
        return Ok(Value::Null);
    }

    let type_name = row.column(index).type_info().name().to_uppercase();
    let value = match type_name.as_str() {
        "BOOLEAN" => Value::Bool(row.try_get(index)?),
        t if t.ends_with("UNSIGNED") => Value::UInt(row.try_get(index)?),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" | "YEAR" => {
            Value::Int(row.try_get(index)?)
        }
        "FLOAT" => Value::Float(row.try_get::<f32, _>(index)? as f64),
        "DOUBLE" => Value::Float(row.try_get(index)?),
        "DATETIME" | "TIMESTAMP" => {
            let t: NaiveDateTime = row.try_get(index)?;
            Value::Timestamp(t.and_utc())
        }
        "DECIMAL" => Value::Decimal(row.try_get_unchecked::<String, _>(index)?),
        "BINARY" | "VARBINARY" | "TINYBLOB" | "BLOB" | "MEDIUMBLOB" | "LONGBLOB" => {
            Value::Bytes(row.try_get(index)?)
        }
        // DATE, TIME, JSON, ENUM, ... travel as their text form
        _ => match row.try_get::<String, _>(index) {
            Ok(s) => Value::String(s),
            Err(_) => Value::String(row.try_get_unchecked::<String, _>(index)?),
        },
    };
    Ok(value)
}

fn decode_rows(rows: &[MySqlRow]) -> Result<RowBatch> {
    let columns: Vec<String> = rows
        .first()
        .map(|r| r.columns().iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();

    let mut batch = RowBatch::new(columns);
    for row in rows {
        let values = (0..row.len())
            .map(|i| decode_column(row, i))
            .collect::<Result<Vec<_>>>()?;
        batch.rows.push(values);
    }
    Ok(batch)
}

fn bind_value<'q>(
    query: Query<'q, MySql, MySqlArguments>,
    value: &'q Value,
) -> Query<'q, MySql, MySqlArguments> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Int(i) => query.bind(*i),
        Value::UInt(u) => query.bind(*u),
        Value::Float(f) => query.bind(*f),
        Value::Decimal(d) => query.bind(d.as_str()),
        Value::String(s) => query.bind(s.as_str()),
        Value::Bytes(b) => query.bind(b.as_slice()),
        Value::Timestamp(t) => query.bind(t.naive_utc()),
        Value::Json(j) => query.bind(j.to_string()),
    }
}

/// `INSERT INTO t (a, b) VALUES (?, ?), (?, ?)` for `rows` rows
fn insert_statement(table: &str, columns: &[String], rows: usize) -> String {
    let column_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let tuple = format!("({})", vec!["?"; columns.len()].join(", "));
    let values = vec![tuple.as_str(); rows].join(", ");
    format!("INSERT INTO {} ({}) VALUES {}", table, column_list, values)
}

#[async_trait]
impl TableStats for MySqlStore {
    async fn max_timestamp(&self, table: &TableConfig) -> Result<Option<i64>> {
        let sql = format!(
            "SELECT CAST(UNIX_TIMESTAMP(MAX({col})) * 1000 AS SIGNED) FROM {table}",
            col = quote_ident(&table.timestamp_column),
            table = qualified_table(&self.database, &table.name),
        );

        let row: (Option<i64>,) = sqlx::query_as(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| self.query_error(e))?;

        Ok(row.0)
    }
}

#[async_trait]
impl HotReader for MySqlStore {
    async fn read_window(&self, table: &TableConfig, window: &Window) -> Result<RowBatch> {
        let col = quote_ident(&table.timestamp_column);
        let sql = format!(
            "SELECT * FROM {table} WHERE {col} >= FROM_UNIXTIME(? / 1000) AND {col} < FROM_UNIXTIME(? / 1000)",
            table = qualified_table(&self.database, &table.name),
            col = col,
        );

        tracing::debug!("Executing: {}", &sql[..sql.len().min(100)]);

        let rows = sqlx::query(&sql)
            .bind(window.start_ts)
            .bind(window.end_ts)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| self.query_error(e))?;

        decode_rows(&rows)
    }
}

#[async_trait]
impl ColdWriter for MySqlStore {
    async fn write_rows(&self, table: &TableConfig, rows: &RowBatch) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let target = qualified_table(&self.database, &table.name);
        let per_statement = (MAX_PLACEHOLDERS / rows.columns.len().max(1))
            .min(self.batch_size)
            .max(1);

        let mut tx = self.pool.begin().await.map_err(|e| self.query_error(e))?;
        let mut written = 0u64;

        for chunk in rows.rows.chunks(per_statement) {
            let sql = insert_statement(&target, &rows.columns, chunk.len());
            let mut query = sqlx::query(&sql);
            for value in chunk.iter().flatten() {
                query = bind_value(query, value);
            }

            let result = query.execute(&mut *tx).await.map_err(|e| Error::Write {
                table: table.name.clone(),
                reason: format!("Failed to execute '{}...': {}", &sql[..sql.len().min(50)], e),
            })?;
            written += result.rows_affected();
        }

        tx.commit().await.map_err(|e| Error::Write {
            table: table.name.clone(),
            reason: format!("commit failed: {}", e),
        })?;

        Ok(written)
    }
}
