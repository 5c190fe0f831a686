//! Row Format
//!
//! The common row representation shared by every store adapter. Readers
//! decode their native rows into a [`RowBatch`]; writers encode it back.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Column value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    /// Number outside `i64`/`u64` (Decimal, Int128, ...), kept as its exact text
    Decimal(String),
    String(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
}

/// Text layout accepted by both ClickHouse and MySQL for DateTime64(3)
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

impl Value {
    /// Interpret the value as a UTC millisecond timestamp
    ///
    /// Integers are taken as epoch milliseconds; strings must use
    /// [`TIMESTAMP_FORMAT`] (fraction optional) or RFC 3339.
    pub fn as_millis(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::UInt(u) => i64::try_from(*u).ok(),
            Value::Timestamp(t) => Some(t.timestamp_millis()),
            Value::String(s) => parse_timestamp(s).map(|t| t.timestamp_millis()),
            _ => None,
        }
    }

    /// Convert from a decoded JSON value
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if let Some(u) = n.as_u64() {
                    Value::UInt(u)
                } else {
                    Value::Decimal(n.to_string())
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            other => Value::Json(other),
        }
    }

    /// Convert to a JSON value for JSON-based wire formats
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::UInt(u) => serde_json::Value::from(*u),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Decimal(d) => d
                .parse::<serde_json::Number>()
                .map(serde_json::Value::Number)
                .unwrap_or_else(|_| serde_json::Value::String(d.clone())),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => serde_json::Value::String(String::from_utf8_lossy(b).into_owned()),
            Value::Timestamp(t) => {
                serde_json::Value::String(t.format(TIMESTAMP_FORMAT).to_string())
            }
            Value::Json(j) => j.clone(),
        }
    }
}

/// Parse the timestamp layouts the stores emit
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(Utc.from_utc_datetime(&t));
    }
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Rows read from one store for one table
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowBatch {
    /// Column names, in value order
    pub columns: Vec<String>,
    /// Row values, each the same length as `columns`
    pub rows: Vec<Vec<Value>>,
}

impl RowBatch {
    /// Create an empty batch with the given columns
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Check if the batch has no rows
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Index of a column by name
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Build a batch from JSON objects, taking columns from the first row
    pub fn from_json_objects(
        objects: Vec<serde_json::Map<String, serde_json::Value>>,
    ) -> Self {
        let columns: Vec<String> = objects
            .first()
            .map(|o| o.keys().cloned().collect())
            .unwrap_or_default();

        let rows = objects
            .into_iter()
            .map(|mut o| {
                columns
                    .iter()
                    .map(|c| o.remove(c).map(Value::from_json).unwrap_or(Value::Null))
                    .collect()
            })
            .collect();

        Self { columns, rows }
    }

    /// Encode a row slice as newline-delimited JSON objects
    pub fn to_json_lines(&self, rows: &[Vec<Value>]) -> crate::Result<String> {
        let mut out = String::new();
        for row in rows {
            let object: serde_json::Map<String, serde_json::Value> = self
                .columns
                .iter()
                .cloned()
                .zip(row.iter().map(Value::to_json))
                .collect();
            out.push_str(&serde_json::to_string(&object)?);
            out.push('\n');
        }
        Ok(out)
    }
}
