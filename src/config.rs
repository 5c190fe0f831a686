//! TierSync Configuration
//!
//! This module provides configuration structures for the hot/cold
//! replication engine. Configuration is read from a TOML file and may be
//! overridden from the environment (store endpoints, credentials, timing).

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "TIERSYNC";

/// Main TierSync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierSyncConfig {
    /// Hot (recent, fast) store
    pub hot: StoreConfig,

    /// Cold (long retention) store
    pub cold: StoreConfig,

    /// Windowing and timing
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Watermark persistence
    #[serde(default)]
    pub state: StateConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Tables to replicate, in processing order
    #[serde(default)]
    pub tables: Vec<TableConfig>,
}

/// Store adapter kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// SQL over HTTP (ClickHouse HTTP interface)
    #[default]
    Http,
    /// MySQL wire protocol
    Mysql,
}

/// Connection configuration for one store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Adapter used to talk to the store
    #[serde(default)]
    pub kind: StoreKind,

    /// Store host
    pub host: String,

    /// Store port (0 = adapter default)
    #[serde(default)]
    pub port: u16,

    /// User name
    #[serde(default = "default_user")]
    pub user: String,

    /// Password
    #[serde(default)]
    pub password: String,

    /// Database holding the replicated tables
    #[serde(default = "default_database")]
    pub database: String,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Per-call timeout in seconds
    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,
}

/// Replication timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Backfill bound used when a table has no watermark yet
    #[serde(default = "default_initial_lookback_ms")]
    pub initial_lookback_ms: i64,

    /// Trailing buffer before data becomes eligible
    #[serde(default = "default_safety_lag_ms")]
    pub safety_lag_ms: i64,

    /// Default window for high-frequency tables
    #[serde(default = "default_high_frequency_window_ms")]
    pub high_frequency_window_ms: i64,

    /// Default window for low-frequency and event tables
    #[serde(default = "default_low_frequency_window_ms")]
    pub low_frequency_window_ms: i64,

    /// Maximum rows per INSERT sent to the cold store
    #[serde(default = "default_insert_batch_size")]
    pub insert_batch_size: usize,
}

/// Table class, selects the default window size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TableClass {
    #[default]
    HighFrequency,
    LowFrequency,
}

/// A replicated table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableConfig {
    /// Table name, identical in hot and cold stores
    pub name: String,

    /// Frequency class
    #[serde(default)]
    pub class: TableClass,

    /// Window override in milliseconds
    #[serde(default)]
    pub window_ms: Option<i64>,

    /// Column holding the row timestamp
    #[serde(default = "default_timestamp_column")]
    pub timestamp_column: String,
}

/// Watermark backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// JSON map replaced by atomic rename
    #[default]
    File,
    /// Embedded SQLite database
    Sqlite,
}

/// Watermark persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Backend
    #[serde(default)]
    pub backend: StateBackend,

    /// Watermark file (JSON map or SQLite database)
    #[serde(default = "default_state_path")]
    pub path: PathBuf,

    /// Lock file taken by `run`
    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_user() -> String {
    "default".to_string()
}

fn default_database() -> String {
    "market_data".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_query_timeout() -> u64 {
    120
}

fn default_initial_lookback_ms() -> i64 {
    60 * 60 * 1000
}

fn default_safety_lag_ms() -> i64 {
    2 * 60 * 1000
}

fn default_high_frequency_window_ms() -> i64 {
    5 * 60 * 1000
}

fn default_low_frequency_window_ms() -> i64 {
    60 * 60 * 1000
}

fn default_insert_batch_size() -> usize {
    10_000
}

fn default_timestamp_column() -> String {
    "timestamp".to_string()
}

fn default_state_path() -> PathBuf {
    PathBuf::from("/var/lib/tiersync/watermarks.json")
}

fn default_lock_file() -> PathBuf {
    PathBuf::from("/var/lib/tiersync/run.lock")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            initial_lookback_ms: default_initial_lookback_ms(),
            safety_lag_ms: default_safety_lag_ms(),
            high_frequency_window_ms: default_high_frequency_window_ms(),
            low_frequency_window_ms: default_low_frequency_window_ms(),
            insert_batch_size: default_insert_batch_size(),
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: StateBackend::default(),
            path: default_state_path(),
            lock_file: default_lock_file(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl StoreConfig {
    /// Port, falling back to the adapter's well-known default
    pub fn effective_port(&self) -> u16 {
        if self.port != 0 {
            return self.port;
        }
        match self.kind {
            StoreKind::Http => 8123,
            StoreKind::Mysql => 3306,
        }
    }

    /// Base URL for the HTTP adapter
    pub fn http_url(&self) -> String {
        format!("http://{}:{}/", self.host, self.effective_port())
    }

    /// Connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Per-call timeout as Duration
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    fn apply_env(
        &mut self,
        tier: &str,
        vars: &dyn Fn(&str) -> Option<String>,
    ) -> crate::Result<()> {
        let key = |field: &str| format!("{}_{}_{}", ENV_PREFIX, tier, field);
        if let Some(host) = vars(&key("HOST")) {
            self.host = host;
        }
        if let Some(port) = vars(&key("PORT")) {
            self.port = port.parse().map_err(|_| {
                crate::Error::Config(format!("{} is not a port: {}", key("PORT"), port))
            })?;
        }
        if let Some(user) = vars(&key("USER")) {
            self.user = user;
        }
        if let Some(password) = vars(&key("PASSWORD")) {
            self.password = password;
        }
        if let Some(database) = vars(&key("DATABASE")) {
            self.database = database;
        }
        Ok(())
    }

    fn validate(&self, tier: &str) -> crate::Result<()> {
        if self.host.is_empty() {
            return Err(crate::Error::Config(format!("{}.host cannot be empty", tier)));
        }
        if !is_identifier(&self.database) {
            return Err(crate::Error::Config(format!(
                "{}.database is not a plain identifier: {}",
                tier, self.database
            )));
        }
        if self.query_timeout_secs == 0 || self.connect_timeout_secs == 0 {
            return Err(crate::Error::Config(format!("{} timeouts must be positive", tier)));
        }
        Ok(())
    }
}

impl TableConfig {
    /// Resolve the window size for this table
    ///
    /// A non-positive override is reported per table so that one bad entry
    /// does not stop the other tables from replicating.
    pub fn window_ms(&self, replication: &ReplicationConfig) -> crate::Result<i64> {
        let window = match self.window_ms {
            Some(w) => w,
            None => match self.class {
                TableClass::HighFrequency => replication.high_frequency_window_ms,
                TableClass::LowFrequency => replication.low_frequency_window_ms,
            },
        };
        if window <= 0 {
            return Err(crate::Error::TableConfig {
                table: self.name.clone(),
                reason: format!("window_ms must be positive, got {}", window),
            });
        }
        Ok(window)
    }
}

/// Names spliced into SQL must be plain identifiers (optionally db-qualified)
pub fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        && !name.starts_with('.')
        && !name.ends_with('.')
}

impl TierSyncConfig {
    /// Load configuration from a TOML file, applying environment overrides
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: TierSyncConfig = toml::from_str(&content)?;
        config.apply_env_overrides(&|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: TierSyncConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `TIERSYNC_*` overrides from a variable lookup
    pub fn apply_env_overrides(
        &mut self,
        vars: &dyn Fn(&str) -> Option<String>,
    ) -> crate::Result<()> {
        self.hot.apply_env("HOT", vars)?;
        self.cold.apply_env("COLD", vars)?;

        let parse_ms = |key: &str| -> crate::Result<Option<i64>> {
            match vars(key) {
                Some(v) => v
                    .parse()
                    .map(Some)
                    .map_err(|_| crate::Error::Config(format!("{} is not an integer: {}", key, v))),
                None => Ok(None),
            }
        };
        if let Some(v) = parse_ms(&format!("{}_INITIAL_LOOKBACK_MS", ENV_PREFIX))? {
            self.replication.initial_lookback_ms = v;
        }
        if let Some(v) = parse_ms(&format!("{}_SAFETY_LAG_MS", ENV_PREFIX))? {
            self.replication.safety_lag_ms = v;
        }
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        self.hot.validate("hot")?;
        self.cold.validate("cold")?;

        if self.tables.is_empty() {
            return Err(crate::Error::Config("at least one [[tables]] entry is required".into()));
        }

        let mut seen = HashSet::new();
        for table in &self.tables {
            if !is_identifier(&table.name) {
                return Err(crate::Error::Config(format!(
                    "table name is not a plain identifier: {:?}",
                    table.name
                )));
            }
            if !is_identifier(&table.timestamp_column) {
                return Err(crate::Error::Config(format!(
                    "timestamp column of {} is not a plain identifier: {:?}",
                    table.name, table.timestamp_column
                )));
            }
            if !seen.insert(table.name.as_str()) {
                return Err(crate::Error::Config(format!("duplicate table: {}", table.name)));
            }
        }

        let r = &self.replication;
        if r.initial_lookback_ms <= 0 {
            return Err(crate::Error::Config(
                "replication.initial_lookback_ms must be positive".into(),
            ));
        }
        if r.safety_lag_ms < 0 {
            return Err(crate::Error::Config("replication.safety_lag_ms cannot be negative".into()));
        }
        if r.high_frequency_window_ms <= 0 || r.low_frequency_window_ms <= 0 {
            return Err(crate::Error::Config("replication window sizes must be positive".into()));
        }
        if r.insert_batch_size == 0 {
            return Err(crate::Error::Config(
                "replication.insert_batch_size must be positive".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn table<'a>(config: &'a TierSyncConfig, name: &str) -> Option<&'a TableConfig> {
        config.tables.iter().find(|t| t.name == name)
    }

    const SAMPLE: &str = r#"
[hot]
host = "hot.internal"
user = "reader"
password = "secret"

[cold]
kind = "mysql"
host = "cold.internal"
user = "writer"
password = "secret"

[replication]
safety_lag_ms = 120000

[state]
backend = "sqlite"
path = "/tmp/tiersync/state.db"

[[tables]]
name = "trades"

[[tables]]
name = "funding_rates"
class = "low_frequency"
timestamp_column = "event_time"

[[tables]]
name = "orderbooks"
window_ms = 60000
"#;

    #[test]
    fn test_parse_config() {
        let config = TierSyncConfig::from_str(SAMPLE).unwrap();
        assert_eq!(config.hot.kind, StoreKind::Http);
        assert_eq!(config.hot.effective_port(), 8123);
        assert_eq!(config.cold.kind, StoreKind::Mysql);
        assert_eq!(config.cold.effective_port(), 3306);
        assert_eq!(config.state.backend, StateBackend::Sqlite);
        assert_eq!(config.replication.initial_lookback_ms, 3_600_000);
        assert_eq!(config.tables.len(), 3);

        let r = &config.replication;
        assert_eq!(table(&config, "trades").unwrap().window_ms(r).unwrap(), 300_000);
        assert_eq!(table(&config, "funding_rates").unwrap().window_ms(r).unwrap(), 3_600_000);
        assert_eq!(table(&config, "orderbooks").unwrap().window_ms(r).unwrap(), 60_000);
        assert_eq!(table(&config, "funding_rates").unwrap().timestamp_column, "event_time");
    }

    #[test]
    fn test_bad_window_is_per_table() {
        let toml = SAMPLE.replace("window_ms = 60000", "window_ms = 0");
        let config = TierSyncConfig::from_str(&toml).unwrap();
        let err = table(&config, "orderbooks")
            .unwrap()
            .window_ms(&config.replication)
            .unwrap_err();
        assert!(err.is_config());
        assert!(table(&config, "trades").unwrap().window_ms(&config.replication).is_ok());
    }

    #[test]
    fn test_rejects_invalid() {
        let dup = format!("{}\n[[tables]]\nname = \"trades\"\n", SAMPLE);
        assert!(TierSyncConfig::from_str(&dup).is_err());

        let injected = SAMPLE.replace("name = \"trades\"", "name = \"trades; DROP TABLE x\"");
        assert!(TierSyncConfig::from_str(&injected).is_err());

        let no_tables = r#"
[hot]
host = "a"
[cold]
host = "b"
"#;
        assert!(TierSyncConfig::from_str(no_tables).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = TierSyncConfig::from_str(SAMPLE).unwrap();
        let vars: HashMap<&str, &str> = [
            ("TIERSYNC_HOT_HOST", "10.0.0.5"),
            ("TIERSYNC_COLD_PASSWORD", "rotated"),
            ("TIERSYNC_SAFETY_LAG_MS", "300000"),
        ]
        .into_iter()
        .collect();
        config
            .apply_env_overrides(&|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.hot.host, "10.0.0.5");
        assert_eq!(config.cold.password, "rotated");
        assert_eq!(config.replication.safety_lag_ms, 300_000);

        let bad: HashMap<&str, &str> = [("TIERSYNC_HOT_PORT", "http")].into_iter().collect();
        assert!(config
            .apply_env_overrides(&|k| bad.get(k).map(|v| v.to_string()))
            .is_err());
    }
}
