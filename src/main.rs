//! TierSync - Hot/Cold Tiered Replication for Market Data
//!
//! Command line entry point. `run` is meant to be invoked by an external
//! scheduler (cron, systemd timer); each invocation performs one cycle.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tiersync::config::TierSyncConfig;
use tiersync::error::{Error, Result};
use tiersync::replication::{CycleDriver, LagReporter, Replicator};
use tiersync::state::{self, RunLock, WatermarkStore};
use tiersync::store::{self, ColdWriter, HotReader, TIMESTAMP_FORMAT};

/// TierSync - Hot/Cold Tiered Replication for Market Data
#[derive(Parser)]
#[command(name = "tiersync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "tiersync.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one replication cycle across all configured tables
    Run,

    /// Show hot/cold replication lag per table
    Status {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Print the persisted watermark map
    Watermarks,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "tiersync.toml")]
        output: PathBuf,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    if let Commands::Init { output } = &cli.command {
        init_logging(cli.log_level.as_deref().unwrap_or("info"), "pretty");
        return run_init(output).map(|_| ExitCode::SUCCESS);
    }

    let loaded = TierSyncConfig::from_file(&cli.config);
    let (level, format) = match &loaded {
        Ok(config) => (config.logging.level.clone(), config.logging.format.clone()),
        Err(_) => ("info".to_string(), "pretty".to_string()),
    };
    init_logging(cli.log_level.as_deref().unwrap_or(&level), &format);

    let config = match loaded {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", cli.config, e);
            return Err(e);
        }
    };

    match cli.command {
        Commands::Run => run_cycle(config).await,
        Commands::Status { json } => run_status(config, json).await,
        Commands::Watermarks => run_watermarks(config).await,
        Commands::Validate => run_validate(&cli.config, &config),
        Commands::Init { .. } => Ok(ExitCode::SUCCESS),
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn connect_stores(
    config: &TierSyncConfig,
) -> Result<(Arc<dyn HotReader>, Arc<dyn ColdWriter>)> {
    let hot = store::connect_hot(&config.hot).await?;
    let cold = store::connect_cold(&config.cold, config.replication.insert_batch_size).await?;
    Ok((hot, cold))
}

/// Run one replication cycle
async fn run_cycle(config: TierSyncConfig) -> Result<ExitCode> {
    let lock = match RunLock::acquire(&config.state.lock_file) {
        Ok(lock) => lock,
        Err(Error::Locked(path)) => {
            tracing::warn!("Another tiersync run holds {}, exiting", path);
            return Ok(ExitCode::from(3));
        }
        Err(e) => return Err(e),
    };
    tracing::debug!(lock = %lock.path().display(), "Run lock acquired");

    let watermarks = state::open(&config.state)?;

    let (hot, cold) = match connect_stores(&config).await {
        Ok(stores) => stores,
        Err(e) => {
            tracing::error!(
                tables = config.tables.len(),
                "Store connection failed, no table replicated this cycle: {}",
                e
            );
            return Ok(ExitCode::FAILURE);
        }
    };

    let driver = CycleDriver::new(
        watermarks,
        Replicator::new(hot, cold),
        config.replication.clone(),
    );

    let summary = driver
        .run_cycle(&config.tables, Utc::now().timestamp_millis())
        .await;

    for outcome in &summary.outcomes {
        if let Err(failure) = &outcome.result {
            eprintln!("✗ {} failed while {}: {}", outcome.table, failure.stage, failure.error);
        }
    }

    if summary.has_hard_failure() {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

fn format_ts(ts: Option<i64>) -> String {
    match ts.and_then(|ms| Utc.timestamp_millis_opt(ms).single()) {
        Some(t) => t.format(TIMESTAMP_FORMAT).to_string(),
        None => "-".to_string(),
    }
}

/// Print per-table lag
async fn run_status(config: TierSyncConfig, json: bool) -> Result<ExitCode> {
    let watermarks: HashMap<String, i64> = match state::open(&config.state) {
        Ok(store) => store.all().await.unwrap_or_default().into_iter().collect(),
        Err(e) => {
            tracing::warn!("Watermarks unavailable: {}", e);
            HashMap::new()
        }
    };

    let (hot, cold) = match connect_stores(&config).await {
        Ok(stores) => stores,
        Err(e) => {
            eprintln!("✗ {}", e);
            return Ok(ExitCode::FAILURE);
        }
    };

    let reports = LagReporter::new(hot, cold).lag_all(&config.tables).await;
    let unreachable = reports
        .iter()
        .any(|(_, r)| matches!(r, Err(e) if e.is_connectivity()));

    if json {
        let rows: Vec<serde_json::Value> = reports
            .iter()
            .map(|(table, report)| match report {
                Ok(r) => serde_json::json!({
                    "table": table,
                    "hot_max": r.hot_max_ts,
                    "cold_max": r.cold_max_ts,
                    "lag_minutes": r.lag_minutes,
                    "watermark": watermarks.get(table),
                }),
                Err(e) => serde_json::json!({
                    "table": table,
                    "error": e.to_string(),
                    "watermark": watermarks.get(table),
                }),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        println!(
            "{:<20} {:<24} {:<24} {:>12} {:<24}",
            "TABLE", "HOT_MAX", "COLD_MAX", "LAG_MINUTES", "WATERMARK"
        );
        for (table, report) in &reports {
            let watermark = format_ts(watermarks.get(table).copied());
            match report {
                Ok(r) => println!(
                    "{:<20} {:<24} {:<24} {:>12} {:<24}",
                    table,
                    format_ts(r.hot_max_ts),
                    format_ts(r.cold_max_ts),
                    r.lag_minutes,
                    watermark
                ),
                Err(e) => println!("{:<20} error: {}", table, e),
            }
        }
    }

    if unreachable {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

/// Print the persisted watermarks
async fn run_watermarks(config: TierSyncConfig) -> Result<ExitCode> {
    let store = state::open(&config.state)?;
    let watermarks = store.all().await?;

    if watermarks.is_empty() {
        println!("No watermarks recorded yet");
        return Ok(ExitCode::SUCCESS);
    }

    println!("{:<20} {:>16}  {}", "TABLE", "WATERMARK_MS", "UTC");
    for (table, ts) in watermarks {
        println!("{:<20} {:>16}  {}", table, ts, format_ts(Some(ts)));
    }
    Ok(ExitCode::SUCCESS)
}

/// Write an example configuration
fn run_init(output: &Path) -> Result<()> {
    let config_content = r#"# TierSync Configuration
# Generated configuration file

[hot]
kind = "http"            # http (ClickHouse HTTP) or mysql
host = "localhost"
port = 8123
user = "default"
password = ""
database = "market_data"
connect_timeout_secs = 10
query_timeout_secs = 120

[cold]
kind = "http"
host = "cold-storage.internal"
port = 8123
user = "default"
password = "changeme"
database = "market_data"

[replication]
initial_lookback_ms = 3600000       # first-run backfill bound (60 min)
safety_lag_ms = 120000              # trailing buffer before data is eligible (2 min)
high_frequency_window_ms = 300000
low_frequency_window_ms = 3600000
insert_batch_size = 10000

[state]
backend = "file"                    # file or sqlite
path = "/var/lib/tiersync/watermarks.json"
lock_file = "/var/lib/tiersync/run.lock"

[logging]
level = "info"
format = "pretty"

[[tables]]
name = "trades"
class = "high_frequency"

[[tables]]
name = "orderbooks"
class = "high_frequency"
window_ms = 60000

[[tables]]
name = "funding_rates"
class = "low_frequency"
"#;

    std::fs::write(output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to configure your hot and cold stores.");
    println!("Then schedule: tiersync --config {} run", output.display());

    Ok(())
}

fn run_validate(path: &Path, config: &TierSyncConfig) -> Result<ExitCode> {
    println!("✓ Configuration is valid: {}", path.display());
    for (tier, store) in [("Hot: ", &config.hot), ("Cold:", &config.cold)] {
        println!(
            "  {}  {:?} {}@{}:{}/{}",
            tier,
            store.kind,
            store.user,
            store.host,
            store.effective_port(),
            store.database
        );
    }
    println!("  State: {:?} {}", config.state.backend, config.state.path.display());
    println!(
        "  Lookback: {} ms, safety lag: {} ms",
        config.replication.initial_lookback_ms, config.replication.safety_lag_ms
    );
    println!("  Tables:");
    for table in &config.tables {
        match table.window_ms(&config.replication) {
            Ok(window) => {
                println!("    {:<20} {:?}, window {} ms", table.name, table.class, window)
            }
            Err(e) => println!("    {:<20} ✗ {}", table.name, e),
        }
    }
    Ok(ExitCode::SUCCESS)
}
