//! TierSync - Hot/Cold Tiered Replication for Market Data
//!
//! Periodically copies newly arrived rows of append-only time-series tables
//! from a hot store to a cold store. Progress is tracked per table with a
//! persisted watermark, so every run resumes where the last successful one
//! stopped without any distributed transaction.
//!
//! # Architecture
//!
//! An external scheduler invokes one cycle at a time. For each configured
//! table the cycle plans a window behind a safety lag, copies it, and only
//! then advances the watermark. A failed table keeps its watermark and is
//! retried by the next trigger; other tables are unaffected.
//!
//! # Features
//!
//! - Bounded initial backfill instead of full-history copies
//! - Crash-atomic watermark map (JSON file or SQLite)
//! - SQL-over-HTTP and MySQL-protocol store adapters, all calls time-bounded
//! - Hot/cold lag reporting

pub mod config;
pub mod error;
pub mod replication;
pub mod state;
pub mod store;

pub use config::TierSyncConfig;
pub use error::{Error, Result};
