// ABOUTME: Library root for bq-syncer
// ABOUTME: Incremental BigQuery-to-DuckDB sync with Parquet snapshot publishing

pub mod config;
pub mod remote;
pub mod scheduler;
pub mod snapshot;
pub mod store;
pub mod sync;
pub mod utils;

pub use config::SyncConfig;
pub use scheduler::Scheduler;
pub use sync::{CycleOutcome, CycleReport, SyncCoordinator};
