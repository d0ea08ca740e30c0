// ABOUTME: Incremental sync engine from remote tables into the local store
// ABOUTME: Schema conversion, watermarks, extraction, loading, workers and the cycle coordinator

pub mod coordinator;
pub mod extractor;
pub mod loader;
pub mod schema;
pub mod watermark;
pub mod worker;

pub use coordinator::{CycleOutcome, CycleReport, SyncCoordinator, TableFailure};
pub use extractor::{Extractor, RowBatch};
pub use loader::Loader;
pub use schema::{LocalColumn, LocalSchema, ProjectionRule, SchemaConverter};
pub use watermark::WatermarkTracker;
pub use worker::{TableSyncReport, TableSyncWorker};
