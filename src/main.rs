// ABOUTME: CLI entry point for bq-syncer
// ABOUTME: Loads configuration, connects to BigQuery and DuckDB, then runs sync cycles

use anyhow::Context;
use bq_syncer::remote::BigQuerySource;
use bq_syncer::store::LocalStore;
use bq_syncer::{CycleOutcome, Scheduler, SyncConfig, SyncCoordinator};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "bq-syncer")]
#[command(about = "Incrementally sync a BigQuery dataset into DuckDB and publish Parquet snapshots", long_about = None)]
#[command(version)]
struct Cli {
    /// DuckDB database file to sync into
    #[arg(short = 'i', long)]
    input: Option<PathBuf>,
    /// Output root for Parquet snapshots (publishing is disabled when omitted)
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,
    /// Number of tables synced in parallel
    #[arg(short = 'c', long)]
    concurrency: Option<usize>,
    /// Project that owns the dataset
    #[arg(long, env = "BQ_SYNCER_PROJECT")]
    project: Option<String>,
    /// Dataset to replicate
    #[arg(long, env = "BQ_SYNCER_DATASET")]
    dataset: Option<String>,
    /// Service account key file
    #[arg(long, env = "GOOGLE_APPLICATION_CREDENTIALS")]
    credentials: Option<PathBuf>,
    /// TOML configuration file; command-line flags override its values
    #[arg(long)]
    config: Option<PathBuf>,
    /// Seconds between sync cycles
    #[arg(long = "interval-secs")]
    interval_secs: Option<u64>,
    /// Rows requested per result page
    #[arg(long = "page-size")]
    page_size: Option<usize>,
    /// Snapshot directory and alias prefix (defaults to the dataset id)
    #[arg(long)]
    prefix: Option<String>,
    /// Run a single cycle and exit
    #[arg(long, default_value_t = false)]
    once: bool,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log: String,
}

impl Cli {
    /// Overlay command-line values on top of the file (or default) configuration.
    fn into_config(self) -> anyhow::Result<SyncConfig> {
        let mut config = match &self.config {
            Some(path) => SyncConfig::load(path)?,
            None => SyncConfig::default(),
        };

        if let Some(input) = self.input {
            config.input = input;
        }
        if let Some(output) = self.output {
            config.output = Some(output);
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(project) = self.project {
            config.project_id = project;
        }
        if let Some(dataset) = self.dataset {
            config.dataset_id = dataset;
        }
        if let Some(credentials) = self.credentials {
            config.credentials_path = credentials;
        }
        if let Some(interval) = self.interval_secs {
            config.sync_interval_secs = interval;
        }
        if let Some(page_size) = self.page_size {
            config.page_size = page_size;
        }
        if let Some(prefix) = self.prefix {
            config.snapshot_prefix = Some(prefix);
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG takes precedence over --log
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let once = cli.once;
    let config = cli.into_config().context("Invalid configuration")?;

    tracing::info!(
        "Syncing {}.{} into {:?} (concurrency {})",
        config.project_id,
        config.dataset_id,
        config.input,
        config.concurrency
    );
    match &config.output {
        Some(root) => tracing::info!(
            "Publishing snapshots under {:?} as '{}'",
            root,
            config.snapshot_prefix()
        ),
        None => tracing::info!("No output root configured; snapshot publishing disabled"),
    }

    let source = BigQuerySource::from_service_account_file(&config.credentials_path)
        .await
        .context("Failed to authenticate with BigQuery")?;
    let store = LocalStore::open(&config.input)?;
    let coordinator = Arc::new(SyncCoordinator::new(Arc::new(source), store, &config)?);

    if once {
        return match coordinator.run_cycle().await {
            CycleOutcome::Completed(report) if report.is_success() => Ok(()),
            CycleOutcome::Completed(report) => anyhow::bail!(
                "Sync cycle {} finished with failures ({} tables failed, {} exports failed, publish error: {})",
                report.cycle,
                report.failures.len(),
                report.snapshot.as_ref().map_or(0, |s| s.failed.len()),
                report.publish_error.as_deref().unwrap_or("none")
            ),
            CycleOutcome::Failed(reason) => anyhow::bail!("Sync cycle failed: {}", reason),
            CycleOutcome::Skipped => Ok(()),
        };
    }

    tracing::info!("Press Ctrl+C to stop");

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Received shutdown signal");
        let _ = shutdown_tx_clone.send(());
    });

    Scheduler::new(coordinator, config.sync_interval())
        .run(shutdown_rx)
        .await;

    Ok(())
}
