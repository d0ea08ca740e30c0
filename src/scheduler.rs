// ABOUTME: Scheduler - triggers sync cycles on a fixed interval until shutdown
// ABOUTME: Runs once immediately, skips missed ticks, waits for in-flight cycles on exit

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use crate::sync::{CycleOutcome, SyncCoordinator};

/// Periodic trigger for a [`SyncCoordinator`].
///
/// Each tick spawns a cycle so a slow cycle never delays the clock; overlapping
/// ticks are turned into skips by the coordinator's single-flight gate.
pub struct Scheduler {
    coordinator: Arc<SyncCoordinator>,
    interval: Duration,
}

impl Scheduler {
    pub fn new(coordinator: Arc<SyncCoordinator>, interval: Duration) -> Self {
        Self {
            coordinator,
            interval,
        }
    }

    /// Run until a shutdown signal is received.
    ///
    /// # Returns
    ///
    /// The number of ticks that triggered a cycle.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> u64 {
        tracing::info!(
            "Scheduler started (interval {}s, first cycle now)",
            self.interval.as_secs()
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut in_flight = JoinSet::new();
        let mut ticks: u64 = 0;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    tracing::info!("Scheduler received shutdown signal");
                    break;
                }

                _ = ticker.tick() => {
                    ticks += 1;
                    let coordinator = self.coordinator.clone();
                    in_flight.spawn(async move { coordinator.run_cycle().await });
                }

                Some(finished) = in_flight.join_next(), if !in_flight.is_empty() => {
                    log_finished(finished);
                }
            }
        }

        if !in_flight.is_empty() {
            tracing::info!("Waiting for the running sync cycle to finish...");
        }
        while let Some(finished) = in_flight.join_next().await {
            log_finished(finished);
        }

        tracing::info!("Scheduler stopped after {} ticks", ticks);
        ticks
    }
}

fn log_finished(finished: Result<CycleOutcome, tokio::task::JoinError>) {
    match finished {
        Ok(CycleOutcome::Completed(report)) if !report.is_success() => {
            tracing::warn!("Sync cycle {} completed with failures", report.cycle)
        }
        Ok(CycleOutcome::Completed(_)) | Ok(CycleOutcome::Skipped) => {}
        Ok(CycleOutcome::Failed(reason)) => tracing::warn!("Sync cycle failed: {}", reason),
        Err(e) => tracing::error!("Sync cycle task panicked: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::remote::{DatasetRef, MemorySource};
    use crate::store::LocalStore;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_runs_immediately_and_stops_on_shutdown() {
        let config = SyncConfig {
            input: PathBuf::from(":memory:"),
            ..Default::default()
        };
        let source = Arc::new(MemorySource::new(config.dataset()));
        let store = LocalStore::open_in_memory().unwrap();
        let coordinator = Arc::new(SyncCoordinator::new(source, store, &config).unwrap());

        let scheduler = Scheduler::new(coordinator.clone(), Duration::from_secs(3600));
        let (tx, rx) = broadcast::channel(1);

        let handle = tokio::spawn(async move { scheduler.run(rx).await });
        while coordinator.cycles_started() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(()).unwrap();

        let ticks = handle.await.unwrap();
        assert_eq!(ticks, 1);
        assert_eq!(coordinator.cycles_started(), 1);
        assert!(!coordinator.is_running());
    }

    #[tokio::test]
    async fn test_listing_failure_releases_gate() {
        let config = SyncConfig {
            input: PathBuf::from(":memory:"),
            list_retries: 0,
            ..Default::default()
        };
        let source = Arc::new(MemorySource::new(DatasetRef::new("other", "dataset")));
        let store = LocalStore::open_in_memory().unwrap();
        let coordinator = Arc::new(SyncCoordinator::new(source, store, &config).unwrap());

        let outcome = coordinator.run_cycle().await;
        assert!(matches!(outcome, CycleOutcome::Failed(_)));
        assert!(!coordinator.is_running());
    }
}
