//! Fixed-period background refresh with cooperative shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::{CycleReport, RefreshPipeline};

pub struct RefreshScheduler {
    pipeline: Arc<RefreshPipeline>,
    period: Duration,
}

/// Owner of a running scheduler task. Dropping it without [`SchedulerHandle::shutdown`]
/// also stops the loop, at the next safe point.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    reports: watch::Receiver<Option<Arc<CycleReport>>>,
}

impl RefreshScheduler {
    pub fn new(pipeline: Arc<RefreshPipeline>) -> Self {
        let period = pipeline.config().refresh_interval();
        Self { pipeline, period }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Start the loop: a cycle immediately, then one per period.
    pub fn spawn(self) -> SchedulerHandle {
        let (shutdown, stop) = watch::channel(false);
        let (report_tx, reports) = watch::channel(None);
        let task = tokio::spawn(run_loop(self.pipeline, self.period, stop, report_tx));
        SchedulerHandle {
            shutdown,
            task,
            reports,
        }
    }
}

async fn run_loop(
    pipeline: Arc<RefreshPipeline>,
    period: Duration,
    mut stop: watch::Receiver<bool>,
    reports: watch::Sender<Option<Arc<CycleReport>>>,
) {
    info!(period_secs = period.as_secs(), "refresh scheduler started");
    loop {
        let report = pipeline.run_cycle_until(&stop).await;
        let interrupted = report.interrupted;
        reports.send_replace(Some(Arc::new(report)));
        if interrupted || *stop.borrow() {
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            // A closed channel means the handle is gone; stop as well.
            _ = stop.changed() => break,
        }
        if *stop.borrow() {
            break;
        }
    }
    info!("refresh scheduler stopped");
}

impl SchedulerHandle {
    /// Latest cycle reports, as they complete.
    pub fn reports(&self) -> watch::Receiver<Option<Arc<CycleReport>>> {
        self.reports.clone()
    }

    /// Signal the loop and wait for it. An in-flight kind finishes first.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            warn!(error = %err, "refresh scheduler task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::NoBlobs;
    use crate::SyncConfig;
    use cima_adapters::FixtureTableClient;
    use cima_core::EntityKind;
    use tempfile::tempdir;

    fn pipeline(root: &std::path::Path) -> Arc<RefreshPipeline> {
        let config = SyncConfig {
            datastore: root.to_path_buf(),
            ..SyncConfig::default()
        };
        let upstream = FixtureTableClient::default()
            .with_table(config.documents_table.clone(), Vec::new())
            .with_table(config.events_table.clone(), Vec::new())
            .with_table(config.people_table.clone(), Vec::new());
        Arc::new(RefreshPipeline::new(
            config,
            Arc::new(upstream),
            Arc::new(NoBlobs),
        ))
    }

    #[tokio::test]
    async fn first_cycle_runs_immediately_and_shutdown_interrupts_sleep() {
        let dir = tempdir().unwrap();
        let handle = RefreshScheduler::new(pipeline(dir.path())).spawn();
        let mut reports = handle.reports();

        reports.changed().await.unwrap();
        let first = reports.borrow_and_update().clone().unwrap();
        assert!(first.is_success());
        assert!(dir.path().join(EntityKind::Documents.snapshot_file()).exists());

        // The default period is five minutes; this must not wait for it.
        tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cycles_repeat_on_the_period() {
        let dir = tempdir().unwrap();
        let handle = RefreshScheduler::new(pipeline(dir.path()))
            .with_period(Duration::from_secs(300))
            .spawn();
        let mut reports = handle.reports();

        reports.changed().await.unwrap();
        let first = reports.borrow_and_update().clone().unwrap();
        reports.changed().await.unwrap();
        let second = reports.borrow_and_update().clone().unwrap();

        assert_ne!(first.cycle_id, second.cycle_id);
        assert!(second.started_at >= first.finished_at);
        handle.shutdown().await;
    }
}
