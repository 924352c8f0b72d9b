use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fieldops_core::ReportKind;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tracing::{error, info, warn};

use crate::ReportPipeline;

/// Cron triggers use six fields (seconds first) and fire in UTC.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub enabled: bool,
    pub daily: String,
    pub weekly: String,
    pub monthly: String,
    pub run_timeout_secs: u64,
    pub queue_capacity: usize,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            daily: "0 0 1 * * *".to_string(),
            weekly: "0 0 2 * * Mon".to_string(),
            monthly: "0 0 3 1 * *".to_string(),
            run_timeout_secs: 300,
            queue_capacity: 16,
        }
    }
}

impl ScheduleConfig {
    pub fn triggers(&self) -> [(&str, ReportKind); 3] {
        [
            (self.daily.as_str(), ReportKind::Daily),
            (self.weekly.as_str(), ReportKind::Weekly),
            (self.monthly.as_str(), ReportKind::Monthly),
        ]
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid cron expression {expr:?} for {kind} reports: {source}")]
    InvalidTrigger {
        expr: String,
        kind: ReportKind,
        #[source]
        source: JobSchedulerError,
    },
    #[error("scheduler: {0}")]
    Scheduler(#[from] JobSchedulerError),
}

/// Running scheduler. Firings are queued and drained by one worker, so report
/// runs never overlap.
pub struct ReportScheduler {
    scheduler: JobScheduler,
    stop: watch::Sender<bool>,
    worker: JoinHandle<()>,
}

impl ReportScheduler {
    pub async fn start(
        pipeline: Arc<ReportPipeline>,
        config: &ScheduleConfig,
    ) -> Result<Self, SchedulerError> {
        let (queue, rx) = mpsc::channel(config.queue_capacity.max(1));

        let mut jobs = Vec::new();
        for (expr, kind) in config.triggers() {
            let tx = queue.clone();
            let job = Job::new_async(expr, move |_id, _scheduler| {
                enqueue(&tx, kind);
                Box::pin(async {})
            })
            .map_err(|source| SchedulerError::InvalidTrigger {
                expr: expr.to_string(),
                kind,
                source,
            })?;
            jobs.push((expr, kind, job));
        }

        let scheduler = JobScheduler::new().await?;
        for (expr, kind, job) in jobs {
            scheduler.add(job).await?;
            info!(%kind, cron = expr, "report trigger registered");
        }

        let (stop, stop_rx) = watch::channel(false);
        let timeout = Duration::from_secs(config.run_timeout_secs.max(1));
        let worker = tokio::spawn(run_worker(pipeline, rx, stop_rx, timeout));

        scheduler.start().await?;
        Ok(Self {
            scheduler,
            stop,
            worker,
        })
    }

    /// Stops trigger evaluation and waits for an in-flight run to finish.
    /// Queued but unstarted runs are discarded.
    pub async fn stop(mut self) -> Result<(), SchedulerError> {
        self.scheduler.shutdown().await?;
        let _ = self.stop.send(true);
        if let Err(err) = self.worker.await {
            error!(error = %err, "report worker panicked");
        }
        info!("report scheduler stopped");
        Ok(())
    }
}

fn enqueue(queue: &mpsc::Sender<ReportKind>, kind: ReportKind) -> bool {
    match queue.try_send(kind) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(%kind, "report queue full; dropping firing");
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            warn!(%kind, "report worker gone; dropping firing");
            false
        }
    }
}

async fn run_worker(
    pipeline: Arc<ReportPipeline>,
    mut queue: mpsc::Receiver<ReportKind>,
    mut stop: watch::Receiver<bool>,
    run_timeout: Duration,
) {
    loop {
        let kind = tokio::select! {
            biased;
            _ = stop.changed() => break,
            next = queue.recv() => match next {
                Some(kind) => kind,
                None => break,
            },
        };

        // pipeline.run logs its own failures
        if tokio::time::timeout(run_timeout, pipeline.run(kind, Utc::now()))
            .await
            .is_err()
        {
            error!(
                %kind,
                timeout_secs = run_timeout.as_secs(),
                "report run timed out"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::tests::RecordingMailer;
    use crate::{MailSettings, ReportAggregator, ReportDispatcher};
    use async_trait::async_trait;
    use chrono::DateTime;
    use fieldops_core::{Cce, Shoot, ShootKind};
    use fieldops_storage::{ActivityStore, DirectoryStore, MemoryStore, ReportPersister};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;

    fn pipeline_over(
        store: Arc<MemoryStore>,
        activity: Arc<dyn ActivityStore>,
    ) -> Arc<ReportPipeline> {
        let dispatcher = ReportDispatcher::new(
            Arc::new(RecordingMailer::default()),
            MailSettings {
                from: "reports@example.com".into(),
                recipients: vec!["ops@example.com".into()],
            },
        );
        Arc::new(ReportPipeline::new(
            ReportAggregator::new(store.clone(), activity),
            store,
            dispatcher,
        ))
    }

    async fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .create_cce(&Cce {
                id: "A1".into(),
                name: "Alice".into(),
            })
            .await
            .unwrap();
        store
    }

    #[test]
    fn default_triggers_cover_every_kind() {
        let config = ScheduleConfig::default();
        let kinds: Vec<_> = config.triggers().iter().map(|(_, k)| *k).collect();
        assert_eq!(kinds, ReportKind::ALL.to_vec());
        assert_eq!(config.weekly, "0 0 2 * * Mon");
    }

    #[tokio::test]
    async fn worker_runs_every_queued_kind() {
        let store = seeded_store().await;
        let pipeline = pipeline_over(store.clone(), store.clone());
        let (tx, rx) = mpsc::channel(4);
        let (_stop_tx, stop_rx) = watch::channel(false);

        assert!(enqueue(&tx, ReportKind::Daily));
        assert!(enqueue(&tx, ReportKind::Weekly));
        drop(tx);
        run_worker(pipeline, rx, stop_rx, Duration::from_secs(5)).await;

        let mut kinds: Vec<_> = store
            .list_recent_reports(10)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.report_type)
            .collect();
        kinds.sort();
        assert_eq!(kinds, vec![ReportKind::Daily, ReportKind::Weekly]);
    }

    #[test]
    fn full_queue_drops_firing() {
        let (tx, _rx) = mpsc::channel(1);
        assert!(enqueue(&tx, ReportKind::Daily));
        assert!(!enqueue(&tx, ReportKind::Monthly));
    }

    /// Hangs on the first range scan, then behaves.
    struct StallOnce {
        inner: Arc<MemoryStore>,
        stalled: AtomicBool,
    }

    #[async_trait]
    impl ActivityStore for StallOnce {
        async fn record_shoot(&self, shoot: &Shoot) -> fieldops_storage::Result<()> {
            self.inner.record_shoot(shoot).await
        }
        async fn list_shoots(
            &self,
            kind: Option<ShootKind>,
        ) -> fieldops_storage::Result<Vec<Shoot>> {
            self.inner.list_shoots(kind).await
        }
        async fn list_by_time_range(
            &self,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> fieldops_storage::Result<Vec<Shoot>> {
            if !self.stalled.swap(true, Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            self.inner.list_by_time_range(start, end).await
        }
        async fn list_missed_calls(&self) -> fieldops_storage::Result<Vec<Shoot>> {
            self.inner.list_missed_calls().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_run_does_not_block_the_next() {
        let store = seeded_store().await;
        let activity = Arc::new(StallOnce {
            inner: store.clone(),
            stalled: AtomicBool::new(false),
        });
        let pipeline = pipeline_over(store.clone(), activity);
        let (tx, rx) = mpsc::channel(4);
        let (_stop_tx, stop_rx) = watch::channel(false);

        enqueue(&tx, ReportKind::Daily);
        enqueue(&tx, ReportKind::Monthly);
        drop(tx);
        run_worker(pipeline, rx, stop_rx, Duration::from_secs(2)).await;

        let saved = store.list_recent_reports(10).await.unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].report_type, ReportKind::Monthly);
    }

    #[tokio::test]
    async fn stop_signal_ends_idle_worker() {
        let store = seeded_store().await;
        let pipeline = pipeline_over(store.clone(), store.clone());
        let (_tx, rx) = mpsc::channel::<ReportKind>(4);
        let (stop_tx, stop_rx) = watch::channel(false);

        let worker = tokio::spawn(run_worker(pipeline, rx, stop_rx, Duration::from_secs(5)));
        stop_tx.send(true).unwrap();
        worker.await.unwrap();
        assert!(store.list_recent_reports(10).await.unwrap().is_empty());
    }

    /// Signals when a range scan begins, then takes `delay` to answer.
    struct SlowScan {
        inner: Arc<MemoryStore>,
        started: Notify,
        delay: Duration,
    }

    #[async_trait]
    impl ActivityStore for SlowScan {
        async fn record_shoot(&self, shoot: &Shoot) -> fieldops_storage::Result<()> {
            self.inner.record_shoot(shoot).await
        }
        async fn list_shoots(
            &self,
            kind: Option<ShootKind>,
        ) -> fieldops_storage::Result<Vec<Shoot>> {
            self.inner.list_shoots(kind).await
        }
        async fn list_by_time_range(
            &self,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> fieldops_storage::Result<Vec<Shoot>> {
            self.started.notify_one();
            tokio::time::sleep(self.delay).await;
            self.inner.list_by_time_range(start, end).await
        }
        async fn list_missed_calls(&self) -> fieldops_storage::Result<Vec<Shoot>> {
            self.inner.list_missed_calls().await
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cron_firing_runs_and_stop_waits_for_in_flight_run() {
        let store = seeded_store().await;
        let activity = Arc::new(SlowScan {
            inner: store.clone(),
            started: Notify::new(),
            delay: Duration::from_millis(800),
        });
        let pipeline = pipeline_over(store.clone(), activity.clone());
        let config = ScheduleConfig {
            enabled: true,
            daily: "* * * * * *".into(),
            ..Default::default()
        };

        let scheduler = ReportScheduler::start(pipeline, &config).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), activity.started.notified())
            .await
            .expect("trigger never fired");
        scheduler.stop().await.unwrap();

        let saved = store.list_recent_reports(10).await.unwrap();
        assert!(!saved.is_empty());
        assert!(saved.iter().all(|r| r.report_type == ReportKind::Daily));
    }

    #[tokio::test]
    async fn invalid_cron_is_rejected() {
        let store = seeded_store().await;
        let pipeline = pipeline_over(store.clone(), store.clone());
        let config = ScheduleConfig {
            enabled: true,
            daily: "every day at one".into(),
            ..Default::default()
        };
        let err = ReportScheduler::start(pipeline, &config).await.err().unwrap();
        assert!(matches!(
            err,
            SchedulerError::InvalidTrigger {
                kind: ReportKind::Daily,
                ..
            }
        ));
    }
}
