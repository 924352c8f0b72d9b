//! Periodic activity reports: aggregation, persistence, mail dispatch and the
//! cron-driven scheduler that ties them together.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use fieldops_core::{AgentReport, Report, ReportKind, ReportWindow};
use fieldops_storage::{ActivityStore, DirectoryStore, ReportPersister, Store, StoreError};
use thiserror::Error;
use tracing::{debug, error, info};
use uuid::Uuid;

mod dispatch;
mod scheduler;

pub use dispatch::{
    render_body, subject_for, DeliveryError, MailSettings, Mailer, ReportDispatcher, SmtpConfig,
    SmtpMailer,
};
pub use scheduler::{ReportScheduler, ScheduleConfig, SchedulerError};

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("data access failed: {0}")]
    DataAccess(#[from] StoreError),
    #[error("delivery failed: {0}")]
    Delivery(#[from] DeliveryError),
    #[error(transparent)]
    InvalidReportKind(#[from] fieldops_core::InvalidReportKind),
    #[error("rendering report email: {0}")]
    Render(#[from] askama::Error),
    #[error("no representable {kind} window ending at {now}")]
    InvalidWindow { kind: ReportKind, now: DateTime<Utc> },
}

/// Folds the shoots of one window into per-agent counters.
pub struct ReportAggregator {
    directory: Arc<dyn DirectoryStore>,
    activity: Arc<dyn ActivityStore>,
}

impl ReportAggregator {
    pub fn new(directory: Arc<dyn DirectoryStore>, activity: Arc<dyn ActivityStore>) -> Self {
        Self {
            directory,
            activity,
        }
    }

    /// Every known agent gets an entry, active or not. Shoots whose agent is
    /// not in the directory are skipped, as are any outside `[start, end)`.
    pub async fn generate(
        &self,
        kind: ReportKind,
        window: ReportWindow,
        now: DateTime<Utc>,
    ) -> Result<Report, ReportError> {
        let agents = self.directory.list_all().await?;
        let mut cce_reports: BTreeMap<String, AgentReport> = agents
            .iter()
            .map(|cce| (cce.id.clone(), AgentReport::seeded(cce)))
            .collect();

        let shoots = self
            .activity
            .list_by_time_range(window.start, window.end)
            .await?;

        let mut orphaned = 0usize;
        for shoot in shoots.iter().filter(|s| window.contains(s.timestamp)) {
            match cce_reports.get_mut(&shoot.cce_id) {
                Some(entry) => entry.record(shoot),
                None => orphaned += 1,
            }
        }
        if orphaned > 0 {
            debug!(%kind, orphaned, "skipped shoots for unknown agents");
        }

        for entry in cce_reports.values_mut() {
            entry.finalize();
        }

        Ok(Report {
            id: Uuid::new_v4(),
            report_type: kind,
            start_date: window.start,
            end_date: window.end,
            created_at: now,
            cce_reports,
        })
    }
}

/// Window, aggregate, persist, dispatch. Each stage runs only if the previous
/// one succeeded.
pub struct ReportPipeline {
    aggregator: ReportAggregator,
    persister: Arc<dyn ReportPersister>,
    dispatcher: ReportDispatcher,
}

impl ReportPipeline {
    pub fn new(
        aggregator: ReportAggregator,
        persister: Arc<dyn ReportPersister>,
        dispatcher: ReportDispatcher,
    ) -> Self {
        Self {
            aggregator,
            persister,
            dispatcher,
        }
    }

    /// Wires every stage to a single backend.
    pub fn from_store<S: Store + 'static>(store: Arc<S>, dispatcher: ReportDispatcher) -> Self {
        let aggregator = ReportAggregator::new(store.clone(), store.clone());
        Self::new(aggregator, store, dispatcher)
    }

    pub async fn run(&self, kind: ReportKind, now: DateTime<Utc>) -> Result<Report, ReportError> {
        match self.run_stages(kind, now).await {
            Ok(report) => {
                info!(
                    %kind,
                    report_id = %report.id,
                    agents = report.cce_reports.len(),
                    "report run finished"
                );
                Ok(report)
            }
            Err(err) => {
                error!(%kind, error = %err, "report run failed");
                Err(err)
            }
        }
    }

    /// Parses `kind` first so an unknown name never reaches the stores.
    pub async fn run_named(&self, kind: &str, now: DateTime<Utc>) -> Result<Report, ReportError> {
        let kind = kind.parse::<ReportKind>().map_err(|err| {
            error!(kind, "rejected unknown report kind");
            ReportError::from(err)
        })?;
        self.run(kind, now).await
    }

    async fn run_stages(
        &self,
        kind: ReportKind,
        now: DateTime<Utc>,
    ) -> Result<Report, ReportError> {
        let window =
            ReportWindow::ending_at(kind, now).ok_or(ReportError::InvalidWindow { kind, now })?;
        info!(%kind, start = %window.start, end = %window.end, "report run started");

        let report = self.aggregator.generate(kind, window, now).await?;
        self.persister.save(&report).await?;
        debug!(%kind, report_id = %report.id, "report persisted");
        self.dispatcher.dispatch(&report).await?;
        Ok(report)
    }
}
