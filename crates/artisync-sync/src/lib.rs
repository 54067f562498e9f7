//! Sync orchestration: pagination over the partner API, per-record
//! reconciliation, run logging, the stats push and the cron bindings.

use std::sync::Arc;

use anyhow::{Context, Result};
use artisync_core::{ProviderRecord, TriggerSource};
use artisync_partner::{PartnerApi, PartnerError};
use artisync_storage::{CatalogStore, RunHistoryStore};
use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};

mod config;
mod reconcile;
mod run_log;
mod stats;

pub use config::SyncConfig;
pub use reconcile::{ReconcileCounts, ReconcileError, Reconciler};
pub use run_log::{
    render_report_markdown, summarize, ReportMetrics, RunLogger, RunReport, RunSession, RunSummary,
    MAX_RECENT_LIMIT, REPORT_RECENT_OPERATIONS,
};
pub use stats::{PushOutcome, StatsPusher};

pub const CRATE_NAME: &str = "artisync-sync";

pub const DEFAULT_MAX_PAGES: u32 = 10_000;

/// Failures that end a run. Record-level problems never show up here.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Partner(#[from] PartnerError),
    #[error("no empty page for {date} within {cap} pages")]
    PageCapExceeded { date: NaiveDate, cap: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncOutcome {
    pub success: bool,
    pub session_id: String,
    pub date: NaiveDate,
    pub inserted: u64,
    pub updated: u64,
    pub pages: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatchUpOutcome {
    pub yesterday: SyncOutcome,
    pub today: SyncOutcome,
}

/// The calendar day before `now` (UTC).
pub fn yesterday_from(now: DateTime<Utc>) -> NaiveDate {
    let today = now.date_naive();
    today.checked_sub_days(Days::new(1)).unwrap_or(today)
}

pub struct SyncPipeline {
    partner: Arc<dyn PartnerApi>,
    reconciler: Reconciler,
    run_logger: Arc<RunLogger>,
    stats: StatsPusher,
    max_pages: u32,
}

impl SyncPipeline {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        partner: Arc<dyn PartnerApi>,
        run_logger: Arc<RunLogger>,
    ) -> Self {
        Self {
            reconciler: Reconciler::new(Arc::clone(&store)),
            stats: StatsPusher::new(store, Arc::clone(&partner)),
            partner,
            run_logger,
            max_pages: DEFAULT_MAX_PAGES,
        }
    }

    /// Wire a pipeline from config: history file and page cap come from `config`.
    pub fn from_config(
        config: &SyncConfig,
        store: Arc<dyn CatalogStore>,
        partner: Arc<dyn PartnerApi>,
    ) -> Self {
        let run_logger = Arc::new(RunLogger::new(RunHistoryStore::new(&config.history_path)));
        Self::new(store, partner, run_logger).with_max_pages(config.max_pages)
    }

    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    pub fn run_logger(&self) -> &Arc<RunLogger> {
        &self.run_logger
    }

    /// Scheduled entry point: yesterday's data, tagged `CRON`.
    pub async fn run_daily(&self) -> SyncOutcome {
        self.sync_for_date(yesterday_from(Utc::now()), TriggerSource::Cron)
            .await
    }

    /// Yesterday then today, one after the other, both tagged `MANUAL`.
    pub async fn sync_yesterday_and_today(&self) -> CatchUpOutcome {
        let now = Utc::now();
        let yesterday = self
            .sync_for_date(yesterday_from(now), TriggerSource::Manual)
            .await;
        let today = self
            .sync_for_date(now.date_naive(), TriggerSource::Manual)
            .await;
        CatchUpOutcome { yesterday, today }
    }

    pub async fn sync_for_date(&self, date: NaiveDate, trigger: TriggerSource) -> SyncOutcome {
        let mut session = self.run_logger.start_session(date, trigger);
        let span = info_span!(
            "sync_run",
            session_id = %session.session_id(),
            %date,
            triggered_by = %trigger
        );

        match self.drive(&mut session).instrument(span).await {
            Ok(totals) => {
                let run = self.run_logger.finish_success(session).await;
                info!(%date, inserted = totals.inserted, updated = totals.updated, "sync completed");
                SyncOutcome {
                    success: true,
                    session_id: run.session_id,
                    date,
                    inserted: run.records_inserted,
                    updated: run.records_updated,
                    pages: run.pages_fetched,
                    error: None,
                }
            }
            Err(err) => {
                let run = self.run_logger.finish_failure(session, &err).await;
                SyncOutcome {
                    success: false,
                    session_id: run.session_id,
                    date,
                    inserted: run.records_inserted,
                    updated: run.records_updated,
                    pages: run.pages_fetched,
                    error: Some(err.to_string()),
                }
            }
        }
    }

    pub async fn push_call_stats(&self, date: NaiveDate) -> PushOutcome {
        self.stats.push_call_stats(date).await
    }

    async fn drive(&self, session: &mut RunSession) -> Result<ReconcileCounts, SyncError> {
        let date = session.target_date();
        let token = self.partner.authenticate().await?;
        let mut totals = ReconcileCounts::default();

        for page in 1..=self.max_pages {
            session.record_page(page);
            let entries = self.partner.fetch_page(&token, date, page).await?;
            if entries.is_empty() {
                info!(page, "empty page, date exhausted");
                return Ok(totals);
            }

            let mut page_counts = ReconcileCounts::default();
            let mut skipped = 0usize;
            for (index, entry) in entries.iter().enumerate() {
                let record: ProviderRecord = match serde_json::from_value(entry.clone()) {
                    Ok(record) => record,
                    Err(err) => {
                        skipped += 1;
                        warn!(
                            page,
                            index,
                            artisan_id = %entry.get("artisanId").unwrap_or(&JsonValue::Null),
                            error = %err,
                            "malformed record skipped"
                        );
                        continue;
                    }
                };
                match self.reconciler.reconcile(&record).await {
                    Ok(counts) => page_counts += counts,
                    Err(err) => {
                        skipped += 1;
                        warn!(
                            artisan_id = record.source_id().as_deref().unwrap_or("<none>"),
                            error = %err,
                            "record skipped"
                        );
                    }
                }
            }

            session.record_counts(page_counts.inserted, page_counts.updated);
            totals += page_counts;
            info!(
                page,
                records = entries.len(),
                skipped,
                inserted = page_counts.inserted,
                updated = page_counts.updated,
                "page reconciled"
            );
        }

        Err(SyncError::PageCapExceeded {
            date,
            cap: self.max_pages,
        })
    }
}

/// Register the daily sync and the stats push as independent cron jobs.
pub async fn maybe_build_scheduler(
    pipeline: Arc<SyncPipeline>,
    config: &SyncConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let sync_pipeline = Arc::clone(&pipeline);
    let sync_job = Job::new_async(&config.sync_cron, move |_uuid, _l| {
        let pipeline = Arc::clone(&sync_pipeline);
        Box::pin(async move {
            info!("scheduled daily sync triggered");
            let outcome = pipeline.run_daily().await;
            if !outcome.success {
                error!(date = %outcome.date, error = ?outcome.error, "scheduled daily sync failed");
            }
        })
    })
    .with_context(|| format!("creating sync job for cron {}", config.sync_cron))?;
    sched.add(sync_job).await.context("adding sync job")?;

    let push_pipeline = Arc::clone(&pipeline);
    let push_job = Job::new_async(&config.push_stats_cron, move |_uuid, _l| {
        let pipeline = Arc::clone(&push_pipeline);
        Box::pin(async move {
            let date = yesterday_from(Utc::now());
            info!(%date, "scheduled stats push triggered");
            let outcome = pipeline.push_call_stats(date).await;
            if !outcome.success {
                error!(%date, message = %outcome.message, "scheduled stats push failed");
            }
        })
    })
    .with_context(|| format!("creating stats push job for cron {}", config.push_stats_cron))?;
    sched.add(push_job).await.context("adding stats push job")?;

    Ok(Some(sched))
}
