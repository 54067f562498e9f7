//! Run lifecycle tracking and the history queries built on it.

use std::collections::BTreeMap;
use std::error::Error as StdError;

use artisync_core::{RunStatus, SyncRun, TriggerSource};
use artisync_storage::RunHistoryStore;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::{error, info};

pub const MAX_RECENT_LIMIT: usize = 100;
pub const REPORT_RECENT_OPERATIONS: usize = 10;

/// Owned handle to one in-progress run. The orchestrator threads it through
/// the run; nothing else can observe or mutate it until it is finished.
#[derive(Debug)]
pub struct RunSession {
    run: SyncRun,
}

impl RunSession {
    pub fn session_id(&self) -> &str {
        &self.run.session_id
    }

    pub fn target_date(&self) -> NaiveDate {
        self.run.target_date
    }

    pub fn triggered_by(&self) -> TriggerSource {
        self.run.triggered_by
    }

    pub fn record_page(&mut self, page: u32) {
        self.run.record_page(page);
    }

    pub fn record_counts(&mut self, inserted: u64, updated: u64) {
        self.run.record_counts(inserted, updated);
    }

    pub fn run(&self) -> &SyncRun {
        &self.run
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub total_fetch_operations: usize,
    pub successful_fetches: usize,
    pub failed_fetches: usize,
    pub total_records_inserted: u64,
    pub total_records_updated: u64,
    pub cron_triggered: usize,
    /// Every run not started by the scheduler.
    pub manual_triggered: usize,
    pub by_trigger: BTreeMap<String, usize>,
    pub last_fetch: Option<SyncRun>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportMetrics {
    pub success_rate: String,
    pub total_records_processed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub generated_at: DateTime<Utc>,
    pub summary: RunSummary,
    pub metrics: ReportMetrics,
    pub recent_operations: Vec<SyncRun>,
    pub last_fetch: Option<SyncRun>,
}

#[derive(Debug)]
pub struct RunLogger {
    history: RunHistoryStore,
}

impl RunLogger {
    pub fn new(history: RunHistoryStore) -> Self {
        Self { history }
    }

    pub fn history(&self) -> &RunHistoryStore {
        &self.history
    }

    pub fn start_session(&self, target_date: NaiveDate, triggered_by: TriggerSource) -> RunSession {
        let run = SyncRun::started(target_date, triggered_by, Utc::now());
        info!(
            session_id = %run.session_id,
            %target_date,
            triggered_by = %triggered_by,
            "sync session started"
        );
        RunSession { run }
    }

    pub async fn finish_success(&self, session: RunSession) -> SyncRun {
        let mut run = session.run;
        run.finish_success(Utc::now());
        info!(
            session_id = %run.session_id,
            pages = run.pages_fetched,
            inserted = run.records_inserted,
            updated = run.records_updated,
            duration_seconds = run.duration_seconds.unwrap_or_default(),
            "sync session finished"
        );
        self.persist(&run).await;
        run
    }

    pub async fn finish_failure(
        &self,
        session: RunSession,
        failure: &(dyn StdError + Send + Sync + 'static),
    ) -> SyncRun {
        let mut run = session.run;
        run.finish_failure(Utc::now(), failure.to_string(), Some(error_chain(failure)));
        error!(
            session_id = %run.session_id,
            error = %failure,
            pages = run.pages_fetched,
            "sync session failed"
        );
        self.persist(&run).await;
        run
    }

    // A history write failure must not change the outcome of the run itself.
    async fn persist(&self, run: &SyncRun) {
        if let Err(err) = self.history.append(run).await {
            error!(session_id = %run.session_id, error = %err, "could not persist sync run");
        }
    }

    pub async fn history_for_date(&self, date: NaiveDate) -> Vec<SyncRun> {
        self.history
            .load()
            .await
            .into_iter()
            .filter(|run| run.target_date == date)
            .collect()
    }

    /// Newest first; `limit` is clamped to 1..=100.
    pub async fn recent(&self, limit: usize) -> Vec<SyncRun> {
        let limit = limit.clamp(1, MAX_RECENT_LIMIT);
        self.history.load().await.into_iter().rev().take(limit).collect()
    }

    pub async fn summary(&self) -> RunSummary {
        summarize(&self.history.load().await)
    }

    pub async fn report(&self) -> RunReport {
        let runs = self.history.load().await;
        let summary = summarize(&runs);
        let total_records_processed = summary.total_records_inserted + summary.total_records_updated;
        let success_rate = if summary.total_fetch_operations == 0 {
            0.0
        } else {
            summary.successful_fetches as f64 * 100.0 / summary.total_fetch_operations as f64
        };
        RunReport {
            generated_at: Utc::now(),
            metrics: ReportMetrics {
                success_rate: format!("{success_rate:.2}%"),
                total_records_processed,
            },
            recent_operations: runs.iter().rev().take(REPORT_RECENT_OPERATIONS).cloned().collect(),
            last_fetch: summary.last_fetch.clone(),
            summary,
        }
    }
}

fn error_chain(failure: &(dyn StdError + 'static)) -> String {
    let mut parts = vec![failure.to_string()];
    let mut source = failure.source();
    while let Some(cause) = source {
        parts.push(cause.to_string());
        source = cause.source();
    }
    parts.join(": ")
}

pub fn summarize(runs: &[SyncRun]) -> RunSummary {
    let mut by_trigger = BTreeMap::new();
    for run in runs {
        *by_trigger.entry(run.triggered_by.as_str().to_string()).or_insert(0) += 1;
    }
    let cron_triggered = runs
        .iter()
        .filter(|run| run.triggered_by == TriggerSource::Cron)
        .count();

    RunSummary {
        total_fetch_operations: runs.len(),
        successful_fetches: runs.iter().filter(|r| r.status == RunStatus::Success).count(),
        failed_fetches: runs.iter().filter(|r| r.status == RunStatus::Failed).count(),
        total_records_inserted: runs.iter().map(|r| r.records_inserted).sum(),
        total_records_updated: runs.iter().map(|r| r.records_updated).sum(),
        cron_triggered,
        manual_triggered: runs.len() - cron_triggered,
        by_trigger,
        last_fetch: runs.last().cloned(),
    }
}

fn status_label(status: RunStatus) -> &'static str {
    match status {
        RunStatus::InProgress => "in progress",
        RunStatus::Success => "success",
        RunStatus::Failed => "failed",
    }
}

pub fn render_report_markdown(report: &RunReport) -> String {
    let summary = &report.summary;
    let mut lines = vec![
        "# Artisan Sync Report".to_string(),
        String::new(),
        format!("Generated at {}", report.generated_at.to_rfc3339()),
        String::new(),
        "## Summary".to_string(),
        format!("- runs: {}", summary.total_fetch_operations),
        format!("- successful: {}", summary.successful_fetches),
        format!("- failed: {}", summary.failed_fetches),
        format!("- success rate: {}", report.metrics.success_rate),
        format!("- records inserted: {}", summary.total_records_inserted),
        format!("- records updated: {}", summary.total_records_updated),
        format!("- records processed: {}", report.metrics.total_records_processed),
        format!(
            "- triggers: cron {} / manual {}",
            summary.cron_triggered, summary.manual_triggered
        ),
        String::new(),
        "## Recent runs".to_string(),
    ];

    if report.recent_operations.is_empty() {
        lines.push("_no runs recorded_".to_string());
    } else {
        lines.push("| date | trigger | status | pages | inserted | updated | seconds |".to_string());
        lines.push("|---|---|---|---|---|---|---|".to_string());
        for run in &report.recent_operations {
            lines.push(format!(
                "| {} | {} | {} | {} | {} | {} | {} |",
                run.target_date,
                run.triggered_by,
                status_label(run.status),
                run.pages_fetched,
                run.records_inserted,
                run.records_updated,
                run.duration_seconds
                    .map(|d| format!("{d:.2}"))
                    .unwrap_or_else(|| "-".to_string()),
            ));
        }
    }

    if let Some(error) = report
        .last_fetch
        .as_ref()
        .filter(|run| run.status == RunStatus::Failed)
        .and_then(|run| run.error.as_deref())
    {
        lines.push(String::new());
        lines.push(format!("Last run failed: {error}"));
    }

    lines.push(String::new());
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logger(dir: &tempfile::TempDir) -> RunLogger {
        RunLogger::new(RunHistoryStore::new(dir.path().join("history.json")))
    }

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 11, day).unwrap()
    }

    #[derive(Debug, thiserror::Error)]
    #[error("partner said no")]
    struct Refused(#[source] std::io::Error);

    #[tokio::test]
    async fn empty_history_gives_zeroed_summary_and_report() {
        let dir = tempfile::tempdir().unwrap();
        let logger = logger(&dir);

        let summary = logger.summary().await;
        assert_eq!(summary.total_fetch_operations, 0);
        assert_eq!(summary.last_fetch, None);
        assert!(logger.recent(10).await.is_empty());

        let report = logger.report().await;
        assert_eq!(report.metrics.success_rate, "0.00%");
        assert!(render_report_markdown(&report).contains("_no runs recorded_"));
    }

    #[tokio::test]
    async fn sessions_are_independent_and_persisted_on_finish() {
        let dir = tempfile::tempdir().unwrap();
        let logger = logger(&dir);

        let mut first = logger.start_session(date(21), TriggerSource::Cron);
        let mut second = logger.start_session(date(22), TriggerSource::Manual);
        first.record_page(1);
        first.record_counts(3, 1);
        second.record_counts(0, 5);

        let second = logger.finish_success(second).await;
        let first = logger.finish_success(first).await;

        assert_eq!(first.records_inserted, 3);
        assert_eq!(first.total_records, 4);
        assert_eq!(second.records_updated, 5);
        assert_eq!(second.records_inserted, 0);

        let recent = logger.recent(10).await;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].session_id, first.session_id);
        assert_eq!(logger.history_for_date(date(22)).await.len(), 1);
    }

    #[tokio::test]
    async fn failure_records_message_and_chain() {
        let dir = tempfile::tempdir().unwrap();
        let logger = logger(&dir);
        let session = logger.start_session(date(22), TriggerSource::ApiManual);
        let failure = Refused(std::io::Error::new(std::io::ErrorKind::Other, "connection reset"));

        let run = logger.finish_failure(session, &failure).await;
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.as_deref(), Some("partner said no"));
        assert_eq!(run.error_details.as_deref(), Some("partner said no: connection reset"));
        assert!(run.end_time.is_some());
    }

    #[tokio::test]
    async fn summary_and_report_aggregate_history() {
        let dir = tempfile::tempdir().unwrap();
        let logger = logger(&dir);

        for (day, trigger) in [(20, TriggerSource::Cron), (21, TriggerSource::Manual), (22, TriggerSource::ApiManual)] {
            let mut session = logger.start_session(date(day), trigger);
            session.record_counts(2, 1);
            logger.finish_success(session).await;
        }
        let failed = logger.start_session(date(23), TriggerSource::Cron);
        let failure = Refused(std::io::Error::new(std::io::ErrorKind::Other, "timeout"));
        logger.finish_failure(failed, &failure).await;

        let summary = logger.summary().await;
        assert_eq!(summary.total_fetch_operations, 4);
        assert_eq!(summary.successful_fetches, 3);
        assert_eq!(summary.failed_fetches, 1);
        assert_eq!(summary.total_records_inserted, 6);
        assert_eq!(summary.total_records_updated, 3);
        assert_eq!(summary.cron_triggered, 2);
        assert_eq!(summary.manual_triggered, 2);
        assert_eq!(summary.by_trigger.get("API_MANUAL"), Some(&1));
        assert_eq!(summary.last_fetch.as_ref().map(|r| r.target_date), Some(date(23)));

        let report = logger.report().await;
        assert_eq!(report.metrics.success_rate, "75.00%");
        assert_eq!(report.metrics.total_records_processed, 9);
        assert_eq!(report.recent_operations[0].target_date, date(23));

        let markdown = render_report_markdown(&report);
        assert!(markdown.contains("- success rate: 75.00%"));
        assert!(markdown.contains("Last run failed: partner said no"));
    }

    #[tokio::test]
    async fn recent_limit_is_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let logger = logger(&dir);
        for day in 1..=3 {
            let session = logger.start_session(date(day), TriggerSource::Manual);
            logger.finish_success(session).await;
        }
        assert_eq!(logger.recent(0).await.len(), 1);
        assert_eq!(logger.recent(500).await.len(), 3);
    }
}
