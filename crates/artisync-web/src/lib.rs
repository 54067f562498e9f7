//! Thin HTTP surface: manual sync triggers and run-history queries.

use std::sync::Arc;

use artisync_core::TriggerSource;
use artisync_sync::{yesterday_from, SyncPipeline, MAX_RECENT_LIMIT};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "artisync-web";

const DEFAULT_RECENT_LIMIT: usize = 10;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SyncPipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<SyncPipeline>) -> Self {
        Self { pipeline }
    }
}

#[derive(Debug, Serialize)]
struct Envelope {
    status: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<JsonValue>,
}

fn respond(code: StatusCode, message: impl Into<String>, data: Option<JsonValue>) -> Response {
    let status = if code.is_success() { "success" } else { "error" };
    (
        code,
        Json(Envelope {
            status,
            message: message.into(),
            data,
        }),
    )
        .into_response()
}

fn ok_with<T: Serialize>(message: &str, data: &T) -> Response {
    match serde_json::to_value(data) {
        Ok(value) => respond(StatusCode::OK, message, Some(value)),
        Err(err) => respond(StatusCode::INTERNAL_SERVER_ERROR, err.to_string(), None),
    }
}

fn bad_request(message: impl Into<String>) -> Response {
    respond(StatusCode::BAD_REQUEST, message, None)
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok()
}

#[derive(Debug, Default, Deserialize)]
struct DateBody {
    #[serde(default)]
    date: Option<String>,
}

/// Optional `{"date": "YYYY-MM-DD"}` body; absent body or field means yesterday.
fn requested_date(body: &Bytes) -> Result<NaiveDate, Response> {
    let parsed: DateBody = if body.iter().all(u8::is_ascii_whitespace) {
        DateBody::default()
    } else {
        serde_json::from_slice(body).map_err(|err| bad_request(format!("invalid request body: {err}")))?
    };
    match parsed.date {
        None => Ok(yesterday_from(Utc::now())),
        Some(raw) => parse_date(&raw).ok_or_else(|| bad_request("Invalid date format. Use YYYY-MM-DD format")),
    }
}

#[derive(Debug, Deserialize)]
struct RecentQuery {
    limit: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/sync", post(trigger_daily_sync))
        .route("/api/sync-dates", get(trigger_catch_up).post(trigger_catch_up))
        .route(
            "/api/vishwakarma/logs/stats",
            get(report_handler).post(sync_now_handler),
        )
        .route("/api/vishwakarma/logs/push-stats", post(push_stats_handler))
        .route("/api/vishwakarma/logs/summary", get(summary_handler))
        .route("/api/vishwakarma/logs/recent", get(recent_handler))
        .route("/api/vishwakarma/logs/date/{date}", get(date_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "http trigger surface listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn trigger_daily_sync(State(state): State<Arc<AppState>>) -> Response {
    let date = yesterday_from(Utc::now());
    let pipeline = Arc::clone(&state.pipeline);
    tokio::spawn(async move {
        let outcome = pipeline.run_daily().await;
        info!(success = outcome.success, date = %outcome.date, "on-demand daily sync finished");
    });
    respond(
        StatusCode::OK,
        "Sync started in background",
        Some(serde_json::json!({ "date": date })),
    )
}

async fn trigger_catch_up(State(state): State<Arc<AppState>>) -> Response {
    let pipeline = Arc::clone(&state.pipeline);
    tokio::spawn(async move {
        pipeline.sync_yesterday_and_today().await;
    });
    respond(StatusCode::OK, "Sync for yesterday and today started in background", None)
}

async fn report_handler(State(state): State<Arc<AppState>>) -> Response {
    let report = state.pipeline.run_logger().report().await;
    ok_with("Sync report generated", &report)
}

async fn sync_now_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let date = match requested_date(&body) {
        Ok(date) => date,
        Err(resp) => return resp,
    };
    let outcome = state
        .pipeline
        .sync_for_date(date, TriggerSource::ApiManual)
        .await;
    let data = serde_json::to_value(&outcome).ok();
    if outcome.success {
        respond(StatusCode::OK, "Sync completed successfully", data)
    } else {
        respond(
            StatusCode::INTERNAL_SERVER_ERROR,
            outcome.error.clone().unwrap_or_else(|| "sync failed".to_string()),
            data,
        )
    }
}

async fn push_stats_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let date = match requested_date(&body) {
        Ok(date) => date,
        Err(resp) => return resp,
    };
    let outcome = state.pipeline.push_call_stats(date).await;
    let code = if outcome.success {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    let message = if outcome.success {
        "Push completed successfully"
    } else {
        "Push failed"
    };
    respond(code, message, serde_json::to_value(&outcome).ok())
}

async fn summary_handler(State(state): State<Arc<AppState>>) -> Response {
    let summary = state.pipeline.run_logger().summary().await;
    ok_with("Sync summary", &summary)
}

async fn recent_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecentQuery>,
) -> Response {
    let limit = match query.limit.as_deref() {
        None => DEFAULT_RECENT_LIMIT,
        Some(raw) => match raw.trim().parse::<usize>() {
            Ok(n) if (1..=MAX_RECENT_LIMIT).contains(&n) => n,
            _ => return bad_request(format!("limit must be between 1 and {MAX_RECENT_LIMIT}")),
        },
    };
    let runs = state.pipeline.run_logger().recent(limit).await;
    ok_with(&format!("{} recent sync runs", runs.len()), &runs)
}

async fn date_handler(State(state): State<Arc<AppState>>, Path(raw): Path<String>) -> Response {
    let Some(date) = parse_date(&raw) else {
        return bad_request("Invalid date format. Use YYYY-MM-DD format");
    };
    let runs = state.pipeline.run_logger().history_for_date(date).await;
    ok_with(&format!("{} sync runs for {date}", runs.len()), &runs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use artisync_core::ProviderRecord;
    use artisync_partner::FixturePartnerApi;
    use artisync_storage::{MemoryCatalogStore, RunHistoryStore};
    use artisync_sync::RunLogger;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn ravi() -> ProviderRecord {
        serde_json::from_value(serde_json::json!({
            "artisanId": "501",
            "artisanName": "Ravi",
            "serviceCategory": []
        }))
        .unwrap()
    }

    fn test_app(dir: &tempfile::TempDir, partner: FixturePartnerApi) -> Router {
        let logger = Arc::new(RunLogger::new(RunHistoryStore::new(dir.path().join("history.json"))));
        let pipeline = SyncPipeline::new(Arc::new(MemoryCatalogStore::new()), Arc::new(partner), logger);
        app(AppState::new(Arc::new(pipeline)))
    }

    async fn call(app: Router, method: &str, uri: &str, body: &str) -> (StatusCode, JsonValue) {
        let resp = app
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn empty_history_queries_return_zeroed_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir, FixturePartnerApi::new(Vec::new()));

        let (status, body) = call(app.clone(), "GET", "/api/vishwakarma/logs/summary", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");
        assert_eq!(body["data"]["total_fetch_operations"], 0);

        let (status, body) = call(app, "GET", "/api/vishwakarma/logs/stats", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["metrics"]["success_rate"], "0.00%");
    }

    #[tokio::test]
    async fn synchronous_sync_records_api_manual_run() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir, FixturePartnerApi::new(vec![vec![ravi()]]));

        let (status, body) = call(
            app.clone(),
            "POST",
            "/api/vishwakarma/logs/stats",
            r#"{"date":"2025-11-22"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["data"]["inserted"], 1);

        let (_, body) = call(app, "GET", "/api/vishwakarma/logs/date/2025-11-22", "").await;
        let runs = body["data"].as_array().unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0]["triggered_by"], "API_MANUAL");
    }

    #[tokio::test]
    async fn failed_sync_is_reported_as_error_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir, FixturePartnerApi::new(Vec::new()).with_auth_failure("denied"));

        let (status, body) = call(app, "POST", "/api/vishwakarma/logs/stats", "").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["status"], "error");
        assert_eq!(body["data"]["success"], false);
    }

    #[tokio::test]
    async fn input_validation_rejects_bad_dates_and_limits() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir, FixturePartnerApi::new(Vec::new()));

        let (status, _) = call(app.clone(), "GET", "/api/vishwakarma/logs/date/22-11-2025", "").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        for limit in ["0", "101", "many"] {
            let uri = format!("/api/vishwakarma/logs/recent?limit={limit}");
            let (status, body) = call(app.clone(), "GET", &uri, "").await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "limit {limit}");
            assert_eq!(body["status"], "error");
        }

        let (status, _) = call(app.clone(), "GET", "/api/vishwakarma/logs/recent?limit=100", "").await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = call(app, "POST", "/api/vishwakarma/logs/push-stats", r#"{"date":"yesterday"}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn push_stats_with_no_calls_succeeds_with_zero_count() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir, FixturePartnerApi::new(Vec::new()));

        let (status, body) = call(
            app,
            "POST",
            "/api/vishwakarma/logs/push-stats",
            r#"{"date":"2025-11-22"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["count"], 0);
    }

    #[tokio::test]
    async fn background_triggers_return_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir, FixturePartnerApi::new(Vec::new()));

        let (status, body) = call(app.clone(), "POST", "/api/sync", "").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["data"]["date"].is_string());

        let (status, _) = call(app.clone(), "GET", "/api/sync-dates", "").await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(app, "POST", "/api/sync-dates", "").await;
        assert_eq!(status, StatusCode::OK);
    }
}
