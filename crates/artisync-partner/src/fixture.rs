//! Offline partner: serves recorded pages and remembers what was pushed.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use artisync_core::ProviderRecord;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;

use crate::{CallStatEntry, PartnerApi, PartnerError};

const FIXTURE_TOKEN: &str = "fixture-token";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub fixture_id: String,
    pub source: String,
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub notes: Option<String>,
    /// Page `n` is `pages[n - 1]`; every page past the end is empty.
    /// Entries stay raw JSON so a bundle can carry malformed records.
    pub pages: Vec<Vec<JsonValue>>,
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Default)]
struct Recorded {
    auth_calls: usize,
    fetches: Vec<(NaiveDate, u32)>,
    pushes: Vec<Vec<CallStatEntry>>,
}

#[derive(Debug, Default)]
pub struct FixturePartnerApi {
    pages: Vec<Vec<JsonValue>>,
    endless: bool,
    auth_failure: Option<String>,
    fetch_failure_on: Option<u32>,
    push_failure: Option<JsonValue>,
    push_response: Option<JsonValue>,
    recorded: Mutex<Recorded>,
}

impl FixturePartnerApi {
    pub fn new(pages: Vec<Vec<ProviderRecord>>) -> Self {
        let pages = pages
            .iter()
            .map(|records| {
                records
                    .iter()
                    .filter_map(|record| serde_json::to_value(record).ok())
                    .collect()
            })
            .collect();
        Self::from_raw_pages(pages)
    }

    /// Serve entries exactly as given, malformed ones included.
    pub fn from_raw_pages(pages: Vec<Vec<JsonValue>>) -> Self {
        Self {
            pages,
            ..Self::default()
        }
    }

    pub fn from_bundle(bundle: FixtureBundle) -> Self {
        Self::from_raw_pages(bundle.pages)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::from_bundle(load_fixture_bundle(path)?))
    }

    pub fn with_auth_failure(mut self, message: impl Into<String>) -> Self {
        self.auth_failure = Some(message.into());
        self
    }

    pub fn with_fetch_failure_on(mut self, page: u32) -> Self {
        self.fetch_failure_on = Some(page);
        self
    }

    /// Reject pushes with the given partner error body.
    pub fn with_push_failure(mut self, payload: JsonValue) -> Self {
        self.push_failure = Some(payload);
        self
    }

    pub fn with_push_response(mut self, response: JsonValue) -> Self {
        self.push_response = Some(response);
        self
    }

    /// Keep serving the last page instead of running dry.
    pub fn with_endless_pages(mut self) -> Self {
        self.endless = true;
        self
    }

    pub async fn auth_calls(&self) -> usize {
        self.recorded.lock().await.auth_calls
    }

    pub async fn fetches(&self) -> Vec<(NaiveDate, u32)> {
        self.recorded.lock().await.fetches.clone()
    }

    pub async fn pushes(&self) -> Vec<Vec<CallStatEntry>> {
        self.recorded.lock().await.pushes.clone()
    }

    fn page(&self, page: u32) -> Vec<JsonValue> {
        let index = page.saturating_sub(1) as usize;
        match self.pages.get(index) {
            Some(records) => records.clone(),
            None if self.endless => self.pages.last().cloned().unwrap_or_default(),
            None => Vec::new(),
        }
    }
}

#[async_trait]
impl PartnerApi for FixturePartnerApi {
    async fn authenticate(&self) -> Result<String, PartnerError> {
        self.recorded.lock().await.auth_calls += 1;
        match &self.auth_failure {
            Some(message) => Err(PartnerError::Auth(message.clone())),
            None => Ok(FIXTURE_TOKEN.to_string()),
        }
    }

    async fn fetch_page(
        &self,
        _token: &str,
        date: NaiveDate,
        page: u32,
    ) -> Result<Vec<JsonValue>, PartnerError> {
        self.recorded.lock().await.fetches.push((date, page));
        if self.fetch_failure_on == Some(page) {
            return Err(PartnerError::Fetch {
                date,
                page,
                message: "fixture configured to fail".to_string(),
            });
        }
        Ok(self.page(page))
    }

    async fn push_call_stats(
        &self,
        _token: &str,
        entries: &[CallStatEntry],
    ) -> Result<JsonValue, PartnerError> {
        self.recorded.lock().await.pushes.push(entries.to_vec());
        if let Some(payload) = &self.push_failure {
            return Err(PartnerError::Push {
                message: "status 500 Internal Server Error".to_string(),
                payload: Some(payload.clone()),
            });
        }
        Ok(self
            .push_response
            .clone()
            .unwrap_or_else(|| serde_json::json!({"Success": true, "Count": entries.len()})))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: i64) -> ProviderRecord {
        serde_json::from_value(serde_json::json!({"artisanId": id})).unwrap()
    }

    #[tokio::test]
    async fn pages_run_dry_after_the_bundle() {
        let api = FixturePartnerApi::new(vec![vec![record(1)], vec![record(2), record(3)]]);
        let date = NaiveDate::from_ymd_opt(2025, 11, 22).unwrap();

        assert_eq!(api.fetch_page("t", date, 1).await.unwrap().len(), 1);
        assert_eq!(api.fetch_page("t", date, 2).await.unwrap().len(), 2);
        assert!(api.fetch_page("t", date, 3).await.unwrap().is_empty());
        assert_eq!(api.fetches().await, vec![(date, 1), (date, 2), (date, 3)]);
    }

    #[tokio::test]
    async fn raw_pages_are_served_untouched() {
        let bad = serde_json::json!({"artisanId": true});
        let api = FixturePartnerApi::from_raw_pages(vec![vec![bad.clone()]]);
        let date = NaiveDate::from_ymd_opt(2025, 11, 22).unwrap();
        assert_eq!(api.fetch_page("t", date, 1).await.unwrap(), vec![bad]);
    }

    #[tokio::test]
    async fn typed_pages_decode_back_to_the_same_records() {
        let api = FixturePartnerApi::new(vec![vec![record(7)]]);
        let date = NaiveDate::from_ymd_opt(2025, 11, 22).unwrap();
        let served = api.fetch_page("t", date, 1).await.unwrap();
        let decoded: ProviderRecord = serde_json::from_value(served[0].clone()).unwrap();
        assert_eq!(decoded, record(7));
    }

    #[tokio::test]
    async fn endless_fixture_repeats_the_last_page() {
        let api = FixturePartnerApi::new(vec![vec![record(1)]]).with_endless_pages();
        let date = NaiveDate::from_ymd_opt(2025, 11, 22).unwrap();
        assert_eq!(api.fetch_page("t", date, 50).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn configured_failures_surface_as_partner_errors() {
        let api = FixturePartnerApi::new(Vec::new())
            .with_auth_failure("bad credentials")
            .with_push_failure(serde_json::json!({"Message": "rejected"}));

        assert!(matches!(api.authenticate().await, Err(PartnerError::Auth(m)) if m == "bad credentials"));
        let err = api.push_call_stats("t", &[]).await.unwrap_err();
        assert_eq!(err.payload(), Some(&serde_json::json!({"Message": "rejected"})));
        assert_eq!(api.auth_calls().await, 1);
        assert_eq!(api.pushes().await.len(), 1);
    }
}
