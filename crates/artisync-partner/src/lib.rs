//! Partner (Vishwakarma) API contract, the reqwest client and a fixture-replay client.

use artisync_core::CallStatRecord;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

mod fixture;
mod http;

pub use fixture::{load_fixture_bundle, FixtureBundle, FixturePartnerApi};
pub use http::{HttpPartnerClient, PartnerConfig};

pub const CRATE_NAME: &str = "artisync-partner";

/// Wire format for dates in query strings and push payloads.
pub const PARTNER_DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Error)]
pub enum PartnerError {
    #[error("partner authentication failed: {0}")]
    Auth(String),
    #[error("fetching page {page} for {date} failed: {message}")]
    Fetch {
        date: NaiveDate,
        page: u32,
        message: String,
    },
    #[error("call stats push failed: {message}")]
    Push {
        message: String,
        payload: Option<JsonValue>,
    },
}

impl PartnerError {
    /// Partner-supplied error body, if the failure came with one.
    pub fn payload(&self) -> Option<&JsonValue> {
        match self {
            PartnerError::Push { payload, .. } => payload.as_ref(),
            _ => None,
        }
    }
}

/// One item of the call-stats push body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallStatEntry {
    #[serde(rename = "ArtisanId")]
    pub artisan_id: String,
    #[serde(rename = "ReceiveCalls")]
    pub receive_calls: i64,
    pub date: String,
}

impl CallStatEntry {
    pub fn from_record(record: &CallStatRecord, date: NaiveDate) -> Self {
        Self {
            artisan_id: record.external_id.clone(),
            receive_calls: record.calls,
            date: date.format(PARTNER_DATE_FORMAT).to_string(),
        }
    }
}

/// The three partner operations the pipeline depends on. Implementations
/// never retry; a failure is reported once and the caller decides.
#[async_trait]
pub trait PartnerApi: Send + Sync {
    async fn authenticate(&self) -> Result<String, PartnerError>;

    /// Raw entries of one page, undecoded so a malformed record cannot take
    /// its neighbours down with it. An empty page means the date is exhausted.
    async fn fetch_page(
        &self,
        token: &str,
        date: NaiveDate,
        page: u32,
    ) -> Result<Vec<JsonValue>, PartnerError>;

    async fn push_call_stats(
        &self,
        token: &str,
        entries: &[CallStatEntry],
    ) -> Result<JsonValue, PartnerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_stat_entry_uses_partner_field_names() {
        let date = NaiveDate::from_ymd_opt(2025, 11, 22).unwrap();
        let entry = CallStatEntry::from_record(
            &CallStatRecord {
                external_id: "501".into(),
                calls: 4,
            },
            date,
        );
        assert_eq!(
            serde_json::to_value(&entry).unwrap(),
            serde_json::json!({"ArtisanId": "501", "ReceiveCalls": 4, "date": "2025-11-22"})
        );
    }

    #[test]
    fn only_push_errors_carry_payloads() {
        let push = PartnerError::Push {
            message: "status 500".into(),
            payload: Some(serde_json::json!({"Message": "boom"})),
        };
        assert_eq!(push.payload().and_then(|p| p["Message"].as_str()), Some("boom"));
        assert!(PartnerError::Auth("denied".into()).payload().is_none());
    }
}
