//! Daily call statistics pushed back to the partner.

use std::sync::Arc;

use artisync_core::PARTNER_SOURCE;
use artisync_partner::{CallStatEntry, PartnerApi};
use artisync_storage::CatalogStore;
use chrono::NaiveDate;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{error, info, info_span, Instrument};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PushOutcome {
    pub success: bool,
    pub date: NaiveDate,
    pub message: String,
    pub count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_response: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonValue>,
}

impl PushOutcome {
    fn failed(date: NaiveDate, message: impl Into<String>, error: JsonValue) -> Self {
        Self {
            success: false,
            date,
            message: message.into(),
            count: 0,
            api_response: None,
            error: Some(error),
        }
    }
}

pub struct StatsPusher {
    store: Arc<dyn CatalogStore>,
    partner: Arc<dyn PartnerApi>,
}

impl StatsPusher {
    pub fn new(store: Arc<dyn CatalogStore>, partner: Arc<dyn PartnerApi>) -> Self {
        Self { store, partner }
    }

    /// Authenticate, aggregate the day's calls per partner provider and push
    /// them in one request. Nothing to push is a success without a network call.
    pub async fn push_call_stats(&self, date: NaiveDate) -> PushOutcome {
        self.push(date)
            .instrument(info_span!("push_call_stats", %date))
            .await
    }

    async fn push(&self, date: NaiveDate) -> PushOutcome {
        let token = match self.partner.authenticate().await {
            Ok(token) => token,
            Err(err) => {
                error!(error = %err, "stats push authentication failed");
                return PushOutcome::failed(date, err.to_string(), JsonValue::Null);
            }
        };

        let stats = match self.store.call_stats_for_date(PARTNER_SOURCE, date).await {
            Ok(stats) => stats,
            Err(err) => {
                error!(error = %err, "call stats aggregation failed");
                return PushOutcome::failed(date, err.to_string(), JsonValue::Null);
            }
        };

        if stats.is_empty() {
            info!("no call stats to push");
            return PushOutcome {
                success: true,
                date,
                message: "No data to push".to_string(),
                count: 0,
                api_response: None,
                error: None,
            };
        }

        let entries: Vec<CallStatEntry> = stats
            .iter()
            .map(|record| CallStatEntry::from_record(record, date))
            .collect();

        match self.partner.push_call_stats(&token, &entries).await {
            Ok(response) => {
                info!(count = entries.len(), "call stats pushed");
                PushOutcome {
                    success: true,
                    date,
                    message: "Data pushed successfully".to_string(),
                    count: entries.len(),
                    api_response: Some(response),
                    error: None,
                }
            }
            Err(err) => {
                error!(error = %err, count = entries.len(), "call stats push failed");
                let payload = err.payload().cloned().unwrap_or(JsonValue::Null);
                PushOutcome::failed(date, err.to_string(), payload)
            }
        }
    }
}
