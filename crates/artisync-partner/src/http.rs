use std::fmt;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{CallStatEntry, PartnerApi, PartnerError, PARTNER_DATE_FORMAT};

const API_PREFIX: &str = "api/IITKnpArtisanData";

#[derive(Clone)]
pub struct PartnerConfig {
    pub base_url: String,
    pub user_id: String,
    pub password: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl fmt::Debug for PartnerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartnerConfig")
            .field("base_url", &self.base_url)
            .field("user_id", &"<redacted>")
            .field("password", &"<redacted>")
            .field("timeout", &self.timeout)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    #[serde(rename = "Token", alias = "token", default)]
    token: Option<String>,
    #[serde(rename = "Success", alias = "success", default)]
    success: Option<bool>,
    #[serde(rename = "Message", alias = "message", default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PageResponse {
    #[serde(default)]
    data: Option<Vec<JsonValue>>,
}

#[derive(Debug, Clone)]
pub struct HttpPartnerClient {
    client: reqwest::Client,
    config: PartnerConfig,
}

impl HttpPartnerClient {
    pub fn new(config: PartnerConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client, config })
    }

    fn endpoint(&self, operation: &str) -> String {
        format!(
            "{}/{API_PREFIX}/{operation}",
            self.config.base_url.trim_end_matches('/')
        )
    }
}

/// Response body as JSON, or as a JSON string when the partner answered with plain text.
async fn body_as_json(resp: reqwest::Response) -> JsonValue {
    match resp.text().await {
        Ok(text) if text.trim().is_empty() => JsonValue::Null,
        Ok(text) => serde_json::from_str(&text).unwrap_or(JsonValue::String(text)),
        Err(err) => JsonValue::String(format!("unreadable body: {err}")),
    }
}

#[async_trait]
impl PartnerApi for HttpPartnerClient {
    async fn authenticate(&self) -> Result<String, PartnerError> {
        let url = self.endpoint("AuthenticateUser");
        let span = info_span!("partner_auth", url = %url);

        async {
            let resp = self
                .client
                .post(&url)
                .query(&[
                    ("UserId", self.config.user_id.as_str()),
                    ("Password", self.config.password.as_str()),
                ])
                .send()
                .await
                .map_err(|err| PartnerError::Auth(format!("request failed: {err}")))?;

            let status = resp.status();
            let body: AuthResponse = resp
                .json()
                .await
                .map_err(|err| PartnerError::Auth(format!("status {status}, unreadable response: {err}")))?;

            let message = body.message.unwrap_or_default();
            if !status.is_success() {
                return Err(PartnerError::Auth(format!("status {status}: {message}")));
            }
            if body.success != Some(true) {
                return Err(PartnerError::Auth(if message.is_empty() {
                    "partner reported failure".to_string()
                } else {
                    message
                }));
            }
            match body.token.filter(|t| !t.trim().is_empty()) {
                Some(token) => {
                    info!("partner authentication succeeded");
                    Ok(token)
                }
                None => Err(PartnerError::Auth("response carried no token".to_string())),
            }
        }
        .instrument(span)
        .await
    }

    async fn fetch_page(
        &self,
        token: &str,
        date: NaiveDate,
        page: u32,
    ) -> Result<Vec<JsonValue>, PartnerError> {
        let url = self.endpoint("GetArtisansIITKanpur");
        let span = info_span!("partner_fetch_page", %date, page);
        let fetch_err = |message: String| PartnerError::Fetch { date, page, message };

        async {
            let resp = self
                .client
                .get(&url)
                .query(&[
                    ("Date", date.format(PARTNER_DATE_FORMAT).to_string()),
                    ("PageNo", page.to_string()),
                ])
                .bearer_auth(token)
                .send()
                .await
                .map_err(|err| fetch_err(format!("request failed: {err}")))?;

            let status = resp.status();
            if !status.is_success() {
                let body = body_as_json(resp).await;
                warn!(%status, "page fetch rejected");
                return Err(fetch_err(format!("status {status}: {body}")));
            }

            let body: PageResponse = resp
                .json()
                .await
                .map_err(|err| fetch_err(format!("decoding page: {err}")))?;
            let entries = body.data.unwrap_or_default();
            debug!(entries = entries.len(), "page fetched");
            Ok(entries)
        }
        .instrument(span)
        .await
    }

    async fn push_call_stats(
        &self,
        token: &str,
        entries: &[CallStatEntry],
    ) -> Result<JsonValue, PartnerError> {
        let url = self.endpoint("SaveIITKanpurArtisanCallDetail");
        let span = info_span!("partner_push_call_stats", entries = entries.len());

        async {
            let resp = self
                .client
                .post(&url)
                .bearer_auth(token)
                .json(entries)
                .send()
                .await
                .map_err(|err| PartnerError::Push {
                    message: format!("request failed: {err}"),
                    payload: None,
                })?;

            let status = resp.status();
            let body = body_as_json(resp).await;
            if !status.is_success() {
                return Err(PartnerError::Push {
                    message: format!("status {status}"),
                    payload: Some(body),
                });
            }
            Ok(body)
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_hides_credentials() {
        let config = PartnerConfig {
            base_url: "https://partner.test".into(),
            user_id: "integration-user".into(),
            password: "hunter2".into(),
            timeout: Duration::from_secs(5),
            user_agent: None,
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("integration-user"));
        assert!(rendered.contains("partner.test"));
    }

    #[test]
    fn endpoints_tolerate_trailing_slash() {
        let client = HttpPartnerClient::new(PartnerConfig {
            base_url: "https://partner.test/".into(),
            user_id: String::new(),
            password: String::new(),
            timeout: Duration::from_secs(5),
            user_agent: Some("artisync-test".into()),
        })
        .unwrap();
        assert_eq!(
            client.endpoint("AuthenticateUser"),
            "https://partner.test/api/IITKnpArtisanData/AuthenticateUser"
        );
    }

    #[test]
    fn auth_response_accepts_either_casing() {
        let upper: AuthResponse = serde_json::from_str(r#"{"Token":"t1","Success":true}"#).unwrap();
        let lower: AuthResponse = serde_json::from_str(r#"{"token":"t2","success":true}"#).unwrap();
        assert_eq!(upper.token.as_deref(), Some("t1"));
        assert_eq!(lower.token.as_deref(), Some("t2"));
        assert_eq!(lower.success, Some(true));
    }
}
