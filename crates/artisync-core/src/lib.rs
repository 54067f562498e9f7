//! Core domain model for the artisan sync pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "artisync-core";

/// `source` value stamped on every account that originates from the partner.
pub const PARTNER_SOURCE: &str = "VISHWAKARMA";

/// Seller role tag given to synced providers at account creation.
pub const ARTISAN_ROLE: &str = "ARTISAN";

pub const HCODE_SEPARATOR: char = '.';

/// Largest float id still converted to an integer without losing digits (2^53).
const MAX_EXACT_FLOAT_ID: f64 = 9_007_199_254_740_992.0;

/// Identifier as the partner sends it: sometimes a JSON number, sometimes a string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ExternalId {
    Number(i64),
    Text(String),
}

impl ExternalId {
    /// Normalized key segment, or `None` when the partner sent a zero or blank id.
    pub fn segment(&self) -> Option<String> {
        match self {
            ExternalId::Number(0) => None,
            ExternalId::Number(n) => Some(n.to_string()),
            ExternalId::Text(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            }
        }
    }
}

impl<'de> Deserialize<'de> for ExternalId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match LenientText::deserialize(deserializer)? {
            LenientText::Int(n) => ExternalId::Number(n),
            LenientText::Float(f) if f.fract() == 0.0 && f.abs() < MAX_EXACT_FLOAT_ID => {
                ExternalId::Number(f as i64)
            }
            LenientText::Float(f) => ExternalId::Text(f.to_string()),
            LenientText::Text(s) => ExternalId::Text(s),
        })
    }
}

impl From<i64> for ExternalId {
    fn from(value: i64) -> Self {
        ExternalId::Number(value)
    }
}

impl From<&str> for ExternalId {
    fn from(value: &str) -> Self {
        ExternalId::Text(value.to_string())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LenientText {
    Int(i64),
    Float(f64),
    Text(String),
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<LenientText>::deserialize(deserializer)?.map(|v| match v {
        LenientText::Int(n) => n.to_string(),
        LenientText::Float(f) => f.to_string(),
        LenientText::Text(s) => s,
    }))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<Option<T>>),
    One(T),
}

fn one_or_many<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(match Option::<OneOrMany<T>>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::Many(items)) => items.into_iter().flatten().collect(),
        Some(OneOrMany::One(item)) => vec![item],
    })
}

/// One partner-supplied provider record, as returned by a page fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRecord {
    #[serde(default)]
    pub artisan_id: Option<ExternalId>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub artisan_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub contact_no: Option<String>,
    #[serde(
        default,
        rename = "lattitude",
        alias = "latitude",
        deserialize_with = "lenient_string"
    )]
    pub latitude: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub longitude: Option<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub service_category: Vec<ServiceCategory>,
}

impl ProviderRecord {
    pub fn source_id(&self) -> Option<String> {
        self.artisan_id.as_ref().and_then(ExternalId::segment)
    }

    /// `"<lat>,<lon>"` snapshot, or `None` when the record carries no coordinates at all.
    pub fn coordinates(&self) -> Option<String> {
        if self.latitude.is_none() && self.longitude.is_none() {
            return None;
        }
        Some(format!(
            "{},{}",
            self.latitude.as_deref().unwrap_or_default(),
            self.longitude.as_deref().unwrap_or_default()
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceCategory {
    #[serde(default)]
    pub service_category_id: Option<ExternalId>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub service_category_name: Option<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub service_sub_category: Vec<ServiceSubCategory>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSubCategory {
    #[serde(default)]
    pub service_sub_category_id: Option<ExternalId>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub sub_category_name: Option<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub service: Vec<ServiceEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEntry {
    #[serde(default)]
    pub service_id: Option<ExternalId>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub service_name: Option<String>,
}

/// Dot-separated natural key of a category node, e.g. `12.7.3`.
///
/// Every segment is non-empty and free of the separator, so the code
/// encodes the exact ancestor chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Hcode(String);

impl Hcode {
    fn valid_segment(segment: &str) -> bool {
        !segment.is_empty() && !segment.contains(HCODE_SEPARATOR)
    }

    pub fn root(segment: &str) -> Option<Self> {
        Self::valid_segment(segment).then(|| Self(segment.to_string()))
    }

    pub fn child(&self, segment: &str) -> Option<Self> {
        Self::valid_segment(segment).then(|| Self(format!("{}{HCODE_SEPARATOR}{segment}", self.0)))
    }

    pub fn parse(value: &str) -> Option<Self> {
        value
            .split(HCODE_SEPARATOR)
            .all(Self::valid_segment)
            .then(|| Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split(HCODE_SEPARATOR)
    }

    pub fn depth(&self) -> usize {
        self.segments().count()
    }

    pub fn last_segment(&self) -> &str {
        self.0
            .rsplit_once(HCODE_SEPARATOR)
            .map(|(_, last)| last)
            .unwrap_or(&self.0)
    }

    pub fn parent(&self) -> Option<Self> {
        self.0
            .rsplit_once(HCODE_SEPARATOR)
            .map(|(head, _)| Self(head.to_string()))
    }

    /// True when `self` is exactly `parent` plus one more segment.
    pub fn extends(&self, parent: &Hcode) -> bool {
        self.parent().as_ref() == Some(parent)
    }
}

impl fmt::Display for Hcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Roles {
    #[serde(default)]
    pub seller: Vec<String>,
    #[serde(default)]
    pub buyer: Vec<String>,
}

impl Roles {
    pub fn artisan() -> Self {
        Self {
            seller: vec![ARTISAN_ROLE.to_string()],
            buyer: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub fullname: Option<String>,
    pub mobile: Option<String>,
    pub last_location: Option<String>,
    pub roles: Roles,
    pub refresh_token: Option<String>,
    pub source: Option<String>,
    pub source_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Mutable account fields keyed by the (source, source_id) natural key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountDraft {
    pub source: String,
    pub source_id: String,
    pub fullname: Option<String>,
    pub mobile: Option<String>,
    pub last_location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SellerProfile {
    pub id: i64,
    pub user_account_id: Uuid,
    pub fullname: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: i64,
    pub name: String,
    pub parent_id: Option<i64>,
    pub hcode: Hcode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryDraft {
    pub hcode: Hcode,
    pub name: String,
    pub parent_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SellerService {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub seller_id: i64,
    pub co_ordinates: Option<String>,
    pub category_id: i64,
}

/// Natural key is (seller_id, category_id, name); `co_ordinates` only lands on insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDraft {
    pub seller_id: i64,
    pub category_id: i64,
    pub name: String,
    pub co_ordinates: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceLocation {
    pub id: i64,
    pub seller_service_id: i64,
    pub latitude: Option<String>,
    pub longitude: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Calls received by one partner-sourced provider on one calendar date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallStatRecord {
    pub external_id: String,
    pub calls: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerSource {
    Cron,
    Manual,
    ApiManual,
}

impl TriggerSource {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerSource::Cron => "CRON",
            TriggerSource::Manual => "MANUAL",
            TriggerSource::ApiManual => "API_MANUAL",
        }
    }
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CRON" => Ok(TriggerSource::Cron),
            "MANUAL" => Ok(TriggerSource::Manual),
            "API_MANUAL" => Ok(TriggerSource::ApiManual),
            other => Err(format!("unknown trigger source: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    InProgress,
    Success,
    Failed,
}

/// One orchestrator invocation. Mutable while in progress, frozen once finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub session_id: String,
    pub triggered_by: TriggerSource,
    pub target_date: NaiveDate,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub status: RunStatus,
    pub records_inserted: u64,
    pub records_updated: u64,
    pub total_records: u64,
    /// Highest page requested so far, counting the final empty page and a
    /// page whose fetch failed.
    pub pages_fetched: u32,
    pub error: Option<String>,
    pub error_details: Option<String>,
}

impl SyncRun {
    pub fn started(target_date: NaiveDate, triggered_by: TriggerSource, now: DateTime<Utc>) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            triggered_by,
            target_date,
            start_time: now,
            end_time: None,
            duration_seconds: None,
            status: RunStatus::InProgress,
            records_inserted: 0,
            records_updated: 0,
            total_records: 0,
            pages_fetched: 0,
            error: None,
            error_details: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status != RunStatus::InProgress
    }

    pub fn record_page(&mut self, page: u32) {
        if !self.is_finished() {
            self.pages_fetched = page;
        }
    }

    pub fn record_counts(&mut self, inserted: u64, updated: u64) {
        if self.is_finished() {
            return;
        }
        self.records_inserted += inserted;
        self.records_updated += updated;
        self.total_records = self.records_inserted + self.records_updated;
    }

    pub fn finish_success(&mut self, now: DateTime<Utc>) {
        self.stamp_end(now);
        self.status = RunStatus::Success;
    }

    pub fn finish_failure(&mut self, now: DateTime<Utc>, error: String, details: Option<String>) {
        self.stamp_end(now);
        self.status = RunStatus::Failed;
        self.error = Some(error);
        self.error_details = details;
    }

    fn stamp_end(&mut self, now: DateTime<Utc>) {
        let millis = (now - self.start_time).num_milliseconds().max(0);
        self.end_time = Some(now);
        self.duration_seconds = Some((millis as f64 / 10.0).round() / 100.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn hcode_chain_extends_parent_by_one_segment() {
        let root = Hcode::root("12").unwrap();
        let sub = root.child("7").unwrap();
        let leaf = sub.child("3").unwrap();

        assert_eq!(leaf.as_str(), "12.7.3");
        assert_eq!(leaf.depth(), 3);
        assert_eq!(leaf.last_segment(), "3");
        assert!(leaf.extends(&sub));
        assert!(!leaf.extends(&root));
        assert_eq!(root.parent(), None);
        assert_eq!(root.last_segment(), "12");
    }

    #[test]
    fn hcode_rejects_blank_or_dotted_segments() {
        assert!(Hcode::root("").is_none());
        assert!(Hcode::root("1.2").is_none());
        assert!(Hcode::parse("1..2").is_none());
        assert_eq!(Hcode::parse("1.2").map(|h| h.depth()), Some(2));
    }

    #[test]
    fn zero_and_blank_external_ids_are_missing() {
        assert_eq!(ExternalId::Number(0).segment(), None);
        assert_eq!(ExternalId::Text("  ".into()).segment(), None);
        assert_eq!(ExternalId::Number(42).segment().as_deref(), Some("42"));
        assert_eq!(ExternalId::Text(" 501 ".into()).segment().as_deref(), Some("501"));
    }

    #[test]
    fn provider_record_decodes_partner_shapes() {
        let json = r#"{
            "artisanId": 501,
            "artisanName": "Ravi",
            "contactNo": 9000000001,
            "lattitude": 26.4,
            "longitude": "80.3",
            "serviceCategory": {
                "serviceCategoryId": "1",
                "serviceCategoryName": "Home",
                "serviceSubCategory": [null, {
                    "serviceSubCategoryId": 2,
                    "subCategoryName": "Repair",
                    "service": [{"serviceId": 3, "serviceName": "Plumbing"}]
                }]
            }
        }"#;
        let record: ProviderRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.source_id().as_deref(), Some("501"));
        assert_eq!(record.contact_no.as_deref(), Some("9000000001"));
        assert_eq!(record.coordinates().as_deref(), Some("26.4,80.3"));
        assert_eq!(record.service_category.len(), 1);
        assert_eq!(record.service_category[0].service_sub_category.len(), 1);
        assert_eq!(
            record.service_category[0].service_sub_category[0].service[0]
                .service_name
                .as_deref(),
            Some("Plumbing")
        );
    }

    #[test]
    fn numeric_names_and_float_ids_decode_as_text() {
        let json = r#"{
            "artisanId": 501.0,
            "serviceCategory": [{
                "serviceCategoryId": 1,
                "serviceCategoryName": 7,
                "serviceSubCategory": [{
                    "serviceSubCategoryId": 2.5,
                    "subCategoryName": 12.5,
                    "service": [{"serviceId": 3, "serviceName": 40}]
                }]
            }]
        }"#;
        let record: ProviderRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.source_id().as_deref(), Some("501"));

        let category = &record.service_category[0];
        assert_eq!(category.service_category_name.as_deref(), Some("7"));
        let sub = &category.service_sub_category[0];
        assert_eq!(sub.service_sub_category_id, Some(ExternalId::Text("2.5".into())));
        assert_eq!(sub.sub_category_name.as_deref(), Some("12.5"));
        assert_eq!(sub.service[0].service_name.as_deref(), Some("40"));
    }

    #[test]
    fn provider_record_without_categories_decodes_empty() {
        let record: ProviderRecord =
            serde_json::from_str(r#"{"artisanId":"9","serviceCategory":null}"#).unwrap();
        assert!(record.service_category.is_empty());
        assert_eq!(record.coordinates(), None);
    }

    #[test]
    fn finished_run_is_frozen_and_timed() {
        let start = Utc.with_ymd_and_hms(2025, 11, 23, 0, 0, 0).single().unwrap();
        let date = NaiveDate::from_ymd_opt(2025, 11, 22).unwrap();
        let mut run = SyncRun::started(date, TriggerSource::Cron, start);
        run.record_page(1);
        run.record_counts(2, 1);
        run.finish_success(start + chrono::Duration::milliseconds(1534));
        run.record_counts(10, 10);
        run.record_page(9);

        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.duration_seconds, Some(1.53));
        assert_eq!(run.total_records, 3);
        assert_eq!(run.pages_fetched, 1);
    }

    #[test]
    fn trigger_source_round_trips_wire_names() {
        assert_eq!("api_manual".parse::<TriggerSource>(), Ok(TriggerSource::ApiManual));
        assert_eq!(
            serde_json::to_string(&TriggerSource::Cron).unwrap(),
            "\"CRON\""
        );
        assert!("nightly".parse::<TriggerSource>().is_err());
    }
}
