//! Catalog persistence (Postgres + in-memory) and the sync run-history file.

use std::path::PathBuf;

use artisync_core::{
    Account, AccountDraft, CallStatRecord, Category, CategoryDraft, Hcode, SellerProfile,
    SellerService, ServiceDraft, ServiceLocation,
};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

mod history;
mod memory;
mod postgres;

pub use history::{RunHistoryStore, DEFAULT_HISTORY_RETENTION};
pub use memory::MemoryCatalogStore;
pub use postgres::PgCatalogStore;

pub const CRATE_NAME: &str = "artisync-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("integrity violation: {0}")]
    Integrity(String),
    #[error("history file {path}: {source}")]
    History {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("encoding history: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Result of an insert-if-absent-else-fetch: the row plus whether this call created it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upserted<T> {
    pub row: T,
    pub created: bool,
}

impl<T> Upserted<T> {
    pub fn created(row: T) -> Self {
        Self { row, created: true }
    }

    pub fn existing(row: T) -> Self {
        Self { row, created: false }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CatalogCounts {
    pub accounts: u64,
    pub sellers: u64,
    pub categories: u64,
    pub services: u64,
    pub locations: u64,
}

/// Natural-key upserts over accounts, sellers, the category tree, services and
/// their locations, plus the call-event aggregate the stats push needs.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Insert by (source, source_id); on conflict overwrite name/contact/location.
    /// Role tags are written only on insert.
    async fn upsert_account(&self, draft: &AccountDraft) -> Result<Upserted<Account>, StoreError>;

    async fn ensure_seller(
        &self,
        account_id: Uuid,
        fullname: Option<&str>,
    ) -> Result<Upserted<SellerProfile>, StoreError>;

    /// Insert by hcode; an existing node keeps its name.
    async fn ensure_category(&self, draft: &CategoryDraft) -> Result<Upserted<Category>, StoreError>;

    async fn ensure_service(&self, draft: &ServiceDraft) -> Result<Upserted<SellerService>, StoreError>;

    async fn ensure_service_location(
        &self,
        seller_service_id: i64,
        latitude: Option<&str>,
        longitude: Option<&str>,
    ) -> Result<Upserted<ServiceLocation>, StoreError>;

    /// Calls per provider of `source` whose timestamp falls on `date` (UTC).
    async fn call_stats_for_date(
        &self,
        source: &str,
        date: NaiveDate,
    ) -> Result<Vec<CallStatRecord>, StoreError>;

    async fn catalog_counts(&self) -> Result<CatalogCounts, StoreError>;
}

/// A node with a parent must carry the parent's hcode plus one segment; roots carry one segment.
pub fn check_category_lineage(draft: &CategoryDraft, parent: Option<&Hcode>) -> Result<(), StoreError> {
    match parent {
        Some(parent_hcode) if !draft.hcode.extends(parent_hcode) => Err(StoreError::Integrity(format!(
            "category {} does not extend parent {}",
            draft.hcode, parent_hcode
        ))),
        None if draft.hcode.depth() != 1 => Err(StoreError::Integrity(format!(
            "root category {} must have a single segment",
            draft.hcode
        ))),
        _ => Ok(()),
    }
}
