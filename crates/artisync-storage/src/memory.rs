//! In-process [`CatalogStore`] with the same natural keys as the Postgres schema.

use artisync_core::{
    Account, AccountDraft, CallStatRecord, Category, CategoryDraft, Roles, SellerProfile,
    SellerService, ServiceDraft, ServiceLocation,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{check_category_lineage, CatalogCounts, CatalogStore, StoreError, Upserted};

#[derive(Debug, Clone)]
struct CallEvent {
    seller_id: i64,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MemoryState {
    accounts: Vec<Account>,
    sellers: Vec<SellerProfile>,
    categories: Vec<Category>,
    services: Vec<SellerService>,
    locations: Vec<ServiceLocation>,
    calls: Vec<CallEvent>,
    next_id: i64,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Debug, Default)]
pub struct MemoryCatalogStore {
    state: Mutex<MemoryState>,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one call received by `seller_id` on the given service.
    pub async fn record_call(
        &self,
        seller_id: i64,
        seller_service_id: i64,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if !state.sellers.iter().any(|s| s.id == seller_id) {
            return Err(StoreError::Integrity(format!("unknown seller {seller_id}")));
        }
        if !state.services.iter().any(|s| s.id == seller_service_id) {
            return Err(StoreError::Integrity(format!(
                "unknown seller service {seller_service_id}"
            )));
        }
        state.calls.push(CallEvent {
            seller_id,
            created_at: at,
        });
        Ok(())
    }

    pub async fn accounts(&self) -> Vec<Account> {
        self.state.lock().await.accounts.clone()
    }

    pub async fn sellers(&self) -> Vec<SellerProfile> {
        self.state.lock().await.sellers.clone()
    }

    pub async fn categories(&self) -> Vec<Category> {
        self.state.lock().await.categories.clone()
    }

    pub async fn services(&self) -> Vec<SellerService> {
        self.state.lock().await.services.clone()
    }

    pub async fn locations(&self) -> Vec<ServiceLocation> {
        self.state.lock().await.locations.clone()
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    async fn upsert_account(&self, draft: &AccountDraft) -> Result<Upserted<Account>, StoreError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        if let Some(existing) = state.accounts.iter_mut().find(|a| {
            a.source.as_deref() == Some(draft.source.as_str())
                && a.source_id.as_deref() == Some(draft.source_id.as_str())
        }) {
            existing.fullname = draft.fullname.clone();
            existing.mobile = draft.mobile.clone();
            existing.last_location = draft.last_location.clone();
            existing.updated_at = now;
            return Ok(Upserted::existing(existing.clone()));
        }

        let account = Account {
            id: Uuid::new_v4(),
            fullname: draft.fullname.clone(),
            mobile: draft.mobile.clone(),
            last_location: draft.last_location.clone(),
            roles: Roles::artisan(),
            refresh_token: None,
            source: Some(draft.source.clone()),
            source_id: Some(draft.source_id.clone()),
            created_at: now,
            updated_at: now,
        };
        state.accounts.push(account.clone());
        Ok(Upserted::created(account))
    }

    async fn ensure_seller(
        &self,
        account_id: Uuid,
        fullname: Option<&str>,
    ) -> Result<Upserted<SellerProfile>, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.sellers.iter().find(|s| s.user_account_id == account_id) {
            return Ok(Upserted::existing(existing.clone()));
        }
        if !state.accounts.iter().any(|a| a.id == account_id) {
            return Err(StoreError::Integrity(format!("unknown account {account_id}")));
        }
        let now = Utc::now();
        let seller = SellerProfile {
            id: state.next_id(),
            user_account_id: account_id,
            fullname: fullname.map(ToString::to_string),
            created_at: now,
            updated_at: now,
        };
        state.sellers.push(seller.clone());
        Ok(Upserted::created(seller))
    }

    async fn ensure_category(&self, draft: &CategoryDraft) -> Result<Upserted<Category>, StoreError> {
        let mut state = self.state.lock().await;
        let parent_hcode = match draft.parent_id {
            Some(parent_id) => Some(
                state
                    .categories
                    .iter()
                    .find(|c| c.id == parent_id)
                    .map(|c| c.hcode.clone())
                    .ok_or_else(|| StoreError::Integrity(format!("unknown parent category {parent_id}")))?,
            ),
            None => None,
        };
        check_category_lineage(draft, parent_hcode.as_ref())?;

        if let Some(existing) = state.categories.iter().find(|c| c.hcode == draft.hcode) {
            return Ok(Upserted::existing(existing.clone()));
        }
        let category = Category {
            id: state.next_id(),
            name: draft.name.clone(),
            parent_id: draft.parent_id,
            hcode: draft.hcode.clone(),
        };
        state.categories.push(category.clone());
        Ok(Upserted::created(category))
    }

    async fn ensure_service(&self, draft: &ServiceDraft) -> Result<Upserted<SellerService>, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.services.iter().find(|s| {
            s.seller_id == draft.seller_id && s.category_id == draft.category_id && s.name == draft.name
        }) {
            return Ok(Upserted::existing(existing.clone()));
        }
        let service = SellerService {
            id: state.next_id(),
            name: draft.name.clone(),
            description: None,
            seller_id: draft.seller_id,
            co_ordinates: draft.co_ordinates.clone(),
            category_id: draft.category_id,
        };
        state.services.push(service.clone());
        Ok(Upserted::created(service))
    }

    async fn ensure_service_location(
        &self,
        seller_service_id: i64,
        latitude: Option<&str>,
        longitude: Option<&str>,
    ) -> Result<Upserted<ServiceLocation>, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state
            .locations
            .iter()
            .find(|l| l.seller_service_id == seller_service_id)
        {
            return Ok(Upserted::existing(existing.clone()));
        }
        let location = ServiceLocation {
            id: state.next_id(),
            seller_service_id,
            latitude: latitude.map(ToString::to_string),
            longitude: longitude.map(ToString::to_string),
            created_at: Utc::now(),
        };
        state.locations.push(location.clone());
        Ok(Upserted::created(location))
    }

    async fn call_stats_for_date(
        &self,
        source: &str,
        date: NaiveDate,
    ) -> Result<Vec<CallStatRecord>, StoreError> {
        let state = self.state.lock().await;
        let mut counts: BTreeMap<String, i64> = BTreeMap::new();
        for call in state.calls.iter().filter(|c| c.created_at.date_naive() == date) {
            let external_id = state
                .sellers
                .iter()
                .find(|s| s.id == call.seller_id)
                .and_then(|seller| state.accounts.iter().find(|a| a.id == seller.user_account_id))
                .filter(|account| account.source.as_deref() == Some(source))
                .and_then(|account| account.source_id.clone());
            if let Some(external_id) = external_id {
                *counts.entry(external_id).or_default() += 1;
            }
        }
        Ok(counts
            .into_iter()
            .map(|(external_id, calls)| CallStatRecord { external_id, calls })
            .collect())
    }

    async fn catalog_counts(&self) -> Result<CatalogCounts, StoreError> {
        let state = self.state.lock().await;
        Ok(CatalogCounts {
            accounts: state.accounts.len() as u64,
            sellers: state.sellers.len() as u64,
            categories: state.categories.len() as u64,
            services: state.services.len() as u64,
            locations: state.locations.len() as u64,
        })
    }
}
