//! Maps one partner record onto accounts, sellers, the category tree,
//! services and service locations.

use std::ops::AddAssign;
use std::sync::Arc;

use artisync_core::{
    AccountDraft, CategoryDraft, Hcode, ProviderRecord, ServiceDraft, PARTNER_SOURCE,
};
use artisync_storage::{CatalogStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileCounts {
    pub inserted: u64,
    pub updated: u64,
}

impl AddAssign for ReconcileCounts {
    fn add_assign(&mut self, rhs: Self) {
        self.inserted += rhs.inserted;
        self.updated += rhs.updated;
    }
}

/// One provider record could not be applied. Never fatal to a run.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("provider record has no usable artisanId")]
    MissingId,
    #[error("reconciling provider {external_id}: {source}")]
    Store {
        external_id: String,
        #[source]
        source: StoreError,
    },
}

pub struct Reconciler {
    store: Arc<dyn CatalogStore>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn CatalogStore>) -> Self {
        Self { store }
    }

    /// Upsert the record's whole hierarchy. Only the account decides the
    /// inserted/updated count; entries without an id are skipped at their level.
    pub async fn reconcile(&self, record: &ProviderRecord) -> Result<ReconcileCounts, ReconcileError> {
        let external_id = record.source_id().ok_or(ReconcileError::MissingId)?;
        let wrap = |source: StoreError| ReconcileError::Store {
            external_id: external_id.clone(),
            source,
        };

        let coordinates = record.coordinates();
        let account = self
            .store
            .upsert_account(&AccountDraft {
                source: PARTNER_SOURCE.to_string(),
                source_id: external_id.clone(),
                fullname: record.artisan_name.clone(),
                mobile: record.contact_no.clone(),
                last_location: coordinates.clone(),
            })
            .await
            .map_err(wrap)?;

        let counts = if account.created {
            ReconcileCounts { inserted: 1, updated: 0 }
        } else {
            ReconcileCounts { inserted: 0, updated: 1 }
        };

        let seller = self
            .store
            .ensure_seller(account.row.id, record.artisan_name.as_deref())
            .await
            .map_err(wrap)?
            .row;

        for category in &record.service_category {
            let Some(root_hcode) = category
                .service_category_id
                .as_ref()
                .and_then(|id| id.segment())
                .and_then(|segment| Hcode::root(&segment))
            else {
                debug!(%external_id, "category without id skipped");
                continue;
            };
            let root = self
                .store
                .ensure_category(&CategoryDraft {
                    name: category
                        .service_category_name
                        .clone()
                        .unwrap_or_else(|| root_hcode.to_string()),
                    hcode: root_hcode,
                    parent_id: None,
                })
                .await
                .map_err(wrap)?
                .row;

            for sub in &category.service_sub_category {
                let Some(sub_hcode) = sub
                    .service_sub_category_id
                    .as_ref()
                    .and_then(|id| id.segment())
                    .and_then(|segment| root.hcode.child(&segment))
                else {
                    debug!(%external_id, parent = %root.hcode, "subcategory without id skipped");
                    continue;
                };
                let sub_category = self
                    .store
                    .ensure_category(&CategoryDraft {
                        name: sub
                            .sub_category_name
                            .clone()
                            .unwrap_or_else(|| sub_hcode.to_string()),
                        hcode: sub_hcode,
                        parent_id: Some(root.id),
                    })
                    .await
                    .map_err(wrap)?
                    .row;

                for entry in &sub.service {
                    let Some(leaf_hcode) = entry
                        .service_id
                        .as_ref()
                        .and_then(|id| id.segment())
                        .and_then(|segment| sub_category.hcode.child(&segment))
                    else {
                        debug!(%external_id, parent = %sub_category.hcode, "service without id skipped");
                        continue;
                    };
                    let service_name = entry
                        .service_name
                        .clone()
                        .unwrap_or_else(|| leaf_hcode.to_string());
                    let leaf = self
                        .store
                        .ensure_category(&CategoryDraft {
                            name: service_name.clone(),
                            hcode: leaf_hcode,
                            parent_id: Some(sub_category.id),
                        })
                        .await
                        .map_err(wrap)?
                        .row;

                    let service = self
                        .store
                        .ensure_service(&ServiceDraft {
                            seller_id: seller.id,
                            category_id: leaf.id,
                            name: service_name,
                            co_ordinates: coordinates.clone(),
                        })
                        .await
                        .map_err(wrap)?
                        .row;

                    self.store
                        .ensure_service_location(
                            service.id,
                            record.latitude.as_deref(),
                            record.longitude.as_deref(),
                        )
                        .await
                        .map_err(wrap)?;
                }
            }
        }

        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use artisync_core::ExternalId;
    use artisync_storage::MemoryCatalogStore;

    fn ravi() -> ProviderRecord {
        serde_json::from_value(serde_json::json!({
            "artisanId": "501",
            "artisanName": "Ravi",
            "contactNo": "9000000001",
            "lattitude": "26.4",
            "longitude": "80.3",
            "serviceCategory": [{
                "serviceCategoryId": 1,
                "serviceCategoryName": "Home",
                "serviceSubCategory": [{
                    "serviceSubCategoryId": 2,
                    "subCategoryName": "Repair",
                    "service": [{"serviceId": 3, "serviceName": "Plumbing"}]
                }]
            }]
        }))
        .unwrap()
    }

    fn setup() -> (Arc<MemoryCatalogStore>, Reconciler) {
        let store = Arc::new(MemoryCatalogStore::new());
        let reconciler = Reconciler::new(store.clone());
        (store, reconciler)
    }

    #[tokio::test]
    async fn end_to_end_record_builds_the_full_hierarchy() {
        let (store, reconciler) = setup();
        let counts = reconciler.reconcile(&ravi()).await.unwrap();
        assert_eq!(counts, ReconcileCounts { inserted: 1, updated: 0 });

        let accounts = store.accounts().await;
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].source.as_deref(), Some(PARTNER_SOURCE));
        assert_eq!(accounts[0].source_id.as_deref(), Some("501"));
        assert_eq!(accounts[0].last_location.as_deref(), Some("26.4,80.3"));
        assert_eq!(accounts[0].roles.seller, vec!["ARTISAN".to_string()]);
        assert!(accounts[0].roles.buyer.is_empty());

        assert_eq!(store.sellers().await.len(), 1);

        let categories = store.categories().await;
        let hcodes: Vec<&str> = categories.iter().map(|c| c.hcode.as_str()).collect();
        assert_eq!(hcodes, vec!["1", "1.2", "1.2.3"]);

        let services = store.services().await;
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].name, "Plumbing");
        assert_eq!(services[0].description, None);
        assert_eq!(services[0].co_ordinates.as_deref(), Some("26.4,80.3"));
        let leaf = categories.iter().find(|c| c.id == services[0].category_id).unwrap();
        assert_eq!(leaf.hcode.as_str(), "1.2.3");

        let locations = store.locations().await;
        assert_eq!(locations.len(), 1);
        assert_eq!(locations[0].latitude.as_deref(), Some("26.4"));
        assert_eq!(locations[0].longitude.as_deref(), Some("80.3"));
    }

    #[tokio::test]
    async fn repeated_reconciliation_is_idempotent() {
        let (store, reconciler) = setup();
        let mut total = ReconcileCounts::default();
        total += reconciler.reconcile(&ravi()).await.unwrap();
        let after_one = store.catalog_counts().await.unwrap();
        total += reconciler.reconcile(&ravi()).await.unwrap();
        total += reconciler.reconcile(&ravi()).await.unwrap();

        assert_eq!(total, ReconcileCounts { inserted: 1, updated: 2 });
        assert_eq!(store.catalog_counts().await.unwrap(), after_one);
    }

    #[tokio::test]
    async fn every_child_category_extends_its_parent() {
        let (store, reconciler) = setup();
        reconciler.reconcile(&ravi()).await.unwrap();
        let categories = store.categories().await;
        for node in &categories {
            match node.parent_id {
                Some(parent_id) => {
                    let parent = categories.iter().find(|c| c.id == parent_id).unwrap();
                    assert_eq!(
                        node.hcode.as_str(),
                        format!("{}.{}", parent.hcode, node.hcode.last_segment())
                    );
                }
                None => assert_eq!(node.hcode.depth(), 1),
            }
        }
    }

    #[tokio::test]
    async fn entries_without_ids_are_skipped_at_their_level() {
        let (store, reconciler) = setup();
        let mut record = ravi();
        record.service_category[0].service_sub_category[0]
            .service
            .push(serde_json::from_value(serde_json::json!({"serviceName": "Nameless"})).unwrap());
        record.service_category.push(
            serde_json::from_value(serde_json::json!({"serviceCategoryId": 0, "serviceCategoryName": "Zero"}))
                .unwrap(),
        );

        reconciler.reconcile(&record).await.unwrap();
        assert_eq!(store.categories().await.len(), 3);
        assert_eq!(store.services().await.len(), 1);
    }

    #[tokio::test]
    async fn record_without_categories_still_creates_account_and_seller() {
        let (store, reconciler) = setup();
        let mut record = ravi();
        record.service_category.clear();

        let counts = reconciler.reconcile(&record).await.unwrap();
        assert_eq!(counts.inserted, 1);
        assert_eq!(store.sellers().await.len(), 1);
        assert!(store.categories().await.is_empty());
    }

    #[tokio::test]
    async fn record_without_id_is_rejected() {
        let (_, reconciler) = setup();
        let mut record = ravi();
        record.artisan_id = Some(ExternalId::Number(0));
        assert!(matches!(
            reconciler.reconcile(&record).await,
            Err(ReconcileError::MissingId)
        ));
    }

    #[tokio::test]
    async fn resync_refreshes_contact_but_not_category_names() {
        let (store, reconciler) = setup();
        reconciler.reconcile(&ravi()).await.unwrap();

        let mut changed = ravi();
        changed.contact_no = Some("9000000009".into());
        changed.service_category[0].service_category_name = Some("Household".into());
        reconciler.reconcile(&changed).await.unwrap();

        let accounts = store.accounts().await;
        assert_eq!(accounts[0].mobile.as_deref(), Some("9000000009"));
        let root = store
            .categories()
            .await
            .into_iter()
            .find(|c| c.hcode.as_str() == "1")
            .unwrap();
        assert_eq!(root.name, "Home");
    }
}
