//! `PostgreSQL`-backed [`CatalogStore`].
//!
//! Every upsert is `INSERT ... ON CONFLICT DO NOTHING RETURNING` followed by a
//! fetch of the existing row, so the "created" signal comes straight from the
//! database and repeated syncs converge on the same rows.

use anyhow::Context;
use artisync_core::{
    Account, AccountDraft, CallStatRecord, Category, CategoryDraft, Hcode, Roles, SellerProfile,
    SellerService, ServiceDraft, ServiceLocation,
};
use async_trait::async_trait;
use chrono::{Days, NaiveDate, NaiveTime};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{check_category_lineage, CatalogCounts, CatalogStore, StoreError, Upserted};

const ACCOUNT_COLUMNS: &str = "id, fullname, mobile, last_location, roles, refresh_token, source, source_id, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PgCatalogStore {
    pool: PgPool,
}

impl PgCatalogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Connect and bring the schema up to date.
    pub async fn connect_and_migrate(database_url: &str) -> anyhow::Result<Self> {
        let store = Self::connect(database_url)
            .await
            .context("connecting to postgres")?;
        store.migrate().await.context("applying migrations")?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("catalog schema migrated");
        Ok(())
    }

    async fn category_hcode(&self, id: i64) -> Result<Hcode, StoreError> {
        let raw: String = sqlx::query_scalar("SELECT hcode FROM categories WHERE id = $1")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Hcode::parse(&raw)
            .ok_or_else(|| StoreError::Integrity(format!("stored category {id} has malformed hcode {raw}")))
    }
}

fn account_from_row(row: &PgRow) -> Result<Account, StoreError> {
    let roles: Option<Json<Roles>> = row.try_get("roles")?;
    Ok(Account {
        id: row.try_get("id")?,
        fullname: row.try_get("fullname")?,
        mobile: row.try_get("mobile")?,
        last_location: row.try_get("last_location")?,
        roles: roles.map(|r| r.0).unwrap_or_default(),
        refresh_token: row.try_get("refresh_token")?,
        source: row.try_get("source")?,
        source_id: row.try_get("source_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn seller_from_row(row: &PgRow) -> Result<SellerProfile, StoreError> {
    Ok(SellerProfile {
        id: row.try_get("id")?,
        user_account_id: row.try_get("user_account_id")?,
        fullname: row.try_get("fullname")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn category_from_row(row: &PgRow) -> Result<Category, StoreError> {
    let raw: String = row.try_get("hcode")?;
    let hcode = Hcode::parse(&raw)
        .ok_or_else(|| StoreError::Integrity(format!("malformed hcode in categories: {raw}")))?;
    Ok(Category {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        parent_id: row.try_get("parent_id")?,
        hcode,
    })
}

fn service_from_row(row: &PgRow) -> Result<SellerService, StoreError> {
    Ok(SellerService {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        seller_id: row.try_get("seller_id")?,
        co_ordinates: row.try_get("co_ordinates")?,
        category_id: row.try_get("category_id")?,
    })
}

fn location_from_row(row: &PgRow) -> Result<ServiceLocation, StoreError> {
    Ok(ServiceLocation {
        id: row.try_get("id")?,
        seller_service_id: row.try_get("seller_service_id")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    async fn upsert_account(&self, draft: &AccountDraft) -> Result<Upserted<Account>, StoreError> {
        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO user_accounts (id, fullname, mobile, last_location, roles, source, source_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (source, source_id) DO NOTHING
            RETURNING {ACCOUNT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(&draft.fullname)
        .bind(&draft.mobile)
        .bind(&draft.last_location)
        .bind(Json(Roles::artisan()))
        .bind(&draft.source)
        .bind(&draft.source_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok(Upserted::created(account_from_row(&row)?));
        }

        let row = sqlx::query(&format!(
            r#"
            UPDATE user_accounts
               SET fullname = $3,
                   mobile = $4,
                   last_location = $5,
                   updated_at = NOW()
             WHERE source = $1
               AND source_id = $2
            RETURNING {ACCOUNT_COLUMNS}
            "#
        ))
        .bind(&draft.source)
        .bind(&draft.source_id)
        .bind(&draft.fullname)
        .bind(&draft.mobile)
        .bind(&draft.last_location)
        .fetch_one(&self.pool)
        .await?;
        Ok(Upserted::existing(account_from_row(&row)?))
    }

    async fn ensure_seller(
        &self,
        account_id: Uuid,
        fullname: Option<&str>,
    ) -> Result<Upserted<SellerProfile>, StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO sellers (user_account_id, fullname)
            VALUES ($1, $2)
            ON CONFLICT (user_account_id) DO NOTHING
            RETURNING id, user_account_id, fullname, created_at, updated_at
            "#,
        )
        .bind(account_id)
        .bind(fullname)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok(Upserted::created(seller_from_row(&row)?));
        }

        let row = sqlx::query(
            "SELECT id, user_account_id, fullname, created_at, updated_at FROM sellers WHERE user_account_id = $1",
        )
        .bind(account_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(Upserted::existing(seller_from_row(&row)?))
    }

    async fn ensure_category(&self, draft: &CategoryDraft) -> Result<Upserted<Category>, StoreError> {
        let parent_hcode = match draft.parent_id {
            Some(parent_id) => Some(self.category_hcode(parent_id).await?),
            None => None,
        };
        check_category_lineage(draft, parent_hcode.as_ref())?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO categories (name, parent_id, hcode)
            VALUES ($1, $2, $3)
            ON CONFLICT (hcode) DO NOTHING
            RETURNING id, name, parent_id, hcode
            "#,
        )
        .bind(&draft.name)
        .bind(draft.parent_id)
        .bind(draft.hcode.as_str())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            debug!(hcode = %draft.hcode, "category created");
            return Ok(Upserted::created(category_from_row(&row)?));
        }

        let row = sqlx::query("SELECT id, name, parent_id, hcode FROM categories WHERE hcode = $1")
            .bind(draft.hcode.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(Upserted::existing(category_from_row(&row)?))
    }

    async fn ensure_service(&self, draft: &ServiceDraft) -> Result<Upserted<SellerService>, StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO seller_services (name, description, seller_id, co_ordinates, category_id)
            VALUES ($1, NULL, $2, $3, $4)
            ON CONFLICT (seller_id, category_id, name) DO NOTHING
            RETURNING id, name, description, seller_id, co_ordinates, category_id
            "#,
        )
        .bind(&draft.name)
        .bind(draft.seller_id)
        .bind(&draft.co_ordinates)
        .bind(draft.category_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok(Upserted::created(service_from_row(&row)?));
        }

        let row = sqlx::query(
            r#"
            SELECT id, name, description, seller_id, co_ordinates, category_id
              FROM seller_services
             WHERE seller_id = $1
               AND category_id = $2
               AND name = $3
            "#,
        )
        .bind(draft.seller_id)
        .bind(draft.category_id)
        .bind(&draft.name)
        .fetch_one(&self.pool)
        .await?;
        Ok(Upserted::existing(service_from_row(&row)?))
    }

    async fn ensure_service_location(
        &self,
        seller_service_id: i64,
        latitude: Option<&str>,
        longitude: Option<&str>,
    ) -> Result<Upserted<ServiceLocation>, StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO seller_service_locations (seller_service_id, latitude, longitude)
            VALUES ($1, $2, $3)
            ON CONFLICT (seller_service_id) DO NOTHING
            RETURNING id, seller_service_id, latitude, longitude, created_at
            "#,
        )
        .bind(seller_service_id)
        .bind(latitude)
        .bind(longitude)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok(Upserted::created(location_from_row(&row)?));
        }

        let row = sqlx::query(
            r#"
            SELECT id, seller_service_id, latitude, longitude, created_at
              FROM seller_service_locations
             WHERE seller_service_id = $1
            "#,
        )
        .bind(seller_service_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(Upserted::existing(location_from_row(&row)?))
    }

    async fn call_stats_for_date(
        &self,
        source: &str,
        date: NaiveDate,
    ) -> Result<Vec<CallStatRecord>, StoreError> {
        let day_start = date.and_time(NaiveTime::MIN).and_utc();
        let day_end = date
            .checked_add_days(Days::new(1))
            .ok_or_else(|| StoreError::Integrity(format!("date {date} has no successor")))?
            .and_time(NaiveTime::MIN)
            .and_utc();

        let rows = sqlx::query(
            r#"
            SELECT ua.source_id AS external_id,
                   COUNT(uac.id) AS calls
              FROM user_account_calls uac
              JOIN sellers s ON uac.seller_id = s.id
              JOIN user_accounts ua ON s.user_account_id = ua.id
             WHERE ua.source = $1
               AND ua.source_id IS NOT NULL
               AND uac.created_at >= $2
               AND uac.created_at < $3
             GROUP BY ua.source_id
             ORDER BY ua.source_id
            "#,
        )
        .bind(source)
        .bind(day_start)
        .bind(day_end)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(CallStatRecord {
                external_id: row.try_get("external_id")?,
                calls: row.try_get("calls")?,
            });
        }
        Ok(out)
    }

    async fn catalog_counts(&self) -> Result<CatalogCounts, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT (SELECT COUNT(*) FROM user_accounts) AS accounts,
                   (SELECT COUNT(*) FROM sellers) AS sellers,
                   (SELECT COUNT(*) FROM categories) AS categories,
                   (SELECT COUNT(*) FROM seller_services) AS services,
                   (SELECT COUNT(*) FROM seller_service_locations) AS locations
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let count = |column: &str| -> Result<u64, StoreError> {
            let value: i64 = row.try_get(column)?;
            Ok(value.max(0) as u64)
        };
        Ok(CatalogCounts {
            accounts: count("accounts")?,
            sellers: count("sellers")?,
            categories: count("categories")?,
            services: count("services")?,
            locations: count("locations")?,
        })
    }
}
