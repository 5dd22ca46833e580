//! SQLite-backed destination stores for resolved disclosure records.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use radar_core::{ResolvedRecord, StoreRole};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Sqlite, Transaction};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("{role} store rejected record: {reason}")]
    Rejected { role: StoreRole, reason: String },
}

/// One destination for resolved records. Writes are buffered until `commit`.
#[async_trait]
pub trait DisclosureStore: Send {
    /// Row id of the record stored under `(source_tag, natural_key)`, if any.
    async fn find_existing(
        &mut self,
        source_tag: &str,
        natural_key: &str,
    ) -> Result<Option<String>, StoreError>;

    async fn insert(&mut self, record: &ResolvedRecord) -> Result<String, StoreError>;

    /// Overwrite every mutable column of row `id` and refresh `last_updated`.
    async fn update(&mut self, id: &str, record: &ResolvedRecord) -> Result<(), StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;
}

/// Open a SQLite pool. A single connection keeps `sqlite::memory:` databases alive.
pub async fn open_pool(url: &str) -> Result<SqlitePool, StoreError> {
    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None::<Duration>)
        .max_lifetime(None::<Duration>)
        .connect_with(options)
        .await?;
    Ok(pool)
}

pub async fn migrate(role: StoreRole, pool: &SqlitePool) -> Result<(), StoreError> {
    match role {
        StoreRole::Linked => sqlx::migrate!("../../migrations/linked").run(pool).await?,
        StoreRole::Orphan => sqlx::migrate!("../../migrations/orphan").run(pool).await?,
    }
    tracing::debug!(%role, "store schema up to date");
    Ok(())
}

pub struct SqlxStore {
    role: StoreRole,
    pool: SqlitePool,
    tx: Option<Transaction<'static, Sqlite>>,
}

impl SqlxStore {
    pub fn new(role: StoreRole, pool: SqlitePool) -> Self {
        Self {
            role,
            pool,
            tx: None,
        }
    }

    /// Open `url`, apply the role's migrations and wrap the pool.
    pub async fn connect(role: StoreRole, url: &str) -> Result<Self, StoreError> {
        let pool = open_pool(url).await?;
        migrate(role, &pool).await?;
        Ok(Self::new(role, pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn transaction(&mut self) -> Result<&mut Transaction<'static, Sqlite>, StoreError> {
        let tx = match self.tx.take() {
            Some(tx) => tx,
            None => self.pool.begin().await?,
        };
        Ok(self.tx.insert(tx))
    }

    fn check_destination(&self, record: &ResolvedRecord) -> Result<(), StoreError> {
        if record.destination() == self.role {
            return Ok(());
        }
        let reason = match self.role {
            StoreRole::Linked => "record has no resolved company code",
            StoreRole::Orphan => "record carries a resolved company code",
        };
        Err(StoreError::Rejected {
            role: self.role,
            reason: reason.to_string(),
        })
    }
}

#[async_trait]
impl DisclosureStore for SqlxStore {
    async fn find_existing(
        &mut self,
        source_tag: &str,
        natural_key: &str,
    ) -> Result<Option<String>, StoreError> {
        let tx = self.transaction().await?;
        let row = sqlx::query(
            "SELECT id FROM disclosure_records WHERE source_tag = ? AND natural_key = ? LIMIT 1",
        )
        .bind(source_tag)
        .bind(natural_key)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(row.map(|r| r.try_get::<String, _>("id")).transpose()?)
    }

    async fn insert(&mut self, record: &ResolvedRecord) -> Result<String, StoreError> {
        self.check_destination(record)?;
        let payload_json = serde_json::to_string(&record.record.payload)?;
        let raw = &record.record;
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let tx = self.transaction().await?;
        sqlx::query(
            r#"
            INSERT INTO disclosure_records (
                id, source_kind, source_tag, natural_key, company_code, match_tier,
                raw_company_name, raw_company_code, raw_tax_id, roc_year, market, era,
                payload_json, payload_sha256, source_url, fetched_at, created_at, last_updated
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(raw.source_kind.as_str())
        .bind(&raw.source_tag)
        .bind(raw.natural_key.storage_key())
        .bind(record.company_code.as_deref())
        .bind(record.tier.map(|t| t.as_str()))
        .bind(&raw.raw_company_name)
        .bind(raw.raw_company_code.as_deref())
        .bind(raw.raw_tax_id.as_deref())
        .bind(raw.roc_year)
        .bind(raw.market.map(|m| m.as_str()))
        .bind(raw.era.map(i64::from))
        .bind(payload_json)
        .bind(&raw.provenance.payload_sha256)
        .bind(&raw.provenance.source_url)
        .bind(raw.provenance.fetched_at)
        .bind(now)
        .bind(now)
        .execute(&mut **tx)
        .await?;
        Ok(id)
    }

    async fn update(&mut self, id: &str, record: &ResolvedRecord) -> Result<(), StoreError> {
        self.check_destination(record)?;
        let payload_json = serde_json::to_string(&record.record.payload)?;
        let raw = &record.record;

        let tx = self.transaction().await?;
        sqlx::query(
            r#"
            UPDATE disclosure_records SET
                source_kind = ?, company_code = ?, match_tier = ?, raw_company_name = ?,
                raw_company_code = ?, raw_tax_id = ?, roc_year = ?, market = ?, era = ?,
                payload_json = ?, payload_sha256 = ?, source_url = ?, fetched_at = ?,
                last_updated = ?
            WHERE id = ?
            "#,
        )
        .bind(raw.source_kind.as_str())
        .bind(record.company_code.as_deref())
        .bind(record.tier.map(|t| t.as_str()))
        .bind(&raw.raw_company_name)
        .bind(raw.raw_company_code.as_deref())
        .bind(raw.raw_tax_id.as_deref())
        .bind(raw.roc_year)
        .bind(raw.market.map(|m| m.as_str()))
        .bind(raw.era.map(i64::from))
        .bind(payload_json)
        .bind(&raw.provenance.payload_sha256)
        .bind(&raw.provenance.source_url)
        .bind(raw.provenance.fetched_at)
        .bind(Utc::now())
        .bind(id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        if let Some(tx) = self.tx.take() {
            tx.commit().await?;
        }
        Ok(())
    }
}
