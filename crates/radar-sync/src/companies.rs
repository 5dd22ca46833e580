//! Read access to the canonical company registry and detail enrichment rows.

use async_trait::async_trait;
use chrono::Utc;
use radar_adapters::{CompanyDetail, FetchedPage};
use radar_core::CanonicalCompany;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use crate::store::StoreError;

#[async_trait]
pub trait CompanyRegistry: Send + Sync {
    async fn load_companies(&self) -> Result<Vec<CanonicalCompany>, StoreError>;
}

/// The `companies` table of the linked database.
#[derive(Debug, Clone)]
pub struct SqlCompanyRegistry {
    pool: SqlitePool,
}

impl SqlCompanyRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Codes due for detail enrichment; without `force`, only companies lacking a details row.
    pub async fn detail_candidates(
        &self,
        force: bool,
        only: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<String>, StoreError> {
        let rows = match (only, force) {
            (Some(code), _) => {
                sqlx::query("SELECT code FROM companies WHERE code = ?")
                    .bind(code)
                    .fetch_all(&self.pool)
                    .await?
            }
            (None, true) => {
                sqlx::query("SELECT code FROM companies ORDER BY code")
                    .fetch_all(&self.pool)
                    .await?
            }
            (None, false) => {
                sqlx::query(
                    r#"
                    SELECT c.code FROM companies c
                    LEFT JOIN company_details d ON d.company_code = c.code
                    WHERE d.company_code IS NULL
                       OR d.stakeholder_url IS NULL
                       OR d.governance_url IS NULL
                    ORDER BY c.code
                    "#,
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        let mut codes = rows
            .into_iter()
            .map(|row| row.try_get::<String, _>("code"))
            .collect::<Result<Vec<_>, _>>()?;
        if let Some(limit) = limit {
            codes.truncate(limit);
        }
        Ok(codes)
    }

    /// Store detail links; a missing value never clears one found earlier.
    pub async fn upsert_detail(
        &self,
        detail: &CompanyDetail,
        page: &FetchedPage,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO company_details (
                company_code, stakeholder_url, governance_url,
                source_url, payload_sha256, fetched_at, last_updated
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (company_code) DO UPDATE SET
                stakeholder_url = COALESCE(excluded.stakeholder_url, company_details.stakeholder_url),
                governance_url = COALESCE(excluded.governance_url, company_details.governance_url),
                source_url = excluded.source_url,
                payload_sha256 = excluded.payload_sha256,
                fetched_at = excluded.fetched_at,
                last_updated = excluded.last_updated
            "#,
        )
        .bind(&detail.code)
        .bind(detail.stakeholder_url.as_deref())
        .bind(detail.governance_url.as_deref())
        .bind(&page.url)
        .bind(&page.sha256)
        .bind(page.fetched_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl CompanyRegistry for SqlCompanyRegistry {
    async fn load_companies(&self) -> Result<Vec<CanonicalCompany>, StoreError> {
        let rows = sqlx::query(
            "SELECT code, name, abbreviation, tax_id, chairman FROM companies ORDER BY code",
        )
        .fetch_all(&self.pool)
        .await?;

        let companies = rows
            .into_iter()
            .map(|row| {
                Ok(CanonicalCompany {
                    code: row.try_get("code")?,
                    name: row.try_get("name")?,
                    abbreviation: row.try_get("abbreviation")?,
                    tax_id: row.try_get("tax_id")?,
                    chairman: row.try_get("chairman")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;
        tracing::info!(companies = companies.len(), "loaded canonical company registry");
        Ok(companies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{migrate, open_pool};
    use radar_core::StoreRole;

    async fn seeded_pool() -> SqlitePool {
        let pool = open_pool("sqlite::memory:").await.expect("pool");
        migrate(StoreRole::Linked, &pool).await.expect("migrate");
        for (code, name, tax_id) in [
            ("2330", "台灣積體電路製造股份有限公司", Some("22099131")),
            ("2303", "聯華電子股份有限公司", None),
        ] {
            sqlx::query("INSERT INTO companies (code, name, tax_id) VALUES (?, ?, ?)")
                .bind(code)
                .bind(name)
                .bind(tax_id)
                .execute(&pool)
                .await
                .expect("seed");
        }
        pool
    }

    fn page(code: &str) -> FetchedPage {
        FetchedPage {
            url: format!("https://mopsov.twse.com.tw/mops/web/t05st03?co_id={code}"),
            content_type: "text/html".into(),
            body: Vec::new(),
            sha256: "e3b0c442".into(),
            fetched_at: Utc::now(),
            from_cache: false,
        }
    }

    #[tokio::test]
    async fn registry_rows_load_in_code_order() {
        let registry = SqlCompanyRegistry::new(seeded_pool().await);
        let companies = registry.load_companies().await.expect("load");
        assert_eq!(companies.len(), 2);
        assert_eq!(companies[0].code, "2303");
        assert_eq!(companies[1].tax_id.as_deref(), Some("22099131"));
        assert_eq!(companies[0].abbreviation, None);
    }

    #[tokio::test]
    async fn detail_candidates_skip_completed_companies_unless_forced() {
        let registry = SqlCompanyRegistry::new(seeded_pool().await);
        let complete = CompanyDetail {
            code: "2330".into(),
            stakeholder_url: Some("https://esg.tsmc.com".into()),
            governance_url: Some("https://investor.tsmc.com".into()),
        };
        registry.upsert_detail(&complete, &page("2330")).await.expect("upsert");

        assert_eq!(
            registry.detail_candidates(false, None, None).await.expect("pending"),
            vec!["2303".to_string()]
        );
        assert_eq!(
            registry.detail_candidates(true, None, Some(1)).await.expect("forced"),
            vec!["2303".to_string()]
        );
        assert_eq!(
            registry.detail_candidates(false, Some("2330"), None).await.expect("single"),
            vec!["2330".to_string()]
        );

        let partial = CompanyDetail {
            code: "2330".into(),
            stakeholder_url: None,
            governance_url: Some("https://investor.tsmc.com/governance".into()),
        };
        registry.upsert_detail(&partial, &page("2330")).await.expect("upsert");
        let row = sqlx::query("SELECT stakeholder_url, governance_url FROM company_details WHERE company_code = '2330'")
            .fetch_one(&registry.pool)
            .await
            .expect("row");
        assert_eq!(
            row.try_get::<Option<String>, _>("stakeholder_url").expect("col").as_deref(),
            Some("https://esg.tsmc.com")
        );
        assert_eq!(
            row.try_get::<Option<String>, _>("governance_url").expect("col").as_deref(),
            Some("https://investor.tsmc.com/governance")
        );
    }
}
