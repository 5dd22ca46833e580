//! Reconciliation writer: routes resolved records to the linked or orphan store
//! and upserts them on `(source_tag, natural_key)`.

use std::ops::AddAssign;

use radar_core::{ResolvedRecord, StoreRole};
use serde::Serialize;
use tracing::warn;

use crate::store::{DisclosureStore, StoreError};

pub const DEFAULT_COMMIT_EVERY: usize = 500;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertSummary {
    pub written: usize,
    pub linked: usize,
    pub orphaned: usize,
    pub inserted: usize,
    pub updated: usize,
    pub failed: usize,
}

impl AddAssign for UpsertSummary {
    fn add_assign(&mut self, other: Self) {
        self.written += other.written;
        self.linked += other.linked;
        self.orphaned += other.orphaned;
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.failed += other.failed;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteAction {
    Inserted,
    Updated,
}

pub struct ReconciliationWriter {
    linked: Box<dyn DisclosureStore>,
    orphan: Box<dyn DisclosureStore>,
    commit_every: usize,
    pending: usize,
}

impl ReconciliationWriter {
    pub fn new(linked: Box<dyn DisclosureStore>, orphan: Box<dyn DisclosureStore>) -> Self {
        Self {
            linked,
            orphan,
            commit_every: DEFAULT_COMMIT_EVERY,
            pending: 0,
        }
    }

    pub fn with_commit_every(mut self, commit_every: usize) -> Self {
        self.commit_every = commit_every.max(1);
        self
    }

    /// Write a batch. Per-record failures are counted; only commit failures abort.
    pub async fn upsert(&mut self, records: Vec<ResolvedRecord>) -> Result<UpsertSummary, StoreError> {
        let mut summary = UpsertSummary::default();

        for record in records {
            let role = record.destination();
            match self.write_one(role, &record).await {
                Ok(action) => {
                    summary.written += 1;
                    match role {
                        StoreRole::Linked => summary.linked += 1,
                        StoreRole::Orphan => summary.orphaned += 1,
                    }
                    match action {
                        WriteAction::Inserted => summary.inserted += 1,
                        WriteAction::Updated => summary.updated += 1,
                    }
                }
                Err(err) => {
                    warn!(
                        source_tag = %record.record.source_tag,
                        company = %record.record.raw_company_name,
                        natural_key = ?record.record.natural_key.storage_key(),
                        store = %role,
                        error = %err,
                        "record write failed; skipping"
                    );
                    summary.failed += 1;
                }
            }

            self.pending += 1;
            if self.pending >= self.commit_every {
                self.commit().await?;
            }
        }

        self.commit().await?;
        Ok(summary)
    }

    pub async fn commit(&mut self) -> Result<(), StoreError> {
        self.linked.commit().await?;
        self.orphan.commit().await?;
        self.pending = 0;
        Ok(())
    }

    async fn write_one(
        &mut self,
        role: StoreRole,
        record: &ResolvedRecord,
    ) -> Result<WriteAction, StoreError> {
        let store = match role {
            StoreRole::Linked => &mut self.linked,
            StoreRole::Orphan => &mut self.orphan,
        };

        let Some(key) = record.record.natural_key.storage_key() else {
            store.insert(record).await?;
            return Ok(WriteAction::Inserted);
        };

        match store.find_existing(&record.record.source_tag, &key).await? {
            Some(id) => {
                store.update(&id, record).await?;
                Ok(WriteAction::Updated)
            }
            None => {
                store.insert(record).await?;
                Ok(WriteAction::Inserted)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqlxStore;
    use chrono::Utc;
    use radar_core::{
        MarketSegment, MatchTier, NaturalKey, Payload, Provenance, RawDisclosureRecord,
        SourceKind,
    };
    use serde_json::json;
    use sqlx::sqlite::SqlitePool;
    use sqlx::Row;

    async fn stores() -> (SqlitePool, SqlitePool, ReconciliationWriter) {
        let linked = SqlxStore::connect(StoreRole::Linked, "sqlite::memory:")
            .await
            .expect("linked");
        let orphan = SqlxStore::connect(StoreRole::Orphan, "sqlite::memory:")
            .await
            .expect("orphan");
        sqlx::query("INSERT INTO companies (code, name) VALUES ('2330', '台灣積體電路製造股份有限公司')")
            .execute(linked.pool())
            .await
            .expect("seed");
        let (linked_pool, orphan_pool) = (linked.pool().clone(), orphan.pool().clone());
        let writer = ReconciliationWriter::new(Box::new(linked), Box::new(orphan));
        (linked_pool, orphan_pool, writer)
    }

    fn violation(name: &str, number: Option<&str>, fine: i64) -> RawDisclosureRecord {
        let mut payload = Payload::new();
        payload.insert("fine_amount".into(), json!(fine));
        RawDisclosureRecord {
            source_kind: SourceKind::LaborViolation,
            source_tag: "LaborStandards".into(),
            raw_company_name: name.into(),
            raw_company_code: None,
            raw_tax_id: None,
            natural_key: NaturalKey::disposition(number),
            roc_year: None,
            market: None,
            era: None,
            payload,
            provenance: Provenance {
                source_url: "file:///data/LaborStandards.json".into(),
                payload_sha256: "ab12".into(),
                fetched_at: Utc::now(),
            },
        }
    }

    fn linked(record: RawDisclosureRecord, code: &str) -> ResolvedRecord {
        ResolvedRecord {
            record,
            company_code: Some(code.into()),
            tier: Some(MatchTier::ExactName),
        }
    }

    async fn count(pool: &SqlitePool) -> i64 {
        sqlx::query("SELECT COUNT(*) AS n FROM disclosure_records")
            .fetch_one(pool)
            .await
            .expect("count")
            .get("n")
    }

    #[tokio::test]
    async fn upserting_twice_keeps_one_row_with_latest_values() {
        let (linked_pool, _, mut writer) = stores().await;
        let name = "台灣積體電路製造股份有限公司";

        let first = writer
            .upsert(vec![linked(violation(name, Some("北市勞字1130001"), 20_000), "2330")])
            .await
            .expect("first");
        assert_eq!(first.inserted, 1);
        assert_eq!(first.linked, 1);

        let second = writer
            .upsert(vec![linked(violation(name, Some("北市勞字1130001"), 50_000), "2330")])
            .await
            .expect("second");
        assert_eq!(second.updated, 1);
        assert_eq!(second.inserted, 0);

        assert_eq!(count(&linked_pool).await, 1);
        let payload: String = sqlx::query("SELECT payload_json FROM disclosure_records")
            .fetch_one(&linked_pool)
            .await
            .expect("row")
            .get("payload_json");
        assert!(payload.contains("50000"));
    }

    #[tokio::test]
    async fn unresolved_records_land_only_in_the_orphan_store() {
        let (linked_pool, orphan_pool, mut writer) = stores().await;
        let summary = writer
            .upsert(vec![
                ResolvedRecord::unresolved(violation("無名工作室", Some("A-1"), 1_000)),
                linked(violation("台灣積體電路製造股份有限公司", Some("A-2"), 2_000), "2330"),
            ])
            .await
            .expect("upsert");

        assert_eq!(summary.orphaned, 1);
        assert_eq!(summary.linked, 1);
        assert_eq!(summary.written, 2);
        assert_eq!(count(&orphan_pool).await, 1);
        assert_eq!(count(&linked_pool).await, 1);

        let code: Option<String> = sqlx::query("SELECT company_code FROM disclosure_records")
            .fetch_one(&orphan_pool)
            .await
            .expect("row")
            .get("company_code");
        assert_eq!(code, None);
    }

    #[tokio::test]
    async fn records_without_natural_key_always_insert() {
        let (_, orphan_pool, mut writer) = stores().await;
        for _ in 0..2 {
            let summary = writer
                .upsert(vec![ResolvedRecord::unresolved(violation("無名工作室", None, 0))])
                .await
                .expect("upsert");
            assert_eq!(summary.inserted, 1);
        }
        assert_eq!(count(&orphan_pool).await, 2);
    }

    #[tokio::test]
    async fn failed_record_is_counted_and_batch_continues() {
        let (linked_pool, _, mut writer) = stores().await;
        let mut periodic = violation("聯華電子股份有限公司", None, 0);
        periodic.source_kind = SourceKind::EmployeeBenefit;
        periodic.source_tag = "t100sb15".into();
        periodic.natural_key = NaturalKey::Periodic {
            raw_code: "2303".into(),
            roc_year: 113,
            market: MarketSegment::Sii,
        };

        let summary = writer
            .with_commit_every(1)
            .upsert(vec![
                // 2303 is not in the registry, so the foreign key rejects it.
                linked(periodic, "2303"),
                linked(violation("台灣積體電路製造股份有限公司", Some("B-7"), 9_000), "2330"),
            ])
            .await
            .expect("batch");

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.written, 1);
        assert_eq!(count(&linked_pool).await, 1);
    }

    #[tokio::test]
    async fn store_refuses_records_routed_to_the_wrong_role() {
        let mut orphan = SqlxStore::connect(StoreRole::Orphan, "sqlite::memory:")
            .await
            .expect("orphan");
        let record = linked(violation("台灣積體電路製造股份有限公司", Some("C-3"), 5_000), "2330");

        let err = orphan.insert(&record).await.expect_err("linked record in orphan store");
        assert!(matches!(err, StoreError::Rejected { role: StoreRole::Orphan, .. }));
        orphan.commit().await.expect("commit");
        assert_eq!(count(orphan.pool()).await, 0);
    }

    #[test]
    fn summaries_accumulate() {
        let mut total = UpsertSummary::default();
        total += UpsertSummary {
            written: 2,
            linked: 1,
            orphaned: 1,
            inserted: 2,
            updated: 0,
            failed: 1,
        };
        total += UpsertSummary {
            written: 1,
            linked: 1,
            updated: 1,
            ..Default::default()
        };
        assert_eq!(total.written, 3);
        assert_eq!(total.linked, 2);
        assert_eq!(total.failed, 1);
    }
}
