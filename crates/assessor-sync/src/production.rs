//! Production store contract
//!
//! The commit engine only needs "write these typed records and tell me
//! which ones succeeded". Records are keyed by `(entity type, identifying
//! key)` and written update-in-place: committing a record whose key
//! already exists overwrites it and reports [`WriteOutcome::Updated`].

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::SyncResult;
use crate::import::FieldValue;

/// A typed entity ready for the production store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub entity_type: String,
    pub key: String,
    pub fields: BTreeMap<String, FieldValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    Inserted,
    Updated,
}

/// `entity_type.field` must name the key of an existing `target_entity` record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub entity_type: String,
    pub field: String,
    pub target_entity: String,
}

#[async_trait]
pub trait ProductionStore: Send + Sync {
    /// Constraint violations that would make `record` unacceptable
    async fn validate(&self, record: &EntityRecord) -> SyncResult<Vec<String>>;

    /// Write every record independently
    ///
    /// The outer error is reserved for the store being unusable; a single
    /// record's failure is reported in its slot of the returned vector.
    async fn write_records(
        &self,
        records: &[EntityRecord],
    ) -> SyncResult<Vec<Result<WriteOutcome, String>>>;

    async fn get(&self, entity_type: &str, key: &str) -> SyncResult<Option<EntityRecord>>;

    async fn count(&self, entity_type: &str) -> SyncResult<u64>;
}

async fn check_references<S: ProductionStore + ?Sized>(
    store: &S,
    references: &[Reference],
    record: &EntityRecord,
) -> SyncResult<Vec<String>> {
    let mut errors = Vec::new();
    for reference in references.iter().filter(|r| r.entity_type == record.entity_type) {
        let Some(target_key) = record.fields.get(&reference.field).and_then(FieldValue::as_key) else {
            continue;
        };
        if store.get(&reference.target_entity, &target_key).await?.is_none() {
            errors.push(format!(
                "field '{}' references unknown {} '{}'",
                reference.field, reference.target_entity, target_key
            ));
        }
    }
    Ok(errors)
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Default)]
pub struct MemoryProductionStore {
    records: RwLock<BTreeMap<(String, String), EntityRecord>>,
    references: Vec<Reference>,
}

impl MemoryProductionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_references(mut self, references: Vec<Reference>) -> Self {
        self.references = references;
        self
    }
}

#[async_trait]
impl ProductionStore for MemoryProductionStore {
    async fn validate(&self, record: &EntityRecord) -> SyncResult<Vec<String>> {
        check_references(self, &self.references, record).await
    }

    async fn write_records(
        &self,
        records: &[EntityRecord],
    ) -> SyncResult<Vec<Result<WriteOutcome, String>>> {
        let mut stored = self.records.write().await;
        Ok(records
            .iter()
            .map(|record| {
                let key = (record.entity_type.clone(), record.key.clone());
                match stored.insert(key, record.clone()) {
                    Some(_) => Ok(WriteOutcome::Updated),
                    None => Ok(WriteOutcome::Inserted),
                }
            })
            .collect())
    }

    async fn get(&self, entity_type: &str, key: &str) -> SyncResult<Option<EntityRecord>> {
        Ok(self
            .records
            .read()
            .await
            .get(&(entity_type.to_string(), key.to_string()))
            .cloned())
    }

    async fn count(&self, entity_type: &str) -> SyncResult<u64> {
        Ok(self
            .records
            .read()
            .await
            .keys()
            .filter(|(t, _)| t == entity_type)
            .count() as u64)
    }
}

// ============================================================================
// SQLite store
// ============================================================================

#[derive(Clone)]
pub struct SqliteProductionStore {
    pool: SqlitePool,
    references: Vec<Reference>,
}

impl SqliteProductionStore {
    pub async fn new(pool: SqlitePool) -> SyncResult<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entity_records (
                entity_type TEXT NOT NULL,
                entity_key TEXT NOT NULL,
                fields TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (entity_type, entity_key)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            references: Vec::new(),
        })
    }

    pub fn with_references(mut self, references: Vec<Reference>) -> Self {
        self.references = references;
        self
    }
}

#[async_trait]
impl ProductionStore for SqliteProductionStore {
    async fn validate(&self, record: &EntityRecord) -> SyncResult<Vec<String>> {
        check_references(self, &self.references, record).await
    }

    async fn write_records(
        &self,
        records: &[EntityRecord],
    ) -> SyncResult<Vec<Result<WriteOutcome, String>>> {
        let mut tx = self.pool.begin().await?;
        let mut outcomes = Vec::with_capacity(records.len());
        let now = Utc::now();

        for record in records {
            let fields = match serde_json::to_string(&record.fields) {
                Ok(fields) => fields,
                Err(e) => {
                    outcomes.push(Err(format!("cannot encode fields: {}", e)));
                    continue;
                },
            };

            let exists: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM entity_records WHERE entity_type = ? AND entity_key = ?)",
            )
            .bind(&record.entity_type)
            .bind(&record.key)
            .fetch_one(&mut *tx)
            .await?;

            let written = sqlx::query(
                r#"
                INSERT INTO entity_records (entity_type, entity_key, fields, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT (entity_type, entity_key)
                DO UPDATE SET fields = excluded.fields, updated_at = excluded.updated_at
                "#,
            )
            .bind(&record.entity_type)
            .bind(&record.key)
            .bind(fields)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await;

            outcomes.push(match written {
                Ok(_) if exists => Ok(WriteOutcome::Updated),
                Ok(_) => Ok(WriteOutcome::Inserted),
                Err(e) => Err(e.to_string()),
            });
        }

        tx.commit().await?;
        debug!(records = records.len(), "Production write committed");
        Ok(outcomes)
    }

    async fn get(&self, entity_type: &str, key: &str) -> SyncResult<Option<EntityRecord>> {
        let row = sqlx::query(
            "SELECT fields FROM entity_records WHERE entity_type = ? AND entity_key = ?",
        )
        .bind(entity_type)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(EntityRecord {
                entity_type: entity_type.to_string(),
                key: key.to_string(),
                fields: serde_json::from_str(row.try_get("fields")?)?,
            })),
            None => Ok(None),
        }
    }

    async fn count(&self, entity_type: &str) -> SyncResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entity_records WHERE entity_type = ?")
            .bind(entity_type)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn parcel(key: &str, value: i64) -> EntityRecord {
        EntityRecord {
            entity_type: "property".into(),
            key: key.into(),
            fields: [
                ("propertyId".to_string(), FieldValue::Text(key.into())),
                ("value".to_string(), FieldValue::Integer(value)),
            ]
            .into_iter()
            .collect(),
        }
    }

    async fn exercise_upsert(store: &dyn ProductionStore) {
        let first = store.write_records(&[parcel("BC001", 1), parcel("BC002", 2)]).await.unwrap();
        assert_eq!(first, vec![Ok(WriteOutcome::Inserted), Ok(WriteOutcome::Inserted)]);

        let second = store.write_records(&[parcel("BC001", 10)]).await.unwrap();
        assert_eq!(second, vec![Ok(WriteOutcome::Updated)]);

        assert_eq!(store.count("property").await.unwrap(), 2);
        assert_eq!(store.count("land").await.unwrap(), 0);
        let stored = store.get("property", "BC001").await.unwrap().unwrap();
        assert_eq!(stored.fields["value"], FieldValue::Integer(10));
    }

    #[tokio::test]
    async fn test_memory_store_updates_in_place() {
        exercise_upsert(&MemoryProductionStore::new()).await;
    }

    #[tokio::test]
    async fn test_sqlite_store_updates_in_place() {
        let pool = crate::db::connect("sqlite::memory:").await.unwrap();
        let store = SqliteProductionStore::new(pool).await.unwrap();
        exercise_upsert(&store).await;
    }

    #[tokio::test]
    async fn test_sqlite_store_keeps_decimal_digits() {
        let pool = crate::db::connect("sqlite::memory:").await.unwrap();
        let store = SqliteProductionStore::new(pool).await.unwrap();
        let mut record = parcel("BC001", 1);
        record
            .fields
            .insert("marketValue".into(), FieldValue::Decimal("12345678901234.56".parse().unwrap()));
        record.fields.insert("acres".into(), FieldValue::Decimal("0.1".parse().unwrap()));
        store.write_records(&[record]).await.unwrap();

        let stored = store.get("property", "BC001").await.unwrap().unwrap();
        assert_eq!(stored.fields["marketValue"].to_string(), "12345678901234.56");
        assert_eq!(stored.fields["acres"].to_string(), "0.1");
    }

    #[tokio::test]
    async fn test_references_must_resolve() {
        let store = MemoryProductionStore::new().with_references(vec![Reference {
            entity_type: "improvement".into(),
            field: "propertyId".into(),
            target_entity: "property".into(),
        }]);
        let improvement = EntityRecord {
            entity_type: "improvement".into(),
            key: "I-1".into(),
            fields: [("propertyId".to_string(), FieldValue::Text("BC001".into()))]
                .into_iter()
                .collect(),
        };

        let errors = store.validate(&improvement).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("unknown property 'BC001'"));

        store.write_records(&[parcel("BC001", 1)]).await.unwrap();
        assert!(store.validate(&improvement).await.unwrap().is_empty());
    }
}
