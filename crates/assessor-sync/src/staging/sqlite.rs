//! SQLite staging store
//!
//! Raw and mapped field maps and error lists are stored as JSON text; ids
//! and statuses as plain text so the tables stay readable from the
//! `sqlite3` shell.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use super::{ImportBatch, StagedRecord, StagingStore, ValidationStatus};
use crate::error::{SyncError, SyncResult};

/// Ids per `IN (...)` list, well under SQLite's bound-parameter limit
const ID_CHUNK: usize = 500;

const RECORD_COLUMNS: &str = "id, import_id, entity_type, row_number, line_number, raw_fields, \
     fields, status, errors, staged_at, committed_at";

#[derive(Clone)]
pub struct SqliteStagingStore {
    pool: SqlitePool,
}

impl SqliteStagingStore {
    /// Wrap `pool`, creating the staging tables if needed
    pub async fn new(pool: SqlitePool) -> SyncResult<Self> {
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    async fn init(&self) -> SyncResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS import_batches (
                import_id TEXT PRIMARY KEY,
                entity_type TEXT NOT NULL,
                source_name TEXT NOT NULL,
                created_at TEXT NOT NULL,
                row_count INTEGER NOT NULL,
                valid_count INTEGER NOT NULL,
                invalid_count INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS staged_records (
                id TEXT PRIMARY KEY,
                import_id TEXT NOT NULL REFERENCES import_batches(import_id),
                entity_type TEXT NOT NULL,
                row_number INTEGER NOT NULL,
                line_number INTEGER NOT NULL,
                raw_fields TEXT NOT NULL,
                fields TEXT NOT NULL,
                status TEXT NOT NULL,
                errors TEXT NOT NULL,
                staged_at TEXT NOT NULL,
                committed_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_staged_records_import ON staged_records (import_id, row_number)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn batch_from_row(row: &SqliteRow) -> SyncResult<ImportBatch> {
    Ok(ImportBatch {
        import_id: row.try_get("import_id")?,
        entity_type: row.try_get("entity_type")?,
        source_name: row.try_get("source_name")?,
        created_at: row.try_get("created_at")?,
        row_count: row.try_get::<i64, _>("row_count")? as usize,
        valid_count: row.try_get::<i64, _>("valid_count")? as usize,
        invalid_count: row.try_get::<i64, _>("invalid_count")? as usize,
    })
}

fn record_from_row(row: &SqliteRow) -> SyncResult<StagedRecord> {
    let id: String = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    Ok(StagedRecord {
        id: Uuid::parse_str(&id)
            .map_err(|e| SyncError::storage(format!("bad staged record id '{}': {}", id, e)))?,
        import_id: row.try_get("import_id")?,
        entity_type: row.try_get("entity_type")?,
        row_number: row.try_get::<i64, _>("row_number")? as usize,
        line_number: row.try_get::<i64, _>("line_number")? as usize,
        raw_fields: serde_json::from_str(row.try_get("raw_fields")?)?,
        fields: serde_json::from_str(row.try_get("fields")?)?,
        status: status.parse()?,
        errors: serde_json::from_str(row.try_get("errors")?)?,
        staged_at: row.try_get("staged_at")?,
        committed_at: row.try_get("committed_at")?,
    })
}

#[async_trait]
impl StagingStore for SqliteStagingStore {
    async fn insert_batch(&self, batch: &ImportBatch, records: &[StagedRecord]) -> SyncResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO import_batches
                (import_id, entity_type, source_name, created_at, row_count, valid_count, invalid_count)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&batch.import_id)
        .bind(&batch.entity_type)
        .bind(&batch.source_name)
        .bind(batch.created_at)
        .bind(batch.row_count as i64)
        .bind(batch.valid_count as i64)
        .bind(batch.invalid_count as i64)
        .execute(&mut *tx)
        .await?;

        for record in records {
            sqlx::query(
                r#"
                INSERT INTO staged_records
                    (id, import_id, entity_type, row_number, line_number, raw_fields,
                     fields, status, errors, staged_at, committed_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(record.id.to_string())
            .bind(&record.import_id)
            .bind(&record.entity_type)
            .bind(record.row_number as i64)
            .bind(record.line_number as i64)
            .bind(serde_json::to_string(&record.raw_fields)?)
            .bind(serde_json::to_string(&record.fields)?)
            .bind(record.status.as_str())
            .bind(serde_json::to_string(&record.errors)?)
            .bind(record.staged_at)
            .bind(record.committed_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(import_id = %batch.import_id, records = records.len(), "Staged batch persisted");
        Ok(())
    }

    async fn get_batch(&self, import_id: &str) -> SyncResult<Option<ImportBatch>> {
        let row = sqlx::query("SELECT * FROM import_batches WHERE import_id = ?")
            .bind(import_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(batch_from_row).transpose()
    }

    async fn list_batches(&self) -> SyncResult<Vec<ImportBatch>> {
        let rows = sqlx::query("SELECT * FROM import_batches ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(batch_from_row).collect()
    }

    async fn records_for_import(&self, import_id: &str) -> SyncResult<Vec<StagedRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM staged_records WHERE import_id = ? ORDER BY row_number",
            RECORD_COLUMNS
        ))
        .bind(import_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn records_by_id(&self, ids: &[Uuid]) -> SyncResult<Vec<StagedRecord>> {
        let mut records = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(ID_CHUNK) {
            let mut query = QueryBuilder::<Sqlite>::new(format!(
                "SELECT {} FROM staged_records WHERE id IN (",
                RECORD_COLUMNS
            ));
            let mut list = query.separated(", ");
            for id in chunk {
                list.push_bind(id.to_string());
            }
            list.push_unseparated(")");

            for row in query.build().fetch_all(&self.pool).await? {
                records.push(record_from_row(&row)?);
            }
        }
        records.sort_by(|a, b| {
            (a.staged_at, &a.import_id, a.row_number).cmp(&(b.staged_at, &b.import_id, b.row_number))
        });
        Ok(records)
    }

    async fn mark_committed(&self, ids: &[Uuid], at: DateTime<Utc>) -> SyncResult<()> {
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query("UPDATE staged_records SET committed_at = ? WHERE id = ?")
                .bind(at)
                .bind(id.to_string())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::import::FieldValue;
    use tempfile::TempDir;

    async fn store(dir: &TempDir) -> SqliteStagingStore {
        let url = format!("sqlite://{}", dir.path().join("staging.db").display());
        SqliteStagingStore::new(crate::db::connect(&url).await.unwrap())
            .await
            .unwrap()
    }

    fn sample(import_id: &str) -> (ImportBatch, Vec<StagedRecord>) {
        let mut good = StagedRecord::pending(import_id, "property", 1, 1);
        good.raw_fields.insert("0".into(), "BC001".into());
        good.fields.insert("propertyId".into(), FieldValue::Text("BC001".into()));
        good.fields.insert("acres".into(), FieldValue::Decimal("0.25".parse().unwrap()));
        good.fields.insert("value".into(), FieldValue::Integer(150000));
        good.settle();

        let mut bad = StagedRecord::pending(import_id, "property", 2, 2);
        bad.errors.push("expected 7 columns, found 2".into());
        bad.settle();

        let batch = ImportBatch {
            import_id: import_id.to_string(),
            entity_type: "property".into(),
            source_name: "/pub/parcel.csv".into(),
            created_at: Utc::now(),
            row_count: 2,
            valid_count: 1,
            invalid_count: 1,
        };
        (batch, vec![bad, good])
    }

    #[tokio::test]
    async fn test_batch_and_records_survive_a_reopen() {
        let dir = TempDir::new().unwrap();
        let (batch, records) = sample("imp_x");
        store(&dir).await.insert_batch(&batch, &records).await.unwrap();

        let reopened = store(&dir).await;
        let loaded = reopened.get_batch("imp_x").await.unwrap().unwrap();
        assert_eq!(loaded.invalid_count, 1);
        assert_eq!(loaded.source_name, "/pub/parcel.csv");

        let rows = reopened.records_for_import("imp_x").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].row_number, 1);
        assert_eq!(rows[0].fields["acres"], FieldValue::Decimal("0.25".parse().unwrap()));
        assert_eq!(rows[0].fields["value"], FieldValue::Integer(150000));
        assert_eq!(rows[1].status, ValidationStatus::Invalid);
        assert_eq!(rows[1].errors, vec!["expected 7 columns, found 2".to_string()]);
    }

    #[tokio::test]
    async fn test_lookup_by_id_and_mark_committed() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let (batch, records) = sample("imp_y");
        store.insert_batch(&batch, &records).await.unwrap();

        let ids: Vec<Uuid> = records.iter().map(|r| r.id).chain([Uuid::new_v4()]).collect();
        let found = store.records_by_id(&ids).await.unwrap();
        assert_eq!(found.len(), 2);

        store.mark_committed(&[records[1].id], Utc::now()).await.unwrap();
        let rows = store.records_for_import("imp_y").await.unwrap();
        assert!(rows[0].committed_at.is_some());
        assert!(rows[1].committed_at.is_none());
    }

    #[tokio::test]
    async fn test_unknown_import_is_empty_and_batches_list() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        assert!(store.get_batch("imp_none").await.unwrap().is_none());
        assert!(store.records_for_import("imp_none").await.unwrap().is_empty());

        let (batch, records) = sample("imp_z");
        store.insert_batch(&batch, &records).await.unwrap();
        assert_eq!(store.list_batches().await.unwrap().len(), 1);
    }
}
