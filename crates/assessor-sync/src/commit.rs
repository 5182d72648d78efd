//! Commit engine: stage, review, commit
//!
//! [`CommitEngine::stage_bytes`] runs the parser and mapper over one file
//! and persists every row (malformed ones included, as invalid records)
//! under a fresh import id. [`CommitEngine::commit_staged_records`]
//! re-validates each staged record and writes the accepted ones to the
//! [`ProductionStore`]. Acceptance is decided per record; one rejection
//! never blocks another.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::DEFAULT_MAX_REPORTED_ERRORS;
use crate::error::{SyncError, SyncResult};
use crate::import::parser::{self, ParsedRow};
use crate::import::{EntityCatalog, EntitySpec, FieldMapper};
use crate::production::{EntityRecord, ProductionStore, WriteOutcome};
use crate::staging::{ImportBatch, StagedRecord, StagingStore};

/// Records written to the production store per call
const COMMIT_CHUNK: usize = 500;

/// Outcome of one commit invocation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportResult {
    pub total: usize,
    pub success_count: usize,
    pub failure_count: usize,
    /// Successes that created a new production record
    pub inserted: usize,
    /// Successes that overwrote an existing production record
    pub updated: usize,
    /// First `max_reported_errors` failures, in row order
    pub errors: Vec<String>,
    pub total_errors: usize,
    /// Every failure, uncapped, for the run artifact
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<RecordFailure>,
}

/// One rejected or unwritable staged record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFailure {
    pub record_id: Uuid,
    /// Source row, when the record exists in staging
    pub row: Option<usize>,
    pub message: String,
}

impl ImportResult {
    fn fail(&mut self, record_id: Uuid, row: Option<usize>, message: String, cap: usize) {
        self.failure_count += 1;
        self.total_errors += 1;
        if self.errors.len() < cap {
            self.errors.push(message.clone());
        }
        self.failures.push(RecordFailure {
            record_id,
            row,
            message,
        });
    }

    fn succeed(&mut self, outcome: WriteOutcome) {
        self.success_count += 1;
        match outcome {
            WriteOutcome::Inserted => self.inserted += 1,
            WriteOutcome::Updated => self.updated += 1,
        }
    }
}

pub struct CommitEngine {
    catalog: Arc<EntityCatalog>,
    staging: Arc<dyn StagingStore>,
    production: Arc<dyn ProductionStore>,
    max_reported_errors: usize,
}

impl CommitEngine {
    pub fn new(
        catalog: Arc<EntityCatalog>,
        staging: Arc<dyn StagingStore>,
        production: Arc<dyn ProductionStore>,
    ) -> Self {
        Self {
            catalog,
            staging,
            production,
            max_reported_errors: DEFAULT_MAX_REPORTED_ERRORS,
        }
    }

    pub fn with_max_reported_errors(mut self, max: usize) -> Self {
        self.max_reported_errors = max;
        self
    }

    pub fn catalog(&self) -> &EntityCatalog {
        &self.catalog
    }

    fn entity(&self, entity_type: &str) -> SyncResult<&EntitySpec> {
        self.catalog.get(entity_type).ok_or_else(|| {
            SyncError::validation(format!("unknown entity type '{}'", entity_type))
        })
    }

    /// Stage a stream of file contents
    pub async fn stage_import<R>(
        &self,
        mut reader: R,
        entity_type: &str,
        source_name: &str,
    ) -> SyncResult<ImportBatch>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes).await?;
        self.stage_bytes(&bytes, entity_type, source_name).await
    }

    /// Parse, map and persist one file's rows under a new import id
    ///
    /// Row count always equals the number of data rows in the file.
    pub async fn stage_bytes(
        &self,
        bytes: &[u8],
        entity_type: &str,
        source_name: &str,
    ) -> SyncResult<ImportBatch> {
        let spec = self.entity(entity_type)?;
        let import_id = ImportBatch::new_id();
        let mapper = FieldMapper::new(spec);

        let records: Vec<StagedRecord> = parser::parse(bytes, &spec.format)
            .into_iter()
            .map(|row| stage_row(&import_id, &mapper, row))
            .collect();

        let valid_count = records.iter().filter(|r| r.is_valid()).count();
        let batch = ImportBatch {
            import_id,
            entity_type: spec.name.clone(),
            source_name: source_name.to_string(),
            created_at: Utc::now(),
            row_count: records.len(),
            valid_count,
            invalid_count: records.len() - valid_count,
        };

        self.staging.insert_batch(&batch, &records).await?;
        info!(
            import_id = %batch.import_id,
            entity = %batch.entity_type,
            source = %batch.source_name,
            rows = batch.row_count,
            invalid = batch.invalid_count,
            "Import staged"
        );
        Ok(batch)
    }

    pub async fn get_batch(&self, import_id: &str) -> SyncResult<ImportBatch> {
        self.staging
            .get_batch(import_id)
            .await?
            .ok_or_else(|| SyncError::UnknownImport(import_id.to_string()))
    }

    pub async fn list_batches(&self) -> SyncResult<Vec<ImportBatch>> {
        self.staging.list_batches().await
    }

    /// Staged records of one import, in source row order
    pub async fn get_staged_records(&self, import_id: &str) -> SyncResult<Vec<StagedRecord>> {
        self.get_batch(import_id).await?;
        self.staging.records_for_import(import_id).await
    }

    /// Commit every record of one import
    pub async fn commit_import(
        &self,
        import_id: &str,
        cancel: &CancellationToken,
    ) -> SyncResult<ImportResult> {
        let ids: Vec<Uuid> = self
            .get_staged_records(import_id)
            .await?
            .iter()
            .map(|r| r.id)
            .collect();
        let result = self.commit_staged_records(&ids, cancel).await?;
        info!(
            import_id = %import_id,
            total = result.total,
            committed = result.success_count,
            failed = result.failure_count,
            inserted = result.inserted,
            updated = result.updated,
            "Import committed"
        );
        Ok(result)
    }

    /// Re-validate and write the referenced staged records
    ///
    /// Records already committed are written again; the update-in-place
    /// policy keeps that idempotent. Cancellation is honoured between
    /// chunks; chunks already written stay committed.
    pub async fn commit_staged_records(
        &self,
        ids: &[Uuid],
        cancel: &CancellationToken,
    ) -> SyncResult<ImportResult> {
        let cap = self.max_reported_errors;
        let mut result = ImportResult {
            total: ids.len(),
            ..ImportResult::default()
        };

        let records = self.staging.records_by_id(ids).await?;
        let found: HashSet<Uuid> = records.iter().map(|r| r.id).collect();
        for id in ids.iter().filter(|id| !found.contains(id)) {
            result.fail(*id, None, format!("record {}: not found in staging", id), cap);
        }

        for chunk in records.chunks(COMMIT_CHUNK) {
            if cancel.is_cancelled() {
                warn!(committed = result.success_count, "Commit cancelled");
                return Err(SyncError::Cancelled);
            }

            let mut accepted: Vec<(&StagedRecord, EntityRecord)> = Vec::with_capacity(chunk.len());
            for record in chunk {
                match self.accept(record).await? {
                    Ok(entity) => accepted.push((record, entity)),
                    Err(message) => result.fail(record.id, Some(record.row_number), message, cap),
                }
            }
            if accepted.is_empty() {
                continue;
            }

            let entities: Vec<EntityRecord> = accepted.iter().map(|(_, e)| e.clone()).collect();
            let outcomes = match self.production.write_records(&entities).await {
                Ok(outcomes) => outcomes,
                Err(e) => {
                    warn!(error = %e, records = entities.len(), "Production write failed");
                    for (record, _) in &accepted {
                        result.fail(
                            record.id,
                            Some(record.row_number),
                            format!("row {}: write failed: {}", record.row_number, e),
                            cap,
                        );
                    }
                    continue;
                },
            };

            let mut committed = Vec::with_capacity(accepted.len());
            for ((record, _), outcome) in accepted.iter().zip(outcomes) {
                match outcome {
                    Ok(outcome) => {
                        result.succeed(outcome);
                        committed.push(record.id);
                    },
                    Err(message) => {
                        result.fail(
                            record.id,
                            Some(record.row_number),
                            format!("row {}: {}", record.row_number, message),
                            cap,
                        )
                    },
                }
            }
            self.staging.mark_committed(&committed, Utc::now()).await?;
            debug!(chunk = chunk.len(), committed = committed.len(), "Commit chunk written");
        }

        Ok(result)
    }

    /// Turn a staged record into an entity record, or explain the rejection
    async fn accept(&self, record: &StagedRecord) -> SyncResult<Result<EntityRecord, String>> {
        if !record.is_valid() {
            let summary = if record.errors.is_empty() {
                format!("row {}: record is {}", record.row_number, record.status)
            } else {
                record.error_summary()
            };
            return Ok(Err(summary));
        }

        let Some(spec) = self.catalog.get(&record.entity_type) else {
            return Ok(Err(format!(
                "row {}: unknown entity type '{}'",
                record.row_number, record.entity_type
            )));
        };

        let mut problems: Vec<String> = spec
            .mappings
            .iter()
            .filter(|m| m.required)
            .filter(|m| record.fields.get(&m.target).map_or(true, |v| v.is_null()))
            .map(|m| format!("required field '{}' is missing", m.target))
            .collect();

        let key = record.fields.get(&spec.key_field).and_then(|v| v.as_key());
        if key.is_none() {
            problems.push(format!("identifying key '{}' is missing", spec.key_field));
        }
        if !problems.is_empty() {
            return Ok(Err(format!("row {}: {}", record.row_number, problems.join("; "))));
        }

        let entity = EntityRecord {
            entity_type: spec.name.clone(),
            key: key.unwrap_or_default(),
            fields: record.fields.clone(),
        };
        let violations = self.production.validate(&entity).await?;
        if !violations.is_empty() {
            return Ok(Err(format!("row {}: {}", record.row_number, violations.join("; "))));
        }
        Ok(Ok(entity))
    }
}

fn stage_row(import_id: &str, mapper: &FieldMapper<'_>, row: ParsedRow) -> StagedRecord {
    let spec = mapper.spec();
    match row {
        ParsedRow::Malformed {
            row,
            line,
            raw,
            error,
        } => {
            let mut record = StagedRecord::pending(import_id, &spec.name, row, line);
            record.raw_fields.insert("_raw".to_string(), raw);
            record.errors.push(error);
            record.settle();
            record
        },
        ParsedRow::Record(raw) => {
            let mut record = StagedRecord::pending(import_id, &spec.name, raw.row, raw.line);
            let mapped = mapper.map(&raw);
            record.raw_fields = FieldMapper::raw_fields(&raw);
            record.errors = mapped.errors.clone();
            if record.errors.is_empty() && mapper.key_of(&mapped).is_none() {
                record
                    .errors
                    .push(format!("identifying key '{}' is missing", spec.key_field));
            }
            record.fields = mapped.fields;
            record.settle();
            record
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::import::FieldValue;
    use crate::production::MemoryProductionStore;
    use crate::staging::{MemoryStagingStore, ValidationStatus};

    const FIVE_ROWS: &str = "BC001,123 Main St,12345,residential,active,0.25,150000\n\
                             BC002,45 Oak Ave,12346,residential,active,0.50,210000\n\
                             BC003,broken row\n\
                             BC004,9 Pine Rd,12348,commercial,active,1.75,990000\n\
                             BC005,1 Elm St,12349,residential,inactive,0.10,87000\n";

    struct Fixture {
        engine: CommitEngine,
        production: Arc<MemoryProductionStore>,
    }

    fn fixture() -> Fixture {
        let production = Arc::new(MemoryProductionStore::new());
        let engine = CommitEngine::new(
            Arc::new(EntityCatalog::builtin()),
            Arc::new(MemoryStagingStore::new()),
            production.clone(),
        );
        Fixture { engine, production }
    }

    #[tokio::test]
    async fn test_staging_keeps_every_row_and_does_not_touch_production() {
        let f = fixture();
        let batch = f
            .engine
            .stage_import(FIVE_ROWS.as_bytes(), "property", "parcel.csv")
            .await
            .unwrap();

        assert_eq!(batch.row_count, 5);
        assert_eq!(batch.valid_count, 4);
        assert_eq!(batch.invalid_count, 1);
        assert_eq!(f.production.count("property").await.unwrap(), 0);

        let records = f.engine.get_staged_records(&batch.import_id).await.unwrap();
        assert_eq!(
            records.iter().map(|r| r.row_number).collect::<Vec<_>>(),
            vec![1, 2, 3, 4, 5]
        );
        assert_eq!(records[2].status, ValidationStatus::Invalid);
        assert_eq!(records[2].raw_fields["_raw"], "BC003,broken row");
        assert_eq!(records[0].fields["acres"], FieldValue::Decimal("0.25".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_partial_failure_commits_the_rest() {
        let f = fixture();
        let batch = f
            .engine
            .stage_bytes(FIVE_ROWS.as_bytes(), "property", "parcel.csv")
            .await
            .unwrap();

        let result = f
            .engine
            .commit_import(&batch.import_id, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.total, 5);
        assert_eq!(result.success_count, 4);
        assert_eq!(result.failure_count, 1);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].starts_with("row 3:"), "{}", result.errors[0]);
        assert_eq!(f.production.count("property").await.unwrap(), 4);

        let records = f.engine.get_staged_records(&batch.import_id).await.unwrap();
        assert!(records[0].committed_at.is_some());
        assert!(records[2].committed_at.is_none());
    }

    #[tokio::test]
    async fn test_recommitting_updates_instead_of_duplicating() {
        let f = fixture();
        let batch = f
            .engine
            .stage_bytes(FIVE_ROWS.as_bytes(), "property", "parcel.csv")
            .await
            .unwrap();
        let cancel = CancellationToken::new();

        let first = f.engine.commit_import(&batch.import_id, &cancel).await.unwrap();
        let second = f.engine.commit_import(&batch.import_id, &cancel).await.unwrap();

        assert_eq!((first.inserted, first.updated), (4, 0));
        assert_eq!((second.inserted, second.updated), (0, 4));
        assert_eq!(f.production.count("property").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_reported_errors_are_capped_but_counted() {
        let production = Arc::new(MemoryProductionStore::new());
        let engine = CommitEngine::new(
            Arc::new(EntityCatalog::builtin()),
            Arc::new(MemoryStagingStore::new()),
            production,
        )
        .with_max_reported_errors(2);
        let input = "x\ny\nz\nw\n";
        let batch = engine.stage_bytes(input.as_bytes(), "property", "bad.csv").await.unwrap();

        let result = engine
            .commit_import(&batch.import_id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.failure_count, 4);
        assert_eq!(result.total_errors, 4);
        assert_eq!(result.errors.len(), 2);
        assert_eq!(
            result.failures.iter().map(|f| f.row).collect::<Vec<_>>(),
            vec![Some(1), Some(2), Some(3), Some(4)]
        );
        assert!(result.failures[3].message.starts_with("row 4:"));
    }

    #[tokio::test]
    async fn test_unknown_import_and_entity() {
        let f = fixture();
        assert!(matches!(
            f.engine.get_staged_records("imp_nope").await,
            Err(SyncError::UnknownImport(_))
        ));
        assert!(matches!(
            f.engine.stage_bytes(b"", "sale", "sales.csv").await,
            Err(SyncError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_record_ids_count_as_failures() {
        let f = fixture();
        let result = f
            .engine
            .commit_staged_records(&[Uuid::new_v4()], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.total, 1);
        assert_eq!(result.failure_count, 1);
        assert!(result.errors[0].contains("not found in staging"));
        assert_eq!(result.failures[0].row, None);
    }

    #[tokio::test]
    async fn test_cancelled_commit_writes_nothing() {
        let f = fixture();
        let batch = f
            .engine
            .stage_bytes(FIVE_ROWS.as_bytes(), "property", "parcel.csv")
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(matches!(
            f.engine.commit_import(&batch.import_id, &cancel).await,
            Err(SyncError::Cancelled)
        ));
        assert_eq!(f.production.count("property").await.unwrap(), 0);
    }
}
