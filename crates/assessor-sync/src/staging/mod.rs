//! Staging store
//!
//! Parsed and mapped records wait here, grouped by import batch, until an
//! operator or the run pipeline commits them. Nothing in this module
//! touches the production store.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::import::FieldValue;

pub use memory::MemoryStagingStore;
pub use sqlite::SqliteStagingStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Pending,
    Valid,
    Invalid,
}

impl ValidationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ValidationStatus::Pending => "pending",
            ValidationStatus::Valid => "valid",
            ValidationStatus::Invalid => "invalid",
        }
    }
}

impl FromStr for ValidationStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ValidationStatus::Pending),
            "valid" => Ok(ValidationStatus::Valid),
            "invalid" => Ok(ValidationStatus::Invalid),
            other => Err(SyncError::storage(format!("unknown validation status '{}'", other))),
        }
    }
}

impl std::fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One source row after parsing and mapping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedRecord {
    pub id: Uuid,
    pub import_id: String,
    pub entity_type: String,
    /// One-based data row in the source file
    pub row_number: usize,
    /// One-based physical line in the source file
    pub line_number: usize,
    pub raw_fields: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    pub status: ValidationStatus,
    pub errors: Vec<String>,
    pub staged_at: DateTime<Utc>,
    /// Set once the record has been written to the production store
    pub committed_at: Option<DateTime<Utc>>,
}

impl StagedRecord {
    pub fn pending(import_id: &str, entity_type: &str, row_number: usize, line_number: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            import_id: import_id.to_string(),
            entity_type: entity_type.to_string(),
            row_number,
            line_number,
            raw_fields: BTreeMap::new(),
            fields: BTreeMap::new(),
            status: ValidationStatus::Pending,
            errors: Vec::new(),
            staged_at: Utc::now(),
            committed_at: None,
        }
    }

    /// Fix the status from the collected errors; a settled record keeps its status
    pub fn settle(&mut self) {
        if self.status != ValidationStatus::Pending {
            return;
        }
        self.status = if self.errors.is_empty() {
            ValidationStatus::Valid
        } else {
            ValidationStatus::Invalid
        };
    }

    pub fn is_valid(&self) -> bool {
        self.status == ValidationStatus::Valid
    }

    /// `row N: first error; second error`
    pub fn error_summary(&self) -> String {
        format!("row {}: {}", self.row_number, self.errors.join("; "))
    }
}

/// Header of one staged import
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportBatch {
    pub import_id: String,
    pub entity_type: String,
    /// File or stream the rows came from
    pub source_name: String,
    pub created_at: DateTime<Utc>,
    pub row_count: usize,
    pub valid_count: usize,
    pub invalid_count: usize,
}

impl ImportBatch {
    pub fn new_id() -> String {
        format!("imp_{}", Uuid::new_v4().simple())
    }
}

#[async_trait]
pub trait StagingStore: Send + Sync {
    /// Persist a batch header together with all of its records
    async fn insert_batch(&self, batch: &ImportBatch, records: &[StagedRecord]) -> SyncResult<()>;

    async fn get_batch(&self, import_id: &str) -> SyncResult<Option<ImportBatch>>;

    /// Newest first
    async fn list_batches(&self) -> SyncResult<Vec<ImportBatch>>;

    /// Records of one import in source row order
    async fn records_for_import(&self, import_id: &str) -> SyncResult<Vec<StagedRecord>>;

    /// Records with the given ids, ordered by import and row; unknown ids are omitted
    async fn records_by_id(&self, ids: &[Uuid]) -> SyncResult<Vec<StagedRecord>>;

    async fn mark_committed(&self, ids: &[Uuid], at: DateTime<Utc>) -> SyncResult<()>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_settle_follows_errors_once() {
        let mut record = StagedRecord::pending("imp_1", "property", 3, 3);
        record.errors.push("expected 7 columns, found 2".into());
        record.settle();
        assert_eq!(record.status, ValidationStatus::Invalid);
        assert_eq!(record.error_summary(), "row 3: expected 7 columns, found 2");

        record.errors.clear();
        record.settle();
        assert_eq!(record.status, ValidationStatus::Invalid);

        let mut clean = StagedRecord::pending("imp_1", "property", 1, 1);
        clean.settle();
        assert!(clean.is_valid());
    }

    #[test]
    fn test_status_text_round_trips() {
        for status in [ValidationStatus::Pending, ValidationStatus::Valid, ValidationStatus::Invalid] {
            assert_eq!(status.as_str().parse::<ValidationStatus>().unwrap(), status);
        }
        assert!("committed".parse::<ValidationStatus>().is_err());
    }

    #[test]
    fn test_import_ids_are_opaque_and_unique() {
        let a = ImportBatch::new_id();
        let b = ImportBatch::new_id();
        assert!(a.starts_with("imp_"));
        assert_ne!(a, b);
    }
}
