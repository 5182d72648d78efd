//! In-process staging store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{ImportBatch, StagedRecord, StagingStore};
use crate::error::{SyncError, SyncResult};

#[derive(Default)]
struct Inner {
    batches: BTreeMap<String, ImportBatch>,
    /// Records per import, in row order
    records: BTreeMap<String, Vec<StagedRecord>>,
}

#[derive(Default)]
pub struct MemoryStagingStore {
    inner: RwLock<Inner>,
}

impl MemoryStagingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StagingStore for MemoryStagingStore {
    async fn insert_batch(&self, batch: &ImportBatch, records: &[StagedRecord]) -> SyncResult<()> {
        let mut inner = self.inner.write().await;
        if inner.batches.contains_key(&batch.import_id) {
            return Err(SyncError::storage(format!(
                "import {} is already staged",
                batch.import_id
            )));
        }
        let mut rows = records.to_vec();
        rows.sort_by_key(|r| r.row_number);
        inner.batches.insert(batch.import_id.clone(), batch.clone());
        inner.records.insert(batch.import_id.clone(), rows);
        Ok(())
    }

    async fn get_batch(&self, import_id: &str) -> SyncResult<Option<ImportBatch>> {
        Ok(self.inner.read().await.batches.get(import_id).cloned())
    }

    async fn list_batches(&self) -> SyncResult<Vec<ImportBatch>> {
        let mut batches: Vec<ImportBatch> = self.inner.read().await.batches.values().cloned().collect();
        batches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(batches)
    }

    async fn records_for_import(&self, import_id: &str) -> SyncResult<Vec<StagedRecord>> {
        Ok(self
            .inner
            .read()
            .await
            .records
            .get(import_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn records_by_id(&self, ids: &[Uuid]) -> SyncResult<Vec<StagedRecord>> {
        let wanted: HashSet<&Uuid> = ids.iter().collect();
        let inner = self.inner.read().await;
        Ok(inner
            .records
            .values()
            .flatten()
            .filter(|r| wanted.contains(&r.id))
            .cloned()
            .collect())
    }

    async fn mark_committed(&self, ids: &[Uuid], at: DateTime<Utc>) -> SyncResult<()> {
        let wanted: HashSet<&Uuid> = ids.iter().collect();
        let mut inner = self.inner.write().await;
        for record in inner.records.values_mut().flatten() {
            if wanted.contains(&record.id) {
                record.committed_at = Some(at);
            }
        }
        Ok(())
    }
}
