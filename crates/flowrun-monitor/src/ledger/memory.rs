//! In-memory job ledger.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use flowrun_core::{JobRecord, JobReference, TaskId};

use super::{
    insert_record, list_records, prune_records, update_record, JobLedger, LedgerError, Records,
};

#[derive(Default)]
pub struct InMemoryLedger {
    records: RwLock<Records>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobLedger for InMemoryLedger {
    async fn insert(&self, record: JobRecord) -> Result<(), LedgerError> {
        insert_record(&mut *self.records.write().await, record)
    }

    async fn update(&self, record: &JobRecord) -> Result<(), LedgerError> {
        update_record(&mut *self.records.write().await, record)
    }

    async fn get(&self, reference: &JobReference) -> Result<Option<JobRecord>, LedgerError> {
        Ok(self.records.read().await.get(reference).cloned())
    }

    async fn list(&self, task_id: Option<&TaskId>) -> Result<Vec<JobRecord>, LedgerError> {
        Ok(list_records(&*self.records.read().await, task_id))
    }

    async fn prune(
        &self,
        now: DateTime<Utc>,
        retention: chrono::Duration,
    ) -> Result<usize, LedgerError> {
        Ok(prune_records(&mut *self.records.write().await, now, retention))
    }
}
