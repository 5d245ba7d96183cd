//! Local ledger of dispatched jobs.
//!
//! Supports:
//! - `memory`: in-process storage, lost on restart
//! - `file`: JSON snapshot rewritten on every change

mod file;
mod memory;

pub use file::FileLedger;
pub use memory::InMemoryLedger;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use flowrun_core::{JobRecord, JobReference, TaskId};

/// Errors raised by ledger backends.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ledger serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("job not found: {0}")]
    NotFound(JobReference),

    #[error("duplicate job reference: {0}")]
    Duplicate(JobReference),
}

/// Storage for [`JobRecord`]s, keyed by reference.
#[async_trait]
pub trait JobLedger: Send + Sync {
    /// Store a new record. Fails if the reference is already present.
    async fn insert(&self, record: JobRecord) -> Result<(), LedgerError>;

    /// Replace an existing record.
    async fn update(&self, record: &JobRecord) -> Result<(), LedgerError>;

    async fn get(&self, reference: &JobReference) -> Result<Option<JobRecord>, LedgerError>;

    /// Records ordered by reference, optionally for one task only.
    async fn list(&self, task_id: Option<&TaskId>) -> Result<Vec<JobRecord>, LedgerError>;

    /// Drop settled records; returns how many were removed.
    async fn prune(
        &self,
        now: DateTime<Utc>,
        retention: chrono::Duration,
    ) -> Result<usize, LedgerError>;
}

pub(crate) type Records = BTreeMap<JobReference, JobRecord>;

pub(crate) fn insert_record(records: &mut Records, record: JobRecord) -> Result<(), LedgerError> {
    if records.contains_key(&record.reference) {
        return Err(LedgerError::Duplicate(record.reference));
    }
    records.insert(record.reference.clone(), record);
    Ok(())
}

pub(crate) fn update_record(records: &mut Records, record: &JobRecord) -> Result<(), LedgerError> {
    match records.get_mut(&record.reference) {
        Some(slot) => {
            *slot = record.clone();
            Ok(())
        }
        None => Err(LedgerError::NotFound(record.reference.clone())),
    }
}

pub(crate) fn list_records(records: &Records, task_id: Option<&TaskId>) -> Vec<JobRecord> {
    records
        .values()
        .filter(|r| task_id.map_or(true, |id| &r.task_id == id))
        .cloned()
        .collect()
}

pub(crate) fn prune_records(
    records: &mut Records,
    now: DateTime<Utc>,
    retention: chrono::Duration,
) -> usize {
    let before = records.len();
    records.retain(|_, r| !r.is_prunable(now, retention));
    before - records.len()
}

/// Prune `ledger` every `every` until the task is aborted.
pub async fn run_pruner(ledger: Arc<dyn JobLedger>, retention: Duration, every: Duration) {
    let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::hours(1));
    let mut interval = tokio::time::interval(every);

    loop {
        interval.tick().await;
        match ledger.prune(Utc::now(), retention).await {
            Ok(0) => {}
            Ok(removed) => debug!(removed, "Pruned settled jobs"),
            Err(e) => warn!(error = %e, "Failed to prune job ledger"),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flowrun_core::ExecutionIntent;

    pub(crate) fn record(reference: &str, task: &str) -> JobRecord {
        JobRecord::new(
            JobReference::new(reference),
            ExecutionIntent::Cancel,
            TaskId::new(task),
        )
    }

    /// Behaviour every backend must share.
    pub(crate) async fn exercise(ledger: &dyn JobLedger) {
        ledger.insert(record("job-a-00000001", "t1")).await.unwrap();
        ledger.insert(record("job-a-00000002", "t2")).await.unwrap();
        assert!(matches!(
            ledger.insert(record("job-a-00000001", "t1")).await,
            Err(LedgerError::Duplicate(_))
        ));

        let mut first = ledger
            .get(&JobReference::new("job-a-00000001"))
            .await
            .unwrap()
            .unwrap();
        first.mark_attempt();
        first.mark_delivered();
        ledger.update(&first).await.unwrap();

        let missing = record("job-a-00000009", "t1");
        assert!(matches!(
            ledger.update(&missing).await,
            Err(LedgerError::NotFound(_))
        ));

        let for_t1 = ledger.list(Some(&TaskId::new("t1"))).await.unwrap();
        assert_eq!(for_t1.len(), 1);
        assert_eq!(for_t1[0].attempt_count, 1);
        assert_eq!(ledger.list(None).await.unwrap().len(), 2);

        first.mark_acknowledged();
        ledger.update(&first).await.unwrap();
        let removed = ledger
            .prune(Utc::now(), chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(ledger.list(None).await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pruner_removes_settled_jobs() {
        let ledger: Arc<dyn JobLedger> = Arc::new(InMemoryLedger::new());
        let mut done = record("job-a-00000001", "t1");
        done.mark_delivered();
        done.mark_acknowledged();
        ledger.insert(done).await.unwrap();

        let pruner = tokio::spawn(run_pruner(
            ledger.clone(),
            Duration::from_secs(3600),
            Duration::from_secs(60),
        ));
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(ledger.list(None).await.unwrap().is_empty());
        pruner.abort();
    }
}
