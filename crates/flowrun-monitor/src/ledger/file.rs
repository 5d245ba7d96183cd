//! JSON file-backed job ledger.
//!
//! The whole ledger is rewritten to a temporary file and renamed over the
//! previous snapshot after every change. An unreadable snapshot is logged
//! and replaced by an empty ledger. Records still queued when the snapshot
//! is loaded belong to a dispatch that died with its process and are marked
//! failed.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

use flowrun_core::{JobRecord, JobReference, JobStatus, TaskId};

use super::{
    insert_record, list_records, prune_records, update_record, JobLedger, LedgerError, Records,
};

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerSnapshot {
    jobs: Vec<JobRecord>,
}

pub struct FileLedger {
    path: PathBuf,
    records: RwLock<Records>,
    persist_lock: Mutex<()>,
}

impl FileLedger {
    /// Open the ledger at `path`, creating parent directories as needed.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let snapshot = match fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<LedgerSnapshot>(&bytes) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to parse job ledger");
                    LedgerSnapshot::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => LedgerSnapshot::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read job ledger");
                LedgerSnapshot::default()
            }
        };

        let mut abandoned = 0usize;
        let records: Records = snapshot
            .jobs
            .into_iter()
            .map(|mut r| {
                if r.status == JobStatus::Queued {
                    r.mark_abandoned();
                    abandoned += 1;
                }
                (r.reference.clone(), r)
            })
            .collect();

        let ledger = Self {
            path,
            records: RwLock::new(records),
            persist_lock: Mutex::new(()),
        };
        if abandoned > 0 {
            warn!(
                path = %ledger.path.display(),
                count = abandoned,
                "Marked jobs queued by a previous run as failed"
            );
            ledger.persist().await?;
        }
        Ok(ledger)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self) -> Result<(), LedgerError> {
        let _guard = self.persist_lock.lock().await;
        let snapshot = LedgerSnapshot {
            jobs: self.records.read().await.values().cloned().collect(),
        };
        let data = serde_json::to_vec_pretty(&snapshot)?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, data).await?;
        fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl JobLedger for FileLedger {
    async fn insert(&self, record: JobRecord) -> Result<(), LedgerError> {
        insert_record(&mut *self.records.write().await, record)?;
        self.persist().await
    }

    async fn update(&self, record: &JobRecord) -> Result<(), LedgerError> {
        update_record(&mut *self.records.write().await, record)?;
        self.persist().await
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
        let removed = prune_records(&mut *self.records.write().await, now, retention);
        if removed > 0 {
            self.persist().await?;
        }
        Ok(removed)
    }
}
