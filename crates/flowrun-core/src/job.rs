//! Job records: one per dispatch, kept in the local ledger.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{ExecutionIntent, JobReference, JobStatus, TaskId};

/// A dispatched intent and its delivery state.
///
/// The payload (`reference`, `intent`, `task_id`, `created_at`) never
/// changes after creation; only the delivery fields move.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub reference: JobReference,
    pub intent: ExecutionIntent,
    pub task_id: TaskId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: JobStatus,
    pub attempt_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl JobRecord {
    /// Create a queued record.
    pub fn new(reference: JobReference, intent: ExecutionIntent, task_id: TaskId) -> Self {
        let now = Utc::now();
        Self {
            reference,
            intent,
            task_id,
            created_at: now,
            updated_at: now,
            status: JobStatus::Queued,
            attempt_count: 0,
            last_error: None,
        }
    }

    /// Count a delivery attempt.
    pub fn mark_attempt(&mut self) {
        self.attempt_count += 1;
        self.updated_at = Utc::now();
    }

    pub fn mark_delivered(&mut self) {
        self.status = JobStatus::Delivered;
        self.last_error = None;
        self.updated_at = Utc::now();
    }

    /// Only delivered records can be acknowledged; returns whether it moved.
    pub fn mark_acknowledged(&mut self) -> bool {
        if self.status != JobStatus::Delivered {
            return false;
        }
        self.status = JobStatus::Acknowledged;
        self.updated_at = Utc::now();
        true
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.last_error = Some(error.into());
        self.updated_at = Utc::now();
    }

    /// Settle a record that a previous process left queued. Its delivery
    /// outcome is unknown and nothing will retry it.
    pub fn mark_abandoned(&mut self) {
        self.mark_failed("abandoned before delivery was confirmed");
    }

    /// Acknowledged records are prunable right away. Every other record once
    /// it has not moved for `retention`.
    pub fn is_prunable(&self, now: DateTime<Utc>, retention: Duration) -> bool {
        match self.status {
            JobStatus::Acknowledged => true,
            JobStatus::Queued | JobStatus::Delivered | JobStatus::Failed => {
                now - self.updated_at >= retention
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> JobRecord {
        JobRecord::new(
            JobReference::new("job-x-00000001"),
            ExecutionIntent::Cancel,
            TaskId::new("t1"),
        )
    }

    #[test]
    fn test_lifecycle() {
        let mut job = record();
        assert_eq!(job.status, JobStatus::Queued);
        assert!(!job.mark_acknowledged());

        job.mark_attempt();
        job.mark_delivered();
        assert!(job.mark_acknowledged());
        assert_eq!(job.status, JobStatus::Acknowledged);
        assert_eq!(job.attempt_count, 1);
    }

    #[test]
    fn test_pruning() {
        let now = Utc::now();
        let retention = Duration::hours(1);

        let mut failed = record();
        failed.mark_failed("boom");
        assert!(!failed.is_prunable(now, retention));
        assert!(failed.is_prunable(now + Duration::hours(2), retention));

        let mut delivered = record();
        delivered.mark_delivered();
        assert!(!delivered.is_prunable(now, retention));
        assert!(delivered.is_prunable(now + Duration::hours(2), retention));

        // A record stuck in queued (its process died mid-dispatch) ages out too.
        let queued = record();
        assert!(!queued.is_prunable(now, retention));
        assert!(queued.is_prunable(now + Duration::hours(2), retention));
    }

    #[test]
    fn test_abandoned_record_is_failed() {
        let mut job = record();
        job.mark_attempt();
        job.mark_abandoned();

        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.last_error.as_deref().unwrap().contains("abandoned"));
        assert!(!job.mark_acknowledged());
    }
}
