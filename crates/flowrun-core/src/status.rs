//! Status enums for Tasks and dispatched jobs.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a Task as reported by the system of record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task submitted, workflow not started yet.
    #[default]
    Pending,
    /// Workflow is executing agents.
    InProgress,
    /// Workflow finished.
    Completed,
    /// Workflow stopped on an error.
    Failed,
    /// Workflow was cancelled.
    Cancelled,
    /// Workflow paused and waiting to be resumed.
    Paused,
}

impl TaskStatus {
    /// Returns true if no further progress can happen without a new intent.
    ///
    /// A `Failed` task only counts as terminal when the failure is not
    /// retriable (e.g. not an upstream quota exhaustion).
    pub fn is_terminal(&self, retriable_failure: bool) -> bool {
        match self {
            Self::Completed | Self::Cancelled => true,
            Self::Failed => !retriable_failure,
            Self::Pending | Self::InProgress | Self::Paused => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Paused => "paused",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery status of a dispatched job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Recorded locally, delivery not confirmed yet.
    #[default]
    Queued,
    /// Accepted by the processor for asynchronous execution.
    Delivered,
    /// Its effect was observed on a monitor refresh.
    Acknowledged,
    /// Delivery abandoned.
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Delivered => "delivered",
            Self::Acknowledged => "acknowledged",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
