//! HTTP request and response types.

use serde::{Deserialize, Serialize};

use flowrun_core::{JobRecord, TaskId};

// ============================================================================
// Trigger types
// ============================================================================

/// Optional body of the trigger endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct TriggerRequest {
    pub prompt: Option<String>,
    pub workflow_ref: Option<String>,
    pub sequence: Option<Vec<String>>,
}

/// Response body of the trigger endpoints.
#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    pub task_id: TaskId,
    pub action: String,

    /// False when the trigger was absorbed by the coordinator.
    pub accepted: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

// ============================================================================
// Error types
// ============================================================================

/// Error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

// ============================================================================
// Job types
// ============================================================================

/// Query of the job list endpoint.
#[derive(Debug, Deserialize)]
pub struct JobQuery {
    pub task_id: Option<String>,
}

/// Response for a single ledger record.
#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub reference: String,
    pub task_id: String,
    pub kind: String,
    pub status: String,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<JobRecord> for JobResponse {
    fn from(record: JobRecord) -> Self {
        Self {
            reference: record.reference.as_str().to_string(),
            task_id: record.task_id.as_str().to_string(),
            kind: record.intent.kind().to_string(),
            status: record.status.as_str().to_string(),
            attempt_count: record.attempt_count,
            last_error: record.last_error,
            created_at: record.created_at.to_rfc3339(),
            updated_at: record.updated_at.to_rfc3339(),
        }
    }
}
