//! Ports to the external collaborators.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use flowrun_core::{ExecutionIntent, JobReference, JobType, LogLine, MonitorSnapshot, TaskId};

use crate::error::ClientError;

/// Optional overrides accepted by the system of record's action endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<Vec<String>>,
}

impl IntentParams {
    /// Extract the overrides carried by an intent.
    pub fn from_intent(intent: &ExecutionIntent) -> Self {
        Self {
            prompt: intent.prompt().map(str::to_string),
            workflow_ref: intent.workflow_ref().map(str::to_string),
            sequence: intent.sequence().map(<[String]>::to_vec),
        }
    }
}

/// Request handed to the job processor for one dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    /// Absolute URL the processor must call.
    pub target_endpoint: String,
    pub method: String,
    /// Name of the connection the processor uses to reach the endpoint.
    pub connection_name: String,
    pub job_type: JobType,
    pub reference: JobReference,
    pub parameters: serde_json::Value,
}

/// The task/workflow system of record.
#[async_trait]
pub trait TaskApi: Send + Sync {
    /// `GET /tasks/{id}/monitor`
    async fn monitor(&self, task_id: &TaskId) -> Result<MonitorSnapshot, ClientError>;

    /// `GET /tasks/{id}/logs?after_seq=N&limit=M`
    async fn logs(
        &self,
        task_id: &TaskId,
        after_seq: Option<u64>,
        limit: usize,
    ) -> Result<Vec<LogLine>, ClientError>;

    /// `POST /tasks/{id}/cancel`
    async fn cancel(&self, task_id: &TaskId, params: &IntentParams) -> Result<(), ClientError>;
}

/// The external asynchronous job processor.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// Hand over a job. Success means accepted for processing, not executed.
    async fn submit(&self, request: &JobRequest) -> Result<(), ClientError>;
}
