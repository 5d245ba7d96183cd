//! Resilient delivery of execution intents.
//!
//! Every dispatch is written to the ledger before anything leaves the
//! process. Run-starting intents are handed to the job processor; Cancel
//! goes straight to the system of record. Network failures are retried with
//! a linear backoff, rejections are surfaced as-is.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info, warn};

use flowrun_client::{ClientError, IntentParams, JobProcessor, JobRequest, TaskApi};
use flowrun_core::{ExecutionIntent, JobRecord, JobReference, ReferenceGenerator, TaskId};

use crate::ledger::{JobLedger, LedgerError};

/// Retry schedule for transient delivery failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay after attempt `n` is `n * backoff_step`.
    pub backoff_step: Duration,
}

impl RetryPolicy {
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff_step * attempt
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_step: Duration::from_millis(400),
        }
    }
}

/// Why a dispatch did not get delivered.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("delivery failed after {attempts} attempts: {message}")]
    Network { attempts: u32, message: String },

    #[error("dispatch rejected: {message}")]
    Rejected { status: Option<u16>, message: String },

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Sends intents to their delivery target and keeps the ledger current.
pub struct JobDispatcher {
    api: Arc<dyn TaskApi>,
    processor: Arc<dyn JobProcessor>,
    ledger: Arc<dyn JobLedger>,
    references: ReferenceGenerator,
    retry: RetryPolicy,
    api_base_url: String,
    connection_name: String,
}

impl JobDispatcher {
    pub fn new(
        api: Arc<dyn TaskApi>,
        processor: Arc<dyn JobProcessor>,
        ledger: Arc<dyn JobLedger>,
        api_base_url: impl Into<String>,
    ) -> Self {
        Self {
            api,
            processor,
            ledger,
            references: ReferenceGenerator::new(),
            retry: RetryPolicy::default(),
            api_base_url: api_base_url.into().trim_end_matches('/').to_string(),
            connection_name: "flowrun".to_string(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = name.into();
        self
    }

    pub fn with_references(mut self, references: ReferenceGenerator) -> Self {
        self.references = references;
        self
    }

    pub fn ledger(&self) -> &Arc<dyn JobLedger> {
        &self.ledger
    }

    /// Record and deliver one intent.
    ///
    /// Returns the job reference once the target accepted it. Acceptance is
    /// not execution: the record stays `Delivered` until [`acknowledge`]
    /// is called.
    ///
    /// [`acknowledge`]: JobDispatcher::acknowledge
    pub async fn dispatch(
        &self,
        intent: &ExecutionIntent,
        task_id: &TaskId,
    ) -> Result<JobReference, DispatchError> {
        let reference = self.references.next_reference();
        let mut record = JobRecord::new(reference.clone(), intent.clone(), task_id.clone());
        self.ledger.insert(record.clone()).await?;

        let request = self.build_request(intent, task_id, &reference);
        info!(
            task_id = %task_id,
            reference = %reference,
            kind = %intent.kind(),
            "Dispatching intent"
        );

        loop {
            record.mark_attempt();
            let attempt = record.attempt_count;

            match self.deliver(intent, task_id, request.as_ref()).await {
                Ok(()) => {
                    record.mark_delivered();
                    self.save(&record).await;
                    info!(reference = %reference, attempt, "Job delivered");
                    return Ok(reference);
                }
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_after(attempt);
                    warn!(
                        reference = %reference,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Delivery failed, retrying"
                    );
                    record.last_error = Some(e.to_string());
                    self.save(&record).await;
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_transient() => {
                    let message = e.to_string();
                    error!(
                        reference = %reference,
                        attempts = attempt,
                        error = %message,
                        "Delivery retries exhausted"
                    );
                    record.mark_failed(message.clone());
                    self.save(&record).await;
                    return Err(DispatchError::Network {
                        attempts: attempt,
                        message,
                    });
                }
                Err(e) => {
                    let status = match &e {
                        ClientError::Status { status, .. } => Some(*status),
                        _ => None,
                    };
                    let message = e.to_string();
                    warn!(reference = %reference, error = %message, "Dispatch rejected");
                    record.mark_failed(message.clone());
                    self.save(&record).await;
                    return Err(DispatchError::Rejected { status, message });
                }
            }
        }
    }

    /// Mark a delivered job as acknowledged. Returns whether it moved.
    pub async fn acknowledge(&self, reference: &JobReference) -> Result<bool, LedgerError> {
        let Some(mut record) = self.ledger.get(reference).await? else {
            return Ok(false);
        };
        if !record.mark_acknowledged() {
            return Ok(false);
        }
        self.ledger.update(&record).await?;
        info!(reference = %reference, task_id = %record.task_id, "Job acknowledged");
        Ok(true)
    }

    /// Job processor request for run-starting intents; `None` for Cancel.
    fn build_request(
        &self,
        intent: &ExecutionIntent,
        task_id: &TaskId,
        reference: &JobReference,
    ) -> Option<JobRequest> {
        let job_type = intent.job_type()?;
        let params = IntentParams::from_intent(intent);
        Some(JobRequest {
            target_endpoint: format!("{}{}", self.api_base_url, intent.endpoint(task_id)),
            method: "POST".to_string(),
            connection_name: self.connection_name.clone(),
            job_type,
            reference: reference.clone(),
            parameters: serde_json::json!({
                "task_id": task_id,
                "prompt": params.prompt,
                "workflow_ref": params.workflow_ref,
                "sequence": params.sequence,
            }),
        })
    }

    async fn deliver(
        &self,
        intent: &ExecutionIntent,
        task_id: &TaskId,
        request: Option<&JobRequest>,
    ) -> Result<(), ClientError> {
        match request {
            Some(request) => self.processor.submit(request).await,
            None => self.api.cancel(task_id, &IntentParams::from_intent(intent)).await,
        }
    }

    /// Ledger writes after the initial insert never fail a dispatch.
    async fn save(&self, record: &JobRecord) {
        if let Err(e) = self.ledger.update(record).await {
            warn!(reference = %record.reference, error = %e, "Failed to update job record");
        }
    }
}
