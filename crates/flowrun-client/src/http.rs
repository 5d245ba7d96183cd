//! HTTP implementations of the client ports.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use flowrun_core::{LogLine, MonitorSnapshot, TaskId};

use crate::api::{IntentParams, JobProcessor, JobRequest, TaskApi};
use crate::error::ClientError;

fn build_client(timeout: Duration) -> Result<reqwest::Client, ClientError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ClientError::Config(e.to_string()))
}

/// Turn a non-success response into [`ClientError::Status`].
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ClientError::Status {
        status: status.as_u16(),
        body,
    })
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ClientError> {
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| ClientError::Decode(e.to_string()))
}

/// Log pages come either bare or wrapped in `{"logs": [...]}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum LogsPage {
    Wrapped { logs: Vec<LogLine> },
    Bare(Vec<LogLine>),
}

/// HTTP client for the task system of record.
pub struct HttpTaskApi {
    inner: reqwest::Client,
    base_url: String,
}

impl HttpTaskApi {
    /// Create a new client for `base_url` (e.g. `http://localhost:8000/api`).
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ClientError> {
        Ok(Self {
            inner: build_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl TaskApi for HttpTaskApi {
    async fn monitor(&self, task_id: &TaskId) -> Result<MonitorSnapshot, ClientError> {
        let url = format!("{}/tasks/{}/monitor", self.base_url, task_id);
        debug!(url = %url, "GET request");

        let response = self.inner.get(&url).send().await?;
        decode(check_status(response).await?).await
    }

    async fn logs(
        &self,
        task_id: &TaskId,
        after_seq: Option<u64>,
        limit: usize,
    ) -> Result<Vec<LogLine>, ClientError> {
        let url = format!("{}/tasks/{}/logs", self.base_url, task_id);
        let mut query: Vec<(&str, String)> = vec![("limit", limit.to_string())];
        if let Some(seq) = after_seq {
            query.push(("after_seq", seq.to_string()));
        }
        debug!(url = %url, after_seq = ?after_seq, "GET request");

        let response = self.inner.get(&url).query(&query).send().await?;
        let page: LogsPage = decode(check_status(response).await?).await?;
        Ok(match page {
            LogsPage::Wrapped { logs } => logs,
            LogsPage::Bare(logs) => logs,
        })
    }

    async fn cancel(&self, task_id: &TaskId, params: &IntentParams) -> Result<(), ClientError> {
        let url = format!("{}/tasks/{}/cancel", self.base_url, task_id);
        debug!(url = %url, "POST request");

        let response = self.inner.post(&url).json(params).send().await?;
        check_status(response).await?;
        Ok(())
    }
}

/// HTTP client for the job processor's submission endpoint.
pub struct HttpJobProcessor {
    inner: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl HttpJobProcessor {
    /// Create a client posting jobs to `url`. The token, if any, is sent as
    /// a bearer credential and never inspected.
    pub fn new(url: &str, token: Option<String>, timeout: Duration) -> Result<Self, ClientError> {
        Ok(Self {
            inner: build_client(timeout)?,
            url: url.to_string(),
            token,
        })
    }
}

#[async_trait]
impl JobProcessor for HttpJobProcessor {
    async fn submit(&self, request: &JobRequest) -> Result<(), ClientError> {
        debug!(
            url = %self.url,
            reference = %request.reference,
            job_type = ?request.job_type,
            "Submitting job"
        );

        let mut builder = self.inner.post(&self.url).json(request);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        let response = builder.send().await?;
        check_status(response).await?;
        Ok(())
    }
}
