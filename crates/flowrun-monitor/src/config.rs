//! Monitor configuration.

use std::path::PathBuf;
use std::time::Duration;

use flowrun_core::signal::{DEFAULT_SIGNAL_COOLDOWN, DEFAULT_SIGNAL_WINDOW};

use crate::coordinator::DEFAULT_DEBOUNCE;
use crate::dispatcher::RetryPolicy;

/// Monitor configuration.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Base URL of the task system of record.
    pub api_url: String,

    /// Job processor submission endpoint.
    pub processor_url: String,

    /// Bearer token for the job processor, passed through unchanged.
    pub processor_token: Option<String>,

    /// Connection name the processor uses to reach the system of record.
    pub connection_name: String,

    /// HTTP server bind address.
    pub http_addr: String,

    /// Ledger snapshot file; in-memory ledger when unset.
    pub ledger_path: Option<PathBuf>,

    /// Workflow reference used for automatic resumes.
    pub workflow_ref: Option<String>,

    /// Delay between two refreshes of one task.
    pub poll_interval: Duration,

    /// Number of most recent log lines scanned for signals.
    pub log_window: usize,

    /// Maximum log lines fetched per refresh.
    pub log_page_limit: usize,

    /// Minimum gap between two accepted dispatches for one task.
    pub debounce: Duration,

    /// How long a rotated-away quota signature stays suppressed.
    pub signal_cooldown: Duration,

    /// Consecutive refresh failures before a monitor reports degraded.
    pub degraded_threshold: u32,

    /// How long a delivered job may wait for its effect to show up.
    pub effect_timeout: Duration,

    /// How long failed or unconfirmed jobs stay in the ledger.
    pub ledger_retention: Duration,

    /// Interval between ledger prune passes.
    pub prune_interval: Duration,

    pub retry: RetryPolicy,

    /// Timeout for every outbound HTTP request.
    pub request_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8000/api".to_string(),
            processor_url: "http://localhost:8080/jobs".to_string(),
            processor_token: None,
            connection_name: "flowrun".to_string(),
            http_addr: "127.0.0.1:7070".to_string(),
            ledger_path: None,
            workflow_ref: None,
            poll_interval: Duration::from_secs(2),
            log_window: DEFAULT_SIGNAL_WINDOW,
            log_page_limit: 200,
            debounce: DEFAULT_DEBOUNCE,
            signal_cooldown: DEFAULT_SIGNAL_COOLDOWN,
            degraded_threshold: 5,
            effect_timeout: Duration::from_secs(120),
            ledger_retention: Duration::from_secs(3600),
            prune_interval: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(15),
        }
    }
}
