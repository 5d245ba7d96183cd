//! The task document served by the system of record.

use serde::{Deserialize, Serialize};

use crate::TaskStatus;

/// Body of `GET /tasks/{id}/monitor`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitorSnapshot {
    /// Current task status.
    pub status: TaskStatus,

    /// Agent currently executing, or a sentinel such as "starting".
    #[serde(default)]
    pub current_agent: Option<String>,

    /// Agents completed so far in this run.
    #[serde(default)]
    pub completed_agents: Vec<String>,

    /// Sequence the run executes (possibly a slice of the definition).
    #[serde(default)]
    pub workflow_sequence: Vec<String>,

    /// Percentage computed by the system of record, if it reports one.
    #[serde(default)]
    pub progress_percentage: Option<f64>,

    /// Link to the produced result, once available.
    #[serde(default)]
    pub result_link: Option<String>,

    /// Error message if the task failed.
    #[serde(default)]
    pub error_message: Option<String>,
}

impl MonitorSnapshot {
    /// Backend percentage clamped into `0..=100`.
    pub fn backend_percentage(&self) -> Option<u8> {
        self.progress_percentage
            .filter(|p| p.is_finite())
            .map(|p| p.round().clamp(0.0, 100.0) as u8)
    }
}
