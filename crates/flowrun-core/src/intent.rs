//! Execution intents: what a user action or a detected signal asks for.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{TaskId, TaskStatus};

/// Discriminant of an [`ExecutionIntent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    Submit,
    Resume,
    Rerun,
    Cancel,
}

impl fmt::Display for IntentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Submit => "submit",
            Self::Resume => "resume",
            Self::Rerun => "rerun",
            Self::Cancel => "cancel",
        };
        f.write_str(s)
    }
}

/// Job type understood by the external job processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    SubmitTask,
    ResumeWorkflow,
    RerunWorkflow,
}

/// A request to start, continue, restart or stop a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionIntent {
    /// Start a freshly submitted task.
    Submit {
        prompt: String,
        workflow_ref: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sequence: Option<Vec<String>>,
    },
    /// Continue from the current agent.
    Resume {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        workflow_ref: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sequence: Option<Vec<String>>,
    },
    /// Restart from the first agent, discarding completions.
    Rerun {
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        workflow_ref: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sequence: Option<Vec<String>>,
    },
    /// Stop the workflow.
    Cancel,
}

impl ExecutionIntent {
    /// A plain resume that keeps the system of record's own settings.
    pub fn resume(workflow_ref: Option<String>) -> Self {
        Self::Resume {
            prompt: None,
            workflow_ref,
            sequence: None,
        }
    }

    pub fn kind(&self) -> IntentKind {
        match self {
            Self::Submit { .. } => IntentKind::Submit,
            Self::Resume { .. } => IntentKind::Resume,
            Self::Rerun { .. } => IntentKind::Rerun,
            Self::Cancel => IntentKind::Cancel,
        }
    }

    /// Returns true if the intent (re)starts workflow execution.
    pub fn starts_run(&self) -> bool {
        !matches!(self, Self::Cancel)
    }

    /// Job type for the processor; `None` for cancellation, which goes to
    /// the system of record directly.
    pub fn job_type(&self) -> Option<JobType> {
        match self {
            Self::Submit { .. } => Some(JobType::SubmitTask),
            Self::Resume { .. } => Some(JobType::ResumeWorkflow),
            Self::Rerun { .. } => Some(JobType::RerunWorkflow),
            Self::Cancel => None,
        }
    }

    /// System-of-record endpoint path that carries out this intent.
    pub fn endpoint(&self, task_id: &TaskId) -> String {
        let action = match self {
            Self::Submit { .. } => "execute",
            Self::Resume { .. } => "resume-workflow",
            Self::Rerun { .. } => "reexecute",
            Self::Cancel => "cancel",
        };
        format!("/tasks/{}/{}", task_id, action)
    }

    pub fn prompt(&self) -> Option<&str> {
        match self {
            Self::Submit { prompt, .. } | Self::Rerun { prompt, .. } => Some(prompt),
            Self::Resume { prompt, .. } => prompt.as_deref(),
            Self::Cancel => None,
        }
    }

    pub fn workflow_ref(&self) -> Option<&str> {
        match self {
            Self::Submit { workflow_ref, .. } => Some(workflow_ref),
            Self::Resume { workflow_ref, .. } | Self::Rerun { workflow_ref, .. } => {
                workflow_ref.as_deref()
            }
            Self::Cancel => None,
        }
    }

    /// Explicit agent sequence override, if any.
    pub fn sequence(&self) -> Option<&[String]> {
        match self {
            Self::Submit { sequence, .. }
            | Self::Resume { sequence, .. }
            | Self::Rerun { sequence, .. } => sequence.as_deref(),
            Self::Cancel => None,
        }
    }

    /// Returns true if a refresh reporting `status` shows this intent has
    /// taken effect. `previous` is the newest status seen since delivery, or
    /// the one last seen before it.
    ///
    /// A run intent needs the task to enter `InProgress`. A task that was
    /// already running does not count until it has left that state, since
    /// the old run is indistinguishable from the new one.
    pub fn effect_observed(&self, previous: Option<TaskStatus>, status: TaskStatus) -> bool {
        match self {
            Self::Cancel => matches!(
                status,
                TaskStatus::Cancelled | TaskStatus::Completed | TaskStatus::Failed
            ),
            _ => status == TaskStatus::InProgress && previous != Some(TaskStatus::InProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoints_and_job_types() {
        let task = TaskId::new("t1");
        let rerun = ExecutionIntent::Rerun {
            prompt: "again".into(),
            workflow_ref: None,
            sequence: None,
        };

        assert_eq!(rerun.endpoint(&task), "/tasks/t1/reexecute");
        assert_eq!(rerun.job_type(), Some(JobType::RerunWorkflow));
        assert_eq!(ExecutionIntent::resume(None).endpoint(&task), "/tasks/t1/resume-workflow");
        assert_eq!(ExecutionIntent::Cancel.job_type(), None);
        assert!(!ExecutionIntent::Cancel.starts_run());
    }

    #[test]
    fn test_effect_observed() {
        let cancel = ExecutionIntent::Cancel;
        assert!(cancel.effect_observed(Some(TaskStatus::InProgress), TaskStatus::Cancelled));
        assert!(!cancel.effect_observed(None, TaskStatus::InProgress));

        let resume = ExecutionIntent::resume(None);
        assert!(resume.effect_observed(None, TaskStatus::InProgress));
        assert!(resume.effect_observed(Some(TaskStatus::Paused), TaskStatus::InProgress));
        assert!(!resume.effect_observed(Some(TaskStatus::Paused), TaskStatus::Completed));
    }

    #[test]
    fn test_resume_of_running_task_needs_a_restart() {
        let resume = ExecutionIntent::resume(Some("bmad".into()));

        assert!(!resume.effect_observed(Some(TaskStatus::InProgress), TaskStatus::InProgress));
        // Cancelled by the recovery, then picked up again.
        assert!(!resume.effect_observed(Some(TaskStatus::InProgress), TaskStatus::Cancelled));
        assert!(resume.effect_observed(Some(TaskStatus::Cancelled), TaskStatus::InProgress));
    }

    #[test]
    fn test_intent_wire_format() {
        let intent = ExecutionIntent::resume(Some("bmad".into()));
        let json = serde_json::to_value(&intent).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "resume", "workflow_ref": "bmad"}));

        let parsed: ExecutionIntent =
            serde_json::from_str(r#"{"kind":"submit","prompt":"build it","workflow_ref":"bmad"}"#)
                .unwrap();
        assert_eq!(parsed.kind(), IntentKind::Submit);
        assert_eq!(parsed.prompt(), Some("build it"));
    }
}
