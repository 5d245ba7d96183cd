//! Core domain errors.

use thiserror::Error;

/// Core domain errors for FlowRun.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    /// An agent name appears more than once in a workflow.
    #[error("Duplicate agent in workflow: {0}")]
    DuplicateAgent(String),

    /// A phase was declared without any agents.
    #[error("Phase '{0}' has no agents")]
    EmptyPhase(String),

    /// Phases do not cover the agent sequence exactly.
    #[error("Phases do not partition the agent sequence: {0}")]
    InvalidPartition(String),
}
