//! FlowRun Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Network/HTTP
//! - Persistence
//! - Runtime specifics
//!
//! Everything here is deterministic: progress computation, log signal
//! classification and job record transitions take their inputs (including
//! the current instant) explicitly so they can be tested in isolation.

pub mod error;
pub mod ids;
pub mod intent;
pub mod job;
pub mod progress;
pub mod signal;
pub mod status;
pub mod task;
pub mod workflow;

// Re-export commonly used types
pub use error::CoreError;
pub use ids::{JobReference, ReferenceGenerator, TaskId};
pub use intent::{ExecutionIntent, IntentKind, JobType};
pub use job::JobRecord;
pub use progress::{compute, CurrentAgent, PhasePosition, Progress, ProgressSnapshot};
pub use signal::{
    Detection, LineClass, LogLevel, LogLine, LogSignal, LogSignalDetector, LogTail,
    SignalDetector, Vocabulary,
};
pub use status::{JobStatus, TaskStatus};
pub use task::MonitorSnapshot;
pub use workflow::{Phase, PhaseRange, WorkflowDefinition};
