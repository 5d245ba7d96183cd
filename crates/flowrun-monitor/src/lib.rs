//! FlowRun Monitor Library
//!
//! Watches Tasks in the system of record, derives workflow progress and
//! log signals from each refresh, and dispatches execution intents through
//! the job processor with a local ledger of every dispatch.

pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod http;
pub mod ledger;
pub mod metrics;
pub mod poller;
pub mod state;

pub use config::MonitorConfig;
pub use coordinator::{CoordinatorState, Decision, DropReason, IntentCoordinator};
pub use dispatcher::{DispatchError, JobDispatcher, RetryPolicy};
pub use ledger::{FileLedger, InMemoryLedger, JobLedger, LedgerError};
pub use poller::{
    MonitorCommand, MonitorHandle, MonitorHealth, MonitorState, MonitorView, TaskMonitor,
};
pub use state::AppState;
