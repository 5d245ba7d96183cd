//! Client library for FlowRun's external collaborators.
//!
//! Provides the ports the monitor depends on ([`TaskApi`] for the task
//! system of record, [`JobProcessor`] for the asynchronous job processor)
//! together with their HTTP implementations.

pub mod api;
pub mod error;
pub mod http;

pub use api::{IntentParams, JobProcessor, JobRequest, TaskApi};
pub use error::ClientError;
pub use http::{HttpJobProcessor, HttpTaskApi};
