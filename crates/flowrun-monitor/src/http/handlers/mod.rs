//! HTTP request handlers.

mod health;
mod jobs;
mod tasks;

pub use health::{health_check, metrics_handler};
pub use jobs::list_jobs;
pub use tasks::{get_task, list_tasks, trigger, watch_task};
