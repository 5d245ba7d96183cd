//! Prometheus metrics collection and formatting.
//!
//! This module provides metrics in Prometheus text exposition format.

use std::fmt::Write;
use std::sync::Arc;

use tracing::warn;

use flowrun_core::JobStatus;

use crate::coordinator::CoordinatorState;
use crate::poller::{MonitorHealth, MonitorView};
use crate::state::AppState;

/// Collect all metrics from AppState and format as Prometheus text.
pub async fn collect_metrics(state: &Arc<AppState>) -> String {
    let mut output = String::new();
    let views = state.views().await;

    collect_job_metrics(state, &mut output).await;
    collect_monitor_metrics(&views, &mut output);
    collect_progress_metrics(&views, &mut output);

    output
}

/// Count ledger records by status.
async fn collect_job_metrics(state: &Arc<AppState>, output: &mut String) {
    let jobs = match state.ledger().list(None).await {
        Ok(jobs) => jobs,
        Err(e) => {
            warn!(error = %e, "Failed to read job ledger for metrics");
            return;
        }
    };

    let mut queued = 0u64;
    let mut delivered = 0u64;
    let mut acknowledged = 0u64;
    let mut failed = 0u64;

    for job in &jobs {
        match job.status {
            JobStatus::Queued => queued += 1,
            JobStatus::Delivered => delivered += 1,
            JobStatus::Acknowledged => acknowledged += 1,
            JobStatus::Failed => failed += 1,
        }
    }

    writeln!(output, "# HELP flowrun_jobs Jobs in the local ledger by status").ok();
    writeln!(output, "# TYPE flowrun_jobs gauge").ok();
    writeln!(output, "flowrun_jobs{{status=\"queued\"}} {queued}").ok();
    writeln!(output, "flowrun_jobs{{status=\"delivered\"}} {delivered}").ok();
    writeln!(output, "flowrun_jobs{{status=\"acknowledged\"}} {acknowledged}").ok();
    writeln!(output, "flowrun_jobs{{status=\"failed\"}} {failed}").ok();
}

/// Count monitors by health and coordinator state.
fn collect_monitor_metrics(views: &[MonitorView], output: &mut String) {
    let running: Vec<&MonitorView> = views.iter().filter(|v| !v.finished).collect();

    let degraded = running
        .iter()
        .filter(|v| matches!(v.health, MonitorHealth::Degraded { .. }))
        .count();
    let healthy = running.len() - degraded;

    let mut idle = 0u64;
    let mut dispatching = 0u64;
    let mut cooling_down = 0u64;
    for view in &running {
        match view.coordinator {
            CoordinatorState::Idle => idle += 1,
            CoordinatorState::Dispatching => dispatching += 1,
            CoordinatorState::CoolingDown => cooling_down += 1,
        }
    }

    writeln!(output, "# HELP flowrun_monitors Running task monitors by health").ok();
    writeln!(output, "# TYPE flowrun_monitors gauge").ok();
    writeln!(output, "flowrun_monitors{{health=\"healthy\"}} {healthy}").ok();
    writeln!(output, "flowrun_monitors{{health=\"degraded\"}} {degraded}").ok();

    writeln!(
        output,
        "# HELP flowrun_coordinators Intent coordinators by state"
    )
    .ok();
    writeln!(output, "# TYPE flowrun_coordinators gauge").ok();
    writeln!(output, "flowrun_coordinators{{state=\"idle\"}} {idle}").ok();
    writeln!(
        output,
        "flowrun_coordinators{{state=\"dispatching\"}} {dispatching}"
    )
    .ok();
    writeln!(
        output,
        "flowrun_coordinators{{state=\"cooling_down\"}} {cooling_down}"
    )
    .ok();
}

/// Per-task completion percentage.
fn collect_progress_metrics(views: &[MonitorView], output: &mut String) {
    writeln!(
        output,
        "# HELP flowrun_task_progress_percent Workflow completion per monitored task"
    )
    .ok();
    writeln!(output, "# TYPE flowrun_task_progress_percent gauge").ok();
    for view in views {
        writeln!(
            output,
            "flowrun_task_progress_percent{{task_id=\"{}\"}} {}",
            escape_label(view.task_id.as_str()),
            view.progress.percentage
        )
        .ok();
    }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
