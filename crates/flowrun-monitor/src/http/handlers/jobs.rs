//! Job ledger handlers.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::error;

use flowrun_core::TaskId;

use crate::http::responses::{ErrorResponse, JobQuery, JobResponse};
use crate::state::AppState;

/// List ledger records, optionally for one task.
pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<JobQuery>,
) -> Response {
    let task_id = query.task_id.map(TaskId::new);
    match state.ledger().list(task_id.as_ref()).await {
        Ok(jobs) => {
            let response: Vec<JobResponse> = jobs.into_iter().map(JobResponse::from).collect();
            Json(response).into_response()
        }
        Err(e) => {
            error!(error = %e, "Failed to list jobs");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
                .into_response()
        }
    }
}
