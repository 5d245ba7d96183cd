//! Task monitor handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::info;

use flowrun_core::{ExecutionIntent, TaskId};

use crate::coordinator::{Decision, DropReason};
use crate::http::responses::{ErrorResponse, TriggerRequest, TriggerResponse};
use crate::state::AppState;

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

/// List the latest view of every monitor.
pub async fn list_tasks(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.views().await)
}

/// Latest view of one monitor.
pub async fn get_task(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.handle(&TaskId::new(id.as_str())).await {
        Some(handle) => Json(handle.view()).into_response(),
        None => error_response(StatusCode::NOT_FOUND, format!("task {} is not monitored", id)),
    }
}

/// Start monitoring a task.
pub async fn watch_task(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let task_id = TaskId::new(id);
    let created = state.watch(task_id.clone()).await;
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    let view = state.handle(&task_id).await.map(|h| h.view());
    (status, Json(view)).into_response()
}

/// Build the intent named by `action`, filling gaps from the configuration.
pub(crate) fn intent_from_action(
    action: &str,
    request: TriggerRequest,
    default_workflow_ref: Option<&str>,
) -> Result<ExecutionIntent, (StatusCode, String)> {
    let workflow_ref = request
        .workflow_ref
        .or_else(|| default_workflow_ref.map(str::to_string));
    let missing = |field: &str| {
        (
            StatusCode::BAD_REQUEST,
            format!("{} requires a {}", action, field),
        )
    };

    match action {
        "submit" => Ok(ExecutionIntent::Submit {
            prompt: request.prompt.ok_or_else(|| missing("prompt"))?,
            workflow_ref: workflow_ref.ok_or_else(|| missing("workflow_ref"))?,
            sequence: request.sequence,
        }),
        "resume" => Ok(ExecutionIntent::Resume {
            prompt: request.prompt,
            workflow_ref,
            sequence: request.sequence,
        }),
        "rerun" => Ok(ExecutionIntent::Rerun {
            prompt: request.prompt.ok_or_else(|| missing("prompt"))?,
            workflow_ref,
            sequence: request.sequence,
        }),
        "cancel" => Ok(ExecutionIntent::Cancel),
        other => Err((StatusCode::NOT_FOUND, format!("unknown action: {}", other))),
    }
}

/// Trigger an execution intent for a monitored task.
pub async fn trigger(
    State(state): State<Arc<AppState>>,
    Path((id, action)): Path<(String, String)>,
    body: Option<Json<TriggerRequest>>,
) -> Response {
    let task_id = TaskId::new(id);
    let request = body.map(|Json(r)| r).unwrap_or_default();

    let default_ref = state.config().workflow_ref.as_deref();
    let intent = match intent_from_action(&action, request, default_ref) {
        Ok(intent) => intent,
        Err((status, message)) => return error_response(status, message),
    };

    let Some(handle) = state.handle(&task_id).await else {
        return error_response(
            StatusCode::NOT_FOUND,
            format!("task {} is not monitored", task_id),
        );
    };

    let decision = match handle.trigger(intent).await {
        Ok(decision) => decision,
        Err(e) => return error_response(StatusCode::CONFLICT, e.to_string()),
    };

    let mut response = TriggerResponse {
        task_id: task_id.clone(),
        action: action.clone(),
        accepted: true,
        reason: None,
        retry_after_ms: None,
    };
    match decision {
        Decision::Dispatch(_) | Decision::Recover { .. } => {
            info!(task_id = %task_id, action = %action, "Trigger accepted");
        }
        Decision::Drop(reason) => {
            response.accepted = false;
            let (label, retry_after) = match reason {
                DropReason::InFlight => ("in_flight", None),
                DropReason::Debounce { remaining } => {
                    ("debounce", Some(remaining.as_millis() as u64))
                }
                DropReason::StaleSignal => ("stale_signal", None),
                DropReason::NotActionable => ("not_actionable", None),
            };
            response.reason = Some(label.to_string());
            response.retry_after_ms = retry_after;
        }
    }

    (StatusCode::ACCEPTED, Json(response)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intent_from_action_uses_default_workflow_ref() {
        let request = TriggerRequest {
            prompt: Some("again".into()),
            ..Default::default()
        };
        let intent = intent_from_action("rerun", request, Some("bmad")).unwrap();
        assert_eq!(
            intent,
            ExecutionIntent::Rerun {
                prompt: "again".into(),
                workflow_ref: Some("bmad".into()),
                sequence: None,
            }
        );

        let err = intent_from_action("submit", TriggerRequest::default(), None).unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);

        let resume = intent_from_action("resume", TriggerRequest::default(), None).unwrap();
        assert_eq!(resume, ExecutionIntent::resume(None));
    }
}
