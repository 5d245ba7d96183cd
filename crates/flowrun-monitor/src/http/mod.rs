//! HTTP server for the monitor.
//!
//! Provides endpoints for:
//! - Monitored tasks (`/v1/tasks`)
//! - Execution triggers (`/v1/tasks/:id/{submit,resume,rerun,cancel}`)
//! - Job ledger (`/v1/jobs`)
//! - Health check (`/health`)
//! - Prometheus metrics (`/metrics`)

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

mod handlers;
pub mod responses;

/// Create the HTTP router.
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // API routes
        .route("/v1/tasks", get(handlers::list_tasks))
        .route(
            "/v1/tasks/:id",
            get(handlers::get_task).put(handlers::watch_task),
        )
        .route("/v1/tasks/:id/:action", post(handlers::trigger))
        .route("/v1/jobs", get(handlers::list_jobs))
        // Observability routes
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_state;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    async fn call(
        router: Router,
        method: &str,
        uri: &str,
        body: Option<&str>,
    ) -> (StatusCode, serde_json::Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                request = request.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = router.oneshot(request.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test(start_paused = true)]
    async fn test_health() {
        let (status, body) = call(create_router(test_state()), "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_unknown_task_is_not_found() {
        let (status, _) = call(
            create_router(test_state()),
            "POST",
            "/v1/tasks/missing/cancel",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_then_submit() {
        let state = test_state();

        let (status, _) = call(create_router(state.clone()), "PUT", "/v1/tasks/t1", None).await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, _) = call(create_router(state.clone()), "PUT", "/v1/tasks/t1", None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(
            create_router(state.clone()),
            "POST",
            "/v1/tasks/t1/submit",
            Some(r#"{"prompt":"build it","workflow_ref":"bmad"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["accepted"], true);

        let (status, body) = call(
            create_router(state.clone()),
            "POST",
            "/v1/tasks/t1/submit",
            Some(r#"{"prompt":"build it","workflow_ref":"bmad"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["accepted"], false);

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let (status, body) =
            call(create_router(state.clone()), "GET", "/v1/jobs?task_id=t1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["kind"], "submit");

        let (status, body) = call(create_router(state.clone()), "GET", "/v1/tasks", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["task_id"], "t1");
        state.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_without_prompt_is_bad_request() {
        let state = test_state();
        state.watch(flowrun_core::TaskId::new("t1")).await;

        let (status, body) = call(
            create_router(state.clone()),
            "POST",
            "/v1/tasks/t1/submit",
            Some(r#"{"workflow_ref":"bmad"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("prompt"));

        let (status, _) =
            call(create_router(state.clone()), "POST", "/v1/tasks/t1/explode", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        state.shutdown().await;
    }
}
