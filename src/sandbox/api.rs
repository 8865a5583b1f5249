use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::chain::{CIRCUIT_OPEN, RECOVERY_IN_PROGRESS};
use super::client::SandboxHandle;
use super::lifecycle::{ExecOptions, SandboxManager};
use super::models::{FailureDetails, InitialContext};
use super::monitor::HealthMonitor;
use crate::errors::SandboxError;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub manager: Arc<SandboxManager>,
    pub monitor: Arc<HealthMonitor>,
    pub ws_tx: broadcast::Sender<String>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ExecRequest {
    pub command: String,
    #[serde(flatten)]
    pub options: ExecOptions,
}

#[derive(Deserialize)]
pub struct AiQueryRequest {
    pub prompt: String,
}

#[derive(Serialize)]
pub struct SandboxResponse {
    pub session_id: String,
    pub sandbox: SandboxHandle,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<SandboxError> for ApiError {
    fn from(err: SandboxError) -> Self {
        let message = err.to_string();
        match err {
            SandboxError::SessionNotFound { .. } => ApiError::NotFound(message),
            SandboxError::SandboxUnhealthy { .. } | SandboxError::Timeout { .. } => {
                ApiError::Unavailable(message)
            }
            SandboxError::Configuration(_)
            | SandboxError::CreationFailed { .. }
            | SandboxError::Provider(_)
            | SandboxError::Store(_)
            | SandboxError::Other(_) => ApiError::Internal(message),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/sandboxes/health", get(health_status))
        .route("/api/sandboxes/recover-all", post(recover_all))
        .route(
            "/api/sessions/{id}/sandbox",
            get(get_sandbox).post(create_sandbox).delete(terminate_sandbox),
        )
        .route("/api/sessions/{id}/exec", post(execute_command))
        .route("/api/sessions/{id}/ai", post(execute_ai_query))
        .route("/api/sessions/{id}/recover", post(recover_session))
        .route("/api/sessions/{id}/snapshot", post(capture_snapshot))
        .route("/api/sessions/{id}/preview/{port}", get(preview_link))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn health_status(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.monitor.get_health_status().await)
}

async fn recover_all(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.monitor.force_recovery_all().await)
}

async fn create_sandbox(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(context): Json<InitialContext>,
) -> Result<impl IntoResponse, ApiError> {
    let sandbox = state.manager.create(&id, context).await?;
    Ok((
        StatusCode::CREATED,
        Json(SandboxResponse {
            session_id: id,
            sandbox,
        }),
    ))
}

async fn get_sandbox(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let sandbox = state
        .manager
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("No sandbox for session {}", id)))?;
    Ok(Json(SandboxResponse {
        session_id: id,
        sandbox,
    }))
}

async fn terminate_sandbox(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.manager.terminate(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn execute_command(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<ExecRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.command.trim().is_empty() {
        return Err(ApiError::BadRequest("command must not be empty".into()));
    }
    let output = state
        .manager
        .execute_command(&id, &req.command, req.options)
        .await?;
    Ok(Json(output))
}

async fn execute_ai_query(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<AiQueryRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.prompt.trim().is_empty() {
        return Err(ApiError::BadRequest("prompt must not be empty".into()));
    }
    let output = state.manager.execute_ai_query(&id, &req.prompt).await?;
    Ok(Json(output))
}

/// Always answers with a `RecoveryResult`; a refused attempt is a 409.
async fn recover_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(failure): Json<FailureDetails>,
) -> impl IntoResponse {
    let result = state.monitor.trigger_manual_recovery(&id, failure).await;
    let gated = [CIRCUIT_OPEN, RECOVERY_IN_PROGRESS];
    let status = if gated.contains(&result.strategy_used.as_str()) {
        StatusCode::CONFLICT
    } else {
        StatusCode::OK
    };
    (status, Json(result))
}

async fn capture_snapshot(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state.manager.capture_snapshot(&id).await?;
    Ok((StatusCode::CREATED, Json(snapshot)))
}

async fn preview_link(
    State(state): State<SharedState>,
    Path((id, port)): Path<(String, u16)>,
) -> Result<impl IntoResponse, ApiError> {
    let link = state.manager.preview_link(&id, Some(port)).await?;
    Ok(Json(link))
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxSettings;
    use crate::sandbox::store::SqliteSessionStore;
    use crate::sandbox::testing::MockSandboxClient;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state() -> (SharedState, Arc<MockSandboxClient>) {
        let client = Arc::new(MockSandboxClient::new());
        let store = Arc::new(SqliteSessionStore::new_in_memory().unwrap());
        let mut settings = SandboxSettings::default();
        settings.recovery.restart_settle_secs = 0;
        let (ws_tx, _) = broadcast::channel(16);
        let monitor = HealthMonitor::new(client.clone(), store.clone(), &settings, ws_tx.clone());
        let manager = SandboxManager::new(client.clone(), store, monitor.clone(), settings);
        let state = Arc::new(AppState {
            manager,
            monitor,
            ws_tx,
        });
        (state, client)
    }

    fn test_app() -> (Router, Arc<MockSandboxClient>) {
        let (state, client) = test_state();
        (api_router().with_state(state), client)
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn empty_request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let (app, _) = test_app();
        let response = app.oneshot(empty_request("GET", "/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_health_status_empty() {
        let (app, _) = test_app();
        let response = app
            .oneshot(empty_request("GET", "/api/sandboxes/health"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let summary: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(summary["total"], 0);
        assert!(summary["sessions"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_then_get_sandbox() {
        let (state, _) = test_state();
        let app = api_router().with_state(state);

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/sessions/s1/sandbox",
                serde_json::json!({"workspace_id": "w1"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(created["session_id"], "s1");
        assert_eq!(created["sandbox"]["id"], "sb-1");

        let response = app
            .clone()
            .oneshot(empty_request("GET", "/api/sessions/s1/sandbox"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(empty_request("GET", "/api/sandboxes/health"))
            .await
            .unwrap();
        let summary: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(summary["healthy"], 1);
        assert_eq!(summary["sessions"][0]["circuit_state"], "closed");
    }

    #[tokio::test]
    async fn test_get_sandbox_not_found() {
        let (app, _) = test_app();
        let response = app
            .oneshot(empty_request("GET", "/api/sessions/missing/sandbox"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert!(body["error"].as_str().unwrap().contains("missing"));
    }

    #[tokio::test]
    async fn test_create_failure_is_500() {
        let (app, client) = test_app();
        client.fail_create(Some("provider exploded"));
        let response = app
            .oneshot(json_request("POST", "/api/sessions/s1/sandbox", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert!(body["error"].as_str().unwrap().contains("provider exploded"));
    }

    #[tokio::test]
    async fn test_exec_rejects_empty_command() {
        let (app, _) = test_app();
        let response = app
            .oneshot(json_request(
                "POST",
                "/api/sessions/s1/exec",
                serde_json::json!({"command": "  "}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_exec_without_sandbox_is_404() {
        let (app, _) = test_app();
        let response = app
            .oneshot(json_request(
                "POST",
                "/api/sessions/s1/exec",
                serde_json::json!({"command": "ls"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_exec_unhealthy_is_503() {
        let (state, client) = test_state();
        state
            .manager
            .create("s1", InitialContext::default())
            .await
            .unwrap();
        client.fail_reconnect("sb-1", "connection refused");
        for _ in 0..3 {
            state.monitor.check_session("s1").await;
        }

        let response = api_router()
            .with_state(state)
            .oneshot(json_request(
                "POST",
                "/api/sessions/s1/exec",
                serde_json::json!({"command": "ls", "timeout_secs": 5}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_exec_returns_output() {
        let (state, client) = test_state();
        state
            .manager
            .create("s1", InitialContext::default())
            .await
            .unwrap();
        client.set_output("sb-1", "node -v", "v22.1.0\n");

        let response = api_router()
            .with_state(state)
            .oneshot(json_request(
                "POST",
                "/api/sessions/s1/exec",
                serde_json::json!({"command": "node -v"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let output: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(output["stdout"], "v22.1.0\n");
        assert_eq!(output["exit_code"], 0);
    }

    #[tokio::test]
    async fn test_manual_recovery_returns_result() {
        let (state, client) = test_state();
        state
            .manager
            .create("s1", InitialContext::default())
            .await
            .unwrap();
        client.kill_sandbox("sb-1");

        let response = api_router()
            .with_state(state)
            .oneshot(json_request(
                "POST",
                "/api/sessions/s1/recover",
                serde_json::json!({"failure_type": "sandbox_terminated", "message": "gone"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let result: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(result["success"], true);
        assert_eq!(result["strategy_used"], "context_preserving_recreation");
        assert_eq!(result["new_sandbox_id"], "sb-2");
    }

    #[tokio::test]
    async fn test_recover_all_with_nothing_unhealthy() {
        let (app, _) = test_app();
        let response = app
            .oneshot(empty_request("POST", "/api/sandboxes/recover-all"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let summary: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(summary["attempted"], 0);
    }

    #[tokio::test]
    async fn test_terminate_is_no_content() {
        let (state, client) = test_state();
        state
            .manager
            .create("s1", InitialContext::default())
            .await
            .unwrap();
        let response = api_router()
            .with_state(state)
            .oneshot(empty_request("DELETE", "/api/sessions/s1/sandbox"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(client.closed(), vec!["sb-1".to_string()]);
    }

    #[tokio::test]
    async fn test_preview_link_route() {
        let (state, _) = test_state();
        state
            .manager
            .create("s1", InitialContext::default())
            .await
            .unwrap();
        let response = api_router()
            .with_state(state)
            .oneshot(empty_request("GET", "/api/sessions/s1/preview/8080"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let link: serde_json::Value = body_json(response.into_body()).await;
        assert!(link["url"].as_str().unwrap().starts_with("https://8080-sb-1"));
    }
}
