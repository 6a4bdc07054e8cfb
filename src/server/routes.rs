//! Axum route handlers for the toolgate HTTP server.
//!
//! # Routes
//!
//! - `GET    /health`        — Liveness probe
//! - `GET    /metrics`       — Prometheus text exposition of the metrics sink
//! - `GET    /capabilities`  — Capability discovery (descriptors + registry stats)
//! - `POST   /tasks`         — Submit a task (202-Accepted polling protocol)
//! - `GET    /tasks`         — List the caller's tasks, filterable
//! - `GET    /tasks/:id`     — Poll one task
//! - `DELETE /tasks/:id`     — Request cancellation
//! - `POST   /invoke`        — Synchronous invocation, bypassing the task machine
//!
//! Caller identity and scope grants arrive from the external auth
//! collaborator as `x-subject-id` and `x-scopes` headers; absent headers
//! mean an anonymous caller with no grants.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::error::{ErrorCode, InvokeError, TaskAccessError};
use crate::runtime::ToolRuntime;
use crate::tasks::{CancelOutcome, TaskPriority, TaskStatus};

/// Shared application state for the HTTP server.
#[derive(Clone)]
pub struct AppState {
    /// The tool-invocation runtime behind every route.
    pub runtime: Arc<ToolRuntime>,
}

impl AppState {
    pub fn new(runtime: Arc<ToolRuntime>) -> Self {
        Self { runtime }
    }
}

/// Build the axum router with all routes.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/capabilities", get(capabilities_handler))
        .route("/tasks", post(create_task_handler).get(list_tasks_handler))
        .route(
            "/tasks/:id",
            get(get_task_handler).delete(cancel_task_handler),
        )
        .route("/invoke", post(invoke_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

type ApiError = (StatusCode, HeaderMap, Json<Value>);

fn api_error(status: StatusCode, code: ErrorCode, message: String) -> ApiError {
    (
        status,
        HeaderMap::new(),
        Json(json!({ "error": { "code": code, "message": message } })),
    )
}

/// Map an invocation failure onto the HTTP boundary.
///
/// Rate-limit rejections carry a `Retry-After` header alongside the body.
fn map_invoke_error(err: InvokeError) -> ApiError {
    let code = err.code();
    let status = match code {
        ErrorCode::PayloadTooLarge | ErrorCode::InvalidStructure | ErrorCode::ValidationError => {
            StatusCode::BAD_REQUEST
        }
        ErrorCode::PermissionDenied => StatusCode::FORBIDDEN,
        ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorCode::ToolNotFound => StatusCode::NOT_FOUND,
        ErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorCode::ExecutionError | ErrorCode::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let message = err.to_string();
    let mut headers = HeaderMap::new();
    if let InvokeError::Admission(admission) = &err {
        if let Some(retry_after) = admission.retry_after() {
            let seconds = retry_after.as_secs().max(1);
            if let Ok(value) = seconds.to_string().parse() {
                headers.insert(header::RETRY_AFTER, value);
            }
        }
    }
    (
        status,
        headers,
        Json(json!({ "error": { "code": code, "message": message } })),
    )
}

fn map_access_error(err: TaskAccessError) -> ApiError {
    match err {
        TaskAccessError::NotFound => (
            StatusCode::NOT_FOUND,
            HeaderMap::new(),
            Json(json!({ "error": { "code": "NOT_FOUND", "message": "task not found" } })),
        ),
        TaskAccessError::Forbidden => (
            StatusCode::FORBIDDEN,
            HeaderMap::new(),
            Json(json!({ "error": { "code": "PERMISSION_DENIED", "message": "task is owned by another caller" } })),
        ),
    }
}

/// Caller identity and scope grants from the auth collaborator's headers.
fn caller_from_headers(headers: &HeaderMap) -> (String, Vec<String>) {
    let subject = headers
        .get("x-subject-id")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .unwrap_or("anonymous")
        .to_string();
    let scopes = headers
        .get("x-scopes")
        .and_then(|v| v.to_str().ok())
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();
    (subject, scopes)
}

fn parse_task_id(id: &str) -> Result<Uuid, ApiError> {
    // An id that cannot exist is indistinguishable from an unknown one.
    id.parse().map_err(|_| {
        (
            StatusCode::NOT_FOUND,
            HeaderMap::new(),
            Json(json!({ "error": { "code": "NOT_FOUND", "message": "task not found" } })),
        )
    })
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /health — liveness probe.
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": crate::VERSION,
        "service": "toolgate",
    }))
}

/// GET /metrics — Prometheus text exposition.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.runtime.metrics().render(),
    )
}

/// GET /capabilities — discovery without instantiation.
async fn capabilities_handler(State(state): State<AppState>) -> impl IntoResponse {
    let registry = state.runtime.registry();
    Json(json!({
        "capabilities": registry.discover(),
        "stats": registry.stats(),
    }))
}

#[derive(Debug, Deserialize)]
struct CreateTaskRequest {
    tool: Option<String>,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(default)]
    priority: Option<TaskPriority>,
}

/// POST /tasks — admit and enqueue a task, returning the 202 envelope.
async fn create_task_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (subject, scopes) = caller_from_headers(&headers);
    let tool = request.tool.filter(|t| !t.is_empty()).ok_or_else(|| {
        api_error(
            StatusCode::BAD_REQUEST,
            ErrorCode::InvalidStructure,
            "missing required field 'tool'".to_string(),
        )
    })?;
    let payload = request.payload.unwrap_or_else(|| json!({}));
    let priority = request.priority.unwrap_or_default();

    let task_id = state
        .runtime
        .submit_task(&subject, &tool, payload, &scopes, priority)
        .map_err(map_invoke_error)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "task_id": task_id,
            "status": "pending",
            "poll_url": format!("/tasks/{}", task_id),
            "cancel_url": format!("/tasks/{}", task_id),
            "estimated_duration_ms": state.runtime.config().tool_timeout.as_millis() as u64,
        })),
    ))
}

/// GET /tasks/:id — poll a task the caller owns.
async fn get_task_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let (subject, _) = caller_from_headers(&headers);
    let task_id = parse_task_id(&id)?;
    let record = state
        .runtime
        .tasks()
        .get(&task_id, &subject)
        .map_err(map_access_error)?;
    Ok(Json(record.view()))
}

/// DELETE /tasks/:id — request cancellation.
///
/// Always 202 for a task the caller owns: pending/running tasks get the
/// flag set, finished tasks get their terminal status back with a no-op
/// message.
async fn cancel_task_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let (subject, _) = caller_from_headers(&headers);
    let task_id = parse_task_id(&id)?;
    let outcome = state
        .runtime
        .tasks()
        .request_cancellation(&task_id, &subject)
        .map_err(map_access_error)?;

    let body = match outcome {
        CancelOutcome::Requested { .. } => json!({
            "task_id": task_id,
            "status": "cancellation_requested",
        }),
        CancelOutcome::AlreadyTerminal { status } => json!({
            "task_id": task_id,
            "status": status,
            "message": "task already reached a terminal state; cancellation is a no-op",
        }),
    };
    Ok((StatusCode::ACCEPTED, Json(body)))
}

#[derive(Debug, Deserialize)]
struct ListTasksQuery {
    status: Option<String>,
    tool: Option<String>,
}

/// GET /tasks?status=&tool= — list the caller's tasks.
async fn list_tasks_handler(
    State(state): State<AppState>,
    Query(query): Query<ListTasksQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let (subject, _) = caller_from_headers(&headers);
    let status = match query.status.as_deref() {
        Some(raw) => Some(raw.parse::<TaskStatus>().map_err(|message| {
            api_error(StatusCode::BAD_REQUEST, ErrorCode::InvalidStructure, message)
        })?),
        None => None,
    };
    let tasks: Vec<Value> = state
        .runtime
        .tasks()
        .list(&subject, status, query.tool.as_deref())
        .iter()
        .map(|record| record.view())
        .collect();
    Ok(Json(json!({ "count": tasks.len(), "tasks": tasks })))
}

#[derive(Debug, Deserialize)]
struct InvokeRequest {
    tool: Option<String>,
    #[serde(default)]
    payload: Option<Value>,
}

/// POST /invoke — synchronous invocation.
async fn invoke_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<InvokeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (subject, scopes) = caller_from_headers(&headers);
    let tool = request.tool.filter(|t| !t.is_empty()).ok_or_else(|| {
        api_error(
            StatusCode::BAD_REQUEST,
            ErrorCode::InvalidStructure,
            "missing required field 'tool'".to_string(),
        )
    })?;
    let payload = request.payload.unwrap_or_else(|| json!({}));

    let result = state
        .runtime
        .invoke(&subject, &tool, payload, &scopes)
        .await
        .map_err(map_invoke_error)?;
    Ok(Json(json!({ "tool": tool, "result": result })))
}
