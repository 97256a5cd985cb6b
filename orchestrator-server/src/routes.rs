//! HTTP route handlers: session control, dependencies and the worker task API.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::Router;
use axum::routing::{delete, get, post, put};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use orchestrator::core::types::{ContextKey, ContextType};
use orchestrator::dependencies;
use orchestrator::io::ledger::{ChainOutput, NewProgressEntry, ProgressEntry, TaskStateRecord};
use orchestrator::model::{SessionRecord, Task};
use orchestrator::session::ApproveOutcome;
use orchestrator::{OrchestratorError, SpawnOptions};

use crate::state::AppState;

/// Maps [`OrchestratorError`] onto HTTP status codes.
#[derive(Debug)]
pub struct AppError(OrchestratorError);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            OrchestratorError::Validation(_) => StatusCode::BAD_REQUEST,
            OrchestratorError::NotFound { .. } => StatusCode::NOT_FOUND,
            OrchestratorError::Internal(err) => {
                warn!(err = %format!("{err:#}"), "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

impl<E: Into<OrchestratorError>> From<E> for AppError {
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

type ApiResult<T> = Result<Json<T>, AppError>;

/// Build the API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/sessions", get(list_sessions))
        .route(
            "/sessions/{context_type}/{context_id}",
            get(session_status).post(start_session).delete(stop_session),
        )
        .route("/sessions/{context_type}/{context_id}/history", get(session_history))
        .route("/sessions/{context_type}/{context_id}/input", post(send_input))
        .route("/sessions/{context_type}/{context_id}/resize", post(resize))
        .route("/tasks/{id}/approve", post(approve))
        .route("/tasks/{id}/dependencies", get(list_dependencies).post(add_dependency))
        .route("/tasks/{id}/dependencies/{depends_on}", delete(remove_dependency))
        .route("/tasks/{id}/criteria/{criterion}/check", post(check_criterion))
        .route("/tasks/{id}/progress-log", post(append_progress))
        .route("/tasks/{id}/chain-output", put(set_chain_output))
        .route("/tasks/{id}/state", get(task_state))
}

async fn health() -> &'static str {
    "ok"
}

/// GET /api/sessions - active sessions.
async fn list_sessions(State(state): State<AppState>) -> ApiResult<Vec<SessionRecord>> {
    Ok(Json(state.supervisor.list_active()?))
}

/// POST /api/sessions/:type/:id - start a session; the body is optional.
async fn start_session(
    State(state): State<AppState>,
    Path((context_type, context_id)): Path<(ContextType, String)>,
    body: Option<Json<SpawnOptions>>,
) -> Result<(StatusCode, Json<SessionRecord>), AppError> {
    let options = body.map(|Json(options)| options).unwrap_or_default();
    let record = state
        .supervisor
        .spawn(ContextKey::new(context_type, context_id), options)
        .await?;
    Ok((StatusCode::CREATED, Json(record)))
}

#[derive(Serialize)]
struct StopResponse {
    stopped: bool,
}

/// DELETE /api/sessions/:type/:id - request termination.
async fn stop_session(
    State(state): State<AppState>,
    Path((context_type, context_id)): Path<(ContextType, String)>,
) -> ApiResult<StopResponse> {
    let stopped = state
        .supervisor
        .stop(&ContextKey::new(context_type, context_id))?;
    Ok(Json(StopResponse { stopped }))
}

/// GET /api/sessions/:type/:id - active session, or the most recent one.
async fn session_status(
    State(state): State<AppState>,
    Path((context_type, context_id)): Path<(ContextType, String)>,
) -> ApiResult<SessionRecord> {
    let key = ContextKey::new(context_type, context_id);
    let record = state
        .supervisor
        .status(&key)?
        .ok_or_else(|| OrchestratorError::not_found("session", key.to_string()))?;
    Ok(Json(record))
}

async fn session_history(
    State(state): State<AppState>,
    Path((context_type, context_id)): Path<(ContextType, String)>,
) -> ApiResult<Vec<SessionRecord>> {
    let key = ContextKey::new(context_type, context_id);
    Ok(Json(state.supervisor.history(&key)?))
}

#[derive(Deserialize)]
struct InputRequest {
    data: String,
}

async fn send_input(
    State(state): State<AppState>,
    Path((context_type, context_id)): Path<(ContextType, String)>,
    Json(body): Json<InputRequest>,
) -> Result<StatusCode, AppError> {
    state
        .supervisor
        .send_input(&ContextKey::new(context_type, context_id), body.data.as_bytes())?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct ResizeRequest {
    cols: u16,
    rows: u16,
}

async fn resize(
    State(state): State<AppState>,
    Path((context_type, context_id)): Path<(ContextType, String)>,
    Json(body): Json<ResizeRequest>,
) -> Result<StatusCode, AppError> {
    if body.cols == 0 || body.rows == 0 {
        return Err(OrchestratorError::validation("cols and rows must be > 0").into());
    }
    state
        .supervisor
        .resize(&ContextKey::new(context_type, context_id), body.cols, body.rows)?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/tasks/:id/approve
async fn approve(State(state): State<AppState>, Path(task_id): Path<String>) -> ApiResult<ApproveOutcome> {
    Ok(Json(state.supervisor.approve(&task_id).await?))
}

#[derive(Serialize)]
struct DependencyListing {
    dependencies: Vec<Task>,
    dependents: Vec<Task>,
}

async fn list_dependencies(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<DependencyListing> {
    Ok(Json(DependencyListing {
        dependencies: dependencies::dependencies(state.store(), &task_id)?,
        dependents: dependencies::dependents(state.store(), &task_id)?,
    }))
}

#[derive(Deserialize)]
struct AddDependencyRequest {
    depends_on_task_id: String,
}

async fn add_dependency(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Json(body): Json<AddDependencyRequest>,
) -> Result<StatusCode, AppError> {
    dependencies::add_dependency(state.store(), &task_id, &body.depends_on_task_id)?;
    Ok(StatusCode::CREATED)
}

async fn remove_dependency(
    State(state): State<AppState>,
    Path((task_id, depends_on)): Path<(String, String)>,
) -> Result<StatusCode, AppError> {
    if dependencies::remove_dependency(state.store(), &task_id, &depends_on)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(OrchestratorError::not_found("dependency", format!("{task_id} -> {depends_on}")).into())
    }
}

/// POST /api/tasks/:id/criteria/:criterion/check - called by workers.
async fn check_criterion(
    State(state): State<AppState>,
    Path((task_id, criterion_id)): Path<(String, String)>,
) -> Result<StatusCode, AppError> {
    state.task(&task_id)?;
    let known = state
        .store()
        .criteria(&task_id)?
        .iter()
        .any(|c| c.id == criterion_id);
    if !known {
        return Err(OrchestratorError::not_found("criterion", criterion_id).into());
    }
    state.store().set_criterion_checked(&task_id, &criterion_id, true)?;
    info!(task_id = %task_id, criterion_id = %criterion_id, "criterion checked");
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/tasks/:id/progress-log - append a session entry to the ledger.
async fn append_progress(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Json(entry): Json<NewProgressEntry>,
) -> Result<(StatusCode, Json<ProgressEntry>), AppError> {
    let task = state.task(&task_id)?;
    let ledger = state.ledger(&task)?;
    let appended = ledger.append_session(&task.id, entry)?;
    Ok((StatusCode::CREATED, Json(appended)))
}

/// PUT /api/tasks/:id/chain-output - record what dependents should know.
async fn set_chain_output(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Json(output): Json<ChainOutput>,
) -> ApiResult<TaskStateRecord> {
    if output.summary.trim().is_empty() {
        return Err(OrchestratorError::validation("chain output summary must not be empty").into());
    }
    let task = state.task(&task_id)?;
    let ledger = state.ledger(&task)?;
    Ok(Json(ledger.set_chain_output(&task.id, output)?))
}

/// GET /api/tasks/:id/state - the task's state document.
async fn task_state(State(state): State<AppState>, Path(task_id): Path<String>) -> ApiResult<TaskStateRecord> {
    let task = state.task(&task_id)?;
    let ledger = state.ledger(&task)?;
    let record = ledger
        .read(&task.id)?
        .ok_or_else(|| OrchestratorError::not_found("task state", &task.id))?;
    Ok(Json(record))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use orchestrator::Supervisor;
    use orchestrator::core::types::TaskStatus;
    use orchestrator::io::config::OrchestratorConfig;
    use orchestrator::io::init::OrchestratorPaths;
    use orchestrator::io::store::{LocalStore, Store};
    use orchestrator::test_support::{criterion, project, task};
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;

    fn app(root: &std::path::Path) -> (Router, Arc<LocalStore>) {
        let store = Arc::new(LocalStore::in_memory());
        store.upsert_project(project("p1", root)).expect("project");
        store.upsert_task(task("t1", "p1")).expect("t1");
        store.upsert_task(task("t2", "p1")).expect("t2");
        store.upsert_criterion(criterion("t1", "c1", 0)).expect("criterion");
        let paths = OrchestratorPaths::new(root);
        let supervisor = Supervisor::new(store.clone(), OrchestratorConfig::default(), &paths.workspaces_dir);
        let router = api_router().with_state(AppState::new(supervisor, paths));
        (router, store)
    }

    async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("request");
        let response = router.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    #[tokio::test]
    async fn worker_task_api_updates_ledger_and_criteria() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (router, store) = app(temp.path());

        let (status, _) = send(&router, "POST", "/tasks/t1/criteria/c1/check", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(store.criteria("t1").expect("criteria")[0].checked);

        let entry = serde_json::json!({
            "accomplishments": ["wired the form"],
            "next_steps": "validation"
        });
        let (status, body) = send(&router, "POST", "/tasks/t1/progress-log", Some(entry)).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["session_number"], 1);

        let output = serde_json::json!({ "summary": "form ready" });
        let (status, _) = send(&router, "PUT", "/tasks/t1/chain-output", Some(output)).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&router, "GET", "/tasks/t1/state", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["chain_output"]["summary"], "form ready");
        assert_eq!(body["progress_log"][0]["accomplishments"][0], "wired the form");
    }

    #[tokio::test]
    async fn errors_map_to_status_codes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (router, _) = app(temp.path());

        let (status, body) = send(&router, "POST", "/tasks/t1/criteria/nope/check", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().expect("error").contains("criterion"));

        let (status, _) = send(&router, "GET", "/tasks/missing/state", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let self_edge = serde_json::json!({ "depends_on_task_id": "t1" });
        let (status, _) = send(&router, "POST", "/tasks/t1/dependencies", Some(self_edge)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&router, "POST", "/sessions/task/t1/input", Some(serde_json::json!({"data": "y"}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn dependency_routes_round_trip() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (router, store) = app(temp.path());

        let edge = serde_json::json!({ "depends_on_task_id": "t2" });
        let (status, _) = send(&router, "POST", "/tasks/t1/dependencies", Some(edge)).await;
        assert_eq!(status, StatusCode::CREATED);

        let (_, body) = send(&router, "GET", "/tasks/t2/dependencies", None).await;
        assert_eq!(body["dependents"][0]["id"], "t1");

        let (status, _) = send(&router, "DELETE", "/tasks/t1/dependencies/t2", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&router, "DELETE", "/tasks/t1/dependencies/t2", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(store.task("t1").expect("read").expect("task").status, TaskStatus::Backlog);
    }

    #[tokio::test]
    async fn stop_without_session_reports_false() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (router, _) = app(temp.path());
        let (status, body) = send(&router, "DELETE", "/sessions/epic/e1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stopped"], false);

        let (status, _) = send(&router, "GET", "/sessions/epic/e1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
