//! Control routes - JSON request handlers over the app manager

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::core::app::AppStatus;
use crate::core::error::ControlError;
use crate::core::lifecycle::{AppManager, AppSnapshot, HealthSnapshot};
use crate::core::logs::{self, LogTail};

#[derive(Clone)]
pub struct ControlState {
    pub manager: Arc<AppManager>,
    pub max_log_lines: usize,
}

pub fn router(state: ControlState) -> Router {
    Router::new()
        .route("/apps", get(list_apps))
        .route("/apps/:name", get(get_app))
        .route("/apps/:name/health", get(get_health))
        .route("/apps/:name/logs", get(get_logs))
        .route("/apps/:name/start", post(start_app))
        .route("/apps/:name/stop", post(stop_app))
        .route("/apps/:name/restart", post(restart_app))
        .with_state(state)
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let status = match &self {
            ControlError::NotFound(_) => StatusCode::NOT_FOUND,
            ControlError::Busy(_) => StatusCode::CONFLICT,
            ControlError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            ControlError::Spawn(_)
            | ControlError::Signal(_)
            | ControlError::Io { .. }
            | ControlError::Aborted(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!("Control request failed: {}", self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Serialize)]
struct AppList {
    apps: Vec<AppSnapshot>,
}

async fn list_apps(State(state): State<ControlState>) -> Json<AppList> {
    Json(AppList {
        apps: state.manager.list(),
    })
}

async fn get_app(
    State(state): State<ControlState>,
    Path(name): Path<String>,
) -> Result<Json<AppSnapshot>, ControlError> {
    Ok(Json(state.manager.snapshot(&name)?))
}

async fn get_health(
    State(state): State<ControlState>,
    Path(name): Path<String>,
) -> Result<Json<HealthSnapshot>, ControlError> {
    Ok(Json(state.manager.health(&name)?))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    lines: Option<usize>,
    search: Option<String>,
}

#[derive(Serialize)]
struct LogsResponse {
    app: String,
    #[serde(flatten)]
    tail: LogTail,
}

async fn get_logs(
    State(state): State<ControlState>,
    Path(name): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<LogsResponse>, ControlError> {
    let path = state.manager.log_path(&name)?;
    let tail = logs::read_tail(&path, query.lines, query.search.as_deref(), state.max_log_lines)
        .await
        .map_err(|source| ControlError::Io { path, source })?;
    Ok(Json(LogsResponse { app: name, tail }))
}

#[derive(Debug, Serialize)]
struct ActionResponse {
    success: bool,
    app: String,
    status: AppStatus,
}

#[derive(Debug, Clone, Copy)]
enum Action {
    Start,
    Stop,
    Restart,
}

async fn start_app(
    State(state): State<ControlState>,
    Path(name): Path<String>,
) -> Result<Json<ActionResponse>, ControlError> {
    run_action(state, name, Action::Start).await
}

async fn stop_app(
    State(state): State<ControlState>,
    Path(name): Path<String>,
) -> Result<Json<ActionResponse>, ControlError> {
    run_action(state, name, Action::Stop).await
}

async fn restart_app(
    State(state): State<ControlState>,
    Path(name): Path<String>,
) -> Result<Json<ActionResponse>, ControlError> {
    run_action(state, name, Action::Restart).await
}

/// Run a transition on its own task so a dropped connection cannot
/// abandon it halfway.
async fn run_action(
    state: ControlState,
    name: String,
    action: Action,
) -> Result<Json<ActionResponse>, ControlError> {
    info!("Control request: {:?} '{}'", action, name);
    let manager = Arc::clone(&state.manager);
    let app = name.clone();
    let task = tokio::spawn(async move {
        match action {
            Action::Start => manager.start(&app).await,
            Action::Stop => manager.stop(&app).await,
            Action::Restart => manager.restart(&app).await,
        }
    });
    let status = task.await??;
    Ok(Json(ActionResponse {
        success: true,
        app: name,
        status,
    }))
}
