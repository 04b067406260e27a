use crate::app::AppState;
use crate::commands::CommandError;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{delete, get, post};
use axum::Router;
use provisio_common::bus::CommandEnvelope;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

/// Build the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/admin/status", get(get_status))
        .route("/admin/tasks/{id}", delete(cancel_task))
        .route("/commands/{name}", post(run_command))
        .with_state(state)
}

async fn root() -> &'static str {
    "Provisio Orchestrator Online"
}

async fn get_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let orch = &state.orchestrator;
    Json(json!({
        "provider": format!("{:?}", orch.settings().provider).to_lowercase(),
        "commands": state.commands.names(),
        "running_tasks": orch.tasks().running(),
        "tasks": orch.tasks().list(),
        "statistics": orch.stats().snapshot(),
        "recent_actions": orch.journal().recent(50),
    }))
}

async fn cancel_task(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> impl IntoResponse {
    if state.orchestrator.tasks().cancel(id) {
        (StatusCode::OK, Json(json!({"status": "cancelled", "task_id": id}))).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "task_not_running", "task_id": id})),
        )
            .into_response()
    }
}

async fn run_command(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    body: Bytes,
) -> impl IntoResponse {
    let parsed: Value = if body.iter().all(u8::is_ascii_whitespace) {
        Value::Null
    } else {
        match serde_json::from_slice(&body) {
            Ok(v) => v,
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"error": "invalid_json", "message": e.to_string()})),
                )
                    .into_response()
            }
        }
    };
    let params = match parsed {
        Value::Null => serde_json::Map::new(),
        Value::Object(map) => map,
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "invalid_params", "message": "params must be a JSON object"})),
            )
                .into_response()
        }
    };

    match state
        .commands
        .dispatch(state.orchestrator.clone(), &name, params)
        .await
    {
        Ok(result) => (StatusCode::OK, Json(CommandEnvelope::new(&name, result))).into_response(),
        Err(CommandError::Unknown(_)) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "unknown_command", "command": name})),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(command = %name, error = %e, "command failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "command_failed", "message": e.to_string()})),
            )
                .into_response()
        }
    }
}
