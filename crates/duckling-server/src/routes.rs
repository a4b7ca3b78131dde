//! Thin Axum HTTP surface over the engine's public contract (spec §4.11.2)
//! and read-only store views. No business logic lives here — every
//! state-changing call goes straight through `Engine`.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
};
use duckling_core::types::CodingTool;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_stream::StreamExt;

use crate::AppState;

fn internal(e: impl std::fmt::Display) -> StatusCode {
    tracing::error!("internal error: {e}");
    StatusCode::INTERNAL_SERVER_ERROR
}

fn bad_request(msg: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": msg.to_string() })))
}

// ── Request bodies ───────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(crate) struct CreateTaskBody {
    pub title: String,
    pub description: String,
    pub coding_tool: Option<String>,
    pub repository_path: String,
}

#[derive(Deserialize)]
pub(crate) struct RegisterRepositoryBody {
    pub path: String,
    pub name: String,
    pub owner: String,
}

#[derive(Deserialize)]
pub(crate) struct AddPrecommitCheckBody {
    pub name: String,
    pub command: String,
    pub order_index: Option<i64>,
}

#[derive(Deserialize)]
pub(crate) struct TaskLogsQuery {
    pub level: Option<String>,
    pub after_id: Option<i64>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

// ── Health / status ───────────────────────────────────────────────────────

pub(crate) async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub(crate) async fn get_status(State(state): State<Arc<AppState>>) -> Result<Json<Value>, StatusCode> {
    let tasks = state.db.list_tasks().map_err(internal)?;
    let mut by_status = serde_json::Map::new();
    for status in [
        duckling_core::types::TaskStatus::Pending,
        duckling_core::types::TaskStatus::InProgress,
        duckling_core::types::TaskStatus::AwaitingReview,
        duckling_core::types::TaskStatus::Completed,
        duckling_core::types::TaskStatus::Failed,
        duckling_core::types::TaskStatus::Cancelled,
    ] {
        let count = tasks.iter().filter(|t| t.status == status).count();
        by_status.insert(status.as_str().to_string(), json!(count));
    }
    Ok(Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_s": state.start_time.elapsed().as_secs(),
        "total_tasks": tasks.len(),
        "tasks_by_status": by_status,
        "active_task_operations": state.engine.active_task_count(),
    })))
}

// ── Repositories (C14) ───────────────────────────────────────────────────

pub(crate) async fn list_repositories(State(state): State<Arc<AppState>>) -> Result<Json<Value>, StatusCode> {
    let repos = state.db.list_repositories().map_err(internal)?;
    Ok(Json(json!(repos)))
}

pub(crate) async fn register_repository(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RegisterRepositoryBody>,
) -> Result<StatusCode, (StatusCode, Json<Value>)> {
    if body.path.trim().is_empty() {
        return Err(bad_request("path must not be empty"));
    }
    state.db.register_repository(&body.path, &body.name, &body.owner).map_err(|e| (internal(e), Json(json!({}))))?;
    Ok(StatusCode::CREATED)
}

// ── Pre-commit checks (C9 config) ────────────────────────────────────────

pub(crate) async fn list_precommit_checks(State(state): State<Arc<AppState>>) -> Result<Json<Value>, StatusCode> {
    let checks = state.db.list_precommit_checks().map_err(internal)?;
    Ok(Json(json!(checks)))
}

pub(crate) async fn add_precommit_check(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AddPrecommitCheckBody>,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    let id = state
        .db
        .add_precommit_check(&body.name, &body.command, body.order_index.unwrap_or(0))
        .map_err(internal)?;
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

// ── Settings (C1) ─────────────────────────────────────────────────────────

const SETTINGS_KEYS: &[&str] = &[
    duckling_core::settings::BRANCH_PREFIX,
    duckling_core::settings::PR_TITLE_PREFIX,
    duckling_core::settings::COMMIT_SUFFIX,
    duckling_core::settings::MAX_RETRIES,
    duckling_core::settings::BASE_BRANCH,
    duckling_core::settings::DEFAULT_CODING_TOOL,
    duckling_core::settings::GITHUB_USERNAME,
];

pub(crate) async fn get_settings(State(state): State<Arc<AppState>>) -> Result<Json<Value>, StatusCode> {
    use duckling_core::settings::*;
    let settings = Settings::new(&state.db);
    let mut obj = serde_json::Map::new();
    obj.insert(BRANCH_PREFIX.to_string(), json!(settings.branch_prefix()));
    obj.insert(PR_TITLE_PREFIX.to_string(), json!(settings.pr_title_prefix()));
    obj.insert(COMMIT_SUFFIX.to_string(), json!(settings.commit_suffix()));
    obj.insert(MAX_RETRIES.to_string(), json!(settings.max_retries()));
    obj.insert(BASE_BRANCH.to_string(), json!(settings.base_branch()));
    obj.insert(DEFAULT_CODING_TOOL.to_string(), json!(settings.default_coding_tool()));
    obj.insert(GITHUB_USERNAME.to_string(), json!(settings.github_username()));
    Ok(Json(Value::Object(obj)))
}

pub(crate) async fn put_settings(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    let map = body.as_object().ok_or(StatusCode::BAD_REQUEST)?;
    let settings = duckling_core::settings::Settings::new(&state.db);
    let mut updated = 0usize;
    for (key, val) in map {
        if !SETTINGS_KEYS.contains(&key.as_str()) {
            continue;
        }
        let s = match val {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => continue,
        };
        settings.set(key, &s).map_err(internal)?;
        updated += 1;
    }
    Ok(Json(json!({ "updated": updated })))
}

// ── Tasks: engine public contract (spec §4.11.2) ─────────────────────────

pub(crate) async fn list_tasks(State(state): State<Arc<AppState>>) -> Result<Json<Value>, StatusCode> {
    let tasks = state.db.list_tasks().map_err(internal)?;
    Ok(Json(json!(tasks)))
}

pub(crate) async fn get_task(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> Result<Json<Value>, StatusCode> {
    match state.db.get_task(id).map_err(internal)? {
        None => Err(StatusCode::NOT_FOUND),
        Some(task) => Ok(Json(json!(task))),
    }
}

pub(crate) async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateTaskBody>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let coding_tool = body
        .coding_tool
        .as_deref()
        .and_then(CodingTool::parse)
        .unwrap_or(CodingTool::Amp);
    let task_id = state
        .engine
        .create_task(&body.title, &body.description, coding_tool, &body.repository_path)
        .await
        .map_err(bad_request)?;
    Ok((StatusCode::CREATED, Json(json!({ "id": task_id }))))
}

pub(crate) async fn get_task_outputs(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> Result<Json<Value>, StatusCode> {
    if state.db.get_task(id).map_err(internal)?.is_none() {
        return Err(StatusCode::NOT_FOUND);
    }
    let outputs = state.db.task_outputs(id).map_err(internal)?;
    Ok(Json(json!(outputs)))
}

pub(crate) async fn get_task_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(q): Query<TaskLogsQuery>,
) -> Result<Json<Value>, StatusCode> {
    if state.db.get_task(id).map_err(internal)?.is_none() {
        return Err(StatusCode::NOT_FOUND);
    }
    let level = q.level.as_deref().and_then(duckling_core::types::LogLevel::parse);
    let logs = state.db.task_logs(id, level, q.after_id, q.limit, q.offset).map_err(internal)?;
    Ok(Json(json!(logs)))
}

pub(crate) async fn cancel_task(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> Result<StatusCode, (StatusCode, Json<Value>)> {
    state.engine.cancel_task(id).map_err(bad_request)?;
    Ok(StatusCode::OK)
}

pub(crate) async fn retry_task(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> Result<StatusCode, (StatusCode, Json<Value>)> {
    state.engine.retry_task(id).map_err(bad_request)?;
    Ok(StatusCode::OK)
}

pub(crate) async fn mark_complete(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> Result<StatusCode, (StatusCode, Json<Value>)> {
    state.engine.mark_complete(id).map_err(bad_request)?;
    Ok(StatusCode::OK)
}

// ── Real-time streams ─────────────────────────────────────────────────────

/// SSE stream of `TaskUpdateEvent`s (spec §6's "real-time event stream").
/// Consumers reconnect and refetch the task list on disconnect — no replay
/// buffer, matching the event bus's best-effort delivery contract.
pub(crate) async fn sse_task_updates(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let rx = state.engine.subscribe();
    let stream = tokio_stream::wrappers::BroadcastStream::new(rx).filter_map(|msg| match msg {
        Ok(event) => serde_json::to_string(&event).ok().map(|data| Ok(Event::default().data(data))),
        Err(broadcast::error::RecvError::Lagged(_)) => None,
    });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(15)).text("ping"))
}

/// SSE stream of the process-wide structured log tail (§3.1): replays the
/// bounded ring buffer, then streams live lines.
pub(crate) async fn sse_logs(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    let live_rx = state.log_tx.subscribe();
    let history: Vec<String> = state.log_ring.lock().unwrap_or_else(|e| e.into_inner()).iter().cloned().collect();
    tokio::spawn(async move {
        for line in history {
            if tx.send(line).is_err() {
                return;
            }
        }
        let mut live_rx = live_rx;
        loop {
            match live_rx.recv().await {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    });
    let stream = tokio_stream::wrappers::UnboundedReceiverStream::new(rx).map(|data| Ok::<_, std::convert::Infallible>(Event::default().data(data)));
    Sse::new(stream).keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(15)).text("ping"))
}
