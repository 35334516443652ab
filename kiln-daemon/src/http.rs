use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use kiln_session::db::features::NewFeature;
use kiln_session::db::{features, tasks, StoreError};
use kiln_session::exec::CompletionRegistry;
use kiln_session::scheduler::{Scheduler, Submission};
use kiln_session::state::{Feature, Priority, Task, TaskId};

/// Shared application state.
///
/// `completions` must be the registry the scheduler's interactive strategy
/// listens on, otherwise completion reports never reach a session.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Scheduler,
    pub completions: CompletionRegistry,
}

type ApiError = (StatusCode, String);

fn store_error(e: StoreError) -> ApiError {
    match e {
        StoreError::NotFound { .. } => (StatusCode::NOT_FOUND, e.to_string()),
        other => (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub running: Vec<TaskId>,
    pub paused: bool,
    /// Interactive sessions waiting for a completion report.
    pub waiting: Vec<TaskId>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FeatureDetail {
    pub feature: Feature,
    pub tasks: Vec<Task>,
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
}

/// Deliver an interactive session's `complete_task` report.
pub async fn complete_task(
    State(state): State<AppState>,
    Path(task_id): Path<TaskId>,
    Json(report): Json<Value>,
) -> Result<StatusCode, ApiError> {
    if state.completions.complete(task_id, report) {
        info!(task_id, "completion delivered");
        Ok(StatusCode::ACCEPTED)
    } else {
        Err((
            StatusCode::NOT_FOUND,
            format!("no session is waiting for task {}", task_id),
        ))
    }
}

pub async fn trigger(State(state): State<AppState>) -> StatusCode {
    state.scheduler.trigger();
    StatusCode::ACCEPTED
}

pub async fn pause(State(state): State<AppState>) -> Json<SchedulerStatus> {
    state.scheduler.pause();
    Json(status_of(&state))
}

pub async fn resume(State(state): State<AppState>) -> Json<SchedulerStatus> {
    state.scheduler.resume();
    Json(status_of(&state))
}

pub async fn get_status(State(state): State<AppState>) -> Json<SchedulerStatus> {
    Json(status_of(&state))
}

fn status_of(state: &AppState) -> SchedulerStatus {
    SchedulerStatus {
        running: state.scheduler.running_tasks(),
        paused: state.scheduler.is_paused(),
        waiting: state.completions.waiting(),
    }
}

pub async fn get_feature(
    State(state): State<AppState>,
    Path(feature_id): Path<String>,
) -> Result<Json<FeatureDetail>, ApiError> {
    let store = state.scheduler.store().clone();
    tokio::task::spawn_blocking(move || {
        store.call(|conn| {
            let feature = features::find_by_id(conn, &feature_id)?
                .ok_or_else(|| StoreError::NotFound {
                    entity: "feature",
                    id: feature_id.clone(),
                })?;
            let tasks = tasks::list_by_feature(conn, &feature_id)?;
            Ok(FeatureDetail { feature, tasks })
        })
    })
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
    .map(Json)
    .map_err(store_error)
}

pub async fn submit_feature(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<Submission>), ApiError> {
    let description = request.description.trim().to_string();
    if description.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "description must not be empty".to_string(),
        ));
    }
    let scheduler = state.scheduler.clone();
    let new = NewFeature {
        description,
        priority: request.priority,
        ..NewFeature::default()
    };
    tokio::task::spawn_blocking(move || scheduler.submit_feature(new))
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map(|submission| (StatusCode::CREATED, Json(submission)))
        .map_err(store_error)
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/status", get(get_status))
        .route("/trigger", post(trigger))
        .route("/pause", post(pause))
        .route("/resume", post(resume))
        .route("/features", post(submit_feature))
        .route("/features/{id}", get(get_feature))
        .route("/tasks/{id}/complete", post(complete_task))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

pub async fn spawn_http_server(
    port: u16,
    state: AppState,
    cancel: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>, anyhow::Error> {
    let router = build_router(state);
    let listener = TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    info!(port = port, "HTTP server listening");

    let handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
            .ok();
    });

    Ok(handle)
}
