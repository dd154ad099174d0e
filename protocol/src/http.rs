//! Read-only loopback HTTP mirror of the tool surface.
//!
//! Serves `/health`, `/api/streams`, `/api/streams/:id`, `/api/tasks`,
//! `/api/tasks/:id`, and `/api/activity`. Mutating tools are only reachable
//! over the JSON-RPC channel.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use coord_core::models::{TaskFilter, TaskStatus};
use engine::streams::{StreamGetParams, StreamListParams};
use engine::task_tools::TaskGetParams;
use engine::Coordinator;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

pub fn router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/streams", get(list_streams))
        .route("/api/streams/:id", get(get_stream))
        .route("/api/tasks", get(list_tasks))
        .route("/api/tasks/:id", get(get_task))
        .route("/api/activity", get(list_activity))
        .with_state(coordinator)
}

/// Bind the mirror to loopback only and serve until the process exits.
pub async fn serve(coordinator: Arc<Coordinator>, port: u16) -> std::io::Result<()> {
    let addr = format!("127.0.0.1:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = addr.as_str(), "HTTP mirror listening");
    axum::serve(listener, router(coordinator)).await
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now(),
    }))
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct StreamsQuery {
    initiative_id: Option<String>,
    prd_id: Option<String>,
    #[serde(default)]
    include_archived: bool,
}

async fn list_streams(
    State(coordinator): State<Arc<Coordinator>>,
    Query(query): Query<StreamsQuery>,
) -> Response {
    let params = StreamListParams {
        initiative_id: query.initiative_id,
        prd_id: query.prd_id,
        include_archived: query.include_archived,
    };
    match coordinator.stream_list(params).await {
        Ok(streams) => Json(streams).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn get_stream(
    State(coordinator): State<Arc<Coordinator>>,
    Path(id): Path<String>,
) -> Response {
    let params = StreamGetParams {
        stream_id: id,
        include_archived: true,
    };
    match coordinator.stream_get(params).await {
        Ok(Some(stream)) => Json(stream).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => internal_error(e),
    }
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct TasksQuery {
    prd_id: Option<String>,
    parent_id: Option<String>,
    status: Option<TaskStatus>,
    assigned_agent: Option<String>,
    #[serde(default)]
    include_archived: bool,
    limit: Option<u32>,
}

async fn list_tasks(
    State(coordinator): State<Arc<Coordinator>>,
    Query(query): Query<TasksQuery>,
) -> Response {
    let filter = TaskFilter {
        prd_id: query.prd_id,
        parent_id: query.parent_id,
        status: query.status,
        assigned_agent: query.assigned_agent,
        include_archived: query.include_archived,
        limit: query.limit,
    };
    match coordinator.task_list(filter).await {
        Ok(tasks) => Json(tasks).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn get_task(
    State(coordinator): State<Arc<Coordinator>>,
    Path(id): Path<String>,
) -> Response {
    let params = TaskGetParams {
        task_id: id,
        include_subtasks: true,
        include_work_products: true,
    };
    match coordinator.task_get(params).await {
        Ok(Some(task)) => Json(task).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => internal_error(e),
    }
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ActivityQuery {
    initiative_id: Option<String>,
    limit: Option<u32>,
}

async fn list_activity(
    State(coordinator): State<Arc<Coordinator>>,
    Query(query): Query<ActivityQuery>,
) -> Response {
    match coordinator
        .store()
        .list_activity(query.initiative_id.as_deref(), query.limit.unwrap_or(100))
        .await
    {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => internal_error(e),
    }
}

fn internal_error(error: coord_core::CoordError) -> Response {
    tracing::error!(error = %error, "HTTP mirror request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": error.to_string() })),
    )
        .into_response()
}
