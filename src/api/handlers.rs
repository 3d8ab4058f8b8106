use super::protocol::*;
use super::session::{DriverSession, SessionError};
use crate::cluster::ClusterStats;
use crate::executor::types::{TaskId, TaskSpec};
use crate::ownership::types::ObjectId;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    routing::{get, post},
};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn status_of(err: &SessionError) -> StatusCode {
    match err {
        SessionError::UnknownObject(_) => StatusCode::NOT_FOUND,
        SessionError::BadRequest(_) => StatusCode::BAD_REQUEST,
        SessionError::Object(err) => status_for(err),
    }
}

pub fn router(session: Arc<DriverSession>) -> Router {
    Router::new()
        .route(ENDPOINT_PUT, post(handle_put))
        .route(ENDPOINT_OBJECT, get(handle_get).delete(handle_release))
        .route(ENDPOINT_SUBMIT_TASK, post(handle_submit_task))
        .route(ENDPOINT_TASK_STATUS, get(handle_get_task_status))
        .route(ENDPOINT_STATS, get(handle_stats))
        .layer(Extension(session))
}

pub async fn handle_put(
    Extension(session): Extension<Arc<DriverSession>>,
    Json(req): Json<PutRequest>,
) -> (StatusCode, Json<PutResponse>) {
    match session.put_json(&req.value).await {
        Ok(object) => {
            tracing::debug!("Put object {}", object);
            (
                StatusCode::OK,
                Json(PutResponse {
                    object: Some(object),
                    error: None,
                }),
            )
        }
        Err(e) => {
            tracing::error!("Failed to put: {}", e);
            (
                status_of(&e),
                Json(PutResponse {
                    object: None,
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}

pub async fn handle_get(
    Extension(session): Extension<Arc<DriverSession>>,
    Path(id): Path<Uuid>,
    Query(query): Query<GetQuery>,
) -> (StatusCode, Json<GetResponse>) {
    let timeout = query.timeout_ms.map(Duration::from_millis);

    match session.get_json(&ObjectId(id), timeout).await {
        Ok(value) => (
            StatusCode::OK,
            Json(GetResponse {
                value: Some(value),
                error: None,
            }),
        ),
        Err(e) => {
            tracing::debug!("Get of {} failed: {}", id, e);
            (
                status_of(&e),
                Json(GetResponse {
                    value: None,
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}

pub async fn handle_release(
    Extension(session): Extension<Arc<DriverSession>>,
    Path(id): Path<Uuid>,
) -> (StatusCode, Json<ReleaseResponse>) {
    if session.release(&ObjectId(id)) {
        tracing::debug!("Released object {}", id);
        (StatusCode::OK, Json(ReleaseResponse { released: true }))
    } else {
        (StatusCode::NOT_FOUND, Json(ReleaseResponse { released: false }))
    }
}

pub async fn handle_submit_task(
    Extension(session): Extension<Arc<DriverSession>>,
    Json(req): Json<SubmitTaskRequest>,
) -> (StatusCode, Json<SubmitTaskResponse>) {
    if !session.cluster().registry().has_handler(&req.handler) {
        return (
            StatusCode::BAD_REQUEST,
            Json(SubmitTaskResponse {
                object: None,
                task_id: None,
                error: Some(format!("Unknown task handler: {}", req.handler)),
            }),
        );
    }

    let mut spec = TaskSpec::new(req.handler);
    if let Some(max_retries) = req.max_retries {
        spec = spec.with_max_retries(max_retries);
    }
    if let Some(delay) = req.retry_delay_ms {
        spec = spec.with_retry_delay(Duration::from_millis(delay));
    }

    match session.submit(spec, &req.args).await {
        Ok(handle) => {
            let task_id = session.driver().tasks().task_for(&handle.object_ref());
            tracing::info!("Task submitted successfully: {:?}", task_id);
            (
                StatusCode::OK,
                Json(SubmitTaskResponse {
                    object: Some(handle.id()),
                    task_id,
                    error: None,
                }),
            )
        }
        Err(e) => {
            tracing::error!("Failed to submit task: {}", e);
            (
                status_of(&e),
                Json(SubmitTaskResponse {
                    object: None,
                    task_id: None,
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}

pub async fn handle_get_task_status(
    Extension(session): Extension<Arc<DriverSession>>,
    Path(id): Path<Uuid>,
) -> (StatusCode, Json<Option<TaskStatusResponse>>) {
    let task_id = TaskId(id);

    match session.driver().tasks().task(&task_id) {
        Some(task) => {
            tracing::debug!("Task status query: {} -> {:?}", task_id, task.status);
            (
                StatusCode::OK,
                Json(Some(TaskStatusResponse {
                    task_id,
                    handler: task.spec.handler,
                    status: task.status,
                    attempts: task.attempts,
                    return_object: task.return_ref.id,
                    created_at: task.created_at,
                })),
            )
        }
        None => {
            tracing::debug!("Task not found: {}", task_id);
            (StatusCode::NOT_FOUND, Json(None))
        }
    }
}

pub async fn handle_stats(Extension(session): Extension<Arc<DriverSession>>) -> Json<ClusterStats> {
    Json(session.cluster().stats())
}
