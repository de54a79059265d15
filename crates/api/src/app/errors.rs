use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use courier_infra::jobs::{QueueError, SubmitError};

pub fn queue_error_to_response(err: QueueError) -> axum::response::Response {
    match err {
        QueueError::Connection(msg) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "queue_unavailable", msg)
        }
        QueueError::AlreadyExists(id) => {
            json_error(StatusCode::CONFLICT, "conflict", format!("job {id} already exists"))
        }
        other => json_error(StatusCode::INTERNAL_SERVER_ERROR, "queue_error", other.to_string()),
    }
}

pub fn submit_error_to_response(err: SubmitError) -> axum::response::Response {
    match err {
        SubmitError::Invalid(e) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string())
        }
        SubmitError::Queue(e) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "queue_unavailable", e.to_string())
        }
    }
}

pub fn join_error_to_response(err: tokio::task::JoinError) -> axum::response::Response {
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", err.to_string())
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
