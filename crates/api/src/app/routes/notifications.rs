use std::sync::Arc;

use axum::{
    Json,
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
};

use courier_infra::jobs::JobStatus;

use crate::app::dto::{SubmitNotificationRequest, SubmitNotificationResponse};
use crate::app::errors;
use crate::app::services::AppServices;

/// Queue a notification. Answers 202: delivery happens later on a worker.
pub async fn submit_notification(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<SubmitNotificationRequest>,
) -> axum::response::Response {
    let submitted = tokio::task::spawn_blocking(move || {
        services.notifications().submit_notification(
            &body.recipient,
            &body.message,
            body.correlation_ref.as_deref().unwrap_or_default(),
            body.max_attempts,
        )
    })
    .await;

    match submitted {
        Ok(Ok(job_id)) => (
            StatusCode::ACCEPTED,
            Json(SubmitNotificationResponse {
                job_id,
                status: JobStatus::Pending,
            }),
        )
            .into_response(),
        Ok(Err(e)) => errors::submit_error_to_response(e),
        Err(e) => errors::join_error_to_response(e),
    }
}
