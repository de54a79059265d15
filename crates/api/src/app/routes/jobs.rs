use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
};

use courier_core::JobId;

use crate::app::dto::JobStatusResponse;
use crate::app::errors;
use crate::app::services::AppServices;

pub async fn job_status(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id: JobId = match id.parse() {
        Ok(id) => id,
        Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", format!("{e}")),
    };

    match tokio::task::spawn_blocking(move || services.notifications().job_status(job_id)).await {
        Ok(Ok(status)) => Json(JobStatusResponse { job_id, status }).into_response(),
        Ok(Err(e)) => errors::queue_error_to_response(e),
        Err(e) => errors::join_error_to_response(e),
    }
}
