use std::sync::Arc;

use axum::{
    Json,
    extract::Extension,
    http::{StatusCode, header},
    response::IntoResponse,
};
use tracing::warn;

use crate::app::dto::HealthResponse;
use crate::app::errors;
use crate::app::services::AppServices;

/// Liveness plus store reachability. Always 200 while the process serves
/// requests; the body says whether the queue store answered.
pub async fn health(Extension(services): Extension<Arc<AppServices>>) -> impl IntoResponse {
    let stats = tokio::task::spawn_blocking(move || services.notifications().queue_stats()).await;

    let queue_error = match stats {
        Ok(Ok(_)) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(e) => Some(e.to_string()),
    };
    if let Some(e) = &queue_error {
        warn!(error = %e, "queue store unreachable");
    }

    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok",
            queue: if queue_error.is_none() { "ok" } else { "unavailable" },
            queue_error,
        }),
    )
}

pub async fn queue_stats(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Response {
    match tokio::task::spawn_blocking(move || services.notifications().queue_stats()).await {
        Ok(Ok(stats)) => Json(stats).into_response(),
        Ok(Err(e)) => errors::queue_error_to_response(e),
        Err(e) => errors::join_error_to_response(e),
    }
}

/// Prometheus text exposition of the injected registry.
pub async fn metrics(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Response {
    match services.metrics().render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            body,
        )
            .into_response(),
        Err(e) => errors::json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "metrics_error",
            e.to_string(),
        ),
    }
}
