use axum::{
    Router,
    routing::{get, post},
};

pub mod jobs;
pub mod notifications;
pub mod system;

/// Router for all admin endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/health", get(system::health))
        .route("/queue/stats", get(system::queue_stats))
        .route("/metrics", get(system::metrics))
        .route("/jobs/:id", get(jobs::job_status))
        .route("/notifications", post(notifications::submit_notification))
}
