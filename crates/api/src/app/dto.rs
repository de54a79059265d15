use serde::{Deserialize, Serialize};

use courier_core::JobId;
use courier_infra::jobs::JobStatus;

#[derive(Debug, Deserialize)]
pub struct SubmitNotificationRequest {
    pub recipient: String,
    pub message: String,
    #[serde(default)]
    pub correlation_ref: Option<String>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct SubmitNotificationResponse {
    pub job_id: JobId,
    pub status: JobStatus,
}

#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub job_id: JobId,
    pub status: JobStatus,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub queue: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_error: Option<String>,
}
