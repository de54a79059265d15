use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde_json::json;

use courier_api::app::{AppServices, build_app};
use courier_core::JobId;
use courier_infra::delivery::DryRunClient;
use courier_infra::jobs::{
    DispatchWorker, DispatchWorkerConfig, JobQueue, JobRecord, JobState, QueueError, QueueStats,
};
use courier_observability::PrometheusMetrics;

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn(services: Arc<AppServices>) -> Self {
        // Same router as prod, bound to an ephemeral port.
        let app = build_app(services);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base_url, handle }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn status_of(client: &reqwest::Client, server: &TestServer, job_id: &str) -> String {
    let body: serde_json::Value = client
        .get(server.url(&format!("/jobs/{job_id}")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["job_id"], job_id);
    body["status"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn health_reports_queue_ok() {
    let server = TestServer::spawn(Arc::new(AppServices::in_memory().unwrap())).await;
    let res = reqwest::get(server.url("/health")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["queue"], "ok");
}

#[tokio::test]
async fn submitted_notification_is_pending() {
    let server = TestServer::spawn(Arc::new(AppServices::in_memory().unwrap())).await;
    let client = reqwest::Client::new();

    let res = client
        .post(server.url("/notifications"))
        .json(&json!({
            "recipient": "+254700000000",
            "message": "Your order was received",
            "correlation_ref": "order-17",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);

    let body: serde_json::Value = res.json().await.unwrap();
    let job_id = body["job_id"].as_str().unwrap().to_string();
    assert_eq!(body["status"], "pending");
    assert_eq!(status_of(&client, &server, &job_id).await, "pending");

    let stats: QueueStats = client
        .get(server.url("/queue/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.total_delivered, 0);
}

#[tokio::test]
async fn invalid_notification_is_rejected() {
    let server = TestServer::spawn(Arc::new(AppServices::in_memory().unwrap())).await;
    let client = reqwest::Client::new();

    let res = client
        .post(server.url("/notifications"))
        .json(&json!({ "recipient": "", "message": "hi" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "validation_error");

    let res = client
        .post(server.url("/notifications"))
        .json(&json!({ "recipient": "+254700000000", "message": "hi", "max_attempts": 0 }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client
        .post(server.url("/notifications"))
        .json(&json!({ "recipient": "+254700000000", "message": "hi", "max_attempts": 11 }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "validation_error");
}

#[tokio::test]
async fn job_lookup_handles_malformed_and_unknown_ids() {
    let server = TestServer::spawn(Arc::new(AppServices::in_memory().unwrap())).await;
    let client = reqwest::Client::new();

    let res = client.get(server.url("/jobs/not-a-uuid")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let unknown = JobId::new().to_string();
    assert_eq!(status_of(&client, &server, &unknown).await, "unknown");
}

#[tokio::test]
async fn worker_delivers_submitted_notification() {
    let services = Arc::new(AppServices::in_memory().unwrap());
    let server = TestServer::spawn(services.clone()).await;
    let client = reqwest::Client::new();

    let metrics: Arc<PrometheusMetrics> = services.metrics().clone();
    let worker = DispatchWorker::new(services.queue(), DryRunClient::new())
        .with_config(DispatchWorkerConfig::default().with_poll_interval(Duration::from_millis(10)))
        .with_metrics(metrics)
        .spawn()
        .unwrap();

    let body: serde_json::Value = client
        .post(server.url("/notifications"))
        .json(&json!({ "recipient": "712345678", "message": "Order shipped" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let job_id = body["job_id"].as_str().unwrap().to_string();

    let mut status = String::new();
    for _ in 0..200 {
        status = status_of(&client, &server, &job_id).await;
        if status == "completed" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status, "completed");

    let res = client.get(server.url("/metrics")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert!(
        res.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/plain")
    );
    let text = res.text().await.unwrap();
    assert!(text.contains("courier_jobs_submitted_total 1"));
    assert!(text.contains("courier_jobs_processed_total{status=\"completed\"} 1"));
    assert!(text.contains("courier_sms_sent_total{status=\"delivered\"} 1"));

    assert!(worker.shutdown_timeout(Duration::from_secs(5)));
}

/// Store that refuses every call, as if Redis were down.
#[derive(Debug)]
struct UnreachableQueue;

fn refused<T>() -> Result<T, QueueError> {
    Err(QueueError::Connection("connection refused".into()))
}

impl JobQueue for UnreachableQueue {
    fn submit(&self, _job: JobRecord) -> Result<JobId, QueueError> {
        refused()
    }
    fn claim_next(&self, _now: DateTime<Utc>) -> Result<Option<JobRecord>, QueueError> {
        refused()
    }
    fn record_attempt(&self, _job: &JobRecord) -> Result<(), QueueError> {
        refused()
    }
    fn complete(&self, _job: &mut JobRecord, _now: DateTime<Utc>) -> Result<(), QueueError> {
        refused()
    }
    fn retry(
        &self,
        _job: &mut JobRecord,
        _delay: Duration,
        _now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        refused()
    }
    fn fail(
        &self,
        _job: &mut JobRecord,
        _error: &str,
        _now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        refused()
    }
    fn stats(&self) -> Result<QueueStats, QueueError> {
        refused()
    }
    fn status_of(&self, _id: JobId) -> Result<Option<JobState>, QueueError> {
        refused()
    }
    fn get(&self, _id: JobId) -> Result<Option<JobRecord>, QueueError> {
        refused()
    }
    fn requeue_stale(&self, _now: DateTime<Utc>, _lease: Duration) -> Result<usize, QueueError> {
        refused()
    }
    fn prune_expired(&self, _now: DateTime<Utc>) -> Result<usize, QueueError> {
        refused()
    }
}

#[tokio::test]
async fn store_outage_surfaces_as_unavailable() {
    let services = Arc::new(AppServices::new(
        Arc::new(UnreachableQueue),
        Arc::new(PrometheusMetrics::new().unwrap()),
        3,
        10,
    ));
    let server = TestServer::spawn(services).await;
    let client = reqwest::Client::new();

    let res = client
        .post(server.url("/notifications"))
        .json(&json!({ "recipient": "+254700000000", "message": "hi" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);

    let res = client.get(server.url("/queue/stats")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);

    let health: serde_json::Value = client
        .get(server.url("/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["queue"], "unavailable");
}
