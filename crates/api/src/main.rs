use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;

use courier_api::app::{AppServices, build_app};
use courier_infra::CourierConfig;
use courier_infra::delivery::{DeliveryClient, DryRunClient, HttpGatewayClient};
use courier_infra::jobs::{
    DispatchWorker, DispatchWorkerHandle, InMemoryJobQueue, JobQueue, RedisJobQueue,
};
use courier_observability::{DispatchMetrics, LogFormat, PrometheusMetrics};

// Workers and the blocking gateway client live on plain threads; only the
// admin HTTP server runs on tokio.
fn main() -> anyhow::Result<()> {
    let config = CourierConfig::from_env().context("invalid configuration")?;
    courier_observability::init(LogFormat::parse(&config.log_format).unwrap_or_default());

    let metrics = Arc::new(PrometheusMetrics::new().context("failed to build metrics registry")?);
    let queue = build_queue(&config, metrics.clone())?;
    let client = build_client(&config)?;

    let workers = (0..config.worker.count)
        .map(|i| {
            DispatchWorker::new(queue.clone(), client.clone())
                .with_config(config.worker.worker_config(i))
                .with_metrics(metrics.clone())
                .spawn()
        })
        .collect::<Result<Vec<_>, _>>()
        .context("failed to spawn dispatch workers")?;
    tracing::info!(count = workers.len(), "dispatch workers started");

    let services = Arc::new(AppServices::new(
        queue,
        metrics,
        config.worker.default_max_attempts,
        config.worker.max_attempts_ceiling,
    ));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    let served = runtime.block_on(serve(config.bind_addr, services));

    stop_workers(workers, config.worker.shutdown_grace);
    served
}

fn build_queue(
    config: &CourierConfig,
    metrics: Arc<PrometheusMetrics>,
) -> anyhow::Result<Arc<dyn JobQueue>> {
    let sink: Arc<dyn DispatchMetrics> = metrics;

    if config.redis.enabled {
        let queue = RedisJobQueue::new(&config.redis.url, Some(config.redis.key_prefix.clone()))?
            .with_retention(config.retention.clone())
            .with_metrics(sink);
        queue
            .ping()
            .with_context(|| format!("redis unreachable at {}", config.redis.url))?;
        tracing::info!(prefix = %config.redis.key_prefix, "using redis job queue");
        Ok(Arc::new(queue))
    } else {
        tracing::warn!("USE_PERSISTENT_STORES not set; jobs are kept in memory only");
        Ok(Arc::new(
            InMemoryJobQueue::new()
                .with_retention(config.retention.clone())
                .with_metrics(sink),
        ))
    }
}

fn build_client(config: &CourierConfig) -> anyhow::Result<Arc<dyn DeliveryClient>> {
    if config.gateway.is_configured() {
        let client = HttpGatewayClient::new(config.gateway.clone())?;
        tracing::info!(
            endpoint = client.endpoint(),
            sandbox = config.gateway.sandbox,
            "using sms gateway"
        );
        Ok(Arc::new(client))
    } else {
        tracing::warn!("SMS_USERNAME/SMS_API_KEY not set; messages will be logged, not sent");
        Ok(Arc::new(DryRunClient::new()))
    }
}

async fn serve(addr: SocketAddr, services: Arc<AppServices>) -> anyhow::Result<()> {
    let app = build_app(services);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}

fn stop_workers(workers: Vec<DispatchWorkerHandle>, grace: std::time::Duration) {
    for w in &workers {
        w.request_shutdown();
    }
    let deadline = Instant::now() + grace;
    for w in workers {
        let name = w.name().to_string();
        let stats = w.stats();
        if w.shutdown_timeout(deadline.saturating_duration_since(Instant::now())) {
            tracing::info!(worker = %name, ?stats, "dispatch worker stopped");
        } else {
            tracing::warn!(
                worker = %name,
                "dispatch worker abandoned mid-delivery; its claim will be swept"
            );
        }
    }
}
