//! Intake Worker
//!
//! Consumes extraction and maintenance jobs:
//! 1. Builds the shared services (store, queue, pub/sub, leases, provider)
//! 2. Runs `queue.concurrency` consumers per routed queue
//! 3. Enqueues the stuck-task and retention sweeps on their schedules
//! 4. Exposes Prometheus metrics
//! 5. Drains in-flight jobs on shutdown

mod consumer;
mod scheduler;

use crate::consumer::Consumer;
use crate::scheduler::Scheduler;
use intake_common::{config::AppConfig, metrics, Services, TaskRegistry, VERSION};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = AppConfig::load().map_err(|e| {
        eprintln!("Failed to load configuration: {e}");
        e
    })?;

    init_tracing(&config);
    info!("Starting Intake Worker v{}", VERSION);

    // Initialize metrics
    install_exporter(&config)?;
    metrics::register_metrics();

    let services = Services::from_config(config).await?;
    let config = services.config.clone();
    let registry = Arc::new(TaskRegistry::standard(&services));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers = JoinSet::new();

    for queue_name in registry.queues(&config.queue) {
        for n in 0..config.queue.concurrency.max(1) {
            let consumer = Consumer::new(
                format!("{queue_name}-{n}"),
                queue_name.clone(),
                services.queue.clone(),
                registry.clone(),
                config.queue.poll_interval(),
            );
            workers.spawn(consumer.run(shutdown_rx.clone()));
        }
    }

    let scheduler = Scheduler::new(services.queue.clone(), config.clone());
    workers.spawn(scheduler.run(shutdown_rx));

    info!(
        consumers = workers.len() - 1,
        concurrency = config.queue.concurrency,
        "Worker ready, polling queues..."
    );

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    let drained = tokio::time::timeout(config.shutdown_timeout(), async {
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker task panicked");
            }
        }
    })
    .await;

    if drained.is_err() {
        warn!("Shutdown timeout reached, abandoning in-flight jobs");
        workers.abort_all();
    }

    services.shutdown().await;
    info!("Worker shutdown complete");
    Ok(())
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.observability.log_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    if config.observability.json_logging {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn install_exporter(config: &AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let port = config.observability.metrics_port;
    if port == 0 {
        info!("Metrics exporter disabled");
        return Ok(());
    }

    PrometheusBuilder::new()
        .with_http_listener(SocketAddr::from(([0, 0, 0, 0], port)))
        .set_buckets_for_metric(
            Matcher::Suffix("duration_seconds".to_string()),
            metrics::TASK_BUCKETS,
        )?
        .install()?;

    info!(port, "Metrics exporter listening");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }
}
