//! Intake API Gateway
//!
//! The entry point for extraction requests from the intake platform.
//! Handles:
//! - Starting, inspecting and retrying document extractions
//! - Live progress over WebSocket
//! - Rate limiting
//! - Observability (logging, metrics)

mod handlers;
mod middleware;

use axum::{
    extract::{Request, State},
    middleware::{from_fn, Next},
    routing::{get, post},
    Router,
};
use intake_common::{
    config::{AppConfig, Backend},
    extraction::ExtractionService,
    metrics, Services, VERSION,
};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub services: Services,
    pub extraction: ExtractionService,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(services: Services, metrics: Option<PrometheusHandle>) -> Self {
        Self {
            config: services.config.clone(),
            extraction: ExtractionService::new(services.clone()),
            services,
            metrics,
        }
    }
}

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
    info!("Starting Intake API Gateway v{}", VERSION);

    // Initialize metrics
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(format!("{}_request_duration_seconds", metrics::METRICS_PREFIX)),
            metrics::LATENCY_BUCKETS,
        )?
        .install_recorder()?;
    metrics::register_metrics();

    if config.queue.backend == Backend::Memory {
        warn!("In-memory backend: jobs enqueued here are not visible to worker processes");
    }

    let services = Services::from_config(config).await?;
    let state = AppState::new(services.clone(), Some(handle));
    let config = state.config.clone();

    // Build the router
    let app = create_router(state);

    // Start the server
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    services.shutdown().await;
    info!("Server shutdown complete");
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

/// Create the main application router
fn create_router(state: AppState) -> Router {
    let server = &state.config.server;

    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Request ID propagation
    let request_id = SetRequestIdLayer::x_request_id(MakeRequestUuid);
    let propagate_id = PropagateRequestIdLayer::x_request_id();

    // API routes
    let mut api_routes = Router::new()
        .route(
            "/v1/documents/{id}/extraction",
            post(handlers::extraction::enqueue_extraction),
        )
        .route(
            "/v1/documents/{id}/extraction/status",
            get(handlers::extraction::get_status),
        )
        .route(
            "/v1/documents/{id}/extraction/result",
            get(handlers::extraction::get_result),
        )
        .route(
            "/v1/documents/{id}/extraction/retry",
            post(handlers::extraction::request_retry),
        )
        .route(
            "/v1/documents/{id}/extraction/live",
            get(handlers::live::live_status),
        )
        .route_layer(from_fn(middleware::metrics::track_requests));

    if server.rate_limit_enabled {
        let limiter = middleware::rate_limit::create_rate_limiter(
            server.requests_per_second,
            server.burst,
        );
        let limit = server.requests_per_second;
        api_routes = api_routes.layer(from_fn(move |request: Request, next: Next| {
            middleware::rate_limit::rate_limit_middleware(request, next, limiter.clone(), limit)
        }));
    }

    let timeout = TimeoutLayer::new(state.config.request_timeout());

    // Compose the app
    Router::new()
        // Health endpoints
        .route("/health", get(handlers::health::health))
        .route("/ready", get(handlers::health::ready))
        .route("/metrics", get(render_metrics))
        .merge(api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(timeout)
        .layer(cors)
        .layer(request_id)
        .layer(propagate_id)
        .with_state(state)
}

async fn render_metrics(State(state): State<AppState>) -> String {
    state
        .metrics
        .as_ref()
        .map(PrometheusHandle::render)
        .unwrap_or_default()
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
