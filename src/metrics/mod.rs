use anyhow::Result;
use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use tokio::task::JoinHandle;
use tracing::info;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Reconciliation metrics
    pub static ref RECONCILE_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "charthouse_reconcile_duration_seconds",
            "Time spent reconciling source objects"
        ).buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0]),
        &["kind"]
    ).unwrap();

    pub static ref RECONCILES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "charthouse_reconciles_total",
            "Total number of reconciliations"
        ),
        &["kind"]
    ).unwrap();

    pub static ref RECONCILE_ERRORS: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "charthouse_reconcile_errors_total",
            "Total number of reconciliation errors"
        ),
        &["kind"]
    ).unwrap();

    pub static ref SUSPENDED_RESOURCES: IntGaugeVec = IntGaugeVec::new(
        Opts::new(
            "charthouse_suspended_resources",
            "Whether a resource is suspended (1) or active (0)"
        ),
        &["kind", "namespace", "name"]
    ).unwrap();

    // Storage metrics
    pub static ref ARTIFACTS_STORED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "charthouse_artifacts_stored_total",
            "Total number of artifacts written to storage"
        ),
        &["kind"]
    ).unwrap();

    pub static ref GC_DELETED_FILES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "charthouse_gc_deleted_files_total",
            "Total number of artifact files removed by garbage collection"
        ),
        &["kind"]
    ).unwrap();
}

fn register_metrics() {
    REGISTRY
        .register(Box::new(RECONCILE_DURATION.clone()))
        .expect("collector registered twice");
    REGISTRY.register(Box::new(RECONCILES_TOTAL.clone())).unwrap();
    REGISTRY.register(Box::new(RECONCILE_ERRORS.clone())).unwrap();
    REGISTRY.register(Box::new(SUSPENDED_RESOURCES.clone())).unwrap();
    REGISTRY.register(Box::new(ARTIFACTS_STORED_TOTAL.clone())).unwrap();
    REGISTRY.register(Box::new(GC_DELETED_FILES_TOTAL.clone())).unwrap();
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&REGISTRY.gather(), &mut buffer).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, String::new());
    }
    match String::from_utf8(buffer) {
        Ok(body) => (StatusCode::OK, body),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, String::new()),
    }
}

async fn health_handler() -> impl IntoResponse {
    StatusCode::OK
}

/// Serves /metrics and /healthz on the given address.
pub async fn start_metrics_server(addr: std::net::SocketAddr) -> Result<JoinHandle<()>> {
    register_metrics();

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(health_handler));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "metrics server listening");

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Metrics server error: {}", e);
        }
    });

    Ok(handle)
}
