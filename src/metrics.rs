use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts,
    Registry, TextEncoder,
};
use std::time::Duration;

/// Metric name prefix for all worker metrics
const PREFIX: &str = "cms_worker";

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Job execution
    pub static ref JOBS_EXECUTED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_jobs_executed_total"), "Jobs executed by function and outcome"),
        &["function", "outcome"]
    ).expect("Failed to create jobs_executed_total metric");

    pub static ref JOB_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_job_duration_seconds"),
            "Job execution duration in seconds"
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0]),
        &["function"]
    ).expect("Failed to create job_duration_seconds metric");

    pub static ref JOBS_RUNNING: Gauge = Gauge::new(
        format!("{PREFIX}_jobs_running"),
        "Jobs currently executing in this process"
    ).expect("Failed to create jobs_running metric");

    // Counter pipeline
    pub static ref COUNTER_INCREMENT_FAILURES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            format!("{PREFIX}_counter_increment_failures_total"),
            "Counter increments dropped because the key-value service failed"
        ),
        &["namespace"]
    ).expect("Failed to create counter_increment_failures_total metric");

    pub static ref FLUSH_ROWS_TOTAL: IntCounter = IntCounter::new(
        format!("{PREFIX}_flush_rows_total"),
        "Daily counter rows written to durable storage"
    ).expect("Failed to create flush_rows_total metric");

    pub static ref EVICTED_KEYS_TOTAL: IntCounter = IntCounter::new(
        format!("{PREFIX}_evicted_keys_total"),
        "Daily counter keys deleted by cleanup"
    ).expect("Failed to create evicted_keys_total metric");

    // Scheduling
    pub static ref CRON_ENQUEUED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(format!("{PREFIX}_cron_enqueued_total"), "Jobs enqueued by cron definitions"),
        &["definition"]
    ).expect("Failed to create cron_enqueued_total metric");
}

/// Register all metrics with the registry. Safe to call repeatedly.
pub fn init_metrics() {
    let _ = REGISTRY.register(Box::new(JOBS_EXECUTED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOB_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_RUNNING.clone()));
    let _ = REGISTRY.register(Box::new(COUNTER_INCREMENT_FAILURES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(FLUSH_ROWS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(EVICTED_KEYS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(CRON_ENQUEUED_TOTAL.clone()));

    tracing::info!("Metrics system initialized successfully");
}

pub fn record_job_executed(function: &str, outcome: &str, duration: Duration) {
    JOBS_EXECUTED_TOTAL
        .with_label_values(&[function, outcome])
        .inc();
    JOB_DURATION_SECONDS
        .with_label_values(&[function])
        .observe(duration.as_secs_f64());
}

pub fn set_running_jobs(count: usize) {
    JOBS_RUNNING.set(count as f64);
}

pub fn record_counter_failure(namespace: &str) {
    COUNTER_INCREMENT_FAILURES_TOTAL
        .with_label_values(&[namespace])
        .inc();
}

pub fn record_rows_flushed(rows: usize) {
    FLUSH_ROWS_TOTAL.inc_by(rows as u64);
}

pub fn record_keys_evicted(keys: usize) {
    EVICTED_KEYS_TOTAL.inc_by(keys as u64);
}

pub fn record_cron_enqueue(definition: &str) {
    CRON_ENQUEUED_TOTAL.with_label_values(&[definition]).inc();
}

/// Handler for the /metrics endpoint
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => {
            let response = String::from_utf8(buffer).unwrap_or_default();
            (StatusCode::OK, response)
        }
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}

pub fn metrics_router() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

/// Serve `/metrics` on `port` until the listener fails.
pub async fn run_metrics_server(port: u16) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!("Serving metrics on port {}", port);
    axum::serve(listener, metrics_router()).await?;
    Ok(())
}
