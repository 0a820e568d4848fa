//! Health metrics server.
//!
//! Exposes prometheus metrics on /metrics and a liveness probe on
//! /healthz. Counters and gauges live on [`HealthMetrics`] and are
//! updated directly by the pipeline components that own the work.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Prometheus metrics registry plus the HTTP server that exposes it.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Measurement records accepted into the buffer queue.
    pub records_buffered_total: Counter,
    /// Records folded into profile accumulators.
    pub records_merged_total: Counter,
    /// Completed merge passes.
    pub merge_passes_total: Counter,
    /// Merge passes that failed and left items buffered.
    pub merge_failures_total: Counter,
    /// Duration of merge passes.
    pub merge_pass_duration: Histogram,
    /// Profiles successfully handed to the writer.
    pub profiles_flushed: Counter,
    /// Profile writes that failed; the entries were retained.
    pub flush_failures: Counter,
    /// Duration of flush passes.
    pub flush_duration: Histogram,
    /// Window rotation flushes.
    pub rotations: Counter,
    /// Records currently sitting in the buffer queue.
    pub queue_depth: Gauge,
    /// Profile entries currently accumulating in the map.
    pub map_profiles: Gauge,
}

impl HealthMetrics {
    /// Creates the registry and all pipeline metrics. The server is not
    /// started until [`HealthMetrics::start`] is called.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let records_buffered_total = Counter::with_opts(
            Opts::new(
                "records_buffered_total",
                "Total measurement records accepted into the buffer queue.",
            )
            .namespace("aggregoor"),
        )?;
        let records_merged_total = Counter::with_opts(
            Opts::new(
                "records_merged_total",
                "Total records folded into profile accumulators.",
            )
            .namespace("aggregoor"),
        )?;
        let merge_passes_total = Counter::with_opts(
            Opts::new("merge_passes_total", "Total completed merge passes.").namespace("aggregoor"),
        )?;
        let merge_failures_total = Counter::with_opts(
            Opts::new(
                "merge_failures_total",
                "Total merge passes that failed and left items buffered.",
            )
            .namespace("aggregoor"),
        )?;
        let merge_pass_duration = Histogram::with_opts(
            HistogramOpts::new(
                "merge_pass_duration_seconds",
                "Duration of merge passes in seconds.",
            )
            .namespace("aggregoor")
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        let profiles_flushed = Counter::with_opts(
            Opts::new(
                "profiles_flushed_total",
                "Total profiles successfully handed to the writer.",
            )
            .namespace("aggregoor"),
        )?;
        let flush_failures = Counter::with_opts(
            Opts::new(
                "flush_failures_total",
                "Total profile writes that failed; the entries were retained.",
            )
            .namespace("aggregoor"),
        )?;
        let flush_duration = Histogram::with_opts(
            HistogramOpts::new(
                "flush_duration_seconds",
                "Duration of flush passes in seconds.",
            )
            .namespace("aggregoor")
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0]),
        )?;
        let rotations = Counter::with_opts(
            Opts::new("window_rotations_total", "Total window rotation flushes.")
                .namespace("aggregoor"),
        )?;
        let queue_depth = Gauge::with_opts(
            Opts::new(
                "queue_depth",
                "Measurement records currently sitting in the buffer queue.",
            )
            .namespace("aggregoor"),
        )?;
        let map_profiles = Gauge::with_opts(
            Opts::new(
                "map_profiles",
                "Profile entries currently accumulating in the map.",
            )
            .namespace("aggregoor"),
        )?;

        registry.register(Box::new(records_buffered_total.clone()))?;
        registry.register(Box::new(records_merged_total.clone()))?;
        registry.register(Box::new(merge_passes_total.clone()))?;
        registry.register(Box::new(merge_failures_total.clone()))?;
        registry.register(Box::new(merge_pass_duration.clone()))?;
        registry.register(Box::new(profiles_flushed.clone()))?;
        registry.register(Box::new(flush_failures.clone()))?;
        registry.register(Box::new(flush_duration.clone()))?;
        registry.register(Box::new(rotations.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(map_profiles.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            records_buffered_total,
            records_merged_total,
            merge_passes_total,
            merge_failures_total,
            merge_pass_duration,
            profiles_flushed,
            flush_failures,
            flush_duration,
            rotations,
            queue_depth,
            map_profiles,
        })
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
