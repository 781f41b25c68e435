use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, Encoder, Gauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Prometheus metrics for agent health and observability.
///
/// All metrics use the "flowmon" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Total packet records processed into the flow table.
    pub flows_processed: Counter,
    /// Total inserts refused (probe budget or timestamp gate).
    pub flows_dropped: Counter,
    /// Total flows lazily expired along probe paths.
    pub flows_expired: Counter,
    /// Total flows evicted by base-timestamp rebasing.
    pub flows_rebased_out: Counter,
    /// Flow table entries currently live.
    pub table_live: Gauge,
    /// Total update blocks written to the compressed stream.
    pub updates_written: Counter,
    /// Total failed update writes.
    pub update_errors: Counter,
    /// Total thresholded-flow reports written.
    pub threshold_reports_written: Counter,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let flows_processed = Counter::with_opts(
            Opts::new(
                "flows_processed_total",
                "Total packet records processed into the flow table.",
            )
            .namespace("flowmon"),
        )?;
        let flows_dropped = Counter::with_opts(
            Opts::new(
                "flows_dropped_total",
                "Total inserts refused by the flow table.",
            )
            .namespace("flowmon"),
        )?;
        let flows_expired = Counter::with_opts(
            Opts::new(
                "flows_expired_total",
                "Total flows lazily expired along probe paths.",
            )
            .namespace("flowmon"),
        )?;
        let flows_rebased_out = Counter::with_opts(
            Opts::new(
                "flows_rebased_out_total",
                "Total flows evicted by base-timestamp rebasing.",
            )
            .namespace("flowmon"),
        )?;
        let table_live = Gauge::with_opts(
            Opts::new("table_live_entries", "Flow table entries currently live.")
                .namespace("flowmon"),
        )?;
        let updates_written = Counter::with_opts(
            Opts::new(
                "updates_written_total",
                "Total update blocks written to the compressed stream.",
            )
            .namespace("flowmon"),
        )?;
        let update_errors = Counter::with_opts(
            Opts::new("update_errors_total", "Total failed update writes.").namespace("flowmon"),
        )?;
        let threshold_reports_written = Counter::with_opts(
            Opts::new(
                "threshold_reports_written_total",
                "Total thresholded-flow reports written.",
            )
            .namespace("flowmon"),
        )?;

        registry.register(Box::new(flows_processed.clone()))?;
        registry.register(Box::new(flows_dropped.clone()))?;
        registry.register(Box::new(flows_expired.clone()))?;
        registry.register(Box::new(flows_rebased_out.clone()))?;
        registry.register(Box::new(table_live.clone()))?;
        registry.register(Box::new(updates_written.clone()))?;
        registry.register(Box::new(update_errors.clone()))?;
        registry.register(Box::new(threshold_reports_written.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            flows_processed,
            flows_dropped,
            flows_expired,
            flows_rebased_out,
            table_live,
            updates_written,
            update_errors,
            threshold_reports_written,
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

            let result = axum::serve(listener, app)
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
