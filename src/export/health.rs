use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Prometheus metrics for pipeline health, served over HTTP.
///
/// All metrics use the "spanharvest" namespace. These are the pipeline's
/// only outward visibility besides logs; delivery payloads themselves are
/// the product, not telemetry.
pub struct HealthMetrics {
    registry: Registry,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Raw records taken off the ingest feed.
    pub records_received: Counter,
    /// Records skipped because they failed to decode.
    pub decode_errors: Counter,
    /// Records dropped for carrying no destination credential.
    pub records_unrouted: Counter,
    /// Spans dropped for missing required fields.
    pub invalid_spans: Counter,
    /// Spans routed into the store, by pipeline variant (metric/span).
    pub spans_ingested: CounterVec,
    /// Harvest cycles that cut at least one batch.
    pub harvest_cycles: Counter,
    /// Batches produced by harvest cuts.
    pub harvest_batches: Counter,
    /// Successful batch deliveries.
    pub deliveries: Counter,
    /// Failed batch deliveries.
    pub delivery_errors: Counter,
    /// Batches merged back into the store after a failed delivery.
    pub reintegrations: Counter,
    /// Destination buckets currently holding pending state.
    pub destinations_tracked: Gauge,
}

impl HealthMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let records_received = Counter::with_opts(opts(
            "records_received_total",
            "Raw records taken off the ingest feed",
        ))?;
        let decode_errors = Counter::with_opts(opts(
            "record_decode_errors_total",
            "Records skipped because they failed to decode",
        ))?;
        let records_unrouted = Counter::with_opts(opts(
            "records_unrouted_total",
            "Records dropped for carrying no destination credential",
        ))?;
        let invalid_spans = Counter::with_opts(opts(
            "invalid_spans_total",
            "Spans dropped for missing required fields",
        ))?;
        let spans_ingested = CounterVec::new(
            opts("spans_ingested_total", "Spans routed into the store"),
            &["variant"],
        )?;
        let harvest_cycles = Counter::with_opts(opts(
            "harvest_cycles_total",
            "Harvest cycles that cut at least one batch",
        ))?;
        let harvest_batches = Counter::with_opts(opts(
            "harvest_batches_total",
            "Batches produced by harvest cuts",
        ))?;
        let deliveries =
            Counter::with_opts(opts("deliveries_total", "Successful batch deliveries"))?;
        let delivery_errors =
            Counter::with_opts(opts("delivery_errors_total", "Failed batch deliveries"))?;
        let reintegrations = Counter::with_opts(opts(
            "reintegrations_total",
            "Batches merged back into the store after a failed delivery",
        ))?;
        let destinations_tracked = Gauge::with_opts(opts(
            "destinations_tracked",
            "Destination buckets currently holding pending state",
        ))?;

        registry.register(Box::new(records_received.clone()))?;
        registry.register(Box::new(decode_errors.clone()))?;
        registry.register(Box::new(records_unrouted.clone()))?;
        registry.register(Box::new(invalid_spans.clone()))?;
        registry.register(Box::new(spans_ingested.clone()))?;
        registry.register(Box::new(harvest_cycles.clone()))?;
        registry.register(Box::new(harvest_batches.clone()))?;
        registry.register(Box::new(deliveries.clone()))?;
        registry.register(Box::new(delivery_errors.clone()))?;
        registry.register(Box::new(reintegrations.clone()))?;
        registry.register(Box::new(destinations_tracked.clone()))?;

        Ok(Self {
            registry,
            shutdown: parking_lot::Mutex::new(None),
            records_received,
            decode_errors,
            records_unrouted,
            invalid_spans,
            spans_ingested,
            harvest_cycles,
            harvest_batches,
            deliveries,
            delivery_errors,
            reintegrations,
            destinations_tracked,
        })
    }

    /// Starts the health HTTP server on `addr` with `/metrics` and
    /// `/healthz` endpoints. Runs until the token is cancelled.
    pub async fn start(self: &Arc<Self>, addr: &str, cancel: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding health server to {addr}"))?;

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(Arc::clone(self));

        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            let shutdown = async move { cancel.cancelled().await };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!(error = %e, "health server failed");
            }
        });

        info!(addr, "health server listening");
        Ok(())
    }

    /// Stops the health server if it was started.
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }
}

fn opts(name: &str, help: &str) -> Opts {
    Opts::new(name, help).namespace("spanharvest")
}

async fn metrics_handler(State(health): State<Arc<HealthMetrics>>) -> impl IntoResponse {
    let families = health.registry.gather();
    let mut buffer = Vec::new();
    match TextEncoder::new().encode(&families, &mut buffer) {
        Ok(()) => (StatusCode::OK, buffer).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn healthz_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
