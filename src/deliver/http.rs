use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use tracing::debug;

use crate::config::DeliveryConfig;
use crate::export::health::HealthMetrics;
use crate::pipeline::accumulator::Accumulator;
use crate::pipeline::batch::{AggregatedMetric, BatchContents, HarvestBatch};
use crate::record::{SpanEvent, TagValue};

use super::{Deliver, DeliveryError, DeliveryOutcome};

/// Version tag stamped on every metric payload.
const METRIC_PAYLOAD_VERSION: &str = "0.3.0";

/// HTTP deliverer for both pipeline variants.
///
/// Metric batches POST to the metric endpoint with the destination key in
/// the `X-Insert-Key` header; span batches POST to the span endpoint with
/// the destination key as a query parameter. One client, one timeout, no
/// internal retries.
pub struct HttpDeliverer {
    client: reqwest::Client,
    metric_endpoint: String,
    span_endpoint: String,
    health: Option<Arc<HealthMetrics>>,
}

impl HttpDeliverer {
    pub fn new(cfg: &DeliveryConfig, health: Option<Arc<HealthMetrics>>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .context("building delivery HTTP client")?;

        Ok(Self {
            client,
            metric_endpoint: cfg.metric_endpoint.clone(),
            span_endpoint: cfg.span_endpoint.clone(),
            health,
        })
    }

    async fn send_metrics(
        &self,
        batch: &HarvestBatch,
        metrics: &[AggregatedMetric],
    ) -> Result<(), DeliveryError> {
        let body = serde_json::to_vec(&MetricPayload::from_batch(batch, metrics))?;

        let response = self
            .client
            .post(&self.metric_endpoint)
            .header("X-Insert-Key", batch.destination().as_str())
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::Status(status));
        }

        debug!(
            destination = %batch.destination(),
            metrics = metrics.len(),
            "metric batch accepted"
        );
        Ok(())
    }

    async fn send_spans(
        &self,
        batch: &HarvestBatch,
        events: &[SpanEvent],
    ) -> Result<(), DeliveryError> {
        let body = serde_json::to_vec(&SpanPayload { spans: events })?;

        let response = self
            .client
            .post(&self.span_endpoint)
            .query(&[
                ("protocol_version", "1"),
                ("license_key", batch.destination().as_str()),
                ("method", "external_span_data"),
            ])
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::Status(status));
        }

        debug!(
            destination = %batch.destination(),
            spans = events.len(),
            "span batch accepted"
        );
        Ok(())
    }
}

impl Deliver for HttpDeliverer {
    async fn deliver(&self, batch: HarvestBatch) -> DeliveryOutcome {
        let result = match batch.contents() {
            BatchContents::Metrics(metrics) => self.send_metrics(&batch, metrics).await,
            BatchContents::Spans(events) => self.send_spans(&batch, events).await,
        };

        match result {
            Ok(()) => {
                if let Some(health) = &self.health {
                    health.deliveries.inc();
                }
                DeliveryOutcome::delivered(batch.destination().clone())
            }
            Err(error) => {
                if let Some(health) = &self.health {
                    health.delivery_errors.inc();
                }
                DeliveryOutcome::failed(batch, error)
            }
        }
    }
}

// --- Wire payloads ---

#[derive(Serialize)]
struct MetricPayload<'a> {
    version: &'static str,
    metric_buckets: [MetricBucket<'a>; 1],
}

#[derive(Serialize)]
struct MetricBucket<'a> {
    start_time_ms: u64,
    interval_ms: u64,
    metrics: Vec<MetricJson<'a>>,
}

#[derive(Serialize)]
struct MetricJson<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "attributes_empty")]
    attributes: &'a HashMap<String, TagValue>,
    value: &'a Accumulator,
}

fn attributes_empty(attributes: &&HashMap<String, TagValue>) -> bool {
    attributes.is_empty()
}

impl<'a> MetricPayload<'a> {
    fn from_batch(batch: &'a HarvestBatch, metrics: &'a [AggregatedMetric]) -> Self {
        Self {
            version: METRIC_PAYLOAD_VERSION,
            metric_buckets: [MetricBucket {
                start_time_ms: epoch_ms(batch.window_start()),
                interval_ms: batch.interval().as_millis() as u64,
                metrics: metrics
                    .iter()
                    .map(|m| MetricJson {
                        name: m.identity.name(),
                        kind: "summary",
                        attributes: m.identity.attributes(),
                        value: &m.value,
                    })
                    .collect(),
            }],
        }
    }
}

#[derive(Serialize)]
struct SpanPayload<'a> {
    spans: &'a [SpanEvent],
}

fn epoch_ms(time: SystemTime) -> u64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}
