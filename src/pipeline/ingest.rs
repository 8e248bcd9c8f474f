use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{CredentialField, PipelineConfig};
use crate::export::health::HealthMetrics;
use crate::pipeline::batch::DestinationKey;
use crate::pipeline::store::AggregationStore;
use crate::record::{self, SpanEvent, SpanMessage, TagValue};

/// How many extra records one loop turn drains without re-entering select.
const DRAIN_BATCH: usize = 256;

/// Continuously drains the ingest feed, decodes records, and routes each
/// span into the aggregation store under its destination key.
///
/// A record carrying the metric-variant credential feeds aggregation; one
/// carrying the span-variant credential feeds pass-through; one carrying
/// both feeds both. A record with neither is dropped with a diagnostic.
pub struct Ingestor {
    store: Arc<AggregationStore>,
    whitelist: Arc<[String]>,
    metric_credential: CredentialField,
    span_credential: CredentialField,
    health: Option<Arc<HealthMetrics>>,
}

impl Ingestor {
    pub fn new(
        store: Arc<AggregationStore>,
        cfg: &PipelineConfig,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            store,
            whitelist: cfg.attribute_whitelist.clone().into(),
            metric_credential: cfg.metric_credential,
            span_credential: cfg.span_credential,
            health,
        }
    }

    /// Runs until cancelled or the feed closes. Feed loss is fatal for the
    /// pipeline: the caller tears down and a supervisor restarts the
    /// process.
    pub async fn run(
        self,
        mut feed: mpsc::Receiver<Vec<u8>>,
        cancel: CancellationToken,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),

                received = feed.recv() => {
                    let Some(payload) = received else {
                        bail!("ingest feed closed");
                    };
                    self.handle_payload(&payload);

                    // Drain whatever else is already queued before the next
                    // select round trip.
                    for _ in 0..DRAIN_BATCH - 1 {
                        match feed.try_recv() {
                            Ok(payload) => self.handle_payload(&payload),
                            Err(_) => break,
                        }
                    }
                }
            }
        }
    }

    fn handle_payload(&self, payload: &[u8]) {
        if let Some(health) = &self.health {
            health.records_received.inc();
        }

        match record::decode(payload) {
            Ok(message) => self.route(message),
            Err(error) => {
                warn!(error = %error, "skipping undecodable record");
                if let Some(health) = &self.health {
                    health.decode_errors.inc();
                }
            }
        }
    }

    /// Routes one decoded record into the store.
    fn route(&self, message: SpanMessage) {
        let metric_dest = credential(&message, self.metric_credential).map(DestinationKey::new);
        let span_dest = credential(&message, self.span_credential).map(DestinationKey::new);

        if metric_dest.is_none() && span_dest.is_none() {
            debug!(
                entity = %message.entity_name,
                "record carries no destination credential, dropping"
            );
            if let Some(health) = &self.health {
                health.records_unrouted.inc();
            }
            return;
        }

        for span in message.spans {
            if let Err(field) = span.validate() {
                warn!(
                    entity = %message.entity_name,
                    field,
                    "dropping span missing required field"
                );
                if let Some(health) = &self.health {
                    health.invalid_spans.inc();
                }
                continue;
            }

            if let Some(dest) = &metric_dest {
                self.store.ingest_sample(
                    dest,
                    &span.name,
                    self.whitelisted_attributes(&span.tags),
                    span.duration_ms(),
                );
                if let Some(health) = &self.health {
                    health.spans_ingested.with_label_values(&["metric"]).inc();
                }
            }

            if let Some(dest) = &span_dest {
                self.store.ingest_record(
                    dest,
                    SpanEvent::from_span(
                        span,
                        &message.entity_name,
                        message.entity_id.as_deref(),
                    ),
                );
                if let Some(health) = &self.health {
                    health.spans_ingested.with_label_values(&["span"]).inc();
                }
            }
        }
    }

    /// Projects a span's tags onto the attribute whitelist, in whitelist
    /// order. Tags outside the whitelist never participate in identity.
    fn whitelisted_attributes(
        &self,
        tags: &HashMap<String, TagValue>,
    ) -> HashMap<String, TagValue> {
        let mut attributes = HashMap::with_capacity(self.whitelist.len());
        for name in self.whitelist.iter() {
            if let Some(value) = tags.get(name) {
                attributes.insert(name.clone(), value.clone());
            }
        }
        attributes
    }
}

/// Picks the configured credential field off a record.
fn credential(message: &SpanMessage, field: CredentialField) -> Option<&str> {
    match field {
        CredentialField::LicenseKey => message.license_key.as_deref(),
        CredentialField::InsightsKey => message.insights_key.as_deref(),
    }
}
