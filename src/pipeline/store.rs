use std::collections::HashMap;
use std::time::SystemTime;

use dashmap::DashMap;

use crate::pipeline::batch::{AggregatedMetric, BatchContents, DestinationKey, HarvestBatch};
use crate::pipeline::identity::MetricIdentity;
use crate::record::{SpanEvent, TagValue};

/// Concurrent per-destination aggregation state, mutated by ingestion and
/// drained by the harvester.
///
/// `DashMap` shards the state by destination key; each entry is
/// independently locked, so a cut (entry removal) is atomic with respect to
/// ingestion for that destination: a concurrently ingested sample lands
/// either in the removed bucket or in a fresh one, never in both and never
/// in neither. Cut and merge are only ever called from the single harvest
/// task, so they never race each other.
pub struct AggregationStore {
    metrics: DashMap<DestinationKey, Vec<AggregatedMetric>>,
    spans: DashMap<DestinationKey, Vec<SpanEvent>>,
}

impl AggregationStore {
    pub fn new() -> Self {
        Self {
            metrics: DashMap::new(),
            spans: DashMap::new(),
        }
    }

    /// Folds one sample into the accumulator for (destination, identity),
    /// creating the identity on first sight.
    ///
    /// Identity lookup is a linear scan of the destination's bucket; the
    /// attribute whitelist bounds identity cardinality, so the bucket stays
    /// small.
    pub fn ingest_sample(
        &self,
        destination: &DestinationKey,
        name: &str,
        attributes: HashMap<String, TagValue>,
        sample: f64,
    ) {
        let mut bucket = self.metrics.entry(destination.clone()).or_default();
        if let Some(metric) = bucket
            .iter_mut()
            .find(|m| m.identity.recognizes(name, &attributes))
        {
            metric.value.add(sample);
            return;
        }

        let mut metric = AggregatedMetric::new(MetricIdentity::new(name, attributes));
        metric.value.add(sample);
        bucket.push(metric);
    }

    /// Appends one pass-through record to the destination's pending list.
    pub fn ingest_record(&self, destination: &DestinationKey, event: SpanEvent) {
        self.spans.entry(destination.clone()).or_default().push(event);
    }

    /// Atomically removes all accumulated state, one immutable batch per
    /// non-empty destination, leaving the store empty. Batches are stamped
    /// with the window start and the elapsed interval up to `cut_time`.
    pub fn cut(&self, window_start: SystemTime, cut_time: SystemTime) -> Vec<HarvestBatch> {
        let interval = cut_time.duration_since(window_start).unwrap_or_default();
        let mut batches = Vec::new();

        let metric_keys: Vec<_> = self.metrics.iter().map(|e| e.key().clone()).collect();
        for key in metric_keys {
            if let Some((destination, bucket)) = self.metrics.remove(&key) {
                if !bucket.is_empty() {
                    batches.push(HarvestBatch::new(
                        destination,
                        window_start,
                        interval,
                        BatchContents::Metrics(bucket),
                    ));
                }
            }
        }

        let span_keys: Vec<_> = self.spans.iter().map(|e| e.key().clone()).collect();
        for key in span_keys {
            if let Some((destination, bucket)) = self.spans.remove(&key) {
                if !bucket.is_empty() {
                    batches.push(HarvestBatch::new(
                        destination,
                        window_start,
                        interval,
                        BatchContents::Spans(bucket),
                    ));
                }
            }
        }

        batches
    }

    /// Reintegrates an undelivered batch, combining it with anything
    /// ingested since the cut so the next harvest retries the union.
    pub fn merge(&self, batch: HarvestBatch) {
        let (destination, contents) = batch.into_parts();
        match contents {
            BatchContents::Metrics(undelivered) => {
                let mut bucket = self.metrics.entry(destination).or_default();
                for incoming in undelivered {
                    if let Some(existing) =
                        bucket.iter_mut().find(|m| m.identity == incoming.identity)
                    {
                        existing.value.merge(&incoming.value);
                    } else {
                        bucket.push(incoming);
                    }
                }
            }
            BatchContents::Spans(undelivered) => {
                self.spans.entry(destination).or_default().extend(undelivered);
            }
        }
    }

    /// True when no destination has pending state.
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty() && self.spans.is_empty()
    }

    /// Number of destination buckets currently tracked (metric and span
    /// buckets counted separately).
    pub fn destination_count(&self) -> usize {
        self.metrics.len() + self.spans.len()
    }
}

impl Default for AggregationStore {
    fn default() -> Self {
        Self::new()
    }
}
