use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::pipeline::accumulator::Accumulator;
use crate::pipeline::identity::MetricIdentity;
use crate::record::SpanEvent;

/// Identifies one downstream credential/target. Cheap to clone; used as the
/// store shard key and carried through every batch and outcome.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DestinationKey(Arc<str>);

impl DestinationKey {
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(Arc::from(key.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DestinationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One metric stream within a destination: its identity plus the running
/// statistics accumulated since the last successful delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedMetric {
    pub identity: MetricIdentity,
    pub value: Accumulator,
}

impl AggregatedMetric {
    pub fn new(identity: MetricIdentity) -> Self {
        Self {
            identity,
            value: Accumulator::new(),
        }
    }
}

/// What a harvest batch carries, by pipeline variant.
#[derive(Debug, Clone)]
pub enum BatchContents {
    /// Aggregated summaries bound for the metric endpoint.
    Metrics(Vec<AggregatedMetric>),
    /// Pass-through span events bound for the span endpoint.
    Spans(Vec<SpanEvent>),
}

impl BatchContents {
    /// Number of metrics or events carried.
    pub fn len(&self) -> usize {
        match self {
            Self::Metrics(metrics) => metrics.len(),
            Self::Spans(events) => events.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An immutable snapshot of one destination's accumulated state at cut time.
///
/// Created by the store's cut, consumed exactly once by the deliverer, and
/// either discarded on success or reintegrated wholesale on failure. Never
/// mutated after creation.
#[derive(Debug, Clone)]
pub struct HarvestBatch {
    destination: DestinationKey,
    window_start: SystemTime,
    interval: Duration,
    contents: BatchContents,
}

impl HarvestBatch {
    pub fn new(
        destination: DestinationKey,
        window_start: SystemTime,
        interval: Duration,
        contents: BatchContents,
    ) -> Self {
        Self {
            destination,
            window_start,
            interval,
            contents,
        }
    }

    pub fn destination(&self) -> &DestinationKey {
        &self.destination
    }

    /// Wall-clock time the accumulation window began (the previous cut).
    pub fn window_start(&self) -> SystemTime {
        self.window_start
    }

    /// Elapsed accumulation interval at cut time.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn contents(&self) -> &BatchContents {
        &self.contents
    }

    /// Decomposes the batch for reintegration.
    pub fn into_parts(self) -> (DestinationKey, BatchContents) {
        (self.destination, self.contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_destination_key_equality_and_display() {
        let a = DestinationKey::new("lic-A");
        let b = DestinationKey::new("lic-A");
        let c = DestinationKey::new("lic-B");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_string(), "lic-A");
    }

    #[test]
    fn test_batch_contents_len() {
        let metrics = BatchContents::Metrics(vec![AggregatedMetric::new(MetricIdentity::new(
            "checkout",
            HashMap::new(),
        ))]);
        assert_eq!(metrics.len(), 1);
        assert!(!metrics.is_empty());

        let spans = BatchContents::Spans(Vec::new());
        assert!(spans.is_empty());
    }
}
