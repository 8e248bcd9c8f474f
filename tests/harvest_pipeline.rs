//! Blackbox pipeline tests: raw records go in through the public feed, and
//! delivered batches come out through a scripted deliverer. No network.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use spanharvest::config::PipelineConfig;
use spanharvest::deliver::{Deliver, DeliveryError, DeliveryOutcome};
use spanharvest::pipeline::batch::{AggregatedMetric, BatchContents, HarvestBatch};
use spanharvest::pipeline::Pipeline;
use spanharvest::record::SpanEvent;

/// Records every delivered batch; destinations in `failing` are refused.
struct ScriptedDeliverer {
    delivered: Mutex<Vec<HarvestBatch>>,
    failing: Mutex<HashSet<String>>,
}

impl ScriptedDeliverer {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            delivered: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
        })
    }

    fn fail(&self, destination: &str) {
        self.failing
            .lock()
            .expect("lock")
            .insert(destination.to_string());
    }

    fn recover(&self, destination: &str) {
        self.failing.lock().expect("lock").remove(destination);
    }

    fn delivered_for(&self, destination: &str) -> Vec<HarvestBatch> {
        self.delivered
            .lock()
            .expect("lock")
            .iter()
            .filter(|b| b.destination().as_str() == destination)
            .cloned()
            .collect()
    }

    fn delivered_count(&self) -> usize {
        self.delivered.lock().expect("lock").len()
    }
}

impl Deliver for ScriptedDeliverer {
    async fn deliver(&self, batch: HarvestBatch) -> DeliveryOutcome {
        if self
            .failing
            .lock()
            .expect("lock")
            .contains(batch.destination().as_str())
        {
            return DeliveryOutcome::failed(
                batch,
                DeliveryError::Status(reqwest::StatusCode::SERVICE_UNAVAILABLE),
            );
        }

        let destination = batch.destination().clone();
        self.delivered.lock().expect("lock").push(batch);
        DeliveryOutcome::delivered(destination)
    }
}

const PERIOD: Duration = Duration::from_secs(10);

fn start_pipeline(
    deliverer: &Arc<ScriptedDeliverer>,
) -> (Pipeline<ScriptedDeliverer>, tokio::sync::mpsc::Sender<Vec<u8>>) {
    let cfg = PipelineConfig {
        harvest_period: PERIOD,
        idle_recheck: Duration::from_secs(1),
        feed_buffer: 64,
        attribute_whitelist: vec!["region".to_string()],
        ..PipelineConfig::default()
    };
    let mut pipeline = Pipeline::new(&cfg, Arc::clone(deliverer), None);
    let feed = pipeline.take_feed().expect("feed sender");
    pipeline.start().expect("pipeline start");
    (pipeline, feed)
}

fn span(name: &str, region: &str, start: f64, finish: f64) -> serde_json::Value {
    json!({
        "trace_id": "t1",
        "span_id": format!("s-{start}"),
        "name": name,
        "start_time": start,
        "finish_time": finish,
        "tags": {"region": region, "host": "web-1"}
    })
}

fn record(
    insights_key: Option<&str>,
    license_key: Option<&str>,
    spans: Vec<serde_json::Value>,
) -> Vec<u8> {
    let mut value = json!({
        "entity_name": "checkout-svc",
        "entity_id": "e-9",
        "spans": spans,
    });
    if let Some(key) = insights_key {
        value["insights_key"] = json!(key);
    }
    if let Some(key) = license_key {
        value["license_key"] = json!(key);
    }
    serde_json::to_vec(&value).expect("serializes")
}

fn metrics_of(batch: &HarvestBatch) -> &[AggregatedMetric] {
    match batch.contents() {
        BatchContents::Metrics(metrics) => metrics,
        BatchContents::Spans(_) => panic!("expected metric batch"),
    }
}

fn spans_of(batch: &HarvestBatch) -> &[SpanEvent] {
    match batch.contents() {
        BatchContents::Spans(events) => events,
        BatchContents::Metrics(_) => panic!("expected span batch"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_same_identity_spans_aggregate_into_one_summary() {
    let deliverer = ScriptedDeliverer::new();
    let (mut pipeline, feed) = start_pipeline(&deliverer);

    feed.send(record(
        Some("lic-A"),
        None,
        vec![span("checkout", "us", 100.0, 110.0)],
    ))
    .await
    .expect("send");
    feed.send(record(
        Some("lic-A"),
        None,
        vec![span("checkout", "us", 200.0, 230.0)],
    ))
    .await
    .expect("send");

    tokio::time::sleep(PERIOD + Duration::from_secs(1)).await;

    let delivered = deliverer.delivered_for("lic-A");
    assert_eq!(delivered.len(), 1);
    let metrics = metrics_of(&delivered[0]);
    assert_eq!(metrics.len(), 1);
    assert_eq!(metrics[0].identity.name(), "checkout");
    assert_eq!(metrics[0].identity.attributes().len(), 1);
    assert_eq!(metrics[0].value.count(), 2);
    assert_eq!(metrics[0].value.sum(), 40.0);
    assert_eq!(metrics[0].value.min(), 10.0);
    assert_eq!(metrics[0].value.max(), 30.0);

    pipeline.shutdown().await.expect("shutdown");
}

#[tokio::test(start_paused = true)]
async fn test_differing_attributes_split_identities() {
    let deliverer = ScriptedDeliverer::new();
    let (mut pipeline, feed) = start_pipeline(&deliverer);

    feed.send(record(
        Some("lic-A"),
        None,
        vec![
            span("checkout", "us", 100.0, 110.0),
            span("checkout", "eu", 200.0, 230.0),
        ],
    ))
    .await
    .expect("send");

    tokio::time::sleep(PERIOD + Duration::from_secs(1)).await;

    let delivered = deliverer.delivered_for("lic-A");
    assert_eq!(delivered.len(), 1);
    let metrics = metrics_of(&delivered[0]);
    assert_eq!(metrics.len(), 2);
    for metric in metrics {
        assert_eq!(metric.identity.name(), "checkout");
        assert_eq!(metric.value.count(), 1);
    }

    pipeline.shutdown().await.expect("shutdown");
}

#[tokio::test(start_paused = true)]
async fn test_license_key_spans_pass_through() {
    let deliverer = ScriptedDeliverer::new();
    let (mut pipeline, feed) = start_pipeline(&deliverer);

    feed.send(record(
        None,
        Some("lic-B"),
        vec![span("checkout", "us", 100.0, 110.0)],
    ))
    .await
    .expect("send");

    tokio::time::sleep(PERIOD + Duration::from_secs(1)).await;

    let delivered = deliverer.delivered_for("lic-B");
    assert_eq!(delivered.len(), 1);
    let events = spans_of(&delivered[0]);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].name, "checkout");
    assert_eq!(events[0].timestamp, 100);
    assert_eq!(events[0].duration_ms, 10.0);
    assert_eq!(events[0].entity_name, "checkout-svc");
    assert_eq!(events[0].entity_id.as_deref(), Some("e-9"));

    pipeline.shutdown().await.expect("shutdown");
}

#[tokio::test(start_paused = true)]
async fn test_failed_metric_delivery_retries_full_accumulation() {
    let deliverer = ScriptedDeliverer::new();
    let (mut pipeline, feed) = start_pipeline(&deliverer);
    deliverer.fail("lic-B");

    // X arrives, first harvest fails and reintegrates.
    feed.send(record(
        Some("lic-B"),
        None,
        vec![span("checkout", "us", 100.0, 110.0)],
    ))
    .await
    .expect("send");
    tokio::time::sleep(PERIOD + Duration::from_secs(1)).await;
    assert!(deliverer.delivered_for("lic-B").is_empty());

    // Y arrives before the retry; the endpoint recovers.
    feed.send(record(
        Some("lic-B"),
        None,
        vec![span("checkout", "us", 200.0, 230.0)],
    ))
    .await
    .expect("send");
    deliverer.recover("lic-B");
    tokio::time::sleep(PERIOD).await;

    // Exactly one delivery carrying the full accumulation: X was cut out of
    // the store before reintegration, so nothing is double counted.
    let delivered = deliverer.delivered_for("lic-B");
    assert_eq!(delivered.len(), 1);
    let metrics = metrics_of(&delivered[0]);
    assert_eq!(metrics.len(), 1);
    assert_eq!(metrics[0].value.count(), 2);
    assert_eq!(metrics[0].value.sum(), 40.0);
    assert_eq!(metrics[0].value.min(), 10.0);
    assert_eq!(metrics[0].value.max(), 30.0);

    pipeline.shutdown().await.expect("shutdown");
}

#[tokio::test(start_paused = true)]
async fn test_failed_span_delivery_keeps_all_events() {
    let deliverer = ScriptedDeliverer::new();
    let (mut pipeline, feed) = start_pipeline(&deliverer);
    deliverer.fail("lic-B");

    feed.send(record(
        None,
        Some("lic-B"),
        vec![span("checkout", "us", 100.0, 110.0)],
    ))
    .await
    .expect("send");
    tokio::time::sleep(PERIOD + Duration::from_secs(1)).await;

    feed.send(record(
        None,
        Some("lic-B"),
        vec![span("checkout", "us", 200.0, 230.0)],
    ))
    .await
    .expect("send");
    deliverer.recover("lic-B");
    tokio::time::sleep(PERIOD).await;

    let delivered = deliverer.delivered_for("lic-B");
    assert_eq!(delivered.len(), 1);
    assert_eq!(spans_of(&delivered[0]).len(), 2);

    pipeline.shutdown().await.expect("shutdown");
}

#[tokio::test(start_paused = true)]
async fn test_destinations_never_cross_contaminate() {
    let deliverer = ScriptedDeliverer::new();
    let (mut pipeline, feed) = start_pipeline(&deliverer);

    feed.send(record(
        Some("ins-A"),
        None,
        vec![span("checkout", "us", 100.0, 110.0)],
    ))
    .await
    .expect("send");
    feed.send(record(
        Some("ins-B"),
        None,
        vec![span("refund", "eu", 200.0, 230.0)],
    ))
    .await
    .expect("send");

    tokio::time::sleep(PERIOD + Duration::from_secs(1)).await;

    let for_a = deliverer.delivered_for("ins-A");
    assert_eq!(for_a.len(), 1);
    assert_eq!(metrics_of(&for_a[0]).len(), 1);
    assert_eq!(metrics_of(&for_a[0])[0].identity.name(), "checkout");

    let for_b = deliverer.delivered_for("ins-B");
    assert_eq!(for_b.len(), 1);
    assert_eq!(metrics_of(&for_b[0])[0].identity.name(), "refund");

    pipeline.shutdown().await.expect("shutdown");
}

#[tokio::test(start_paused = true)]
async fn test_both_credentials_feed_both_variants() {
    let deliverer = ScriptedDeliverer::new();
    let (mut pipeline, feed) = start_pipeline(&deliverer);

    feed.send(record(
        Some("ins-A"),
        Some("lic-A"),
        vec![span("checkout", "us", 100.0, 110.0)],
    ))
    .await
    .expect("send");

    tokio::time::sleep(PERIOD + Duration::from_secs(1)).await;

    assert_eq!(metrics_of(&deliverer.delivered_for("ins-A")[0]).len(), 1);
    assert_eq!(spans_of(&deliverer.delivered_for("lic-A")[0]).len(), 1);

    pipeline.shutdown().await.expect("shutdown");
}

#[tokio::test(start_paused = true)]
async fn test_records_without_credentials_are_dropped() {
    let deliverer = ScriptedDeliverer::new();
    let (mut pipeline, feed) = start_pipeline(&deliverer);

    feed.send(record(None, None, vec![span("checkout", "us", 100.0, 110.0)]))
        .await
        .expect("send");

    tokio::time::sleep(PERIOD * 2).await;
    assert_eq!(deliverer.delivered_count(), 0);

    pipeline.shutdown().await.expect("shutdown");
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_runs_final_harvest() {
    let deliverer = ScriptedDeliverer::new();
    let (mut pipeline, feed) = start_pipeline(&deliverer);

    feed.send(record(
        Some("ins-A"),
        None,
        vec![span("checkout", "us", 100.0, 110.0)],
    ))
    .await
    .expect("send");

    // Let the ingest task pick the record up, then stop well before the
    // first period expires.
    tokio::time::sleep(Duration::from_millis(10)).await;
    pipeline.shutdown().await.expect("shutdown");

    assert_eq!(deliverer.delivered_for("ins-A").len(), 1);
}
