use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::deliver::Deliver;
use crate::export::health::HealthMetrics;
use crate::pipeline::store::AggregationStore;

/// Timer-driven harvest loop.
///
/// Each cycle cuts the store into one immutable batch per destination, fans
/// the deliveries out concurrently, fans every outcome back in, and only
/// then reintegrates failed batches. Cycles never overlap: the next cut
/// cannot begin until every delivery of the current cycle has resolved, so
/// in-flight deliveries are bounded by the number of distinct destinations.
/// Ingestion is never blocked by a pending cycle.
///
/// There is no retry cap and no backoff: a destination that keeps failing
/// accumulates until it succeeds. That growth is deliberate and observable
/// (reintegration counter, warn logs), not silently bounded.
pub struct Harvester<D> {
    store: Arc<AggregationStore>,
    deliverer: Arc<D>,
    period: Duration,
    idle_recheck: Duration,
    health: Option<Arc<HealthMetrics>>,
}

impl<D: Deliver + 'static> Harvester<D> {
    pub fn new(
        store: Arc<AggregationStore>,
        deliverer: Arc<D>,
        period: Duration,
        idle_recheck: Duration,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            store,
            deliverer,
            period,
            idle_recheck,
            health,
        }
    }

    /// Runs harvest cycles until cancelled, then performs one final cycle so
    /// accumulated state gets a last delivery attempt.
    pub async fn run(self, cancel: CancellationToken) {
        let mut window_start = SystemTime::now();
        let mut delay = self.period;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.final_cycle(window_start).await;
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            if self.store.is_empty() {
                // Nothing accumulated; check again sooner than a full period.
                window_start = SystemTime::now();
                delay = self.idle_recheck;
                continue;
            }

            window_start = self.cycle(window_start).await;
            delay = self.period;
        }
    }

    /// Runs one harvest cycle and returns the next window start.
    async fn cycle(&self, window_start: SystemTime) -> SystemTime {
        let cut_time = SystemTime::now();
        let batches = self.store.cut(window_start, cut_time);
        if batches.is_empty() {
            return cut_time;
        }

        debug!(batches = batches.len(), "harvest cut");
        if let Some(health) = &self.health {
            health.harvest_cycles.inc();
            health.harvest_batches.inc_by(batches.len() as f64);
        }

        let mut deliveries = JoinSet::new();
        for batch in batches {
            let deliverer = Arc::clone(&self.deliverer);
            deliveries.spawn(async move { deliverer.deliver(batch).await });
        }

        // Collect every outcome before touching the store again, so
        // reintegration never races this cycle's own cut.
        let mut failed = Vec::new();
        while let Some(joined) = deliveries.join_next().await {
            match joined {
                Ok(outcome) => {
                    match outcome.error() {
                        None => debug!(destination = %outcome.destination(), "batch delivered"),
                        Some(delivery_error) => warn!(
                            destination = %outcome.destination(),
                            error = %delivery_error,
                            "delivery failed, batch will be retried next cycle"
                        ),
                    }
                    if let Some(batch) = outcome.into_failed_batch() {
                        failed.push(batch);
                    }
                }
                // A panicked delivery task carried its batch with it; there
                // is nothing left to reintegrate.
                Err(join_error) => error!(error = %join_error, "delivery task failed"),
            }
        }

        for batch in failed {
            if let Some(health) = &self.health {
                health.reintegrations.inc();
            }
            self.store.merge(batch);
        }

        if let Some(health) = &self.health {
            health
                .destinations_tracked
                .set(self.store.destination_count() as f64);
        }

        cut_time
    }

    async fn final_cycle(&self, window_start: SystemTime) {
        if self.store.is_empty() {
            return;
        }

        info!("running final harvest before shutdown");
        self.cycle(window_start).await;

        let remaining = self.store.destination_count();
        if remaining > 0 {
            warn!(
                destinations = remaining,
                "undelivered data abandoned at shutdown"
            );
        }
    }
}
