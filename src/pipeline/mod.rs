pub mod accumulator;
pub mod batch;
pub mod harvest;
pub mod identity;
pub mod ingest;
pub mod store;

use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::deliver::Deliver;
use crate::export::health::HealthMetrics;

use self::harvest::Harvester;
use self::ingest::Ingestor;
use self::store::AggregationStore;

/// One pipeline instance: the aggregation store plus its ingest and harvest
/// tasks.
///
/// Lifecycle is scoped to the instance; nothing is process-global, so
/// multiple pipelines can coexist (tests rely on this).
pub struct Pipeline<D> {
    store: Arc<AggregationStore>,
    feed_tx: Option<mpsc::Sender<Vec<u8>>>,
    feed_rx: Option<mpsc::Receiver<Vec<u8>>>,
    ingestor: Option<Ingestor>,
    harvester: Option<Harvester<D>>,
    cancel: CancellationToken,
    ingest_task: Option<JoinHandle<Result<()>>>,
    harvest_task: Option<JoinHandle<()>>,
}

impl<D: Deliver + 'static> Pipeline<D> {
    /// Builds an idle pipeline from its configuration.
    pub fn new(
        cfg: &PipelineConfig,
        deliverer: Arc<D>,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        let (feed_tx, feed_rx) = mpsc::channel(cfg.feed_buffer);
        let store = Arc::new(AggregationStore::new());

        let ingestor = Ingestor::new(Arc::clone(&store), cfg, health.clone());
        let harvester = Harvester::new(
            Arc::clone(&store),
            deliverer,
            cfg.harvest_period,
            cfg.idle_recheck,
            health,
        );

        Self {
            store,
            feed_tx: Some(feed_tx),
            feed_rx: Some(feed_rx),
            ingestor: Some(ingestor),
            harvester: Some(harvester),
            cancel: CancellationToken::new(),
            ingest_task: None,
            harvest_task: None,
        }
    }

    /// Takes the sender half of the ingest feed; the bus adapter pushes one
    /// raw record payload per send.
    ///
    /// The pipeline keeps no copy of the sender, so once every handle from
    /// here is dropped the feed closes and the pipeline treats the loss as
    /// fatal. Can only be taken once.
    pub fn take_feed(&mut self) -> Option<mpsc::Sender<Vec<u8>>> {
        self.feed_tx.take()
    }

    pub fn store(&self) -> Arc<AggregationStore> {
        Arc::clone(&self.store)
    }

    /// Spawns the ingest and harvest tasks.
    pub fn start(&mut self) -> Result<()> {
        let Some(feed_rx) = self.feed_rx.take() else {
            bail!("pipeline already started");
        };
        let ingestor = self
            .ingestor
            .take()
            .expect("ingestor present while feed receiver is");
        let harvester = self
            .harvester
            .take()
            .expect("harvester present while feed receiver is");

        self.ingest_task = Some(tokio::spawn(ingestor.run(feed_rx, self.cancel.clone())));
        self.harvest_task = Some(tokio::spawn(harvester.run(self.cancel.clone())));

        info!("pipeline started");
        Ok(())
    }

    /// Waits for the ingest task to end. Returns the fatal error when the
    /// feed is lost; a clean cancellation resolves to Ok.
    pub async fn wait(&mut self) -> Result<()> {
        let Some(task) = self.ingest_task.as_mut() else {
            return Ok(());
        };
        let joined = task.await;
        self.ingest_task = None;

        match joined {
            Ok(result) => result,
            Err(e) => Err(anyhow!("ingest task join failed: {e}")),
        }
    }

    /// Cancels both tasks and joins them. The harvester performs one final
    /// cycle before exiting so accumulated state gets a last delivery
    /// attempt.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.cancel.cancel();

        if let Some(task) = self.harvest_task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "harvest task join failed");
            }
        }

        if let Some(task) = self.ingest_task.take() {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "ingest task ended with error"),
                Err(e) => warn!(error = %e, "ingest task join failed"),
            }
        }

        info!("pipeline stopped");
        Ok(())
    }
}
