pub mod http;

use std::future::Future;

use thiserror::Error;

use crate::pipeline::batch::{DestinationKey, HarvestBatch};

pub use self::http::HttpDeliverer;

/// Why a delivery attempt failed. The harvest loop does not distinguish
/// transient from permanent failures; every failure reintegrates the batch.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("serializing payload: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("sending request: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("endpoint returned status {0}")]
    Status(reqwest::StatusCode),
}

/// Result of one delivery attempt. Failure carries the original, unmodified
/// batch so the harvest loop can reintegrate it without loss.
#[derive(Debug)]
pub struct DeliveryOutcome {
    destination: DestinationKey,
    error: Option<DeliveryError>,
    batch: Option<HarvestBatch>,
}

impl DeliveryOutcome {
    pub fn delivered(destination: DestinationKey) -> Self {
        Self {
            destination,
            error: None,
            batch: None,
        }
    }

    pub fn failed(batch: HarvestBatch, error: DeliveryError) -> Self {
        Self {
            destination: batch.destination().clone(),
            error: Some(error),
            batch: Some(batch),
        }
    }

    pub fn destination(&self) -> &DestinationKey {
        &self.destination
    }

    pub fn is_delivered(&self) -> bool {
        self.error.is_none()
    }

    pub fn error(&self) -> Option<&DeliveryError> {
        self.error.as_ref()
    }

    /// The undelivered batch, present only on failure.
    pub fn into_failed_batch(self) -> Option<HarvestBatch> {
        self.batch
    }
}

/// Performs the external send for one harvest batch.
///
/// Implementations must not mutate the batch and must not retry internally;
/// retry policy belongs to the harvest loop via reintegration.
pub trait Deliver: Send + Sync {
    fn deliver(&self, batch: HarvestBatch) -> impl Future<Output = DeliveryOutcome> + Send;
}
