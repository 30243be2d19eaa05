//! Cancellable location streams. Platform position callbacks are modeled as
//! an explicit subscription object with a close contract, so teardown and
//! testing stay deterministic.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::TerraResult;
use crate::models::GpsPoint;
use crate::store::SurveyStore;

/// A live position watch. Dropping the subscription cancels the watch; the
/// stream ending means the watch is gone.
pub struct LocationSubscription {
    samples: mpsc::Receiver<GpsPoint>,
}

impl LocationSubscription {
    pub fn new(samples: mpsc::Receiver<GpsPoint>) -> Self {
        Self { samples }
    }

    pub async fn next(&mut self) -> Option<GpsPoint> {
        self.samples.recv().await
    }
}

/// Source of position fixes. Implementations wrap the platform location
/// service; a denied grant surfaces as [`crate::TerraError::PermissionDenied`].
#[async_trait]
pub trait LocationSource: Send + Sync {
    async fn watch(&self, interval: Duration) -> TerraResult<LocationSubscription>;
}

/// Buffers every fix into the durable store until the subscription closes.
/// The sync engine later drains the buffer with most-recent-only semantics.
pub fn spawn_buffering(
    mut subscription: LocationSubscription,
    store: Arc<SurveyStore>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(point) = subscription.next().await {
            if let Err(e) = store.buffer_location(point.lat, point.lng, point.accuracy, point.timestamp)
            {
                warn!("could not buffer location sample: {e}");
            }
        }
        debug!("location subscription closed");
    })
}
