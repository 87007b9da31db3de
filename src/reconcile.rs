//! Re-enqueues records left at `NEW` because publishing failed at upload time.
use crate::ingest::enqueue;
use crate::queue::TaskQueue;
use crate::store::RecordStore;
use crate::{Result, Status};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[derive(Clone, Debug)]
pub struct ReconcileConfig {
    pub interval: Duration,
    /// Records younger than this are left to the upload path.
    pub min_age: Duration,
    pub batch_size: i64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            min_age: Duration::from_secs(30),
            batch_size: 50,
        }
    }
}

pub struct Reconciler {
    records: Arc<dyn RecordStore>,
    queue: Arc<dyn TaskQueue>,
    config: ReconcileConfig,
}

impl Reconciler {
    pub fn new(
        records: Arc<dyn RecordStore>,
        queue: Arc<dyn TaskQueue>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            records,
            queue,
            config,
        }
    }

    /// One pass. Returns how many records were queued.
    #[instrument(name = "reconcile.sweep", skip(self))]
    pub async fn sweep(&self) -> Result<usize> {
        let min_age = chrono::Duration::from_std(self.config.min_age)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let stuck = self
            .records
            .list_stale(Status::New, Utc::now() - min_age, self.config.batch_size)
            .await?;

        if stuck.is_empty() {
            debug!("No stuck records");
            return Ok(0);
        }

        let mut queued = 0;
        for record in &stuck {
            match enqueue(self.records.as_ref(), self.queue.as_ref(), record).await {
                Ok(_) => queued += 1,
                Err(err) => {
                    // Queue is most likely still down; try again next interval.
                    warn!(image_id = %record.id, error = %err, "Re-enqueue failed");
                    break;
                }
            }
        }

        info!(found = stuck.len(), queued, "Reconciliation sweep finished");
        Ok(queued)
    }

    pub async fn start(&self, cancel_token: CancellationToken) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Starting reconciler"
        );
        let mut interval = tokio::time::interval(self.config.interval);
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    debug!("Reconciler cancelled");
                    break;
                },
                _ = interval.tick() => {
                    if let Err(err) = self.sweep().await {
                        error!(error = %err, "Reconciliation sweep failed, will retry next interval");
                    }
                }
            }
        }
        info!("Reconciler stopped.");
    }
}
