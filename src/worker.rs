use crate::blob::BlobStore;
use crate::queue::{Delivery, TaskMessage, TaskQueue};
use crate::store::RecordStore;
use crate::thumbnail::ThumbnailEngine;
use crate::{AppError, ImageRecord, Result, Status, Thumbnails};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::*;
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Pause between polls when the queue is empty
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// How one delivery was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Thumbnails written, record `DONE`, message acked.
    Completed(Uuid),
    /// Record was already `DONE`; message acked without work.
    Duplicate(Uuid),
    /// Record moved to `ERROR`; message rejected.
    Failed(Uuid, String),
    /// Payload unusable or record missing; message rejected.
    Rejected(String),
}

pub struct Worker {
    records: Arc<dyn RecordStore>,
    blobs: BlobStore,
    queue: Arc<dyn TaskQueue>,
    engine: Arc<ThumbnailEngine>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        records: Arc<dyn RecordStore>,
        blobs: BlobStore,
        queue: Arc<dyn TaskQueue>,
        engine: Arc<ThumbnailEngine>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            records,
            blobs,
            queue,
            engine,
            config,
        }
    }

    /// Consumes until cancelled. Exactly one message is in flight at a time,
    /// and cancellation is only observed between messages. A fetch is never
    /// abandoned halfway, so a claimed message is always settled.
    pub async fn start(&self, cancel_token: CancellationToken) {
        info!("Worker started");
        loop {
            if cancel_token.is_cancelled() {
                debug!("Worker cancelled");
                break;
            }

            let idle = match self.queue.fetch().await {
                Ok(Some(delivery)) => {
                    self.settle(delivery).await;
                    false
                }
                Ok(None) => true,
                Err(err) => {
                    error!(message = "Error fetching from queue", error = %err);
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        debug!("Worker cancelled while idle");
                        break;
                    },
                    _ = sleep(self.config.poll_interval) => {},
                }
            }
        }
        info!("Worker stopped.");
    }

    /// Fetches and handles a single message, if one is ready.
    pub async fn run_once(&self) -> Result<Option<Outcome>> {
        match self.queue.fetch().await? {
            Some(delivery) => Ok(Some(self.handle(delivery).await?)),
            None => Ok(None),
        }
    }

    async fn settle(&self, delivery: Delivery) {
        let tag = delivery.tag;
        match self.handle(delivery).await {
            Ok(Outcome::Completed(id)) => info!(image_id = %id, "Image processed"),
            Ok(Outcome::Duplicate(id)) => info!(image_id = %id, "Duplicate delivery acknowledged"),
            Ok(Outcome::Failed(id, msg)) => warn!(image_id = %id, error = %msg, "Image failed"),
            Ok(Outcome::Rejected(reason)) => warn!(tag, reason = %reason, "Message rejected"),
            // Unsettled: the lease runs out and the message comes back.
            Err(err) => error!(tag, error = %err, "Could not settle message"),
        }
    }

    /// Processes one delivery and acks or rejects it.
    #[instrument(skip(self, delivery), fields(tag = delivery.tag, attempt = delivery.delivery_count))]
    pub async fn handle(&self, delivery: Delivery) -> Result<Outcome> {
        let task = match delivery.task() {
            Ok(task) => task,
            Err(err) => {
                let reason = format!("Malformed task payload: {err}");
                self.queue.reject(&delivery, &reason).await?;
                return Ok(Outcome::Rejected(reason));
            }
        };

        match self.process(&task).await {
            Ok(attempt) => {
                self.queue.ack(&delivery).await?;
                Ok(match attempt {
                    Attempt::Completed => Outcome::Completed(task.image_id),
                    Attempt::AlreadyDone => Outcome::Duplicate(task.image_id),
                })
            }
            Err(AppError::NotFound(what)) => {
                let reason = format!("Not found: {what}");
                self.queue.reject(&delivery, &reason).await?;
                Ok(Outcome::Rejected(reason))
            }
            Err(err) => {
                let reason = err.to_string();
                self.queue.reject(&delivery, &reason).await?;
                Ok(Outcome::Failed(task.image_id, reason))
            }
        }
    }

    #[instrument(skip(self, task), fields(image_id = %task.image_id))]
    async fn process(&self, task: &TaskMessage) -> Result<Attempt> {
        let record = self
            .records
            .update(task.image_id, Box::new(ImageRecord::begin_attempt))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("image {}", task.image_id)))?;

        if record.status == Status::Done {
            return Ok(Attempt::AlreadyDone);
        }

        debug!(path = %task.image_path, "Generating thumbnails");
        let result = match self.render_and_store(task).await {
            Ok(thumbnails) => {
                self.records
                    .update(
                        task.image_id,
                        Box::new(move |r: &mut ImageRecord| r.complete(thumbnails)),
                    )
                    .await
            }
            Err(err) => Err(err),
        };

        match result {
            Ok(Some(_)) => Ok(Attempt::Completed),
            Ok(None) => Err(AppError::NotFound(format!("image {}", task.image_id))),
            Err(err) => {
                let message = format!("Processing failed: {err}");
                let stored = message.clone();
                if let Err(update_err) = self
                    .records
                    .update(
                        task.image_id,
                        Box::new(move |r: &mut ImageRecord| r.fail(&stored)),
                    )
                    .await
                {
                    error!(error = %update_err, "Could not record failure");
                }
                Err(AppError::Processing(message))
            }
        }
    }

    async fn render_and_store(&self, task: &TaskMessage) -> Result<Thumbnails> {
        let original = self.blobs.read(&task.image_path).await?;
        let rendered = self
            .engine
            .clone()
            .render_async(Bytes::from(original))
            .await?;

        let mut entries = BTreeMap::new();
        for thumb in rendered {
            let path = self
                .blobs
                .write_thumbnail(task.image_id, thumb.size, &thumb.data)
                .await?;
            entries.insert(thumb.size.label(), path);
        }
        Thumbnails::complete(self.engine.sizes(), entries)
    }
}

enum Attempt {
    Completed,
    AlreadyDone,
}
