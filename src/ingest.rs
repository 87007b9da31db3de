use crate::blob::BlobStore;
use crate::queue::{TaskMessage, TaskQueue};
use crate::store::RecordStore;
use crate::{AppError, ImageRecord, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, instrument};
use uuid::Uuid;

pub const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;
pub const DEFAULT_EXTENSIONS: [&str; 4] = [".jpg", ".jpeg", ".png", ".webp"];

/// What an upload must satisfy before anything is stored.
#[derive(Clone, Debug)]
pub struct UploadPolicy {
    pub max_size: u64,
    /// Lowercase, dot-prefixed
    pub allowed_extensions: Vec<String>,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FILE_SIZE, DEFAULT_EXTENSIONS)
    }
}

impl UploadPolicy {
    pub fn new<I, S>(max_size: u64, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let allowed_extensions = extensions
            .into_iter()
            .map(|e| e.as_ref().trim().to_lowercase())
            .filter(|e| !e.is_empty())
            .map(|e| if e.starts_with('.') { e } else { format!(".{e}") })
            .collect();
        Self {
            max_size,
            allowed_extensions,
        }
    }

    /// Checks filename, extension and size, in that order. Returns the
    /// trimmed filename.
    pub fn validate<'a>(&self, filename: Option<&'a str>, size: u64) -> Result<&'a str> {
        let filename = filename
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .ok_or_else(|| AppError::InvalidInput("No filename provided".into()))?;

        let extension = Path::new(filename)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
            .unwrap_or_default();
        if !self.allowed_extensions.contains(&extension) {
            return Err(AppError::UnsupportedType {
                extension: if extension.is_empty() {
                    "(none)".into()
                } else {
                    extension
                },
                allowed: self.allowed_extensions.join(", "),
            });
        }

        if size > self.max_size {
            return Err(AppError::TooLarge { max: self.max_size });
        }

        Ok(filename)
    }
}

/// Upload half of the pipeline: store, record, enqueue.
#[derive(Clone)]
pub struct IngestService {
    records: Arc<dyn RecordStore>,
    blobs: BlobStore,
    queue: Arc<dyn TaskQueue>,
    policy: UploadPolicy,
}

impl IngestService {
    pub fn new(
        records: Arc<dyn RecordStore>,
        blobs: BlobStore,
        queue: Arc<dyn TaskQueue>,
        policy: UploadPolicy,
    ) -> Self {
        Self {
            records,
            blobs,
            queue,
            policy,
        }
    }

    pub fn policy(&self) -> &UploadPolicy {
        &self.policy
    }

    /// Validates and stores an upload, then queues it for processing.
    ///
    /// A failed enqueue is not an ingest failure: the record stays `NEW` and
    /// the reconciler picks it up later.
    #[instrument(skip(self, bytes), fields(image_id))]
    pub async fn ingest(
        &self,
        filename: Option<&str>,
        size: u64,
        bytes: &[u8],
    ) -> Result<ImageRecord> {
        let filename = self.policy.validate(filename, size)?;

        let id = Uuid::new_v4();
        tracing::Span::current().record("image_id", tracing::field::display(id));

        let original_path = self
            .blobs
            .write_original(id, filename, bytes)
            .await
            .map_err(|err| {
                error!(error = %err, "Failed to save original");
                err
            })?;

        let record = self
            .records
            .create(ImageRecord::new(id, filename, &original_path, size))
            .await?;
        info!(path = %original_path, "Image record created");

        match enqueue(self.records.as_ref(), self.queue.as_ref(), &record).await {
            Ok(updated) => Ok(updated),
            Err(err) => {
                error!(error = %err, "Failed to queue processing task, leaving record NEW");
                Ok(record)
            }
        }
    }
}

/// Publishes a task for `record` and moves it out of `NEW`.
///
/// If publishing fails the record is untouched. If publishing succeeds but the
/// status update does not, the task is still queued and the worker will set
/// the status itself.
pub async fn enqueue(
    records: &dyn RecordStore,
    queue: &dyn TaskQueue,
    record: &ImageRecord,
) -> Result<ImageRecord> {
    queue
        .publish(&TaskMessage {
            image_id: record.id,
            image_path: record.original_path.clone(),
        })
        .await?;

    match records
        .update(record.id, Box::new(ImageRecord::mark_enqueued))
        .await
    {
        Ok(Some(updated)) => Ok(updated),
        Ok(None) => Err(AppError::NotFound(format!("image {}", record.id))),
        Err(err) => {
            error!(image_id = %record.id, error = %err, "Task queued but status update failed");
            Ok(record.clone())
        }
    }
}
