use crate::{ImageRecord, Result, Status};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Read-modify-write step applied by [`RecordStore::update`]. If it returns an
/// error nothing is persisted.
pub type Mutator = Box<dyn FnOnce(&mut ImageRecord) -> Result<()> + Send>;

/// Durable keyed storage for image records.
///
/// `update` runs the mutator against the latest persisted state and writes the
/// whole mutable part of the record in one step, so status, thumbnails and
/// error message always change together.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn create(&self, record: ImageRecord) -> Result<ImageRecord>;

    async fn get(&self, id: Uuid) -> Result<Option<ImageRecord>>;

    async fn update(&self, id: Uuid, mutator: Mutator) -> Result<Option<ImageRecord>>;

    /// Records in `status` last touched before `older_than`, oldest first.
    async fn list_stale(
        &self,
        status: Status,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ImageRecord>>;

    async fn ping(&self) -> bool;
}
