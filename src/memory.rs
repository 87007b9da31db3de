//! In-process record store and queue.
//!
//! Used by `thumbq standalone` and by the tests. Nothing survives a restart.
use crate::queue::{Delivery, TaskMessage, TaskQueue};
use crate::store::{Mutator, RecordStore};
use crate::{AppError, ImageRecord, Result, Status};
use async_channel::{Receiver, Sender};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

#[derive(Default)]
pub struct MemoryRecordStore {
    records: RwLock<HashMap<Uuid, ImageRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn create(&self, record: ImageRecord) -> Result<ImageRecord> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.id) {
            return Err(AppError::Internal(format!(
                "record {} already exists",
                record.id
            )));
        }
        records.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: Uuid) -> Result<Option<ImageRecord>> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn update(&self, id: Uuid, mutator: Mutator) -> Result<Option<ImageRecord>> {
        let mut records = self.records.write().await;
        let Some(current) = records.get(&id) else {
            return Ok(None);
        };
        // Mutate a copy so a failing mutator leaves the stored record as it was.
        let mut next = current.clone();
        mutator(&mut next)?;
        records.insert(id, next.clone());
        Ok(Some(next))
    }

    async fn list_stale(
        &self,
        status: Status,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ImageRecord>> {
        let records = self.records.read().await;
        let mut stale: Vec<ImageRecord> = records
            .values()
            .filter(|r| r.status == status && r.updated_at < older_than)
            .cloned()
            .collect();
        stale.sort_by_key(|r| r.updated_at);
        stale.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(stale)
    }

    async fn ping(&self) -> bool {
        true
    }
}

/// Channel-backed queue with ack/reject bookkeeping.
pub struct MemoryQueue {
    sender: Sender<Vec<u8>>,
    receiver: Receiver<Vec<u8>>,
    next_tag: AtomicI64,
    in_flight: Mutex<HashMap<i64, Delivery>>,
    rejected: Mutex<Vec<(Vec<u8>, String)>>,
    acked: AtomicUsize,
    available: AtomicBool,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        let (sender, receiver) = async_channel::unbounded();
        Self {
            sender,
            receiver,
            next_tag: AtomicI64::new(1),
            in_flight: Mutex::new(HashMap::new()),
            rejected: Mutex::new(Vec::new()),
            acked: AtomicUsize::new(0),
            available: AtomicBool::new(true),
        }
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates a broker outage: publish fails and health reports down.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Enqueues an arbitrary payload, bypassing serialization.
    pub async fn push_raw(&self, payload: Vec<u8>) -> Result<()> {
        self.sender
            .send(payload)
            .await
            .map_err(|e| AppError::Queue(e.to_string()))
    }

    /// Returns every unsettled message to the ready queue, as an expired
    /// lease would.
    pub async fn redeliver_unsettled(&self) -> Result<usize> {
        let drained: Vec<Delivery> = self.in_flight.lock().await.drain().map(|(_, d)| d).collect();
        let count = drained.len();
        for delivery in drained {
            self.push_raw(delivery.payload).await?;
        }
        Ok(count)
    }

    pub fn pending(&self) -> usize {
        self.receiver.len()
    }

    pub fn acked(&self) -> usize {
        self.acked.load(Ordering::SeqCst)
    }

    pub async fn rejected(&self) -> Vec<(Vec<u8>, String)> {
        self.rejected.lock().await.clone()
    }

    pub async fn in_flight(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AppError::Queue("queue unavailable".into()))
        }
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn publish(&self, task: &TaskMessage) -> Result<()> {
        self.ensure_available()?;
        self.push_raw(serde_json::to_vec(task)?).await
    }

    async fn fetch(&self) -> Result<Option<Delivery>> {
        self.ensure_available()?;
        let Ok(payload) = self.receiver.try_recv() else {
            return Ok(None);
        };
        let delivery = Delivery {
            tag: self.next_tag.fetch_add(1, Ordering::SeqCst),
            payload,
            delivery_count: 1,
        };
        self.in_flight
            .lock()
            .await
            .insert(delivery.tag, delivery.clone());
        Ok(Some(delivery))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        if self.in_flight.lock().await.remove(&delivery.tag).is_some() {
            self.acked.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn reject(&self, delivery: &Delivery, reason: &str) -> Result<()> {
        if let Some(settled) = self.in_flight.lock().await.remove(&delivery.tag) {
            self.rejected
                .lock()
                .await
                .push((settled.payload, reason.to_string()));
        }
        Ok(())
    }

    async fn ping(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.sender.close();
    }
}
