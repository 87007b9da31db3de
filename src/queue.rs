//! Durable task queue.
//!
//! Messages are JSON `{"image_id": ..., "image_path": ...}`. Delivery is
//! at-least-once: a claimed message that is neither acked nor rejected before
//! its lease runs out becomes deliverable again.
use crate::{AppError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::Executor;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Instruction to build thumbnails for one image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub image_id: Uuid,
    pub image_path: String,
}

/// A claimed, not yet settled message.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: i64,
    pub payload: Vec<u8>,
    pub delivery_count: i32,
}

impl Delivery {
    pub fn task(&self) -> Result<TaskMessage> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn publish(&self, task: &TaskMessage) -> Result<()>;

    /// Claims at most one message. `None` when nothing is ready.
    async fn fetch(&self) -> Result<Option<Delivery>>;

    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Settles the message without requeueing it.
    async fn reject(&self, delivery: &Delivery, reason: &str) -> Result<()>;

    async fn ping(&self) -> bool;

    async fn close(&self) {}
}

/// Queue stored in a PostgreSQL table. Competing consumers claim rows with
/// `FOR UPDATE SKIP LOCKED`.
///
/// Nothing touches the database until first use, so a process can start while
/// the queue is down. The table is declared by the first call that reaches it.
#[derive(Clone)]
pub struct PgQueue {
    pool: PgPool,
    name: String,
    visibility_timeout: Duration,
    declared: Arc<OnceCell<()>>,
}

impl PgQueue {
    #[instrument(name = "queue.connect", skip(url))]
    pub fn connect(url: &str, name: &str, visibility_timeout: Duration) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(2))
            .connect_lazy(url)
            .map_err(queue_error)?;
        Ok(Self::with_pool(pool, name, visibility_timeout))
    }

    /// Shares an existing pool, for when the queue lives in the record database.
    pub fn with_pool(pool: PgPool, name: &str, visibility_timeout: Duration) -> Self {
        Self {
            pool,
            name: name.to_string(),
            visibility_timeout,
            declared: Arc::new(OnceCell::new()),
        }
    }

    async fn declare(&self) -> Result<()> {
        self.declared
            .get_or_try_init(|| async {
                (&self.pool)
                    .execute(include_str!("queue.sql"))
                    .await
                    .map_err(queue_error)?;
                info!(queue = %self.name, "Queue declared");
                Ok::<(), AppError>(())
            })
            .await?;
        Ok(())
    }

    /// Settles a claim. Only the claim that produced `delivery` is matched, so
    /// a worker whose lease ran out cannot settle a later redelivery.
    async fn settle(&self, delivery: &Delivery, state: &str, reason: Option<&str>) -> Result<()> {
        let settled = sqlx::query(
            "UPDATE image_tasks \
                SET state = $3::task_state, finished_at = now(), locked_until = NULL, \
                last_error = COALESCE($4, last_error) \
            WHERE id = $1 AND delivery_count = $2 AND state = 'IN_FLIGHT'",
        )
        .bind(delivery.tag)
        .bind(delivery.delivery_count)
        .bind(state)
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_err(queue_error)?;

        if settled.rows_affected() == 0 {
            warn!(
                tag = delivery.tag,
                attempt = delivery.delivery_count,
                "Claim no longer held, message left to its current owner"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for PgQueue {
    #[instrument(name = "queue.publish", skip_all, fields(image_id = %task.image_id))]
    async fn publish(&self, task: &TaskMessage) -> Result<()> {
        self.declare().await?;
        sqlx::query("INSERT INTO image_tasks (queue, payload) VALUES ($1, $2)")
            .bind(&self.name)
            .bind(Json(task))
            .execute(&self.pool)
            .await
            .map_err(queue_error)?;

        debug!("Task published");
        Ok(())
    }

    async fn fetch(&self) -> Result<Option<Delivery>> {
        self.declare().await?;
        let row: Option<(i64, String, i32)> = sqlx::query_as(
            "UPDATE image_tasks \
                SET state = 'IN_FLIGHT', \
                delivery_count = delivery_count + 1, \
                locked_until = now() + make_interval(secs => $2) \
            WHERE id = ( \
                SELECT id FROM image_tasks \
                WHERE queue = $1 \
                  AND (state = 'READY' OR (state = 'IN_FLIGHT' AND locked_until < now())) \
                ORDER BY id ASC \
                LIMIT 1 \
                FOR UPDATE SKIP LOCKED \
            ) \
            RETURNING id, payload::text, delivery_count",
        )
        .bind(&self.name)
        .bind(self.visibility_timeout.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(queue_error)?;

        Ok(row.map(|(tag, payload, delivery_count)| Delivery {
            tag,
            payload: payload.into_bytes(),
            delivery_count,
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.settle(delivery, "ACKED", None).await
    }

    async fn reject(&self, delivery: &Delivery, reason: &str) -> Result<()> {
        self.settle(delivery, "REJECTED", Some(reason)).await
    }

    async fn ping(&self) -> bool {
        if self.pool.is_closed() {
            return false;
        }
        let reachable = match self.declare().await {
            Ok(()) => sqlx::query("SELECT 1")
                .execute(&self.pool)
                .await
                .map(|_| ())
                .map_err(queue_error),
            Err(err) => Err(err),
        };
        match reachable {
            Ok(()) => true,
            Err(err) => {
                error!(error = %err, "Queue health check failed");
                false
            }
        }
    }

    async fn close(&self) {
        self.pool.close().await;
        info!(queue = %self.name, "Queue connection closed");
    }
}

fn queue_error(err: sqlx::Error) -> AppError {
    AppError::Queue(err.to_string())
}
