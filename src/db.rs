use crate::store::{Mutator, RecordStore};
use crate::{ImageRecord, Result, Status, Thumbnails};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::Executor;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

const SELECT_COLUMNS: &str = "SELECT id, status, original_filename, original_path, original_size, \
     thumbnails, error_message, created_at, updated_at FROM images";

#[derive(Debug, sqlx::FromRow)]
struct ImageRow {
    id: Uuid,
    status: Status,
    original_filename: String,
    original_path: String,
    original_size: i64,
    thumbnails: Json<BTreeMap<String, String>>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ImageRow> for ImageRecord {
    fn from(row: ImageRow) -> Self {
        ImageRecord {
            id: row.id,
            status: row.status,
            original_filename: row.original_filename,
            original_path: row.original_path,
            original_size: row.original_size,
            thumbnails: Thumbnails::from_stored(row.thumbnails.0),
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// PostgreSQL-backed record store.
#[derive(Clone)]
pub struct DbHandle {
    pool: Arc<PgPool>,
}

impl DbHandle {
    #[instrument(name = "db.connect", skip(url))]
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        (&pool).execute(include_str!("setup.sql")).await?;
        debug!("Image schema ready");

        Ok(DbHandle {
            pool: Arc::new(pool),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl RecordStore for DbHandle {
    #[instrument(name = "db.create", skip_all, fields(image_id = %record.id))]
    async fn create(&self, record: ImageRecord) -> Result<ImageRecord> {
        sqlx::query(
            "INSERT INTO images \
            (id, status, original_filename, original_path, original_size, thumbnails, \
             error_message, created_at, updated_at) \
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(record.id)
        .bind(record.status)
        .bind(&record.original_filename)
        .bind(&record.original_path)
        .bind(record.original_size)
        .bind(Json(record.thumbnails.as_map()))
        .bind(&record.error_message)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&*self.pool)
        .await?;

        Ok(record)
    }

    async fn get(&self, id: Uuid) -> Result<Option<ImageRecord>> {
        let row = sqlx::query_as::<_, ImageRow>(&format!("{SELECT_COLUMNS} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&*self.pool)
            .await?;

        Ok(row.map(ImageRecord::from))
    }

    #[instrument(name = "db.update", skip(self, mutator), fields(image_id = %id))]
    async fn update(&self, id: Uuid, mutator: Mutator) -> Result<Option<ImageRecord>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, ImageRow>(&format!(
            "{SELECT_COLUMNS} WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        // Dropping the transaction rolls it back.
        let Some(row) = row else {
            return Ok(None);
        };
        let mut record = ImageRecord::from(row);
        mutator(&mut record)?;

        sqlx::query(
            "UPDATE images \
                SET status = $2, \
                thumbnails = $3, \
                error_message = $4, \
                updated_at = $5 \
            WHERE id = $1",
        )
        .bind(id)
        .bind(record.status)
        .bind(Json(record.thumbnails.as_map()))
        .bind(&record.error_message)
        .bind(record.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(status = %record.status, "Record updated");

        Ok(Some(record))
    }

    async fn list_stale(
        &self,
        status: Status,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ImageRecord>> {
        debug!("Getting up to {} stale {} records", limit, status);
        let rows = sqlx::query_as::<_, ImageRow>(&format!(
            "{SELECT_COLUMNS} \
            WHERE status = $1 AND updated_at < $2 \
            ORDER BY updated_at ASC \
            LIMIT $3"
        ))
        .bind(status)
        .bind(older_than)
        .bind(limit)
        .fetch_all(&*self.pool)
        .await?;

        Ok(rows.into_iter().map(ImageRecord::from).collect())
    }

    async fn ping(&self) -> bool {
        match sqlx::query("SELECT 1").execute(&*self.pool).await {
            Ok(_) => true,
            Err(err) => {
                tracing::error!(error = %err, "Database health check failed");
                false
            }
        }
    }
}
