//! HTTP API.
//!
//! ```text
//! GET  /                         service banner
//! POST /images/                  multipart upload, field `file`
//! GET  /images/{id}              status and URLs
//! GET  /health                   dependency checks
//! GET  /static/{kind}/{name}     stored originals and thumbnails
//! ```
use crate::blob::{public_name, BlobKind, BlobStore};
use crate::ingest::IngestService;
use crate::queue::TaskQueue;
use crate::store::RecordStore;
use crate::{AppError, ImageRecord, Result, Status};
use actix_multipart::Multipart;
use actix_web::{http::header, web, HttpResponse};
use bytes::BytesMut;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, instrument, warn};
use uuid::Uuid;

const UPLOAD_FIELD: &str = "file";
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// Everything the handlers need, shared through `web::Data`.
#[derive(Clone)]
pub struct AppState {
    pub ingest: IngestService,
    pub records: Arc<dyn RecordStore>,
    pub queue: Arc<dyn TaskQueue>,
    pub blobs: BlobStore,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::get().to(index))
        .route("/health", web::get().to(health))
        .route("/images/", web::post().to(upload_image))
        .route("/images", web::post().to(upload_image))
        .route("/images/{id}", web::get().to(get_image))
        .route("/static/{kind}/{name}", web::get().to(serve_blob));
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub id: Uuid,
    pub status: Status,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ImageResponse {
    pub id: Uuid,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_url: Option<String>,
    pub thumbnails: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl From<&ImageRecord> for ImageResponse {
    fn from(record: &ImageRecord) -> Self {
        let original_url = (record.status == Status::Done)
            .then(|| static_url(BlobKind::Originals, &record.original_path))
            .flatten();
        let thumbnails = record
            .thumbnails
            .iter()
            .filter_map(|(label, path)| {
                static_url(BlobKind::Thumbnails, path).map(|url| (label.to_string(), url))
            })
            .collect();

        Self {
            id: record.id,
            status: record.status,
            original_url,
            thumbnails,
            error_message: record.error_message.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthServices {
    pub database: bool,
    pub queue: bool,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub services: HealthServices,
    pub timestamp: DateTime<Utc>,
}

fn static_url(kind: BlobKind, path: &str) -> Option<String> {
    public_name(path).map(|name| format!("/static/{}/{name}", kind.dir_name()))
}

async fn index() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "message": "Image Processing Service API",
        "version": env!("CARGO_PKG_VERSION"),
        "health": "/health",
    }))
}

/// Reads the `file` field. Buffering stops once the upload is known to be
/// over the limit; the counted size is still handed on so validation reports
/// it in the usual order.
#[instrument(skip_all)]
async fn upload_image(
    state: web::Data<AppState>,
    mut payload: Multipart,
) -> Result<HttpResponse> {
    let max_size = state.ingest.policy().max_size;
    let mut upload = None;

    while let Some(field) = payload.next().await {
        let mut field = field.map_err(|e| {
            warn!(error = %e, "Unreadable multipart body");
            AppError::MissingField(format!("{UPLOAD_FIELD} ({e})"))
        })?;

        if field.name() != Some(UPLOAD_FIELD) {
            while let Some(chunk) = field.next().await {
                chunk.map_err(|e| AppError::MissingField(format!("{UPLOAD_FIELD} ({e})")))?;
            }
            continue;
        }

        let filename = field
            .content_disposition()
            .and_then(|cd| cd.get_filename())
            .map(str::to_string);
        let mut size: u64 = 0;
        let mut buf = BytesMut::new();
        while let Some(chunk) = field.next().await {
            let chunk =
                chunk.map_err(|e| AppError::MissingField(format!("{UPLOAD_FIELD} ({e})")))?;
            size += chunk.len() as u64;
            if size > max_size {
                break;
            }
            buf.extend_from_slice(&chunk);
        }
        upload = Some((filename, size, buf));
        break;
    }

    let (filename, size, buf) =
        upload.ok_or_else(|| AppError::MissingField(UPLOAD_FIELD.to_string()))?;

    let record = state.ingest.ingest(filename.as_deref(), size, &buf).await?;

    Ok(HttpResponse::Ok().json(UploadResponse {
        id: record.id,
        status: record.status,
        message: "Image uploaded successfully and queued for processing".to_string(),
    }))
}

async fn get_image(state: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse> {
    let raw = path.into_inner();
    let not_found = || AppError::NotFound("Image not found".to_string());

    let id = Uuid::parse_str(&raw).map_err(|_| not_found())?;
    let record = state.records.get(id).await?.ok_or_else(not_found)?;

    Ok(HttpResponse::Ok().json(ImageResponse::from(&record)))
}

async fn check(name: &str, ping: impl Future<Output = bool>) -> bool {
    match tokio::time::timeout(HEALTH_CHECK_TIMEOUT, ping).await {
        Ok(true) => true,
        Ok(false) => {
            error!(service = name, "Health check failed");
            false
        }
        Err(_) => {
            error!(service = name, "Health check timed out");
            false
        }
    }
}

async fn health(state: web::Data<AppState>) -> HttpResponse {
    let (database, queue) = futures::join!(
        check("database", state.records.ping()),
        check("queue", state.queue.ping())
    );

    HttpResponse::Ok().json(HealthResponse {
        status: if database && queue { "healthy" } else { "unhealthy" },
        services: HealthServices { database, queue },
        timestamp: Utc::now(),
    })
}

async fn serve_blob(
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse> {
    let (kind, name) = path.into_inner();
    let not_found = || AppError::NotFound(format!("{kind}/{name}"));

    let file = BlobKind::parse(&kind)
        .and_then(|kind| state.blobs.resolve(kind, &name))
        .ok_or_else(not_found)?;

    let bytes = match tokio::fs::read(&file).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Err(not_found()),
        Err(err) => return Err(err.into()),
    };

    Ok(HttpResponse::Ok()
        .insert_header((header::CONTENT_TYPE, content_type(&file)))
        .body(bytes))
}

fn content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}
