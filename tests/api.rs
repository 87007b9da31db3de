use actix_web::http::{header, StatusCode};
use actix_web::{test, web, App};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageEncoder, RgbImage};
use serde_json::Value;
use std::sync::Arc;
use thumbq::blob::BlobStore;
use thumbq::http::{self, AppState};
use thumbq::ingest::{IngestService, UploadPolicy, DEFAULT_EXTENSIONS};
use thumbq::memory::{MemoryQueue, MemoryRecordStore};
use thumbq::store::RecordStore;
use thumbq::thumbnail::{ThumbnailConfig, ThumbnailEngine};
use thumbq::worker::{Outcome, Worker, WorkerConfig};
use thumbq::Status;

const BOUNDARY: &str = "thumbq-test-boundary";

struct Fixture {
    _tmp: tempfile::TempDir,
    records: Arc<MemoryRecordStore>,
    queue: Arc<MemoryQueue>,
    worker: Worker,
    state: AppState,
}

async fn fixture(policy: UploadPolicy) -> Fixture {
    let tmp = tempfile::TempDir::new().unwrap();
    let records = Arc::new(MemoryRecordStore::new());
    let queue = Arc::new(MemoryQueue::new());
    let blobs = BlobStore::open(tmp.path()).await.unwrap();

    let worker = Worker::new(
        records.clone(),
        blobs.clone(),
        queue.clone(),
        Arc::new(ThumbnailEngine::new(ThumbnailConfig::default())),
        WorkerConfig::default(),
    );
    let state = AppState {
        ingest: IngestService::new(records.clone(), blobs.clone(), queue.clone(), policy),
        records: records.clone(),
        queue: queue.clone(),
        blobs,
    };

    Fixture {
        _tmp: tmp,
        records,
        queue,
        worker,
        state,
    }
}

fn red_jpeg(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, image::Rgb([255, 0, 0]));
    let mut buf = Vec::new();
    JpegEncoder::new(&mut buf)
        .write_image(img.as_raw(), width, height, ExtendedColorType::Rgb8)
        .unwrap();
    buf
}

fn multipart(field: &str, filename: Option<&str>, content: &[u8]) -> Vec<u8> {
    let disposition = match filename {
        Some(name) => format!("form-data; name=\"{field}\"; filename=\"{name}\""),
        None => format!("form-data; name=\"{field}\""),
    };
    let mut body = format!(
        "--{BOUNDARY}\r\nContent-Disposition: {disposition}\r\n\
         Content-Type: application/octet-stream\r\n\r\n"
    )
    .into_bytes();
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn upload_request(field: &str, filename: Option<&str>, content: &[u8]) -> test::TestRequest {
    test::TestRequest::post()
        .uri("/images/")
        .insert_header((
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        ))
        .set_payload(multipart(field, filename, content))
}

macro_rules! app {
    ($fx:expr) => {
        test::init_service(
            App::new()
                .app_data(web::Data::new($fx.state.clone()))
                .configure(http::configure),
        )
        .await
    };
}

#[actix_web::test]
async fn upload_then_process_then_fetch_thumbnails() {
    let fx = fixture(UploadPolicy::default()).await;
    let app = app!(fx);

    let req = upload_request("file", Some("red.jpg"), &red_jpeg(1000, 1000)).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["status"], "PROCESSING");
    assert_eq!(
        body["message"],
        "Image uploaded successfully and queued for processing"
    );
    let id = body["id"].as_str().unwrap().to_string();

    // Pending records expose no URLs yet.
    let req = test::TestRequest::get().uri(&format!("/images/{id}")).to_request();
    let pending: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(pending["status"], "PROCESSING");
    assert!(pending.get("original_url").is_none());
    assert_eq!(pending["thumbnails"], serde_json::json!({}));

    let outcome = fx.worker.run_once().await.unwrap().unwrap();
    assert!(matches!(outcome, Outcome::Completed(_)));

    let req = test::TestRequest::get().uri(&format!("/images/{id}")).to_request();
    let done: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(done["status"], "DONE");
    let thumbnails = done["thumbnails"].as_object().unwrap();
    assert_eq!(thumbnails.len(), 3);

    for (label, (w, h)) in [
        ("100x100", (100, 100)),
        ("300x300", (300, 300)),
        ("1200x1200", (1200, 1200)),
    ] {
        let url = thumbnails[label].as_str().unwrap();
        assert_eq!(url, format!("/static/thumbnails/{id}_{label}.jpg"));

        let resp = test::call_service(&app, test::TestRequest::get().uri(url).to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "image/jpeg"
        );
        let bytes = test::read_body(resp).await;
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (w, h));
    }

    let original = done["original_url"].as_str().unwrap();
    assert_eq!(original, format!("/static/originals/{id}.jpg"));
    let resp = test::call_service(&app, test::TestRequest::get().uri(original).to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);

    // Repeated reads are stable.
    let req = test::TestRequest::get().uri(&format!("/images/{id}")).to_request();
    let again: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(again, done);
    assert_eq!(fx.queue.acked(), 1);
}

#[actix_web::test]
async fn text_file_is_rejected_without_record() {
    let fx = fixture(UploadPolicy::default()).await;
    let app = app!(fx);

    let req = upload_request("file", Some("notes.txt"), b"hello").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "unsupported_type");
    let detail = body["detail"].as_str().unwrap();
    assert!(detail.contains("not allowed"), "{detail}");
    assert!(detail.contains(".txt"), "{detail}");

    assert!(fx.records.is_empty().await);
    assert_eq!(fx.queue.pending(), 0);
}

#[actix_web::test]
async fn oversized_upload_is_rejected_without_record() {
    let fx = fixture(UploadPolicy::new(1024, DEFAULT_EXTENSIONS)).await;
    let app = app!(fx);

    let req = upload_request("file", Some("big.jpg"), &[7u8; 4096]).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "too_large");
    assert!(fx.records.is_empty().await);
}

#[actix_web::test]
async fn storage_failure_is_internal_error_without_record() {
    let fx = fixture(UploadPolicy::default()).await;
    let originals = fx._tmp.path().join("originals");
    std::fs::remove_dir_all(&originals).unwrap();
    std::fs::write(&originals, b"").unwrap();
    let app = app!(fx);

    let req = upload_request("file", Some("red.jpg"), &red_jpeg(8, 8)).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "storage_error");

    assert!(fx.records.is_empty().await);
    assert_eq!(fx.queue.pending(), 0);
}

#[actix_web::test]
async fn upload_without_file_field_is_unprocessable() {
    let fx = fixture(UploadPolicy::default()).await;
    let app = app!(fx);

    let req = upload_request("image", Some("red.jpg"), b"abc").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let req = test::TestRequest::post()
        .uri("/images")
        .insert_header((header::CONTENT_TYPE, "application/json"))
        .set_payload("{}")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_client_error());
    assert!(fx.records.is_empty().await);
}

#[actix_web::test]
async fn missing_filename_is_bad_request() {
    let fx = fixture(UploadPolicy::default()).await;
    let app = app!(fx);

    let req = upload_request("file", None, b"abc").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "invalid_input");
}

#[actix_web::test]
async fn unknown_and_malformed_ids_are_not_found() {
    let fx = fixture(UploadPolicy::default()).await;
    let app = app!(fx);

    for uri in [
        "/images/00000000-0000-0000-0000-000000000000",
        "/images/not-a-uuid",
    ] {
        let resp = test::call_service(&app, test::TestRequest::get().uri(uri).to_request()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND, "{uri}");
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "not_found");
    }
}

#[actix_web::test]
async fn queue_outage_keeps_upload_new_and_reports_unhealthy() {
    let fx = fixture(UploadPolicy::default()).await;
    fx.queue.set_available(false);
    let app = app!(fx);

    let req = upload_request("file", Some("red.png"), b"png?").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["status"], "NEW");

    let req = test::TestRequest::get().uri("/health").to_request();
    let health: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(health["status"], "unhealthy");
    assert_eq!(health["services"]["database"], true);
    assert_eq!(health["services"]["queue"], false);
    assert!(health["timestamp"].is_string());
}

#[actix_web::test]
async fn health_and_index() {
    let fx = fixture(UploadPolicy::default()).await;
    let app = app!(fx);

    let req = test::TestRequest::get().uri("/health").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let health: Value = test::read_body_json(resp).await;
    assert_eq!(health["status"], "healthy");

    let req = test::TestRequest::get().uri("/").to_request();
    let index: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(index["health"], "/health");
}

#[actix_web::test]
async fn missing_original_ends_in_error_without_retry() {
    let fx = fixture(UploadPolicy::default()).await;
    let app = app!(fx);

    let req = upload_request("file", Some("gone.jpg"), &red_jpeg(10, 10)).to_request();
    let resp = test::call_service(&app, req).await;
    let body: Value = test::read_body_json(resp).await;
    let id = body["id"].as_str().unwrap().to_string();

    let record = fx
        .records
        .get(id.parse().unwrap())
        .await
        .unwrap()
        .unwrap();
    std::fs::remove_file(&record.original_path).unwrap();

    let outcome = fx.worker.run_once().await.unwrap().unwrap();
    assert!(matches!(outcome, Outcome::Failed(..)));

    let req = test::TestRequest::get().uri(&format!("/images/{id}")).to_request();
    let failed: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(failed["status"], "ERROR");
    assert!(!failed["error_message"].as_str().unwrap().is_empty());
    assert_eq!(failed["thumbnails"], serde_json::json!({}));

    assert_eq!(fx.queue.rejected().await.len(), 1);
    assert_eq!(fx.queue.pending(), 0);
    assert!(fx.worker.run_once().await.unwrap().is_none());
    assert_eq!(
        fx.records
            .get(id.parse().unwrap())
            .await
            .unwrap()
            .unwrap()
            .status,
        Status::Error
    );
}

#[actix_web::test]
async fn static_files_outside_storage_are_not_served() {
    let fx = fixture(UploadPolicy::default()).await;
    let app = app!(fx);

    for uri in [
        "/static/secrets/a.jpg",
        "/static/thumbnails/missing.jpg",
        "/static/originals/..",
    ] {
        let resp = test::call_service(&app, test::TestRequest::get().uri(uri).to_request()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND, "{uri}");
    }
}
