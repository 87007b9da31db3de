use anyhow::{Context, Error};
use clap::Parser;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};

use actix_web::{middleware::Logger, web, App, HttpServer};
use thumbq::blob::BlobStore;
use thumbq::config::{
    Cli, Command, DatabaseArgs, HttpArgs, QueueArgs, ReconcileOnceArgs, ServeArgs,
    StandaloneArgs, WorkArgs,
};
use thumbq::db::DbHandle;
use thumbq::http::{self, AppState};
use thumbq::ingest::IngestService;
use thumbq::memory::{MemoryQueue, MemoryRecordStore};
use thumbq::queue::{PgQueue, TaskQueue};
use thumbq::reconcile::Reconciler;
use thumbq::store::RecordStore;
use thumbq::telemetry;
use thumbq::thumbnail::ThumbnailEngine;
use thumbq::worker::Worker;

/// The queue pool connects on first use; an unreachable queue shows up in
/// `/health` and leaves uploads at `NEW` instead of stopping startup.
fn connect_queue(db: &DbHandle, args: &QueueArgs) -> Result<PgQueue, Error> {
    match &args.queue_url {
        Some(url) => PgQueue::connect(url, &args.queue_name, args.visibility_timeout())
            .context("Invalid queue URL"),
        None => Ok(PgQueue::with_pool(
            db.pool().clone(),
            &args.queue_name,
            args.visibility_timeout(),
        )),
    }
}

async fn connect_db(args: &DatabaseArgs) -> Result<DbHandle, Error> {
    DbHandle::connect(&args.database_url, args.max_connections)
        .await
        .context("Failed to connect to database")
}

/// Cancels `token` on SIGINT or SIGTERM.
fn spawn_signal_handler(token: CancellationToken) -> Result<(), Error> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
        token.cancel();
    });
    Ok(())
}

async fn run_http(http_args: &HttpArgs, state: AppState) -> Result<(), Error> {
    let bind = (http_args.host.clone(), http_args.port);
    info!(host = %bind.0, port = bind.1, "Starting HTTP server");

    let data = web::Data::new(state);
    HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .wrap(Logger::default())
            .configure(http::configure)
    })
    .bind(bind)?
    .run()
    .await?;
    Ok(())
}

async fn serve(args: ServeArgs) -> Result<(), Error> {
    let db = connect_db(&args.database).await?;
    let queue: Arc<dyn TaskQueue> = Arc::new(connect_queue(&db, &args.queue)?);
    let records: Arc<dyn RecordStore> = Arc::new(db.clone());
    let blobs = BlobStore::open(&args.storage.storage_path).await?;

    let state = AppState {
        ingest: IngestService::new(
            records.clone(),
            blobs.clone(),
            queue.clone(),
            args.upload.policy(),
        ),
        records,
        queue: queue.clone(),
        blobs,
    };

    let served = run_http(&args.http, state).await;
    queue.close().await;
    db.close().await;
    served
}

async fn work(args: WorkArgs) -> Result<(), Error> {
    args.validate().map_err(Error::msg)?;
    let cancel_token = CancellationToken::new();
    spawn_signal_handler(cancel_token.clone())?;

    let db = connect_db(&args.database).await?;
    let queue: Arc<dyn TaskQueue> = Arc::new(connect_queue(&db, &args.queue)?);
    let records: Arc<dyn RecordStore> = Arc::new(db.clone());
    let blobs = BlobStore::open(&args.storage.storage_path).await?;
    let engine = Arc::new(ThumbnailEngine::new(args.thumbnails.config()));

    let worker = Worker::new(
        records.clone(),
        blobs,
        queue.clone(),
        engine,
        args.worker.config(),
    );
    let reconciler = Reconciler::new(records, queue.clone(), args.reconcile.config());

    tokio::join!(
        worker
            .start(cancel_token.clone())
            .instrument(info_span!("worker")),
        reconciler
            .start(cancel_token.clone())
            .instrument(info_span!("reconciler")),
    );

    queue.close().await;
    db.close().await;
    info!("Worker shut down.");
    Ok(())
}

async fn reconcile_once(args: ReconcileOnceArgs) -> Result<(), Error> {
    let db = connect_db(&args.database).await?;
    let queue: Arc<dyn TaskQueue> = Arc::new(connect_queue(&db, &args.queue)?);
    let reconciler = Reconciler::new(Arc::new(db.clone()), queue.clone(), args.reconcile.config());

    let swept = reconciler.sweep().await;
    queue.close().await;
    db.close().await;
    let queued = swept?;
    info!(queued, "Reconciliation finished");
    Ok(())
}

async fn standalone(args: StandaloneArgs) -> Result<(), Error> {
    let cancel_token = CancellationToken::new();

    let records: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
    let queue: Arc<dyn TaskQueue> = Arc::new(MemoryQueue::new());
    let blobs = BlobStore::open(&args.storage.storage_path).await?;
    let engine = Arc::new(ThumbnailEngine::new(args.thumbnails.config()));

    let worker = Worker::new(
        records.clone(),
        blobs.clone(),
        queue.clone(),
        engine,
        args.worker.config(),
    );
    let reconciler = Reconciler::new(records.clone(), queue.clone(), args.reconcile.config());

    let background = {
        let cancel_token = cancel_token.clone();
        tokio::spawn(async move {
            tokio::join!(
                worker
                    .start(cancel_token.clone())
                    .instrument(info_span!("worker")),
                reconciler
                    .start(cancel_token.clone())
                    .instrument(info_span!("reconciler")),
            );
        })
    };

    let state = AppState {
        ingest: IngestService::new(records.clone(), blobs.clone(), queue.clone(), args.upload.policy()),
        records,
        queue: queue.clone(),
        blobs,
    };

    // The HTTP server owns signal handling and returns once it has stopped.
    let served = run_http(&args.http, state).await;
    cancel_token.cancel();
    background.await?;
    queue.close().await;
    served
}

#[actix_web::main]
async fn main() -> Result<(), Error> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    telemetry::init(
        &cli.log.log_level,
        cli.log.log_format,
        cli.log.jaeger_endpoint.as_deref(),
    )?;

    let result = match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Work(args) => work(args).await,
        Command::Reconcile(args) => reconcile_once(args).await,
        Command::Standalone(args) => standalone(args).await,
    };

    if let Err(err) = &result {
        error!(error = ?err, "Exiting with error");
    }
    info!("Shutting down.");
    telemetry::shutdown();

    result
}
