//! Pipeline assembly and lifecycle.
//!
//! [`Components`] bundles the backends every stage talks to (object store,
//! keyed store, index, dead letters, checkpoints, the two streams, OCR).
//! Production builds them from the config (SQLite + the configured object
//! store); tests build them in memory.
//!
//! [`start`] wires the stages together and spawns one task per unit of work:
//!
//! ```text
//!   uploads ──▶ NotifyingObjectStore ──▶ UploadWatcher ──▶ bizcard-image
//!                                                            │ (1 task / partition)
//!                                                            ▼
//!                                     ExtractWorker ──▶ records + bizcard-text
//!                                                            │
//!                              ┌─────────────────────────────┤
//!                              ▼ (1 task / partition)        ▼ (1 task)
//!                         IndexWorker                   ArchiveSink
//! ```
//!
//! plus a retention task that trims both streams. All tasks stop when the
//! shared `watch` shutdown signal flips to `true`.

use anyhow::{Context, Result};
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::archive::ArchiveSink;
use crate::cache::QueryCache;
use crate::config::Config;
use crate::db;
use crate::extract_worker::{ExtractWorker, EXTRACTION_GROUP};
use crate::index_worker::{IndexWorker, INDEXING_GROUP};
use crate::migrate;
use crate::models::ObjectLocation;
use crate::object_store::{
    build_object_store, detect_content_type, NotifyingObjectStore, ObjectEvent, ObjectStore,
};
use crate::ocr::{create_extractor, TextExtractor};
use crate::search::SearchService;
use crate::server::{self, AppState};
use crate::store::memory::InMemoryStore;
use crate::store::sqlite::SqliteStore;
use crate::store::{DeadLetterQueue, RecordStore, SearchIndex};
use crate::stream::memory::MemoryStream;
use crate::stream::sqlite::SqliteStream;
use crate::stream::{
    run_partition, wait_or_shutdown, BatchProcessor, CheckpointStore, PartitionConsumer,
    StartingPosition, Stream,
};
use crate::watcher::{KeyFilter, UploadWatcher};

/// How often the retention task trims the streams.
const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Clone)]
pub struct Components {
    pub objects: Arc<dyn ObjectStore>,
    pub records: Arc<dyn RecordStore>,
    pub index: Arc<dyn SearchIndex>,
    pub dead_letters: Arc<dyn DeadLetterQueue>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub image_stream: Arc<dyn Stream>,
    pub text_stream: Arc<dyn Stream>,
    pub ocr: Arc<dyn TextExtractor>,
}

impl Components {
    /// SQLite-backed components plus the configured object store and OCR provider.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;
        let store = Arc::new(SqliteStore::new(pool.clone()));

        let partitions = config.streams.partitions;
        let image_stream =
            SqliteStream::open(pool.clone(), &config.streams.image_stream, partitions).await?;
        let text_stream =
            SqliteStream::open(pool, &config.streams.text_stream, partitions).await?;

        let ocr: Arc<dyn TextExtractor> = Arc::from(create_extractor(&config.ocr)?);
        if !config.ocr.is_enabled() {
            tracing::warn!("OCR provider is disabled; extraction will halt until [ocr] is configured");
        }

        Ok(Self {
            objects: build_object_store(&config.object_store)?,
            records: store.clone(),
            index: store.clone(),
            dead_letters: store.clone(),
            checkpoints: store,
            image_stream: Arc::new(image_stream),
            text_stream: Arc::new(text_stream),
            ocr,
        })
    }

    /// Everything in memory, for tests and local experiments.
    pub fn in_memory(
        objects: Arc<dyn ObjectStore>,
        config: &Config,
        ocr: Arc<dyn TextExtractor>,
    ) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let partitions = config.streams.partitions;
        Self {
            objects,
            records: store.clone(),
            index: store.clone(),
            dead_letters: store.clone(),
            checkpoints: store,
            image_stream: Arc::new(MemoryStream::new(&config.streams.image_stream, partitions)),
            text_stream: Arc::new(MemoryStream::new(&config.streams.text_stream, partitions)),
            ocr,
        }
    }
}

/// A started pipeline: the upload-facing object store and the stage tasks.
pub struct RunningPipeline {
    /// Writes through this store notify the upload watcher.
    pub uploads: Arc<dyn ObjectStore>,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningPipeline {
    /// Wait for every stage task to finish. Call after signalling shutdown.
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "pipeline task panicked");
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn spawn_consumers(
    group: &str,
    stream: &Arc<dyn Stream>,
    checkpoints: &Arc<dyn CheckpointStore>,
    start: StartingPosition,
    processor: Arc<dyn BatchProcessor>,
    batch_size: usize,
    poll_interval: Duration,
    shutdown: &watch::Receiver<bool>,
    tasks: &mut Vec<JoinHandle<()>>,
) -> Result<()> {
    for partition in 0..stream.partitions() {
        let consumer = PartitionConsumer::open(
            group,
            stream.clone(),
            checkpoints.clone(),
            partition,
            start,
        )
        .await
        .with_context(|| format!("opening {} consumer for partition {}", group, partition))?;
        tasks.push(tokio::spawn(run_partition(
            consumer,
            processor.clone(),
            batch_size,
            poll_interval,
            shutdown.clone(),
        )));
    }
    Ok(())
}

/// Wire every stage and spawn its tasks.
///
/// Consumers are opened before the watcher starts, so with a `latest` start
/// position no work item enqueued by this process is skipped.
pub async fn start(
    config: &Config,
    components: Components,
    shutdown: watch::Receiver<bool>,
) -> Result<RunningPipeline> {
    let poll_interval = config.streams.poll_interval();
    let mut tasks = Vec::new();

    let extractor: Arc<dyn BatchProcessor> = Arc::new(
        ExtractWorker::builder(
            components.objects.clone(),
            components.ocr.clone(),
            components.records.clone(),
            components.dead_letters.clone(),
            components.image_stream.name(),
            components.text_stream.clone(),
        )
        .call_policy(config.extraction.retry_policy())
        .ocr_policy(config.ocr.retry_policy())
        .budget(config.extraction.invocation_budget())
        .build(),
    );
    spawn_consumers(
        EXTRACTION_GROUP,
        &components.image_stream,
        &components.checkpoints,
        config.extraction.starting_position,
        extractor,
        config.extraction.batch_size,
        poll_interval,
        &shutdown,
        &mut tasks,
    )
    .await?;

    let indexer: Arc<dyn BatchProcessor> = Arc::new(IndexWorker::new(
        components.index.clone(),
        components.dead_letters.clone(),
        components.text_stream.name(),
        config.indexing.retry_policy(),
        config.indexing.invocation_budget(),
    ));
    spawn_consumers(
        INDEXING_GROUP,
        &components.text_stream,
        &components.checkpoints,
        config.indexing.starting_position,
        indexer,
        config.indexing.batch_size,
        poll_interval,
        &shutdown,
        &mut tasks,
    )
    .await?;

    if config.archive.enabled {
        let sink = ArchiveSink::open(
            components.objects.clone(),
            components.text_stream.clone(),
            components.checkpoints.clone(),
            components.dead_letters.clone(),
            &config.archive,
            config.indexing.batch_size,
        )
        .await
        .context("opening archive sink")?;
        tasks.push(tokio::spawn(sink.run(poll_interval, shutdown.clone())));
    }

    let (notifying, events) = NotifyingObjectStore::new(components.objects.clone());
    let watcher = UploadWatcher::new(
        KeyFilter::from_config(&config.watcher)?,
        components.image_stream.clone(),
        components.dead_letters.clone(),
        config.watcher.retry_policy(),
    );
    if config.watcher.scan_on_start {
        watcher.scan_existing(components.objects.as_ref()).await?;
    }
    tasks.push(tokio::spawn(watcher.run(events, shutdown.clone())));

    tasks.push(tokio::spawn(run_retention(
        vec![components.image_stream, components.text_stream],
        Duration::from_secs(config.streams.retention_hours * 3600),
        shutdown,
    )));

    tracing::info!(
        partitions = config.streams.partitions,
        archive = config.archive.enabled,
        "pipeline started"
    );
    Ok(RunningPipeline {
        uploads: Arc::new(notifying),
        tasks,
    })
}

async fn run_retention(
    streams: Vec<Arc<dyn Stream>>,
    retention: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let Ok(age) = chrono::Duration::from_std(retention) else {
            tracing::error!("retention window out of range; trimming disabled");
            return;
        };
        let cutoff = Utc::now() - age;
        for stream in &streams {
            match stream.trim_before(cutoff).await {
                Ok(0) => {}
                Ok(removed) => tracing::info!(stream = stream.name(), removed, "trimmed expired records"),
                Err(e) => tracing::warn!(stream = stream.name(), error = %e, "stream trim failed"),
            }
        }
        if wait_or_shutdown(&mut shutdown, RETENTION_SWEEP_INTERVAL).await || *shutdown.borrow() {
            break;
        }
    }
}

/// `bizcard serve`: run the upload API and every pipeline stage until Ctrl-C.
pub async fn run_serve(config: &Config) -> Result<()> {
    let components = Components::from_config(config).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let search = Arc::new(SearchService::new(
        components.index.clone(),
        Arc::new(QueryCache::from_config(&config.cache)),
    ));
    let records = components.records.clone();
    let pipeline = start(config, components, shutdown_rx.clone()).await?;

    let state = AppState::new(
        pipeline.uploads.clone(),
        records,
        search,
        server::resolve_credentials(&config.server)?,
        config.server.max_clock_skew_secs,
    );
    let server_config = config.server.clone();
    let mut server_task =
        tokio::spawn(async move { server::run_server(&server_config, state, shutdown_rx).await });

    let early_exit = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("listening for Ctrl-C")?;
            tracing::info!("shutdown requested");
            None
        }
        result = &mut server_task => Some(result),
    };

    let _ = shutdown_tx.send(true);
    let server_result = match early_exit {
        Some(result) => result,
        None => server_task.await,
    };
    pipeline.join().await;
    server_result??;
    Ok(())
}

/// `bizcard put <file>`: store a file directly and enqueue it like an upload.
pub async fn run_put(config: &Config, file: &Path, key: Option<String>) -> Result<()> {
    let bytes = std::fs::read(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let key = match key {
        Some(key) => key,
        None => {
            let name = file
                .file_name()
                .and_then(|n| n.to_str())
                .context("file name is not valid UTF-8")?;
            format!("{}{}", config.watcher.prefix, name)
        }
    };

    let objects = build_object_store(&config.object_store)?;
    let content_type = detect_content_type(&key);
    let meta = objects.put(&key, bytes, &content_type).await?;
    println!("Stored {} ({} bytes, {})", key, meta.size, meta.content_type);

    let pool = db::connect(config).await?;
    migrate::apply(&pool).await?;
    let store = Arc::new(SqliteStore::new(pool.clone()));
    let stream = SqliteStream::open(
        pool.clone(),
        &config.streams.image_stream,
        config.streams.partitions,
    )
    .await?;
    let watcher = UploadWatcher::new(
        KeyFilter::from_config(&config.watcher)?,
        Arc::new(stream),
        store,
        config.watcher.retry_policy(),
    );

    let event = ObjectEvent::Created {
        location: ObjectLocation::new(objects.bucket(), key.as_str()),
        meta,
    };
    match watcher.handle_event(&event).await? {
        Some((partition, offset)) => {
            println!("Enqueued on {} partition {} offset {}", config.streams.image_stream, partition, offset)
        }
        None => println!("Not enqueued: key is outside the watched prefix/suffix filter"),
    }

    pool.close().await;
    Ok(())
}
