//! Archival sink: text stream → compressed batch files in object storage.
//!
//! The sink is its own consumer group (`archive`) on the text stream, so it
//! reads every event independently of the indexing worker. Events are
//! buffered in an [`ArchiveBuffer`] and flushed as one object when either
//! threshold is reached, whichever comes first:
//!
//! - **time**: `archive.interval_secs` since the first buffered event
//! - **size**: `archive.size_bytes` of buffered JSONL
//!
//! # Object layout
//!
//! ```text
//! {prefix}{YYYY}/{MM}/{DD}/{HH}/{stream}-{unix_ts}-{uuid}.zip
//!   └── records.jsonl      one TextEvent per line, deflate-compressed
//! ```
//!
//! Objects are zip containers, not bare gzip streams; read them back with
//! [`decode_archive`].
//!
//! Checkpoints only move after the object write succeeds. A failed write
//! keeps the buffer intact and is retried on the next poll, so no event is
//! acknowledged before it is durable.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use crate::config::ArchiveConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{DeadLetter, TextEvent};
use crate::object_store::ObjectStore;
use crate::retry::{retry, RetryPolicy};
use crate::store::DeadLetterQueue;
use crate::stream::{wait_or_shutdown, CheckpointStore, PartitionConsumer, Stream};

pub const ARCHIVE_GROUP: &str = "archive";

/// Name of the single entry inside each archive object.
pub const ARCHIVE_ENTRY: &str = "records.jsonl";

/// Clock-injected buffer of events awaiting a flush.
pub struct ArchiveBuffer {
    interval: Duration,
    max_bytes: usize,
    jsonl: Vec<u8>,
    count: usize,
    first_at: Option<Instant>,
    /// Next offset to commit per partition once this buffer is durable.
    next_offsets: BTreeMap<u32, u64>,
}

/// The contents of a buffer handed over for writing.
#[derive(Debug, Default)]
pub struct ArchiveBatch {
    pub jsonl: Vec<u8>,
    pub count: usize,
    pub next_offsets: BTreeMap<u32, u64>,
}

impl ArchiveBuffer {
    pub fn new(interval: Duration, max_bytes: usize) -> Self {
        Self {
            interval,
            max_bytes,
            jsonl: Vec::new(),
            count: 0,
            first_at: None,
            next_offsets: BTreeMap::new(),
        }
    }

    pub fn push(
        &mut self,
        partition: u32,
        offset: u64,
        event: &TextEvent,
        now: Instant,
    ) -> PipelineResult<()> {
        let line = serde_json::to_vec(event)
            .map_err(|e| PipelineError::permanent("encode archive line", e))?;
        self.jsonl.extend_from_slice(&line);
        self.jsonl.push(b'\n');
        self.count += 1;
        self.first_at.get_or_insert(now);
        self.mark(partition, offset);
        Ok(())
    }

    /// Account for a record that was consumed without being buffered
    /// (dead-lettered), so its offset is committed with the next flush.
    pub fn skip(&mut self, partition: u32, offset: u64) {
        self.mark(partition, offset);
    }

    fn mark(&mut self, partition: u32, offset: u64) {
        let next = self.next_offsets.entry(partition).or_insert(0);
        *next = (*next).max(offset + 1);
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn size_bytes(&self) -> usize {
        self.jsonl.len()
    }

    pub fn is_full(&self) -> bool {
        self.jsonl.len() >= self.max_bytes
    }

    /// Whether a flush is due at `now`. Offsets from skipped records alone
    /// are flushed (committed) on the same schedule.
    pub fn should_flush(&self, now: Instant) -> bool {
        if self.is_full() {
            return true;
        }
        match self.first_at {
            Some(first) => now.saturating_duration_since(first) >= self.interval,
            None => !self.next_offsets.is_empty(),
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.next_offsets.is_empty()
    }

    pub fn take(&mut self) -> ArchiveBatch {
        self.first_at = None;
        ArchiveBatch {
            jsonl: std::mem::take(&mut self.jsonl),
            count: std::mem::replace(&mut self.count, 0),
            next_offsets: std::mem::take(&mut self.next_offsets),
        }
    }
}

/// Object key for an archive written at `at`.
pub fn archive_key(prefix: &str, stream: &str, at: DateTime<Utc>) -> String {
    format!(
        "{}{}/{}-{}-{}.zip",
        prefix,
        at.format("%Y/%m/%d/%H"),
        stream,
        at.timestamp(),
        uuid::Uuid::new_v4()
    )
}

/// Deflate-compress a JSONL payload into a single-entry zip.
pub fn encode_archive(jsonl: &[u8]) -> PipelineResult<Vec<u8>> {
    let encode_err = |e: &dyn std::fmt::Display| PipelineError::permanent("encode archive", e);
    let mut buf = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        zip.start_file(ARCHIVE_ENTRY, options)
            .map_err(|e| encode_err(&e))?;
        zip.write_all(jsonl).map_err(|e| encode_err(&e))?;
        zip.finish().map_err(|e| encode_err(&e))?;
    }
    Ok(buf)
}

/// Read the JSONL entry back out of an archive object.
pub fn decode_archive(bytes: &[u8]) -> PipelineResult<Vec<TextEvent>> {
    use std::io::Read;

    let decode_err = |e: &dyn std::fmt::Display| PipelineError::permanent("decode archive", e);
    let mut archive =
        zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| decode_err(&e))?;
    let mut entry = archive.by_name(ARCHIVE_ENTRY).map_err(|e| decode_err(&e))?;
    let mut jsonl = String::new();
    entry.read_to_string(&mut jsonl).map_err(|e| decode_err(&e))?;
    jsonl
        .lines()
        .filter(|l| !l.is_empty())
        .map(|l| serde_json::from_str(l).map_err(|e| PipelineError::decode("archived event", e)))
        .collect()
}

pub struct ArchiveSink {
    objects: Arc<dyn ObjectStore>,
    stream: Arc<dyn Stream>,
    dead_letters: Arc<dyn DeadLetterQueue>,
    prefix: String,
    policy: RetryPolicy,
    batch_size: usize,
    consumers: Vec<PartitionConsumer>,
    /// Read position per partition; runs ahead of the committed checkpoint.
    cursors: Vec<u64>,
    buffer: ArchiveBuffer,
}

impl ArchiveSink {
    /// Open one archive consumer per partition of `stream`.
    pub async fn open(
        objects: Arc<dyn ObjectStore>,
        stream: Arc<dyn Stream>,
        checkpoints: Arc<dyn CheckpointStore>,
        dead_letters: Arc<dyn DeadLetterQueue>,
        config: &ArchiveConfig,
        batch_size: usize,
    ) -> PipelineResult<Self> {
        let mut consumers = Vec::new();
        for partition in 0..stream.partitions() {
            consumers.push(
                PartitionConsumer::open(
                    ARCHIVE_GROUP,
                    stream.clone(),
                    checkpoints.clone(),
                    partition,
                    config.starting_position,
                )
                .await?,
            );
        }
        let cursors = consumers.iter().map(|c| c.position()).collect();

        Ok(Self {
            objects,
            stream,
            dead_letters,
            prefix: config.prefix.clone(),
            policy: config.retry_policy(),
            batch_size,
            consumers,
            cursors,
            buffer: ArchiveBuffer::new(config.interval(), config.size_bytes),
        })
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Read what is available from every partition into the buffer,
    /// flushing as thresholds are hit. Returns the number of records read.
    pub async fn poll(&mut self, now: Instant) -> PipelineResult<usize> {
        let mut read = 0;
        for partition in 0..self.consumers.len() {
            if self.buffer.is_full() {
                self.flush_logged().await;
                if self.buffer.is_full() {
                    break;
                }
            }

            let records = self
                .stream
                .read(partition as u32, self.cursors[partition], self.batch_size)
                .await?;
            for record in records {
                match serde_json::from_str::<TextEvent>(&record.payload) {
                    Ok(event) => self.buffer.push(record.partition, record.offset, &event, now)?,
                    Err(e) => {
                        let error = PipelineError::decode("text event", e);
                        tracing::warn!(
                            partition = record.partition,
                            offset = record.offset,
                            error = %error,
                            "dead-lettering undecodable archive event"
                        );
                        self.dead_letters
                            .push_dead_letter(&DeadLetter {
                                consumer: ARCHIVE_GROUP.to_string(),
                                stream: self.stream.name().to_string(),
                                partition: record.partition,
                                offset: record.offset,
                                image_id: None,
                                reason: error.to_string(),
                                payload: record.payload.clone(),
                                failed_at: Utc::now(),
                            })
                            .await?;
                        self.buffer.skip(record.partition, record.offset);
                    }
                }
                // Only past the record once it is buffered or dead-lettered
                self.cursors[partition] = record.offset + 1;
                read += 1;
                if self.buffer.is_full() {
                    self.flush_logged().await;
                }
            }
        }

        if self.buffer.should_flush(now) {
            self.flush_logged().await;
        }
        Ok(read)
    }

    async fn flush_logged(&mut self) {
        if let Err(e) = self.flush().await {
            tracing::error!(
                buffered = self.buffer.len(),
                error = %e,
                "archive flush failed; keeping buffer"
            );
        }
    }

    /// Write the buffer as one archive object and commit its offsets.
    ///
    /// Returns the key written, or `None` when nothing needed writing. On
    /// error the buffer is left untouched.
    pub async fn flush(&mut self) -> PipelineResult<Option<String>> {
        if !self.buffer.has_pending() {
            return Ok(None);
        }

        let mut written = None;
        if !self.buffer.is_empty() {
            let bytes = encode_archive(&self.buffer.jsonl)?;
            let key = archive_key(&self.prefix, self.stream.name(), Utc::now());
            let objects = &self.objects;
            let (k, b) = (key.as_str(), &bytes);
            retry(&self.policy, "write archive", move || async move {
                objects
                    .put(k, b.clone(), "application/zip")
                    .await
                    .map_err(PipelineError::from)
            })
            .await?;
            tracing::info!(
                key = %key,
                events = self.buffer.len(),
                raw_bytes = self.buffer.size_bytes(),
                compressed_bytes = bytes.len(),
                "archive flushed"
            );
            written = Some(key);
        }

        let batch = self.buffer.take();
        for (partition, next) in batch.next_offsets {
            if let Some(consumer) = self.consumers.get_mut(partition as usize) {
                // The object is durable; a failed commit only means re-archiving
                if let Err(e) = consumer.commit(next).await {
                    tracing::error!(partition, offset = next, error = %e, "archive checkpoint commit failed");
                }
            }
        }
        Ok(written)
    }

    /// Poll until shutdown, then flush whatever is still buffered.
    pub async fn run(mut self, poll_interval: Duration, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.poll(Instant::now()).await {
                Ok(read) if read > 0 => continue,
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "archive poll failed"),
            }
            if wait_or_shutdown(&mut shutdown, poll_interval).await {
                break;
            }
        }

        // Pick up events appended since the last poll
        if let Err(e) = self.poll(Instant::now()).await {
            tracing::warn!(error = %e, "final archive poll failed");
        }
        match self.flush().await {
            Ok(Some(key)) => tracing::info!(key = %key, "final archive flushed"),
            Ok(None) => {}
            Err(e) => tracing::error!(
                buffered = self.buffer.len(),
                error = %e,
                "final archive flush failed; events will be re-read on restart"
            ),
        }
        tracing::info!("archive sink stopped");
    }
}
