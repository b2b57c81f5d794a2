//! Ordered, partitioned, replayable streams.
//!
//! A [`Stream`] is an append-only log split into a fixed number of
//! partitions. Records with the same key always land in the same partition
//! ([`partition_for`]), and ordering holds within a partition only.
//!
//! Consumers track their progress through a [`CheckpointStore`] held
//! outside the worker: the checkpoint of a consumer group is the next offset
//! it will read. [`PartitionConsumer`] pairs one partition with one group and
//! drives a [`BatchProcessor`] over it.
//!
//! | Backend | Module | Use |
//! |---------|--------|-----|
//! | SQLite | [`sqlite`] | durable streams (`stream_records` table) |
//! | In-memory | [`memory`] | tests |

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::error::PipelineResult;

/// Where a consumer group with no checkpoint starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartingPosition {
    /// The partition's end offset at the time the consumer starts.
    #[default]
    Latest,
    /// The oldest retained record.
    TrimHorizon,
}

/// A record read back from a stream partition.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRecord {
    pub partition: u32,
    pub offset: u64,
    pub key: String,
    pub payload: String,
    pub appended_at: DateTime<Utc>,
}

#[async_trait]
pub trait Stream: Send + Sync {
    fn name(&self) -> &str;

    fn partitions(&self) -> u32;

    /// Append a record, returning `(partition, offset)`.
    async fn append(&self, key: &str, payload: &str) -> PipelineResult<(u32, u64)>;

    /// Read up to `max` records with offset `>= from`, in offset order.
    async fn read(&self, partition: u32, from: u64, max: usize) -> PipelineResult<Vec<StreamRecord>>;

    /// The offset the next appended record will receive.
    async fn end_offset(&self, partition: u32) -> PipelineResult<u64>;

    /// The oldest retained offset (equal to `end_offset` when empty).
    async fn start_offset(&self, partition: u32) -> PipelineResult<u64>;

    /// Drop records appended before `cutoff`. Returns the number removed.
    async fn trim_before(&self, cutoff: DateTime<Utc>) -> PipelineResult<u64>;

    /// Wait until the partition has data at or beyond `from`, or `timeout` elapses.
    async fn wait_for_data(&self, partition: u32, from: u64, timeout: Duration);
}

/// Stable partition for a key: SHA-256 of the key, first 8 bytes, modulo `partitions`.
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % u64::from(partitions.max(1))) as u32
}

/// Per-partition end-offset signals, so waiting consumers wake on append.
pub(crate) struct PartitionSignals {
    senders: Vec<watch::Sender<u64>>,
}

impl PartitionSignals {
    pub(crate) fn new(end_offsets: &[u64]) -> Self {
        Self {
            senders: end_offsets.iter().map(|&o| watch::channel(o).0).collect(),
        }
    }

    pub(crate) fn advance(&self, partition: u32, end_offset: u64) {
        if let Some(tx) = self.senders.get(partition as usize) {
            tx.send_modify(|current| *current = (*current).max(end_offset));
        }
    }

    pub(crate) async fn wait(&self, partition: u32, from: u64, timeout: Duration) {
        let Some(tx) = self.senders.get(partition as usize) else {
            tokio::time::sleep(timeout).await;
            return;
        };
        let mut rx = tx.subscribe();
        let _ = tokio::time::timeout(timeout, rx.wait_for(|end| *end > from)).await;
    }
}

/// A committed position of a consumer group in one partition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Checkpoint {
    pub group: String,
    pub stream: String,
    pub partition: u32,
    pub next_offset: u64,
    pub updated_at: DateTime<Utc>,
}

/// Externally-owned consumer offsets.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get_checkpoint(
        &self,
        group: &str,
        stream: &str,
        partition: u32,
    ) -> PipelineResult<Option<u64>>;

    async fn commit_checkpoint(
        &self,
        group: &str,
        stream: &str,
        partition: u32,
        next_offset: u64,
    ) -> PipelineResult<()>;

    async fn list_checkpoints(&self) -> PipelineResult<Vec<Checkpoint>>;
}

/// What a batch run achieved.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    /// Offset to commit; `None` leaves the checkpoint where it was.
    pub next_offset: Option<u64>,
    pub processed: usize,
    pub dead_lettered: usize,
}

/// Processes one batch of records read from a single partition.
#[async_trait]
pub trait BatchProcessor: Send + Sync {
    /// Consumer group name, used for checkpoints and dead letters.
    fn group(&self) -> &str;

    async fn process_batch(
        &self,
        partition: u32,
        records: Vec<StreamRecord>,
    ) -> PipelineResult<BatchOutcome>;
}

/// One consumer group reading one partition.
pub struct PartitionConsumer {
    group: String,
    stream: Arc<dyn Stream>,
    checkpoints: Arc<dyn CheckpointStore>,
    partition: u32,
    position: u64,
}

impl PartitionConsumer {
    /// Open a consumer at its checkpoint, or at `start` when it has none.
    ///
    /// The resolved start position is committed right away, so a restart
    /// before the first batch does not skip records appended in between.
    pub async fn open(
        group: &str,
        stream: Arc<dyn Stream>,
        checkpoints: Arc<dyn CheckpointStore>,
        partition: u32,
        start: StartingPosition,
    ) -> PipelineResult<Self> {
        let position = match checkpoints
            .get_checkpoint(group, stream.name(), partition)
            .await?
        {
            Some(offset) => offset,
            None => {
                let offset = match start {
                    StartingPosition::Latest => stream.end_offset(partition).await?,
                    StartingPosition::TrimHorizon => stream.start_offset(partition).await?,
                };
                checkpoints
                    .commit_checkpoint(group, stream.name(), partition, offset)
                    .await?;
                offset
            }
        };

        tracing::debug!(group, stream = stream.name(), partition, position, "consumer opened");
        Ok(Self {
            group: group.to_string(),
            stream,
            checkpoints,
            partition,
            position,
        })
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn stream(&self) -> &Arc<dyn Stream> {
        &self.stream
    }

    pub async fn next_batch(&self, max: usize) -> PipelineResult<Vec<StreamRecord>> {
        self.stream.read(self.partition, self.position, max).await
    }

    pub async fn commit(&mut self, next_offset: u64) -> PipelineResult<()> {
        if next_offset <= self.position {
            return Ok(());
        }
        self.checkpoints
            .commit_checkpoint(&self.group, self.stream.name(), self.partition, next_offset)
            .await?;
        self.position = next_offset;
        Ok(())
    }

    pub async fn wait_for_data(&self, timeout: Duration) {
        self.stream
            .wait_for_data(self.partition, self.position, timeout)
            .await
    }
}

/// Drive `processor` over one partition until `shutdown` flips to `true`.
///
/// Batches are read from the consumer's position; after each batch the
/// checkpoint is committed to the offset the processor reports. Errors from
/// the processor leave the checkpoint untouched, so the batch is redelivered
/// on the next poll.
pub async fn run_partition(
    mut consumer: PartitionConsumer,
    processor: Arc<dyn BatchProcessor>,
    batch_size: usize,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let group = processor.group();
    let partition = consumer.partition();

    loop {
        if *shutdown.borrow() {
            break;
        }

        let batch = match consumer.next_batch(batch_size).await {
            Ok(batch) => batch,
            Err(e) => {
                tracing::error!(group, partition, error = %e, "failed to read batch");
                if wait_or_shutdown(&mut shutdown, poll_interval).await {
                    break;
                }
                continue;
            }
        };

        if batch.is_empty() {
            tokio::select! {
                _ = consumer.wait_for_data(poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            continue;
        }

        let first = batch[0].offset;
        let size = batch.len();
        match processor.process_batch(partition, batch).await {
            Ok(outcome) => {
                tracing::debug!(
                    group,
                    partition,
                    first_offset = first,
                    size,
                    processed = outcome.processed,
                    dead_lettered = outcome.dead_lettered,
                    "batch done"
                );
                match outcome.next_offset {
                    Some(next) => {
                        if let Err(e) = consumer.commit(next).await {
                            tracing::error!(group, partition, offset = next, error = %e, "checkpoint commit failed");
                        }
                    }
                    None => {
                        if wait_or_shutdown(&mut shutdown, poll_interval).await {
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::error!(group, partition, offset = first, error = %e, "batch failed; will redeliver");
                if wait_or_shutdown(&mut shutdown, poll_interval).await {
                    break;
                }
            }
        }
    }

    tracing::info!(group, partition, position = consumer.position(), "consumer stopped");
}

/// Sleep for `delay` unless shutdown is signalled first. Returns `true` when
/// the shutdown sender is gone.
pub(crate) async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        changed = shutdown.changed() => changed.is_err(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;
    use std::sync::Mutex;

    #[test]
    fn partition_is_stable_and_in_range() {
        for key in ["a", "img-1", "6f63-7465", ""] {
            let p = partition_for(key, 4);
            assert!(p < 4);
            assert_eq!(p, partition_for(key, 4));
        }
        assert_eq!(partition_for("anything", 1), 0);
    }

    #[test]
    fn starting_position_parses_snake_case() {
        #[derive(Deserialize)]
        struct Wrap {
            start: StartingPosition,
        }
        let w: Wrap = toml::from_str("start = \"trim_horizon\"").unwrap();
        assert_eq!(w.start, StartingPosition::TrimHorizon);
        assert_eq!(StartingPosition::default(), StartingPosition::Latest);
    }

    #[tokio::test]
    async fn latest_start_skips_existing_and_persists_position() {
        let stream: Arc<dyn Stream> = Arc::new(memory::MemoryStream::new("s", 1));
        let checkpoints: Arc<dyn CheckpointStore> = Arc::new(InMemoryStore::new());
        stream.append("k", "old-1").await.unwrap();
        stream.append("k", "old-2").await.unwrap();

        let consumer = PartitionConsumer::open(
            "g",
            stream.clone(),
            checkpoints.clone(),
            0,
            StartingPosition::Latest,
        )
        .await
        .unwrap();
        assert_eq!(consumer.position(), 2);
        assert_eq!(checkpoints.get_checkpoint("g", "s", 0).await.unwrap(), Some(2));

        stream.append("k", "new").await.unwrap();
        let batch = consumer.next_batch(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload, "new");
    }

    #[tokio::test]
    async fn trim_horizon_start_reads_retained_history() {
        let stream: Arc<dyn Stream> = Arc::new(memory::MemoryStream::new("s", 1));
        let checkpoints: Arc<dyn CheckpointStore> = Arc::new(InMemoryStore::new());
        stream.append("k", "old").await.unwrap();

        let consumer = PartitionConsumer::open(
            "g",
            stream,
            checkpoints,
            0,
            StartingPosition::TrimHorizon,
        )
        .await
        .unwrap();
        assert_eq!(consumer.position(), 0);
        assert_eq!(consumer.next_batch(10).await.unwrap().len(), 1);
    }

    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl BatchProcessor for Recorder {
        fn group(&self) -> &str {
            "recorder"
        }

        async fn process_batch(
            &self,
            _partition: u32,
            records: Vec<StreamRecord>,
        ) -> PipelineResult<BatchOutcome> {
            let next = records.last().map(|r| r.offset + 1);
            let mut seen = self.seen.lock().unwrap();
            seen.extend(records.into_iter().map(|r| r.payload));
            Ok(BatchOutcome {
                next_offset: next,
                processed: seen.len(),
                dead_lettered: 0,
            })
        }
    }

    #[tokio::test]
    async fn run_partition_processes_in_order_and_commits() {
        let stream: Arc<dyn Stream> = Arc::new(memory::MemoryStream::new("s", 1));
        let checkpoints: Arc<dyn CheckpointStore> = Arc::new(InMemoryStore::new());
        let consumer = PartitionConsumer::open(
            "recorder",
            stream.clone(),
            checkpoints.clone(),
            0,
            StartingPosition::Latest,
        )
        .await
        .unwrap();

        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_partition(
            consumer,
            recorder.clone(),
            2,
            Duration::from_millis(10),
            shutdown_rx,
        ));

        for i in 0..5 {
            stream.append("k", &format!("m{}", i)).await.unwrap();
        }

        for _ in 0..200 {
            if recorder.seen.lock().unwrap().len() == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(
            *recorder.seen.lock().unwrap(),
            vec!["m0", "m1", "m2", "m3", "m4"]
        );
        assert_eq!(
            checkpoints.get_checkpoint("recorder", "s", 0).await.unwrap(),
            Some(5)
        );
    }
}
