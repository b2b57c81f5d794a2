//! Pipeline status and dead-letter inspection.
//!
//! `bizcard status` reports, per consumer group, every partition's end
//! offset, committed checkpoint and lag, plus record/document/dead-letter
//! counts. `bizcard dead-letters` lists the most recent dead letters.

use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;

use crate::archive::ARCHIVE_GROUP;
use crate::config::Config;
use crate::db;
use crate::error::PipelineResult;
use crate::extract_worker::EXTRACTION_GROUP;
use crate::index_worker::INDEXING_GROUP;
use crate::store::sqlite::SqliteStore;
use crate::store::{DeadLetterQueue, RecordStore, SearchIndex};
use crate::stream::sqlite::SqliteStream;
use crate::stream::{CheckpointStore, Stream};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartitionStatus {
    pub partition: u32,
    pub start_offset: u64,
    pub end_offset: u64,
    /// `None` until the group has opened this partition.
    pub checkpoint: Option<u64>,
    pub lag: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupStatus {
    pub group: String,
    pub stream: String,
    pub partitions: Vec<PartitionStatus>,
}

impl GroupStatus {
    pub fn total_lag(&self) -> u64 {
        self.partitions.iter().map(|p| p.lag).sum()
    }
}

/// Checkpoint, end offset and lag for every partition `group` reads.
pub async fn group_status(
    group: &str,
    stream: &dyn Stream,
    checkpoints: &dyn CheckpointStore,
) -> PipelineResult<GroupStatus> {
    let mut partitions = Vec::new();
    for partition in 0..stream.partitions() {
        let start_offset = stream.start_offset(partition).await?;
        let end_offset = stream.end_offset(partition).await?;
        let checkpoint = checkpoints
            .get_checkpoint(group, stream.name(), partition)
            .await?;
        // Records trimmed before being read are gone; lag counts what remains
        let lag = end_offset.saturating_sub(checkpoint.unwrap_or(end_offset).max(start_offset));
        partitions.push(PartitionStatus {
            partition,
            start_offset,
            end_offset,
            checkpoint,
            lag,
        });
    }
    Ok(GroupStatus {
        group: group.to_string(),
        stream: stream.name().to_string(),
        partitions,
    })
}

pub async fn run_status(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = Arc::new(SqliteStore::new(pool.clone()));
    let partitions = config.streams.partitions;
    let image = SqliteStream::open(pool.clone(), &config.streams.image_stream, partitions).await?;
    let text = SqliteStream::open(pool.clone(), &config.streams.text_stream, partitions).await?;

    println!("Bizcard Pipeline Status");
    println!("=======================");
    println!();
    println!("  Database:      {}", config.db.path.display());
    println!("  Records:       {}", store.count_records().await?);
    println!("  Documents:     {}", store.count_documents().await?);
    println!("  Dead letters:  {}", store.count_dead_letters().await?);
    println!();

    let groups = [
        (EXTRACTION_GROUP, &image),
        (INDEXING_GROUP, &text),
        (ARCHIVE_GROUP, &text),
    ];
    for (group, stream) in groups {
        let status = group_status(group, stream, store.as_ref()).await?;
        println!(
            "  {} ← {} (lag {})",
            status.group,
            status.stream,
            status.total_lag()
        );
        for p in &status.partitions {
            let checkpoint = p
                .checkpoint
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "    partition {}: offsets {}..{}  checkpoint {}  lag {}",
                p.partition, p.start_offset, p.end_offset, checkpoint, p.lag
            );
        }
        println!();
    }

    pool.close().await;
    Ok(())
}

pub async fn run_dead_letters(config: &Config, limit: usize) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());
    let letters = store.list_dead_letters(limit).await?;

    if letters.is_empty() {
        println!("No dead letters.");
    }
    for letter in &letters {
        println!(
            "{}  {}  {}[{}]@{}",
            letter.failed_at.format("%Y-%m-%d %H:%M:%S"),
            letter.consumer,
            letter.stream,
            letter.partition,
            letter.offset
        );
        if let Some(ref id) = letter.image_id {
            println!("    image_id: {}", id);
        }
        println!("    reason: {}", letter.reason);
    }

    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;
    use crate::stream::memory::MemoryStream;

    #[tokio::test]
    async fn lag_is_end_minus_checkpoint() {
        let stream = MemoryStream::new("bizcard-image", 2);
        let store = InMemoryStore::new();
        for i in 0..6 {
            stream.append(&format!("img-{}", i), "{}").await.unwrap();
        }
        let p0_end = stream.end_offset(0).await.unwrap();
        store
            .commit_checkpoint(EXTRACTION_GROUP, "bizcard-image", 0, 0)
            .await
            .unwrap();

        let status = group_status(EXTRACTION_GROUP, &stream, &store).await.unwrap();
        assert_eq!(status.partitions[0].checkpoint, Some(0));
        assert_eq!(status.partitions[0].lag, p0_end);
        assert_eq!(status.partitions[1].checkpoint, None);
        assert_eq!(status.partitions[1].lag, 0);
    }
}
