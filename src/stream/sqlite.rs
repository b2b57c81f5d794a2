//! SQLite-backed durable [`Stream`].
//!
//! Records live in `stream_records (stream, part, seq)`; the next
//! offset of each partition lives in `stream_heads`, so offsets stay
//! monotonic after retention trims every record of a partition. Appends
//! bump the head and insert the record in one transaction, which keeps
//! offsets gap-free even when several processes append to the same database.
//!
//! Consumers in this process are woken on append; appends from other
//! processes are picked up on the next poll.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::time::Duration;

use super::{partition_for, PartitionSignals, Stream, StreamRecord};
use crate::error::PipelineResult;

pub struct SqliteStream {
    pool: SqlitePool,
    name: String,
    partitions: u32,
    signals: PartitionSignals,
}

impl SqliteStream {
    /// Open a stream over an already-migrated database.
    pub async fn open(pool: SqlitePool, name: &str, partitions: u32) -> PipelineResult<Self> {
        let partitions = partitions.max(1);
        let mut heads = vec![0u64; partitions as usize];
        let rows = sqlx::query("SELECT part, next_offset FROM stream_heads WHERE stream = ?")
            .bind(name)
            .fetch_all(&pool)
            .await?;
        for row in rows {
            let partition: i64 = row.get("part");
            let next: i64 = row.get("next_offset");
            if let Some(slot) = heads.get_mut(partition as usize) {
                *slot = next as u64;
            }
        }

        Ok(Self {
            pool,
            name: name.to_string(),
            partitions,
            signals: PartitionSignals::new(&heads),
        })
    }
}

#[async_trait]
impl Stream for SqliteStream {
    fn name(&self) -> &str {
        &self.name
    }

    fn partitions(&self) -> u32 {
        self.partitions
    }

    async fn append(&self, key: &str, payload: &str) -> PipelineResult<(u32, u64)> {
        let partition = partition_for(key, self.partitions);
        let mut tx = self.pool.begin().await?;

        let next: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO stream_heads (stream, part, next_offset) VALUES (?, ?, 1)
            ON CONFLICT(stream, part) DO UPDATE SET next_offset = next_offset + 1
            RETURNING next_offset
            "#,
        )
        .bind(&self.name)
        .bind(partition as i64)
        .fetch_one(&mut *tx)
        .await?;
        let offset = next - 1;

        sqlx::query(
            r#"
            INSERT INTO stream_records (stream, part, seq, record_key, payload, appended_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&self.name)
        .bind(partition as i64)
        .bind(offset)
        .bind(key)
        .bind(payload)
        .bind(Utc::now().timestamp_millis())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        self.signals.advance(partition, next as u64);
        Ok((partition, offset as u64))
    }

    async fn read(&self, partition: u32, from: u64, max: usize) -> PipelineResult<Vec<StreamRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT seq, record_key, payload, appended_at
            FROM stream_records
            WHERE stream = ? AND part = ? AND seq >= ?
            ORDER BY seq
            LIMIT ?
            "#,
        )
        .bind(&self.name)
        .bind(partition as i64)
        .bind(from as i64)
        .bind(max as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let offset: i64 = row.get("seq");
                let appended_at: i64 = row.get("appended_at");
                StreamRecord {
                    partition,
                    offset: offset as u64,
                    key: row.get("record_key"),
                    payload: row.get("payload"),
                    appended_at: DateTime::from_timestamp_millis(appended_at)
                        .unwrap_or_else(Utc::now),
                }
            })
            .collect())
    }

    async fn end_offset(&self, partition: u32) -> PipelineResult<u64> {
        let next: Option<i64> = sqlx::query_scalar(
            "SELECT next_offset FROM stream_heads WHERE stream = ? AND part = ?",
        )
        .bind(&self.name)
        .bind(partition as i64)
        .fetch_optional(&self.pool)
        .await?;
        Ok(next.unwrap_or(0) as u64)
    }

    async fn start_offset(&self, partition: u32) -> PipelineResult<u64> {
        let oldest: Option<i64> = sqlx::query_scalar(
            "SELECT MIN(seq) FROM stream_records WHERE stream = ? AND part = ?",
        )
        .bind(&self.name)
        .bind(partition as i64)
        .fetch_one(&self.pool)
        .await?;
        match oldest {
            Some(offset) => Ok(offset as u64),
            None => self.end_offset(partition).await,
        }
    }

    async fn trim_before(&self, cutoff: DateTime<Utc>) -> PipelineResult<u64> {
        let result = sqlx::query("DELETE FROM stream_records WHERE stream = ? AND appended_at < ?")
            .bind(&self.name)
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn wait_for_data(&self, partition: u32, from: u64, timeout: Duration) {
        self.signals.wait(partition, from, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::migrate;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, SqlitePool) {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect_path(&tmp.path().join("bizcard.sqlite"))
            .await
            .unwrap();
        migrate::apply(&pool).await.unwrap();
        (tmp, pool)
    }

    #[tokio::test]
    async fn append_read_and_reopen() {
        let (_tmp, pool) = setup().await;
        let stream = SqliteStream::open(pool.clone(), "bizcard-text", 2)
            .await
            .unwrap();

        let (p, o0) = stream.append("img-1", "{\"n\":0}").await.unwrap();
        let (p2, o1) = stream.append("img-1", "{\"n\":1}").await.unwrap();
        assert_eq!(p, p2);
        assert_eq!((o0, o1), (0, 1));

        let records = stream.read(p, 0, 10).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].payload, "{\"n\":1}");
        assert_eq!(records[1].key, "img-1");

        let reopened = SqliteStream::open(pool, "bizcard-text", 2).await.unwrap();
        assert_eq!(reopened.end_offset(p).await.unwrap(), 2);
        let (_, o2) = reopened.append("img-1", "{\"n\":2}").await.unwrap();
        assert_eq!(o2, 2);
    }

    #[tokio::test]
    async fn streams_sharing_a_database_are_independent() {
        let (_tmp, pool) = setup().await;
        let images = SqliteStream::open(pool.clone(), "bizcard-image", 1)
            .await
            .unwrap();
        let text = SqliteStream::open(pool, "bizcard-text", 1).await.unwrap();

        images.append("a", "x").await.unwrap();
        images.append("a", "y").await.unwrap();
        let (_, offset) = text.append("a", "z").await.unwrap();
        assert_eq!(offset, 0);
        assert_eq!(images.read(0, 0, 10).await.unwrap().len(), 2);
        assert_eq!(text.read(0, 0, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn trim_removes_old_records_but_keeps_head() {
        let (_tmp, pool) = setup().await;
        let stream = SqliteStream::open(pool, "s", 1).await.unwrap();
        stream.append("k", "a").await.unwrap();
        stream.append("k", "b").await.unwrap();

        let removed = stream
            .trim_before(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(stream.start_offset(0).await.unwrap(), 2);
        assert!(stream.read(0, 0, 10).await.unwrap().is_empty());
    }
}
