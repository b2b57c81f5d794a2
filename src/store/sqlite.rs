//! SQLite-backed keyed store, search index, dead-letter queue, and
//! checkpoint store.
//!
//! Tables (see [`crate::migrate`]): `records`, `documents` with the FTS5
//! table `documents_fts` over each document's text and field values,
//! `dead_letters`, and `checkpoints`. Timestamps carried by the models are
//! stored as RFC 3339 strings with nanosecond precision so they read back
//! unchanged.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{Row, SqlitePool};

use super::{document_body, query_terms, DeadLetterQueue, RecordStore, SearchIndex};
use crate::error::{PipelineError, PipelineResult};
use crate::models::{
    DeadLetter, ExtractedRecord, FieldMap, ImageId, IndexDocument, ObjectLocation, SearchHit,
};
use crate::stream::{Checkpoint, CheckpointStore};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(s: &str) -> PipelineResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| PipelineError::permanent("parse timestamp", e))
}

fn encode_fields(fields: &FieldMap) -> PipelineResult<String> {
    serde_json::to_string(fields).map_err(|e| PipelineError::permanent("encode field map", e))
}

fn decode_fields(json: &str) -> PipelineResult<FieldMap> {
    serde_json::from_str(json).map_err(|e| PipelineError::decode("field map", e))
}

/// FTS5 match expression: every term quoted, implicitly AND-ed.
fn fts_match_expr(query: &str) -> Option<String> {
    let terms = query_terms(query);
    if terms.is_empty() {
        return None;
    }
    Some(
        terms
            .iter()
            .map(|t| format!("\"{}\"", t))
            .collect::<Vec<_>>()
            .join(" "),
    )
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn upsert_record(&self, record: &ExtractedRecord) -> PipelineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO records (image_id, bucket, object_key, fields_json, metadata_json,
                                 extracted_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(image_id) DO UPDATE SET
                bucket = excluded.bucket,
                object_key = excluded.object_key,
                fields_json = excluded.fields_json,
                metadata_json = excluded.metadata_json,
                extracted_at = excluded.extracted_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(record.image_id.as_str())
        .bind(&record.location.bucket)
        .bind(&record.location.key)
        .bind(encode_fields(&record.fields)?)
        .bind(encode_fields(&record.metadata)?)
        .bind(format_ts(&record.extracted_at))
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_record(&self, image_id: &ImageId) -> PipelineResult<Option<ExtractedRecord>> {
        let row = sqlx::query(
            r#"
            SELECT image_id, bucket, object_key, fields_json, metadata_json, extracted_at
            FROM records WHERE image_id = ?
            "#,
        )
        .bind(image_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let fields_json: String = row.get("fields_json");
        let metadata_json: String = row.get("metadata_json");
        let extracted_at: String = row.get("extracted_at");
        Ok(Some(ExtractedRecord {
            image_id: ImageId(row.get("image_id")),
            location: ObjectLocation::new(
                row.get::<String, _>("bucket"),
                row.get::<String, _>("object_key"),
            ),
            fields: decode_fields(&fields_json)?,
            metadata: decode_fields(&metadata_json)?,
            extracted_at: parse_ts(&extracted_at)?,
        }))
    }

    async fn count_records(&self) -> PipelineResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM records")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

#[async_trait]
impl SearchIndex for SqliteStore {
    async fn upsert_document(&self, doc: &IndexDocument) -> PipelineResult<()> {
        let body = document_body(doc);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO documents (image_id, fields_json, ocr_text, source_updated_at, indexed_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(image_id) DO UPDATE SET
                fields_json = excluded.fields_json,
                ocr_text = excluded.ocr_text,
                source_updated_at = excluded.source_updated_at,
                indexed_at = excluded.indexed_at
            "#,
        )
        .bind(doc.image_id.as_str())
        .bind(encode_fields(&doc.fields)?)
        .bind(&doc.text)
        .bind(format_ts(&doc.source_updated_at))
        .bind(Utc::now().timestamp())
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM documents_fts WHERE image_id = ?")
            .bind(doc.image_id.as_str())
            .execute(&mut *tx)
            .await?;

        sqlx::query("INSERT INTO documents_fts (image_id, body) VALUES (?, ?)")
            .bind(doc.image_id.as_str())
            .bind(&body)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_document(&self, image_id: &ImageId) -> PipelineResult<Option<IndexDocument>> {
        let row = sqlx::query(
            "SELECT image_id, fields_json, ocr_text, source_updated_at FROM documents WHERE image_id = ?",
        )
        .bind(image_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let fields_json: String = row.get("fields_json");
        let source_updated_at: String = row.get("source_updated_at");
        Ok(Some(IndexDocument {
            image_id: ImageId(row.get("image_id")),
            fields: decode_fields(&fields_json)?,
            text: row.get("ocr_text"),
            source_updated_at: parse_ts(&source_updated_at)?,
        }))
    }

    async fn search(&self, query: &str, limit: usize) -> PipelineResult<Vec<SearchHit>> {
        let Some(expr) = fts_match_expr(query) else {
            return Ok(Vec::new());
        };

        let rows = sqlx::query(
            r#"
            SELECT documents_fts.image_id AS image_id, rank,
                   snippet(documents_fts, 1, '>>>', '<<<', '...', 24) AS snippet,
                   documents.fields_json AS fields_json
            FROM documents_fts
            JOIN documents ON documents.image_id = documents_fts.image_id
            WHERE documents_fts MATCH ?
            ORDER BY rank, documents_fts.image_id
            LIMIT ?
            "#,
        )
        .bind(&expr)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in &rows {
            let rank: f64 = row.get("rank");
            let fields_json: String = row.get("fields_json");
            hits.push(SearchHit {
                image_id: ImageId(row.get("image_id")),
                score: -rank, // negate so higher = better
                snippet: row.get("snippet"),
                fields: decode_fields(&fields_json)?,
            });
        }
        Ok(hits)
    }

    async fn count_documents(&self) -> PipelineResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

#[async_trait]
impl DeadLetterQueue for SqliteStore {
    async fn push_dead_letter(&self, letter: &DeadLetter) -> PipelineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO dead_letters (consumer_group, stream, part, seq, image_id, reason,
                                      payload, failed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&letter.consumer)
        .bind(&letter.stream)
        .bind(letter.partition as i64)
        .bind(letter.offset as i64)
        .bind(letter.image_id.as_ref().map(|id| id.as_str().to_string()))
        .bind(&letter.reason)
        .bind(&letter.payload)
        .bind(format_ts(&letter.failed_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_dead_letters(&self, limit: usize) -> PipelineResult<Vec<DeadLetter>> {
        let rows = sqlx::query(
            r#"
            SELECT consumer_group, stream, part, seq, image_id, reason, payload, failed_at
            FROM dead_letters
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut letters = Vec::with_capacity(rows.len());
        for row in &rows {
            let part: i64 = row.get("part");
            let seq: i64 = row.get("seq");
            let image_id: Option<String> = row.get("image_id");
            let failed_at: String = row.get("failed_at");
            letters.push(DeadLetter {
                consumer: row.get("consumer_group"),
                stream: row.get("stream"),
                partition: part as u32,
                offset: seq as u64,
                image_id: image_id.map(ImageId),
                reason: row.get("reason"),
                payload: row.get("payload"),
                failed_at: parse_ts(&failed_at)?,
            });
        }
        Ok(letters)
    }

    async fn count_dead_letters(&self) -> PipelineResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

#[async_trait]
impl CheckpointStore for SqliteStore {
    async fn get_checkpoint(
        &self,
        group: &str,
        stream: &str,
        partition: u32,
    ) -> PipelineResult<Option<u64>> {
        let offset: Option<i64> = sqlx::query_scalar(
            "SELECT next_offset FROM checkpoints WHERE consumer_group = ? AND stream = ? AND part = ?",
        )
        .bind(group)
        .bind(stream)
        .bind(partition as i64)
        .fetch_optional(&self.pool)
        .await?;
        Ok(offset.map(|o| o as u64))
    }

    async fn commit_checkpoint(
        &self,
        group: &str,
        stream: &str,
        partition: u32,
        next_offset: u64,
    ) -> PipelineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO checkpoints (consumer_group, stream, part, next_offset, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(consumer_group, stream, part) DO UPDATE SET
                next_offset = excluded.next_offset,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(group)
        .bind(stream)
        .bind(partition as i64)
        .bind(next_offset as i64)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_checkpoints(&self) -> PipelineResult<Vec<Checkpoint>> {
        let rows = sqlx::query(
            r#"
            SELECT consumer_group, stream, part, next_offset, updated_at
            FROM checkpoints
            ORDER BY consumer_group, stream, part
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let part: i64 = row.get("part");
                let next: i64 = row.get("next_offset");
                let updated_at: i64 = row.get("updated_at");
                Checkpoint {
                    group: row.get("consumer_group"),
                    stream: row.get("stream"),
                    partition: part as u32,
                    next_offset: next as u64,
                    updated_at: DateTime::from_timestamp(updated_at, 0).unwrap_or_else(Utc::now),
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, migrate};
    use tempfile::TempDir;

    async fn setup() -> (TempDir, SqliteStore) {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect_path(&tmp.path().join("bizcard.sqlite"))
            .await
            .unwrap();
        migrate::apply(&pool).await.unwrap();
        (tmp, SqliteStore::new(pool))
    }

    fn card(id: &str, name: &str, company: &str) -> IndexDocument {
        let mut fields = FieldMap::new();
        fields.insert("name".into(), name.into());
        fields.insert("company".into(), company.into());
        fields.insert("confidence".into(), 0.93.into());
        IndexDocument {
            image_id: ImageId::from(id),
            fields,
            text: format!("{}\n{}", name, company),
            source_updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn record_upsert_is_last_write_wins() {
        let (_tmp, store) = setup().await;
        let mut fields = FieldMap::new();
        fields.insert("name".into(), "Jane".into());
        let mut record = ExtractedRecord {
            image_id: ImageId::from("img-1"),
            location: ObjectLocation::new("cards", "bizcard-raw-img/jane.jpg"),
            fields,
            metadata: FieldMap::new(),
            extracted_at: Utc::now(),
        };
        store.upsert_record(&record).await.unwrap();

        record.fields.insert("name".into(), "Jane Doe".into());
        record.metadata.insert("confidence".into(), 0.87.into());
        store.upsert_record(&record).await.unwrap();

        assert_eq!(store.count_records().await.unwrap(), 1);
        let back = store.get_record(&record.image_id).await.unwrap().unwrap();
        assert_eq!(back, record);
        assert!(store
            .get_record(&ImageId::from("missing"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn redelivered_document_converges_to_one_row() {
        let (_tmp, store) = setup().await;
        let doc = card("img-1", "Jane Doe", "Acme Corp");
        for _ in 0..3 {
            store.upsert_document(&doc).await.unwrap();
        }
        assert_eq!(store.count_documents().await.unwrap(), 1);
        let fts_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents_fts")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(fts_rows, 1);
        assert_eq!(
            store.get_document(&doc.image_id).await.unwrap().unwrap(),
            doc
        );
    }

    #[tokio::test]
    async fn search_matches_text_and_fields() {
        let (_tmp, store) = setup().await;
        store
            .upsert_document(&card("img-1", "Jane Doe", "Acme Corp"))
            .await
            .unwrap();
        store
            .upsert_document(&card("img-2", "John Roe", "Globex"))
            .await
            .unwrap();

        let hits = store.search("acme", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].image_id.as_str(), "img-1");
        assert!(hits[0].snippet.contains(">>>Acme<<<"));
        assert_eq!(hits[0].fields.get("company").unwrap().to_text(), "Acme Corp");

        // punctuation in the query is not FTS syntax
        assert!(store.search("jane@acme", 10).await.unwrap().len() == 1);
        assert!(store.search("\"", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reindex_replaces_searchable_text() {
        let (_tmp, store) = setup().await;
        store
            .upsert_document(&card("img-1", "Jane Doe", "Acme"))
            .await
            .unwrap();
        store
            .upsert_document(&card("img-1", "Jane Doe", "Initech"))
            .await
            .unwrap();
        assert!(store.search("acme", 10).await.unwrap().is_empty());
        assert_eq!(store.search("initech", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dead_letters_and_checkpoints_persist() {
        let (_tmp, store) = setup().await;
        let letter = DeadLetter {
            consumer: "extraction".into(),
            stream: "bizcard-image".into(),
            partition: 2,
            offset: 17,
            image_id: Some(ImageId::from("img-9")),
            reason: "unsupported content type".into(),
            payload: "{}".into(),
            failed_at: Utc::now(),
        };
        store.push_dead_letter(&letter).await.unwrap();
        assert_eq!(store.count_dead_letters().await.unwrap(), 1);
        assert_eq!(store.list_dead_letters(10).await.unwrap(), vec![letter]);

        assert_eq!(
            store.get_checkpoint("indexing", "bizcard-text", 0).await.unwrap(),
            None
        );
        store
            .commit_checkpoint("indexing", "bizcard-text", 0, 5)
            .await
            .unwrap();
        store
            .commit_checkpoint("indexing", "bizcard-text", 0, 9)
            .await
            .unwrap();
        assert_eq!(
            store.get_checkpoint("indexing", "bizcard-text", 0).await.unwrap(),
            Some(9)
        );
        let all = store.list_checkpoints().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].next_offset, 9);
    }
}
