//! Keyed store, search index, and dead-letter queue.
//!
//! The workers only see these traits, so the SQLite backend used in
//! production and the in-memory backend used in tests are interchangeable.
//! All writes are upserts by [`ImageId`]; concurrent writers converge to
//! last-write-wins.
//!
//! # Operations
//!
//! | Trait | Method | Purpose |
//! |-------|--------|---------|
//! | [`RecordStore`] | [`upsert_record`](RecordStore::upsert_record) | Write an extracted record |
//! | [`RecordStore`] | [`get_record`](RecordStore::get_record) | Read a record by image id |
//! | [`SearchIndex`] | [`upsert_document`](SearchIndex::upsert_document) | Index or re-index a document |
//! | [`SearchIndex`] | [`search`](SearchIndex::search) | Full-text search |
//! | [`DeadLetterQueue`] | [`push_dead_letter`](DeadLetterQueue::push_dead_letter) | Route a failed item aside |
//!
//! Both backends also implement [`CheckpointStore`](crate::stream::CheckpointStore).

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;

use crate::error::PipelineResult;
use crate::models::{DeadLetter, ExtractedRecord, ImageId, IndexDocument, SearchHit};

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn upsert_record(&self, record: &ExtractedRecord) -> PipelineResult<()>;

    async fn get_record(&self, image_id: &ImageId) -> PipelineResult<Option<ExtractedRecord>>;

    async fn count_records(&self) -> PipelineResult<u64>;
}

#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Insert or replace the document for `doc.image_id`.
    async fn upsert_document(&self, doc: &IndexDocument) -> PipelineResult<()>;

    async fn get_document(&self, image_id: &ImageId) -> PipelineResult<Option<IndexDocument>>;

    /// Full-text search over document text and field values. Every term in
    /// `query` must match; results are ordered by score, then image id.
    async fn search(&self, query: &str, limit: usize) -> PipelineResult<Vec<SearchHit>>;

    async fn count_documents(&self) -> PipelineResult<u64>;
}

#[async_trait]
pub trait DeadLetterQueue: Send + Sync {
    async fn push_dead_letter(&self, letter: &DeadLetter) -> PipelineResult<()>;

    /// Most recent first.
    async fn list_dead_letters(&self, limit: usize) -> PipelineResult<Vec<DeadLetter>>;

    async fn count_dead_letters(&self) -> PipelineResult<u64>;
}

/// Text indexed for a document: the OCR text followed by every field value.
pub fn document_body(doc: &IndexDocument) -> String {
    let mut body = doc.text.clone();
    for (name, value) in &doc.fields {
        if name == "text" {
            continue;
        }
        body.push('\n');
        body.push_str(&value.to_text());
    }
    body
}

/// Split a free-text query into lowercase alphanumeric terms.
pub fn query_terms(query: &str) -> Vec<String> {
    query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FieldMap;
    use chrono::Utc;

    #[test]
    fn query_terms_split_on_punctuation() {
        assert_eq!(
            query_terms("  Jane.Doe@Acme.com  CTO "),
            vec!["jane", "doe", "acme", "com", "cto"]
        );
        assert!(query_terms(" -- ").is_empty());
    }

    #[test]
    fn body_includes_field_values_once() {
        let mut fields = FieldMap::new();
        fields.insert("text".into(), "Jane Doe".into());
        fields.insert("company".into(), "Acme".into());
        let doc = IndexDocument {
            image_id: ImageId::from("img-1"),
            fields,
            text: "Jane Doe".into(),
            source_updated_at: Utc::now(),
        };
        assert_eq!(document_body(&doc), "Jane Doe\nAcme");
    }
}
