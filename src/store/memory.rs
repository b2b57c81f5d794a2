//! In-memory store for tests.
//!
//! Uses `HashMap`/`BTreeMap` behind `std::sync::RwLock`. Search is a linear
//! scan that scores documents by term frequency.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use super::{document_body, query_terms, DeadLetterQueue, RecordStore, SearchIndex};
use crate::error::PipelineResult;
use crate::models::{DeadLetter, ExtractedRecord, ImageId, IndexDocument, SearchHit};
use crate::stream::{Checkpoint, CheckpointStore};

type CheckpointKey = (String, String, u32);

pub struct InMemoryStore {
    records: RwLock<HashMap<ImageId, ExtractedRecord>>,
    documents: RwLock<HashMap<ImageId, IndexDocument>>,
    dead_letters: RwLock<Vec<DeadLetter>>,
    checkpoints: RwLock<BTreeMap<CheckpointKey, Checkpoint>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            documents: RwLock::new(HashMap::new()),
            dead_letters: RwLock::new(Vec::new()),
            checkpoints: RwLock::new(BTreeMap::new()),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn snippet(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    flat.chars().take(160).collect()
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn upsert_record(&self, record: &ExtractedRecord) -> PipelineResult<()> {
        self.records
            .write()
            .unwrap()
            .insert(record.image_id.clone(), record.clone());
        Ok(())
    }

    async fn get_record(&self, image_id: &ImageId) -> PipelineResult<Option<ExtractedRecord>> {
        Ok(self.records.read().unwrap().get(image_id).cloned())
    }

    async fn count_records(&self) -> PipelineResult<u64> {
        Ok(self.records.read().unwrap().len() as u64)
    }
}

#[async_trait]
impl SearchIndex for InMemoryStore {
    async fn upsert_document(&self, doc: &IndexDocument) -> PipelineResult<()> {
        self.documents
            .write()
            .unwrap()
            .insert(doc.image_id.clone(), doc.clone());
        Ok(())
    }

    async fn get_document(&self, image_id: &ImageId) -> PipelineResult<Option<IndexDocument>> {
        Ok(self.documents.read().unwrap().get(image_id).cloned())
    }

    async fn search(&self, query: &str, limit: usize) -> PipelineResult<Vec<SearchHit>> {
        let terms = query_terms(query);
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let docs = self.documents.read().unwrap();
        let mut hits: Vec<SearchHit> = docs
            .values()
            .filter_map(|doc| {
                let tokens = query_terms(&document_body(doc));
                let mut score = 0.0;
                for term in &terms {
                    let count = tokens.iter().filter(|t| *t == term).count();
                    if count == 0 {
                        return None;
                    }
                    score += count as f64;
                }
                Some(SearchHit {
                    image_id: doc.image_id.clone(),
                    score,
                    snippet: snippet(&doc.text),
                    fields: doc.fields.clone(),
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.image_id.cmp(&b.image_id))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn count_documents(&self) -> PipelineResult<u64> {
        Ok(self.documents.read().unwrap().len() as u64)
    }
}

#[async_trait]
impl DeadLetterQueue for InMemoryStore {
    async fn push_dead_letter(&self, letter: &DeadLetter) -> PipelineResult<()> {
        self.dead_letters.write().unwrap().push(letter.clone());
        Ok(())
    }

    async fn list_dead_letters(&self, limit: usize) -> PipelineResult<Vec<DeadLetter>> {
        Ok(self
            .dead_letters
            .read()
            .unwrap()
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count_dead_letters(&self) -> PipelineResult<u64> {
        Ok(self.dead_letters.read().unwrap().len() as u64)
    }
}

#[async_trait]
impl CheckpointStore for InMemoryStore {
    async fn get_checkpoint(
        &self,
        group: &str,
        stream: &str,
        partition: u32,
    ) -> PipelineResult<Option<u64>> {
        let key = (group.to_string(), stream.to_string(), partition);
        Ok(self
            .checkpoints
            .read()
            .unwrap()
            .get(&key)
            .map(|c| c.next_offset))
    }

    async fn commit_checkpoint(
        &self,
        group: &str,
        stream: &str,
        partition: u32,
        next_offset: u64,
    ) -> PipelineResult<()> {
        let key = (group.to_string(), stream.to_string(), partition);
        self.checkpoints.write().unwrap().insert(
            key,
            Checkpoint {
                group: group.to_string(),
                stream: stream.to_string(),
                partition,
                next_offset,
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn list_checkpoints(&self) -> PipelineResult<Vec<Checkpoint>> {
        Ok(self.checkpoints.read().unwrap().values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FieldMap;

    fn doc(id: &str, text: &str) -> IndexDocument {
        let mut fields = FieldMap::new();
        fields.insert("text".into(), text.into());
        IndexDocument {
            image_id: ImageId::from(id),
            fields,
            text: text.to_string(),
            source_updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn upsert_replaces_document() {
        let store = InMemoryStore::new();
        store.upsert_document(&doc("a", "old text")).await.unwrap();
        store.upsert_document(&doc("a", "new text")).await.unwrap();
        assert_eq!(store.count_documents().await.unwrap(), 1);
        assert!(store.search("old", 10).await.unwrap().is_empty());
        assert_eq!(store.search("new", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn search_requires_all_terms_and_ranks_by_frequency() {
        let store = InMemoryStore::new();
        store.upsert_document(&doc("a", "acme acme sales")).await.unwrap();
        store.upsert_document(&doc("b", "acme engineering")).await.unwrap();
        store.upsert_document(&doc("c", "globex sales")).await.unwrap();

        let hits = store.search("acme", 10).await.unwrap();
        assert_eq!(
            hits.iter().map(|h| h.image_id.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        let hits = store.search("ACME sales", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].image_id.as_str(), "a");
    }
}
