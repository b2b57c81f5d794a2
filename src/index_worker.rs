//! Indexing worker: text events → search index documents.
//!
//! Each [`TextEvent`] becomes one [`IndexDocument`] upserted by image id, so
//! redelivering an event any number of times converges to the same document.
//! Undecodable events, and events the index rejects outright, are
//! dead-lettered. Transient index failures are never skipped: when retries
//! run out the batch stops at that event and it is redelivered.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{ErrorClass, PipelineError, PipelineResult};
use crate::models::{DeadLetter, IndexDocument, TextEvent};
use crate::retry::{retry, RetryPolicy};
use crate::store::{DeadLetterQueue, SearchIndex};
use crate::stream::{BatchOutcome, BatchProcessor, StreamRecord};

pub const INDEXING_GROUP: &str = "indexing";

pub struct IndexWorker {
    index: Arc<dyn SearchIndex>,
    dead_letters: Arc<dyn DeadLetterQueue>,
    text_stream: String,
    policy: RetryPolicy,
    budget: Duration,
}

impl IndexWorker {
    pub fn new(
        index: Arc<dyn SearchIndex>,
        dead_letters: Arc<dyn DeadLetterQueue>,
        text_stream: &str,
        policy: RetryPolicy,
        budget: Duration,
    ) -> Self {
        Self {
            index,
            dead_letters,
            text_stream: text_stream.to_string(),
            policy,
            budget,
        }
    }

    async fn index_event(&self, event: &TextEvent) -> PipelineResult<()> {
        let doc = IndexDocument::from(event);
        let index = &self.index;
        let doc_ref = &doc;
        retry(&self.policy, "upsert document", move || async move {
            index.upsert_document(doc_ref).await
        })
        .await?;
        tracing::debug!(image_id = %doc.image_id, "indexed document");
        Ok(())
    }

    async fn dead_letter(&self, record: &StreamRecord, error: PipelineError) -> PipelineResult<()> {
        tracing::warn!(
            partition = record.partition,
            offset = record.offset,
            error = %error,
            "dead-lettering text event"
        );
        self.dead_letters
            .push_dead_letter(&DeadLetter {
                consumer: INDEXING_GROUP.to_string(),
                stream: self.text_stream.clone(),
                partition: record.partition,
                offset: record.offset,
                image_id: None,
                reason: error.to_string(),
                payload: record.payload.clone(),
                failed_at: Utc::now(),
            })
            .await
    }
}

#[async_trait]
impl BatchProcessor for IndexWorker {
    fn group(&self) -> &str {
        INDEXING_GROUP
    }

    async fn process_batch(
        &self,
        partition: u32,
        records: Vec<StreamRecord>,
    ) -> PipelineResult<BatchOutcome> {
        let deadline = Instant::now() + self.budget;
        let mut outcome = BatchOutcome::default();

        for record in &records {
            let event: TextEvent = match serde_json::from_str(&record.payload) {
                Ok(event) => event,
                Err(e) => {
                    self.dead_letter(record, PipelineError::decode("text event", e))
                        .await?;
                    outcome.dead_lettered += 1;
                    outcome.next_offset = Some(record.offset + 1);
                    continue;
                }
            };

            let result = match tokio::time::timeout_at(deadline, self.index_event(&event)).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(partition, offset = record.offset, "batch budget exhausted");
                    break;
                }
            };

            match result {
                Ok(()) => {
                    outcome.processed += 1;
                    outcome.next_offset = Some(record.offset + 1);
                }
                Err(e) if e.class() == ErrorClass::Permanent => {
                    self.dead_letter(record, e).await?;
                    outcome.dead_lettered += 1;
                    outcome.next_offset = Some(record.offset + 1);
                }
                Err(e) if outcome.next_offset.is_none() && e.class() == ErrorClass::Fatal => {
                    return Err(e);
                }
                Err(e) => {
                    // Keep what was indexed so far; this event comes back next poll
                    tracing::error!(
                        partition,
                        offset = record.offset,
                        image_id = %event.image_id,
                        error = %e,
                        "index write failed; stopping batch"
                    );
                    break;
                }
            }
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FieldMap, ImageId};
    use crate::store::memory::InMemoryStore;
    use crate::store::RecordStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn event_record(offset: u64, id: &str, text: &str) -> StreamRecord {
        let mut fields = FieldMap::new();
        fields.insert("text".into(), text.into());
        let event = TextEvent {
            image_id: ImageId::from(id),
            text: text.to_string(),
            fields,
            extracted_at: Utc::now(),
        };
        StreamRecord {
            partition: 0,
            offset,
            key: id.to_string(),
            payload: serde_json::to_string(&event).unwrap(),
            appended_at: Utc::now(),
        }
    }

    fn worker(store: Arc<InMemoryStore>) -> IndexWorker {
        IndexWorker::new(
            store.clone(),
            store,
            "bizcard-text",
            RetryPolicy::none(),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn redelivery_converges_to_one_document() {
        let store = Arc::new(InMemoryStore::new());
        let w = worker(store.clone());
        let rec = event_record(0, "img-1", "Jane Doe Acme");

        for _ in 0..3 {
            let outcome = w.process_batch(0, vec![rec.clone()]).await.unwrap();
            assert_eq!(outcome.next_offset, Some(1));
        }
        assert_eq!(store.count_documents().await.unwrap(), 1);
        let doc = store
            .get_document(&ImageId::from("img-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.text, "Jane Doe Acme");
        assert_eq!(store.count_records().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn undecodable_event_is_dead_lettered_and_skipped() {
        let store = Arc::new(InMemoryStore::new());
        let w = worker(store.clone());
        let mut bad = event_record(0, "img-0", "");
        bad.payload = "[]".into();

        let outcome = w
            .process_batch(0, vec![bad, event_record(1, "img-1", "John Roe")])
            .await
            .unwrap();
        assert_eq!(outcome.next_offset, Some(2));
        assert_eq!(outcome.dead_lettered, 1);
        assert_eq!(store.count_documents().await.unwrap(), 1);
        let letters = store.list_dead_letters(5).await.unwrap();
        assert_eq!(letters[0].consumer, INDEXING_GROUP);
    }

    /// Fails the first `failures` upserts with a transient error.
    struct FlakyIndex {
        inner: InMemoryStore,
        failures: AtomicU32,
    }

    #[async_trait]
    impl SearchIndex for FlakyIndex {
        async fn upsert_document(&self, doc: &IndexDocument) -> PipelineResult<()> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(PipelineError::transient("upsert document", "index busy"));
            }
            self.inner.upsert_document(doc).await
        }
        async fn get_document(&self, id: &ImageId) -> PipelineResult<Option<IndexDocument>> {
            self.inner.get_document(id).await
        }
        async fn search(&self, q: &str, limit: usize) -> PipelineResult<Vec<crate::models::SearchHit>> {
            self.inner.search(q, limit).await
        }
        async fn count_documents(&self) -> PipelineResult<u64> {
            self.inner.count_documents().await
        }
    }

    #[tokio::test]
    async fn exhausted_retries_stop_without_skipping() {
        let index = Arc::new(FlakyIndex {
            inner: InMemoryStore::new(),
            failures: AtomicU32::new(1),
        });
        let dead_letters = Arc::new(InMemoryStore::new());
        let w = IndexWorker::new(
            index.clone(),
            dead_letters.clone(),
            "bizcard-text",
            RetryPolicy::none(),
            Duration::from_secs(5),
        );

        let batch = vec![event_record(0, "img-1", "a"), event_record(1, "img-2", "b")];
        let outcome = w.process_batch(0, batch.clone()).await.unwrap();
        assert_eq!(outcome.next_offset, None);
        assert_eq!(index.count_documents().await.unwrap(), 0);
        assert_eq!(dead_letters.count_dead_letters().await.unwrap(), 0);

        let outcome = w.process_batch(0, batch).await.unwrap();
        assert_eq!(outcome.next_offset, Some(2));
        assert_eq!(index.count_documents().await.unwrap(), 2);
    }
}
