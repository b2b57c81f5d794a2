//! Extraction worker: image work items → extracted records + text events.
//!
//! Consumes the image stream in ordered batches. For each item:
//!
//! 1. fetch the image bytes from object storage
//! 2. run OCR and structure the lines into card fields
//! 3. upsert the [`ExtractedRecord`] into the keyed store (last write wins)
//! 4. append one [`TextEvent`] to the text stream
//!
//! Every external call is bounded by a timeout and retried on transient
//! failures. An item that fails permanently (or runs out of retries) is
//! dead-lettered and the partition moves on; a fatal error (bad credentials,
//! OCR disabled) stops the batch at that item without committing past it.
//!
//! The whole batch runs under a wall-clock budget. Items not reached before
//! the budget expires are left uncommitted and redelivered on the next poll.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::card_fields;
use crate::error::{ErrorClass, PipelineError, PipelineResult};
use crate::models::{DeadLetter, ExtractedRecord, FieldMap, FieldValue, ImageWorkItem, TextEvent};
use crate::object_store::ObjectStore;
use crate::ocr::TextExtractor;
use crate::retry::{retry, RetryPolicy};
use crate::store::{DeadLetterQueue, RecordStore};
use crate::stream::{BatchOutcome, BatchProcessor, Stream, StreamRecord};

/// Consumer group of the extraction worker on the image stream.
pub const EXTRACTION_GROUP: &str = "extraction";

const SUPPORTED_CONTENT_TYPES: &[&str] = &["image/jpeg", "image/jpg", "image/png"];

pub struct ExtractWorker {
    objects: Arc<dyn ObjectStore>,
    ocr: Arc<dyn TextExtractor>,
    records: Arc<dyn RecordStore>,
    dead_letters: Arc<dyn DeadLetterQueue>,
    image_stream: String,
    text_stream: Arc<dyn Stream>,
    call_policy: RetryPolicy,
    ocr_policy: RetryPolicy,
    budget: Duration,
}

/// Per-item result inside a batch.
enum ItemOutcome {
    Done,
    DeadLettered,
    Halt(PipelineError),
}

pub struct ExtractWorkerBuilder {
    worker: ExtractWorker,
}

impl ExtractWorkerBuilder {
    pub fn call_policy(mut self, policy: RetryPolicy) -> Self {
        self.worker.call_policy = policy;
        self
    }

    pub fn ocr_policy(mut self, policy: RetryPolicy) -> Self {
        self.worker.ocr_policy = policy;
        self
    }

    pub fn budget(mut self, budget: Duration) -> Self {
        self.worker.budget = budget;
        self
    }

    pub fn build(self) -> ExtractWorker {
        self.worker
    }
}

impl ExtractWorker {
    pub fn builder(
        objects: Arc<dyn ObjectStore>,
        ocr: Arc<dyn TextExtractor>,
        records: Arc<dyn RecordStore>,
        dead_letters: Arc<dyn DeadLetterQueue>,
        image_stream: &str,
        text_stream: Arc<dyn Stream>,
    ) -> ExtractWorkerBuilder {
        ExtractWorkerBuilder {
            worker: ExtractWorker {
                objects,
                ocr,
                records,
                dead_letters,
                image_stream: image_stream.to_string(),
                text_stream,
                call_policy: RetryPolicy::none(),
                ocr_policy: RetryPolicy::none(),
                budget: Duration::from_secs(300),
            },
        }
    }

    async fn process_item(&self, record: &StreamRecord) -> ItemOutcome {
        let item: ImageWorkItem = match serde_json::from_str(&record.payload) {
            Ok(item) => item,
            Err(e) => {
                return self
                    .dead_letter(record, None, PipelineError::decode("work item", e))
                    .await
            }
        };

        match self.extract(&item).await {
            Ok(()) => ItemOutcome::Done,
            Err(e) if e.class() == ErrorClass::Fatal => ItemOutcome::Halt(e),
            Err(e) => self.dead_letter(record, Some(&item), e).await,
        }
    }

    async fn extract(&self, item: &ImageWorkItem) -> PipelineResult<()> {
        let objects = &self.objects;
        let key = item.location.key.as_str();
        let data = retry(&self.call_policy, "fetch image", move || async move {
            objects.get(key).await.map_err(PipelineError::from)
        })
        .await?;

        if data.bytes.is_empty() {
            return Err(PipelineError::permanent("validate image", "empty image"));
        }
        let content_type = data.meta.content_type.to_lowercase();
        if !SUPPORTED_CONTENT_TYPES.contains(&content_type.as_str()) {
            return Err(PipelineError::permanent(
                "validate image",
                format!("unsupported content type '{}'", data.meta.content_type),
            ));
        }

        let ocr = &self.ocr;
        let bytes = data.bytes.as_slice();
        let ct = content_type.as_str();
        let output = retry(&self.ocr_policy, "ocr", move || async move {
            ocr.extract(bytes, ct).await
        })
        .await?;

        let text = output.text();
        let mut fields = card_fields::parse_card(&output.line_texts());
        fields.insert("text".to_string(), FieldValue::Text(text));

        let mut metadata = FieldMap::new();
        if let Some(confidence) = output.confidence() {
            metadata.insert("confidence".to_string(), FieldValue::Number(confidence));
        }
        metadata.insert(
            "line_count".to_string(),
            FieldValue::Number(output.lines.len() as f64),
        );
        metadata.insert(
            "ocr_provider".to_string(),
            FieldValue::Text(self.ocr.name().to_string()),
        );
        metadata.insert("content_type".to_string(), FieldValue::Text(content_type.clone()));
        metadata.insert(
            "size_bytes".to_string(),
            FieldValue::Number(data.bytes.len() as f64),
        );

        let extracted = ExtractedRecord {
            image_id: item.image_id.clone(),
            location: item.location.clone(),
            fields,
            metadata,
            extracted_at: Utc::now(),
        };

        let records = &self.records;
        let rec = &extracted;
        retry(&self.call_policy, "upsert record", move || async move {
            records.upsert_record(rec).await
        })
        .await?;

        let event = TextEvent::from(&extracted);
        let payload = serde_json::to_string(&event)
            .map_err(|e| PipelineError::permanent("encode text event", e))?;
        let stream = &self.text_stream;
        let id = event.image_id.as_str();
        let body = payload.as_str();
        let (partition, offset) = retry(&self.call_policy, "append text event", move || async move {
            stream.append(id, body).await
        })
        .await?;

        tracing::info!(
            image_id = %item.image_id,
            text_partition = partition,
            text_offset = offset,
            "extracted record"
        );
        Ok(())
    }

    async fn dead_letter(
        &self,
        record: &StreamRecord,
        item: Option<&ImageWorkItem>,
        error: PipelineError,
    ) -> ItemOutcome {
        tracing::warn!(
            partition = record.partition,
            offset = record.offset,
            image_id = item.map(|i| i.image_id.as_str()).unwrap_or(""),
            error = %error,
            "dead-lettering work item"
        );
        let letter = DeadLetter {
            consumer: EXTRACTION_GROUP.to_string(),
            stream: self.image_stream.clone(),
            partition: record.partition,
            offset: record.offset,
            image_id: item.map(|i| i.image_id.clone()),
            reason: error.to_string(),
            payload: record.payload.clone(),
            failed_at: Utc::now(),
        };
        match self.dead_letters.push_dead_letter(&letter).await {
            Ok(()) => ItemOutcome::DeadLettered,
            Err(e) => ItemOutcome::Halt(e),
        }
    }
}

#[async_trait]
impl BatchProcessor for ExtractWorker {
    fn group(&self) -> &str {
        EXTRACTION_GROUP
    }

    async fn process_batch(
        &self,
        partition: u32,
        records: Vec<StreamRecord>,
    ) -> PipelineResult<BatchOutcome> {
        let deadline = Instant::now() + self.budget;
        let mut outcome = BatchOutcome::default();

        for record in &records {
            let item_outcome =
                match tokio::time::timeout_at(deadline, self.process_item(record)).await {
                    Ok(o) => o,
                    Err(_) => {
                        tracing::warn!(
                            partition,
                            offset = record.offset,
                            budget_secs = self.budget.as_secs(),
                            "batch budget exhausted; remaining items will be redelivered"
                        );
                        break;
                    }
                };

            match item_outcome {
                ItemOutcome::Done => outcome.processed += 1,
                ItemOutcome::DeadLettered => outcome.dead_lettered += 1,
                ItemOutcome::Halt(e) => {
                    tracing::error!(
                        partition,
                        offset = record.offset,
                        error = %e,
                        "extraction halted"
                    );
                    if outcome.next_offset.is_none() {
                        return Err(e);
                    }
                    break;
                }
            }
            outcome.next_offset = Some(record.offset + 1);
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ImageId, ObjectLocation};
    use crate::object_store::memory::MemoryObjectStore;
    use crate::ocr::OcrOutput;
    use crate::store::memory::InMemoryStore;
    use crate::stream::memory::MemoryStream;

    /// Treats the image bytes as the card's text.
    struct EchoOcr;

    #[async_trait]
    impl TextExtractor for EchoOcr {
        fn name(&self) -> &str {
            "echo"
        }

        async fn extract(&self, image: &[u8], _content_type: &str) -> PipelineResult<OcrOutput> {
            let text = String::from_utf8_lossy(image);
            if text.starts_with("SLOW") {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            let mut out = OcrOutput::from_text(&text);
            out.confidence = Some(0.9);
            Ok(out)
        }
    }

    struct Harness {
        objects: Arc<MemoryObjectStore>,
        store: Arc<InMemoryStore>,
        text: Arc<MemoryStream>,
        worker: ExtractWorker,
    }

    fn harness(budget: Duration) -> Harness {
        let objects = Arc::new(MemoryObjectStore::new("cards"));
        let store = Arc::new(InMemoryStore::new());
        let text = Arc::new(MemoryStream::new("bizcard-text", 1));
        let worker = ExtractWorker::builder(
            objects.clone(),
            Arc::new(EchoOcr),
            store.clone(),
            store.clone(),
            "bizcard-image",
            text.clone(),
        )
        .budget(budget)
        .build();
        Harness {
            objects,
            store,
            text,
            worker,
        }
    }

    fn work_record(offset: u64, key: &str) -> StreamRecord {
        let location = ObjectLocation::new("cards", key);
        let item = ImageWorkItem {
            image_id: ImageId::for_location(&location),
            location,
        };
        StreamRecord {
            partition: 0,
            offset,
            key: item.image_id.to_string(),
            payload: serde_json::to_string(&item).unwrap(),
            appended_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn extracts_record_then_emits_text_event() {
        let h = harness(Duration::from_secs(5));
        h.objects
            .put(
                "bizcard-raw-img/jane.jpg",
                b"Jane Doe\nAcme Corp\njane@acme.example".to_vec(),
                "image/jpeg",
            )
            .await
            .unwrap();

        let rec = work_record(7, "bizcard-raw-img/jane.jpg");
        let outcome = h.worker.process_batch(0, vec![rec.clone()]).await.unwrap();
        assert_eq!(outcome.next_offset, Some(8));
        assert_eq!(outcome.processed, 1);

        let id = ImageId(rec.key.clone());
        let stored = h.store.get_record(&id).await.unwrap().unwrap();
        assert_eq!(
            stored.fields.get("email").and_then(FieldValue::as_text),
            Some("jane@acme.example")
        );
        assert_eq!(
            stored.metadata.get("confidence"),
            Some(&FieldValue::Number(0.9))
        );

        let events = h.text.read(0, 0, 10).await.unwrap();
        assert_eq!(events.len(), 1);
        let event: TextEvent = serde_json::from_str(&events[0].payload).unwrap();
        assert_eq!(event.image_id, id);
        assert!(event.text.contains("Acme Corp"));
    }

    #[tokio::test]
    async fn malformed_items_do_not_block_the_batch() {
        let h = harness(Duration::from_secs(5));
        h.objects
            .put("bizcard-raw-img/ok.jpg", b"John Roe".to_vec(), "image/jpeg")
            .await
            .unwrap();
        h.objects
            .put("bizcard-raw-img/empty.jpg", Vec::new(), "image/jpeg")
            .await
            .unwrap();
        h.objects
            .put("bizcard-raw-img/doc.jpg", b"%PDF".to_vec(), "application/pdf")
            .await
            .unwrap();

        let mut garbage = work_record(0, "bizcard-raw-img/x.jpg");
        garbage.payload = "{not json".into();
        let batch = vec![
            garbage,
            work_record(1, "bizcard-raw-img/missing.jpg"),
            work_record(2, "bizcard-raw-img/empty.jpg"),
            work_record(3, "bizcard-raw-img/doc.jpg"),
            work_record(4, "bizcard-raw-img/ok.jpg"),
        ];

        let outcome = h.worker.process_batch(0, batch).await.unwrap();
        assert_eq!(outcome.next_offset, Some(5));
        assert_eq!(outcome.processed, 1);
        assert_eq!(outcome.dead_lettered, 4);
        assert_eq!(h.store.count_records().await.unwrap(), 1);
        assert_eq!(h.text.len(), 1);

        let letters = h.store.list_dead_letters(10).await.unwrap();
        assert_eq!(letters.len(), 4);
        assert!(letters.iter().all(|l| l.consumer == EXTRACTION_GROUP));
        assert!(letters.iter().any(|l| l.reason.contains("unsupported content type")));
    }

    #[tokio::test]
    async fn budget_expiry_leaves_remaining_items_uncommitted() {
        let h = harness(Duration::from_millis(200));
        h.objects
            .put("bizcard-raw-img/a.jpg", b"Jane Doe".to_vec(), "image/jpeg")
            .await
            .unwrap();
        h.objects
            .put("bizcard-raw-img/slow.jpg", b"SLOW card".to_vec(), "image/jpeg")
            .await
            .unwrap();

        let outcome = h
            .worker
            .process_batch(
                0,
                vec![
                    work_record(0, "bizcard-raw-img/a.jpg"),
                    work_record(1, "bizcard-raw-img/slow.jpg"),
                    work_record(2, "bizcard-raw-img/a.jpg"),
                ],
            )
            .await
            .unwrap();
        assert_eq!(outcome.next_offset, Some(1));
        assert_eq!(outcome.processed, 1);
        assert_eq!(h.store.count_dead_letters().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn fatal_ocr_error_halts_without_commit() {
        let objects = Arc::new(MemoryObjectStore::new("cards"));
        objects
            .put("bizcard-raw-img/a.jpg", b"x".to_vec(), "image/jpeg")
            .await
            .unwrap();
        let store = Arc::new(InMemoryStore::new());
        let worker = ExtractWorker::builder(
            objects,
            Arc::new(crate::ocr::DisabledExtractor),
            store.clone(),
            store.clone(),
            "bizcard-image",
            Arc::new(MemoryStream::new("bizcard-text", 1)),
        )
        .build();

        let err = worker
            .process_batch(0, vec![work_record(0, "bizcard-raw-img/a.jpg")])
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Fatal);
        assert_eq!(store.count_dead_letters().await.unwrap(), 0);
    }
}
