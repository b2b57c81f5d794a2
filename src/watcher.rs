//! Upload watcher: object-created notifications → image work items.
//!
//! Every [`ObjectEvent::Created`] whose key passes the [`KeyFilter`] becomes
//! exactly one [`ImageWorkItem`] on the image stream, keyed (and therefore
//! partitioned) by its image id. Writes outside the filter, including the
//! archive prefix, are ignored.
//!
//! Enqueue failures are retried with bounded backoff. If retries run out
//! the failure is logged at `error` level and recorded as a dead letter with
//! reason `delivery`, so nothing is dropped silently.

use anyhow::Result;
use chrono::Utc;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::config::WatcherConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{DeadLetter, ImageId, ImageWorkItem, ObjectLocation};
use crate::object_store::{ObjectEvent, ObjectStore};
use crate::retry::{retry, RetryPolicy};
use crate::store::DeadLetterQueue;
use crate::stream::{partition_for, Stream};

/// Consumer name used for watcher dead letters.
pub const WATCHER_GROUP: &str = "watcher";

/// Prefix/suffix filter over object keys.
///
/// Suffixes match case-insensitively (`.JPG` matches `.jpg`). Keys matching
/// any exclude glob are rejected even when prefix and suffix match.
pub struct KeyFilter {
    prefix: String,
    suffixes: Vec<String>,
    exclude: GlobSet,
}

impl KeyFilter {
    pub fn new(prefix: &str, suffixes: &[String], exclude_globs: &[String]) -> Result<Self> {
        Ok(Self {
            prefix: prefix.to_string(),
            suffixes: suffixes.iter().map(|s| s.to_lowercase()).collect(),
            exclude: build_globset(exclude_globs)?,
        })
    }

    pub fn from_config(config: &WatcherConfig) -> Result<Self> {
        Self::new(&config.prefix, &config.suffixes, &config.exclude_globs)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn matches(&self, key: &str) -> bool {
        if !key.starts_with(&self.prefix) {
            return false;
        }
        let lower = key.to_lowercase();
        if !self.suffixes.iter().any(|s| lower.ends_with(s.as_str())) {
            return false;
        }
        !self.exclude.is_match(key)
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

pub struct UploadWatcher {
    filter: KeyFilter,
    stream: Arc<dyn Stream>,
    dead_letters: Arc<dyn DeadLetterQueue>,
    policy: RetryPolicy,
}

impl UploadWatcher {
    pub fn new(
        filter: KeyFilter,
        stream: Arc<dyn Stream>,
        dead_letters: Arc<dyn DeadLetterQueue>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            filter,
            stream,
            dead_letters,
            policy,
        }
    }

    /// Enqueue the work item for one notification.
    ///
    /// Returns `Ok(None)` when the key is outside the filter, or the
    /// `(partition, offset)` the item was appended at.
    pub async fn handle_event(&self, event: &ObjectEvent) -> PipelineResult<Option<(u32, u64)>> {
        let ObjectEvent::Created { location, .. } = event;
        if !self.filter.matches(&location.key) {
            tracing::debug!(key = %location.key, "ignoring object outside watched prefix");
            return Ok(None);
        }
        self.enqueue(location).await.map(Some)
    }

    async fn enqueue(&self, location: &ObjectLocation) -> PipelineResult<(u32, u64)> {
        let item = ImageWorkItem {
            image_id: ImageId::for_location(location),
            location: location.clone(),
        };
        let payload = serde_json::to_string(&item)
            .map_err(|e| PipelineError::permanent("encode work item", e))?;

        let stream = &self.stream;
        let key = item.image_id.as_str();
        let body = payload.as_str();
        let result = retry(&self.policy, "enqueue work item", move || async move {
            stream.append(key, body).await
        })
        .await;

        match result {
            Ok((partition, offset)) => {
                tracing::info!(
                    image_id = %item.image_id,
                    key = %location.key,
                    partition,
                    offset,
                    "enqueued image work item"
                );
                Ok((partition, offset))
            }
            Err(e) => {
                tracing::error!(
                    image_id = %item.image_id,
                    key = %location.key,
                    error = %e,
                    "failed to deliver work item"
                );
                let letter = DeadLetter {
                    consumer: WATCHER_GROUP.to_string(),
                    stream: self.stream.name().to_string(),
                    partition: partition_for(item.image_id.as_str(), self.stream.partitions()),
                    offset: 0,
                    image_id: Some(item.image_id.clone()),
                    reason: format!("delivery: {}", e),
                    payload,
                    failed_at: Utc::now(),
                };
                if let Err(dl_err) = self.dead_letters.push_dead_letter(&letter).await {
                    tracing::error!(error = %dl_err, "failed to record delivery dead letter");
                }
                Err(e)
            }
        }
    }

    /// Enqueue every matching object already present under the prefix.
    pub async fn scan_existing(&self, store: &dyn ObjectStore) -> PipelineResult<usize> {
        let mut enqueued = 0;
        for meta in store.list(self.filter.prefix()).await? {
            if !self.filter.matches(&meta.key) {
                continue;
            }
            let location = ObjectLocation::new(store.bucket(), meta.key.as_str());
            self.enqueue(&location).await?;
            enqueued += 1;
        }
        tracing::info!(enqueued, prefix = self.filter.prefix(), "startup scan complete");
        Ok(enqueued)
    }

    /// Consume notifications until the channel closes or shutdown is signalled.
    pub async fn run(
        self,
        mut events: mpsc::UnboundedReceiver<ObjectEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    // Failures are already logged and dead-lettered
                    let _ = self.handle_event(&event).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("upload watcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::memory::MemoryObjectStore;
    use crate::object_store::ObjectMeta;
    use crate::store::memory::InMemoryStore;
    use crate::stream::memory::MemoryStream;
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::time::Duration;

    fn filter() -> KeyFilter {
        KeyFilter::new(
            "bizcard-raw-img/",
            &[".jpg".to_string()],
            &["**/drafts/**".to_string()],
        )
        .unwrap()
    }

    fn created(key: &str) -> ObjectEvent {
        ObjectEvent::Created {
            location: ObjectLocation::new("cards", key),
            meta: ObjectMeta {
                key: key.to_string(),
                size: 3,
                content_type: "image/jpeg".into(),
                last_modified: Utc::now(),
            },
        }
    }

    #[test]
    fn filter_applies_prefix_suffix_and_excludes() {
        let f = filter();
        assert!(f.matches("bizcard-raw-img/alice.jpg"));
        assert!(f.matches("bizcard-raw-img/2026/ALICE.JPG"));
        assert!(!f.matches("bizcard-raw-img/alice.png"));
        assert!(!f.matches("bizcard-text/2026/10/18/12/batch.zip"));
        assert!(!f.matches("other/alice.jpg"));
        assert!(!f.matches("bizcard-raw-img/drafts/alice.jpg"));
    }

    #[tokio::test]
    async fn matching_upload_produces_one_keyed_work_item() {
        let stream = Arc::new(MemoryStream::new("bizcard-image", 4));
        let store = Arc::new(InMemoryStore::new());
        let watcher = UploadWatcher::new(filter(), stream.clone(), store, RetryPolicy::none());

        let (partition, offset) = watcher
            .handle_event(&created("bizcard-raw-img/alice.jpg"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(offset, 0);
        assert!(watcher
            .handle_event(&created("bizcard-text/x.jpg"))
            .await
            .unwrap()
            .is_none());

        let records = stream.read(partition, 0, 10).await.unwrap();
        assert_eq!(records.len(), 1);
        let item: ImageWorkItem = serde_json::from_str(&records[0].payload).unwrap();
        assert_eq!(item.location.key, "bizcard-raw-img/alice.jpg");
        assert_eq!(records[0].key, item.image_id.as_str());
        assert_eq!(item.image_id, ImageId::for_location(&item.location));
        assert_eq!(stream.len(), 1);
    }

    struct BrokenStream;

    #[async_trait]
    impl Stream for BrokenStream {
        fn name(&self) -> &str {
            "bizcard-image"
        }
        fn partitions(&self) -> u32 {
            1
        }
        async fn append(&self, _key: &str, _payload: &str) -> PipelineResult<(u32, u64)> {
            Err(PipelineError::transient("append", "stream unavailable"))
        }
        async fn read(&self, _: u32, _: u64, _: usize) -> PipelineResult<Vec<crate::stream::StreamRecord>> {
            Ok(Vec::new())
        }
        async fn end_offset(&self, _: u32) -> PipelineResult<u64> {
            Ok(0)
        }
        async fn start_offset(&self, _: u32) -> PipelineResult<u64> {
            Ok(0)
        }
        async fn trim_before(&self, _: DateTime<Utc>) -> PipelineResult<u64> {
            Ok(0)
        }
        async fn wait_for_data(&self, _: u32, _: u64, _: Duration) {}
    }

    #[tokio::test]
    async fn delivery_failure_is_surfaced_and_dead_lettered() {
        let store = Arc::new(InMemoryStore::new());
        let policy = RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(2));
        let watcher = UploadWatcher::new(filter(), Arc::new(BrokenStream), store.clone(), policy);

        let err = watcher
            .handle_event(&created("bizcard-raw-img/alice.jpg"))
            .await
            .unwrap_err();
        assert!(err.is_transient());

        let letters = store.list_dead_letters(10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].consumer, WATCHER_GROUP);
        assert!(letters[0].reason.starts_with("delivery"));
    }

    #[tokio::test]
    async fn scan_existing_enqueues_only_matching_objects() {
        let objects = MemoryObjectStore::new("cards");
        for key in [
            "bizcard-raw-img/a.jpg",
            "bizcard-raw-img/b.jpg",
            "bizcard-raw-img/c.txt",
            "bizcard-text/old.zip",
        ] {
            objects.put(key, b"x".to_vec(), "image/jpeg").await.unwrap();
        }
        let stream = Arc::new(MemoryStream::new("bizcard-image", 2));
        let watcher = UploadWatcher::new(
            filter(),
            stream.clone(),
            Arc::new(InMemoryStore::new()),
            RetryPolicy::none(),
        );
        assert_eq!(watcher.scan_existing(&objects).await.unwrap(), 2);
        assert_eq!(stream.len(), 2);
    }
}
