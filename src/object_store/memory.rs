//! In-memory [`ObjectStore`] for tests.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::RwLock;

use super::{validate_key, ObjectData, ObjectMeta, ObjectResult, ObjectStore, ObjectStoreError};

pub struct MemoryObjectStore {
    bucket: String,
    objects: RwLock<BTreeMap<String, ObjectData>>,
}

impl MemoryObjectStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.objects.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> ObjectResult<ObjectMeta> {
        validate_key(key)?;
        let meta = ObjectMeta {
            key: key.to_string(),
            size: bytes.len() as u64,
            content_type: content_type.to_string(),
            last_modified: Utc::now(),
        };
        self.objects.write().unwrap().insert(
            key.to_string(),
            ObjectData {
                meta: meta.clone(),
                bytes,
            },
        );
        Ok(meta)
    }

    async fn get(&self, key: &str) -> ObjectResult<ObjectData> {
        self.objects
            .read()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| ObjectStoreError::NotFound(key.to_string()))
    }

    async fn head(&self, key: &str) -> ObjectResult<ObjectMeta> {
        self.get(key).await.map(|d| d.meta)
    }

    async fn list(&self, prefix: &str) -> ObjectResult<Vec<ObjectMeta>> {
        Ok(self
            .objects
            .read()
            .unwrap()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, d)| d.meta.clone())
            .collect())
    }
}
