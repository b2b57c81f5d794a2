//! Object storage abstraction.
//!
//! The [`ObjectStore`] trait covers everything the pipeline needs from a
//! bucket: the upload API reads and writes single objects and lists
//! folders, the extraction worker fetches image bytes, and the archival sink
//! writes compressed batch files.
//!
//! | Backend | Module | Use |
//! |---------|--------|-----|
//! | Filesystem | [`fs`] | local deployments, integration tests |
//! | S3 / S3-compatible | [`s3`] | production buckets, MinIO, LocalStack |
//! | In-memory | [`memory`] | unit tests |
//!
//! [`NotifyingObjectStore`] wraps any backend and publishes an
//! [`ObjectEvent`] after each successful write, which is what drives the
//! upload watcher.

pub mod fs;
pub mod memory;
pub mod s3;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::ObjectStoreConfig;
use crate::error::ErrorClass;
use crate::models::ObjectLocation;

/// Errors surfaced by object-store backends.
#[derive(Debug, thiserror::Error)]
pub enum ObjectStoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("invalid object key '{key}': {reason}")]
    InvalidKey { key: String, reason: &'static str },

    /// A non-2xx response from a remote backend, passed through as-is.
    #[error("upstream returned HTTP {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("object store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("object store request failed: {0}")]
    Request(String),
}

impl ObjectStoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ObjectStoreError::NotFound(_) | ObjectStoreError::InvalidKey { .. } => {
                ErrorClass::Permanent
            }
            ObjectStoreError::Upstream { status, .. } => {
                if *status == 408 || *status == 429 || *status >= 500 {
                    ErrorClass::Transient
                } else if *status == 401 || *status == 403 {
                    ErrorClass::Fatal
                } else {
                    ErrorClass::Permanent
                }
            }
            ObjectStoreError::Io(_) | ObjectStoreError::Request(_) => ErrorClass::Transient,
        }
    }

    /// HTTP status the upload API should answer with for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            ObjectStoreError::NotFound(_) => 404,
            ObjectStoreError::InvalidKey { .. } => 400,
            ObjectStoreError::Upstream { status, .. } => *status,
            ObjectStoreError::Io(_) => 500,
            ObjectStoreError::Request(_) => 502,
        }
    }
}

pub type ObjectResult<T> = std::result::Result<T, ObjectStoreError>;

/// Metadata for a single stored object.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub content_type: String,
    pub last_modified: DateTime<Utc>,
}

/// An object's bytes together with its metadata.
#[derive(Debug, Clone)]
pub struct ObjectData {
    pub meta: ObjectMeta,
    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Bucket name; together with a key it forms an [`ObjectLocation`].
    fn bucket(&self) -> &str;

    /// Write an object, replacing any existing object at `key`.
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> ObjectResult<ObjectMeta>;

    async fn get(&self, key: &str) -> ObjectResult<ObjectData>;

    async fn head(&self, key: &str) -> ObjectResult<ObjectMeta>;

    /// List objects whose key starts with `prefix`, sorted by key.
    async fn list(&self, prefix: &str) -> ObjectResult<Vec<ObjectMeta>>;

    /// List the distinct top-level folders (first path segment of each key).
    async fn list_folders(&self) -> ObjectResult<Vec<String>> {
        let mut folders: Vec<String> = self
            .list("")
            .await?
            .into_iter()
            .filter_map(|m| m.key.split_once('/').map(|(f, _)| f.to_string()))
            .collect();
        folders.dedup();
        Ok(folders)
    }
}

/// Notification published after an object is written.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectEvent {
    Created {
        location: ObjectLocation,
        meta: ObjectMeta,
    },
}

/// Wraps an [`ObjectStore`] and emits [`ObjectEvent::Created`] on every
/// successful `put`.
pub struct NotifyingObjectStore {
    inner: Arc<dyn ObjectStore>,
    events: mpsc::UnboundedSender<ObjectEvent>,
}

impl NotifyingObjectStore {
    pub fn new(
        inner: Arc<dyn ObjectStore>,
    ) -> (Self, mpsc::UnboundedReceiver<ObjectEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { inner, events: tx }, rx)
    }
}

#[async_trait]
impl ObjectStore for NotifyingObjectStore {
    fn bucket(&self) -> &str {
        self.inner.bucket()
    }

    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> ObjectResult<ObjectMeta> {
        let meta = self.inner.put(key, bytes, content_type).await?;
        let event = ObjectEvent::Created {
            location: ObjectLocation::new(self.inner.bucket(), key),
            meta: meta.clone(),
        };
        if self.events.send(event).is_err() {
            tracing::warn!(key, "object-created notification dropped: no watcher listening");
        }
        Ok(meta)
    }

    async fn get(&self, key: &str) -> ObjectResult<ObjectData> {
        self.inner.get(key).await
    }

    async fn head(&self, key: &str) -> ObjectResult<ObjectMeta> {
        self.inner.head(key).await
    }

    async fn list(&self, prefix: &str) -> ObjectResult<Vec<ObjectMeta>> {
        self.inner.list(prefix).await
    }

    async fn list_folders(&self) -> ObjectResult<Vec<String>> {
        self.inner.list_folders().await
    }
}

/// Validate an object key: relative, no `..` segments, no empty segments.
pub fn validate_key(key: &str) -> ObjectResult<()> {
    let invalid = |reason| {
        Err(ObjectStoreError::InvalidKey {
            key: key.to_string(),
            reason,
        })
    };
    if key.is_empty() {
        return invalid("key must not be empty");
    }
    if key.starts_with('/') || key.contains('\\') {
        return invalid("key must be a relative path");
    }
    if key.split('/').any(|seg| seg == ".." || seg == ".") {
        return invalid("key must not contain '.' or '..' segments");
    }
    if key.ends_with('/') || key.contains("//") {
        return invalid("key must not contain empty segments");
    }
    Ok(())
}

/// Detect MIME content type from a key's extension.
pub fn detect_content_type(key: &str) -> String {
    let ext = key.rsplit('.').next().map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("jpg" | "jpeg") => "image/jpeg".to_string(),
        Some("png") => "image/png".to_string(),
        Some("json") => "application/json".to_string(),
        Some("jsonl") => "application/x-ndjson".to_string(),
        Some("zip") => "application/zip".to_string(),
        Some("gz") => "application/gzip".to_string(),
        Some("txt") => "text/plain".to_string(),
        _ => "application/octet-stream".to_string(),
    }
}

/// Build the object store described by the configuration.
pub fn build_object_store(config: &ObjectStoreConfig) -> Result<Arc<dyn ObjectStore>> {
    match config.backend.as_str() {
        "filesystem" => {
            let Some(ref root) = config.root else {
                bail!("object_store.root is required for the filesystem backend");
            };
            Ok(Arc::new(fs::FsObjectStore::new(
                config.bucket.clone(),
                root.clone(),
            )?))
        }
        "s3" => Ok(Arc::new(s3::S3ObjectStore::from_env(config.clone())?)),
        other => bail!("Unknown object_store.backend: '{}'", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_traversal_and_absolute_keys() {
        assert!(validate_key("bizcard-raw-img/a.jpg").is_ok());
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key("/abs.jpg").is_err());
        assert!(validate_key("a//b.jpg").is_err());
        assert!(validate_key("folder/").is_err());
        assert!(validate_key("").is_err());
    }

    #[test]
    fn content_type_from_extension() {
        assert_eq!(detect_content_type("x/a.JPG"), "image/jpeg");
        assert_eq!(detect_content_type("x/a.png"), "image/png");
        assert_eq!(detect_content_type("x/a.zip"), "application/zip");
        assert_eq!(detect_content_type("x/a"), "application/octet-stream");
    }

    #[test]
    fn upstream_status_drives_class_and_passthrough() {
        let throttled = ObjectStoreError::Upstream {
            status: 503,
            message: "slow down".into(),
        };
        assert_eq!(throttled.class(), ErrorClass::Transient);
        assert_eq!(throttled.status_code(), 503);

        let denied = ObjectStoreError::Upstream {
            status: 403,
            message: "denied".into(),
        };
        assert_eq!(denied.class(), ErrorClass::Fatal);
        assert_eq!(denied.status_code(), 403);
    }

    #[tokio::test]
    async fn notifying_store_emits_created_events() {
        let inner: Arc<dyn ObjectStore> = Arc::new(memory::MemoryObjectStore::new("cards"));
        let (store, mut rx) = NotifyingObjectStore::new(inner);

        store
            .put("bizcard-raw-img/a.jpg", b"jpeg".to_vec(), "image/jpeg")
            .await
            .unwrap();

        let ObjectEvent::Created { location, meta } = rx.recv().await.unwrap();
        assert_eq!(location, ObjectLocation::new("cards", "bizcard-raw-img/a.jpg"));
        assert_eq!(meta.size, 4);
    }
}
