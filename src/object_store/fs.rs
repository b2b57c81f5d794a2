//! Filesystem-backed object store.
//!
//! Objects live at `<root>/<key>`. The content type given on `put` is kept
//! in a sidecar file under `<root>/.bizcard-meta/`, which is excluded from
//! listings; objects written by other tools fall back to extension-based
//! detection.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::{
    detect_content_type, validate_key, ObjectData, ObjectMeta, ObjectResult, ObjectStore,
    ObjectStoreError,
};

const META_DIR: &str = ".bizcard-meta";

pub struct FsObjectStore {
    bucket: String,
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(bucket: String, root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create object store root: {}", root.display()))?;
        Ok(Self { bucket, root })
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.root.join(META_DIR).join(format!("{}.type", key))
    }

    async fn content_type_for(&self, key: &str) -> String {
        match tokio::fs::read_to_string(self.meta_path(key)).await {
            Ok(ct) if !ct.trim().is_empty() => ct.trim().to_string(),
            _ => detect_content_type(key),
        }
    }

    async fn meta_for(&self, key: &str, path: &Path) -> ObjectResult<ObjectMeta> {
        let md = match tokio::fs::metadata(path).await {
            Ok(md) if md.is_file() => md,
            Ok(_) => return Err(ObjectStoreError::NotFound(key.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ObjectStoreError::NotFound(key.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let last_modified: DateTime<Utc> = md
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Ok(ObjectMeta {
            key: key.to_string(),
            size: md.len(),
            content_type: self.content_type_for(key).await,
            last_modified,
        })
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> ObjectResult<ObjectMeta> {
        validate_key(key)?;
        let path = self.object_path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write to a temp file and rename, so readers never see a partial object.
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;

        let meta_path = self.meta_path(key);
        if let Some(parent) = meta_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&meta_path, content_type.as_bytes()).await?;

        self.meta_for(key, &path).await
    }

    async fn get(&self, key: &str) -> ObjectResult<ObjectData> {
        validate_key(key)?;
        let path = self.object_path(key);
        let meta = self.meta_for(key, &path).await?;
        let bytes = tokio::fs::read(&path).await?;
        Ok(ObjectData { meta, bytes })
    }

    async fn head(&self, key: &str) -> ObjectResult<ObjectMeta> {
        validate_key(key)?;
        self.meta_for(key, &self.object_path(key)).await
    }

    async fn list(&self, prefix: &str) -> ObjectResult<Vec<ObjectMeta>> {
        let root = self.root.clone();
        let prefix_owned = prefix.to_string();
        let keys = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<String>> {
            let mut keys = Vec::new();
            for entry in WalkDir::new(&root).follow_links(false) {
                let entry = entry.map_err(std::io::Error::other)?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(rel) = entry.path().strip_prefix(&root) else {
                    continue;
                };
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(META_DIR) || key.contains(".tmp-") {
                    continue;
                }
                if key.starts_with(&prefix_owned) {
                    keys.push(key);
                }
            }
            keys.sort();
            Ok(keys)
        })
        .await
        .map_err(|e| ObjectStoreError::Request(e.to_string()))??;

        let mut objects = Vec::with_capacity(keys.len());
        for key in keys {
            let path = self.object_path(&key);
            objects.push(self.meta_for(&key, &path).await?);
        }
        Ok(objects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn put_get_list_round_trip() {
        let tmp = TempDir::new().unwrap();
        let store = FsObjectStore::new("cards".into(), tmp.path().to_path_buf()).unwrap();

        store
            .put("bizcard-raw-img/a.jpg", b"aaa".to_vec(), "image/jpeg")
            .await
            .unwrap();
        store
            .put("bizcard-raw-img/b.png", b"bb".to_vec(), "image/png")
            .await
            .unwrap();
        store
            .put("other/c.bin", b"c".to_vec(), "application/x-custom")
            .await
            .unwrap();

        let data = store.get("bizcard-raw-img/a.jpg").await.unwrap();
        assert_eq!(data.bytes, b"aaa");
        assert_eq!(data.meta.content_type, "image/jpeg");

        let other = store.head("other/c.bin").await.unwrap();
        assert_eq!(other.content_type, "application/x-custom");

        let listed: Vec<String> = store
            .list("bizcard-raw-img/")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.key)
            .collect();
        assert_eq!(listed, vec!["bizcard-raw-img/a.jpg", "bizcard-raw-img/b.png"]);

        let folders = store.list_folders().await.unwrap();
        assert_eq!(folders, vec!["bizcard-raw-img", "other"]);
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let store = FsObjectStore::new("cards".into(), tmp.path().to_path_buf()).unwrap();
        let err = store.get("bizcard-raw-img/nope.jpg").await.unwrap_err();
        assert!(matches!(err, ObjectStoreError::NotFound(_)));
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn traversal_keys_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let store = FsObjectStore::new("cards".into(), tmp.path().to_path_buf()).unwrap();
        let err = store
            .put("../escape.jpg", b"x".to_vec(), "image/jpeg")
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
    }
}
