//! Record retrieval by image id.
//!
//! Fetches the extracted record from the keyed store together with its
//! search-index document, if it has been indexed yet. Used by the
//! `bizcard get` CLI command; the HTTP API reads the keyed store directly.

use anyhow::{bail, Result};
use serde::Serialize;

use crate::config::Config;
use crate::db;
use crate::models::{ExtractedRecord, ImageId, IndexDocument};
use crate::store::sqlite::SqliteStore;
use crate::store::{RecordStore, SearchIndex};

#[derive(Debug, Clone, Serialize)]
pub struct RecordResponse {
    pub record: ExtractedRecord,
    /// `None` while the text event is still in flight to the index.
    pub document: Option<IndexDocument>,
}

pub async fn get_record(
    records: &dyn RecordStore,
    index: &dyn SearchIndex,
    image_id: &ImageId,
) -> Result<RecordResponse> {
    let Some(record) = records.get_record(image_id).await? else {
        bail!("record not found: {}", image_id);
    };
    let document = index.get_document(image_id).await?;
    Ok(RecordResponse { record, document })
}

/// `bizcard get <image_id>`: print the record as pretty JSON.
pub async fn run_get(config: &Config, image_id: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());
    let result = get_record(&store, &store, &ImageId::from(image_id)).await;
    pool.close().await;

    let response = result?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    if response.document.is_none() {
        eprintln!("(not indexed yet)");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FieldMap, ObjectLocation, TextEvent};
    use crate::store::memory::InMemoryStore;
    use chrono::Utc;

    #[tokio::test]
    async fn reports_record_before_and_after_indexing() {
        let store = InMemoryStore::new();
        let id = ImageId::from("img-1");
        let mut fields = FieldMap::new();
        fields.insert("text".into(), "Jane Doe".into());
        let record = ExtractedRecord {
            image_id: id.clone(),
            location: ObjectLocation::new("cards", "bizcard-raw-img/a.jpg"),
            fields,
            metadata: FieldMap::new(),
            extracted_at: Utc::now(),
        };
        store.upsert_record(&record).await.unwrap();

        let before = get_record(&store, &store, &id).await.unwrap();
        assert!(before.document.is_none());

        let doc = IndexDocument::from(&TextEvent::from(&record));
        store.upsert_document(&doc).await.unwrap();
        let after = get_record(&store, &store, &id).await.unwrap();
        assert_eq!(after.document, Some(doc));

        assert!(get_record(&store, &store, &ImageId::from("nope"))
            .await
            .is_err());
    }
}
