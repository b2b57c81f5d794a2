//! Core data models used throughout the pipeline.
//!
//! These types represent the images, work items, extracted records, and
//! index documents that flow through the ingestion and indexing stages. The
//! [`ImageId`] is the join key shared by every stage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Namespace used to derive deterministic image identifiers (UUID v5).
const IMAGE_ID_NAMESPACE: uuid::Uuid = uuid::Uuid::from_bytes([
    0x6f, 0x63, 0x74, 0x65, 0x6d, 0x62, 0x65, 0x72, 0x2d, 0x62, 0x69, 0x7a, 0x63, 0x61, 0x72, 0x64,
]);

/// Identifier of an uploaded image, propagated unchanged through every stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageId(pub String);

impl ImageId {
    /// Derive the identifier for an object location.
    ///
    /// The id is a UUID v5 over `bucket/key`, so repeated notifications for
    /// the same object always yield the same id.
    pub fn for_location(location: &ObjectLocation) -> Self {
        let name = format!("{}/{}", location.bucket, location.key);
        Self(uuid::Uuid::new_v5(&IMAGE_ID_NAMESPACE, name.as_bytes()).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ImageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Where an object lives in object storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectLocation {
    pub bucket: String,
    pub key: String,
}

impl ObjectLocation {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// A single value in a field map.
///
/// Serialized untagged so that `{"phone": "555", "confidence": 0.9,
/// "verified": true}` round-trips without an envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl FieldValue {
    /// Text rendering used for full-text indexing.
    pub fn to_text(&self) -> String {
        match self {
            FieldValue::Bool(b) => b.to_string(),
            FieldValue::Number(n) => n.to_string(),
            FieldValue::Text(s) => s.clone(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<f64> for FieldValue {
    fn from(n: f64) -> Self {
        FieldValue::Number(n)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

/// Typed mapping from field name to value. Ordered, so serialization is stable.
pub type FieldMap = BTreeMap<String, FieldValue>;

/// An uploaded business-card photo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawImage {
    pub image_id: ImageId,
    pub location: ObjectLocation,
    pub content_type: String,
    pub size: u64,
    pub uploaded_at: DateTime<Utc>,
}

/// A unit of extraction work, carried on the image stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageWorkItem {
    pub image_id: ImageId,
    pub location: ObjectLocation,
}

/// Structured fields parsed from an image; one row per image in the keyed store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRecord {
    pub image_id: ImageId,
    pub location: ObjectLocation,
    pub fields: FieldMap,
    #[serde(default)]
    pub metadata: FieldMap,
    pub extracted_at: DateTime<Utc>,
}

/// The text payload to be indexed and archived, carried on the text stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextEvent {
    pub image_id: ImageId,
    pub text: String,
    #[serde(default)]
    pub fields: FieldMap,
    pub extracted_at: DateTime<Utc>,
}

impl From<&ExtractedRecord> for TextEvent {
    fn from(record: &ExtractedRecord) -> Self {
        let text = record
            .fields
            .get("text")
            .map(FieldValue::to_text)
            .unwrap_or_default();
        Self {
            image_id: record.image_id.clone(),
            text,
            fields: record.fields.clone(),
            extracted_at: record.extracted_at,
        }
    }
}

/// The searchable representation of a record. Document id = image id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDocument {
    pub image_id: ImageId,
    pub fields: FieldMap,
    pub text: String,
    pub source_updated_at: DateTime<Utc>,
}

impl From<&TextEvent> for IndexDocument {
    fn from(event: &TextEvent) -> Self {
        Self {
            image_id: event.image_id.clone(),
            fields: event.fields.clone(),
            text: event.text.clone(),
            source_updated_at: event.extracted_at,
        }
    }
}

/// A search result returned from the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub image_id: ImageId,
    pub score: f64,
    pub snippet: String,
    pub fields: FieldMap,
}

/// A permanently failed item, routed aside so it does not block its partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub consumer: String,
    pub stream: String,
    pub partition: u32,
    pub offset: u64,
    pub image_id: Option<ImageId>,
    pub reason: String,
    pub payload: String,
    pub failed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_id_is_deterministic_per_location() {
        let a = ObjectLocation::new("cards", "bizcard-raw-img/alice.jpg");
        let b = ObjectLocation::new("cards", "bizcard-raw-img/bob.jpg");
        assert_eq!(ImageId::for_location(&a), ImageId::for_location(&a));
        assert_ne!(ImageId::for_location(&a), ImageId::for_location(&b));
    }

    #[test]
    fn field_map_preserves_value_types() {
        let mut fields = FieldMap::new();
        fields.insert("name".into(), "Jane Doe".into());
        fields.insert("confidence".into(), 0.5.into());
        fields.insert("verified".into(), true.into());

        let json = serde_json::to_string(&fields).unwrap();
        assert_eq!(
            json,
            r#"{"confidence":0.5,"name":"Jane Doe","verified":true}"#
        );
        let back: FieldMap = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fields);
    }

    #[test]
    fn text_event_carries_record_text_field() {
        let mut fields = FieldMap::new();
        fields.insert("text".into(), "Jane Doe\nAcme".into());
        let record = ExtractedRecord {
            image_id: ImageId::from("img-1"),
            location: ObjectLocation::new("cards", "bizcard-raw-img/a.jpg"),
            fields,
            metadata: FieldMap::new(),
            extracted_at: Utc::now(),
        };
        let event = TextEvent::from(&record);
        assert_eq!(event.image_id, record.image_id);
        assert_eq!(event.text, "Jane Doe\nAcme");
    }
}
