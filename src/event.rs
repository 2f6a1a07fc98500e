// Object-created notification payload.
// Mirrors the S3 event shape: Records[].s3.bucket.name / Records[].s3.object.key

use crate::object_store::ObjectLocation;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("notification has no records")]
    NoRecords,

    #[error("notification is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("object key {0:?} is not valid URL encoding")]
    KeyEncoding(String),

    #[error("notification does not name an object (bucket {bucket:?}, key {key:?})")]
    MissingObject { bucket: String, key: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    #[serde(rename = "Records", default)]
    pub records: Vec<EventRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    #[serde(rename = "eventName", default, skip_serializing_if = "Option::is_none")]
    pub event_name: Option<String>,
    pub s3: S3Entity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct S3Entity {
    pub bucket: BucketEntity,
    pub object: ObjectEntity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketEntity {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectEntity {
    /// URL-encoded, as delivered by the notification service
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl NotificationEvent {
    pub fn from_json(payload: &str) -> Result<Self, EventError> {
        Ok(serde_json::from_str(payload)?)
    }

    /// Build the event the notification service would send for an upload
    pub fn for_object(bucket: &str, key: &str) -> Self {
        NotificationEvent {
            records: vec![EventRecord {
                event_name: Some("ObjectCreated:Put".to_string()),
                s3: S3Entity {
                    bucket: BucketEntity {
                        name: bucket.to_string(),
                    },
                    object: ObjectEntity {
                        key: encode_object_key(key),
                        size: None,
                    },
                },
            }],
        }
    }

    /// Location of the first record's object, key decoded.
    pub fn source_location(&self) -> Result<ObjectLocation, EventError> {
        let record = self.records.first().ok_or(EventError::NoRecords)?;
        let bucket = record.s3.bucket.name.clone();
        let key = decode_object_key(&record.s3.object.key)?;

        if bucket.is_empty() || key.is_empty() || key.ends_with('/') {
            return Err(EventError::MissingObject { bucket, key });
        }

        Ok(ObjectLocation::new(bucket, key))
    }
}

/// Notification keys are form-encoded: `+` is a space, `%XX` an escaped byte
pub fn decode_object_key(raw: &str) -> Result<String, EventError> {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|decoded| decoded.into_owned())
        .map_err(|_| EventError::KeyEncoding(raw.to_string()))
}

pub fn encode_object_key(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).replace("%20", "+"))
        .collect::<Vec<_>>()
        .join("/")
}
