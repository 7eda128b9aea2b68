//! Decoding of S3 event notifications carried in queue records.

use crate::error::Error;
use serde::Deserialize;
use std::fmt;

/// Location of a stored raw message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    pub bucket: String,
    pub key: String,
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

#[derive(Debug, Deserialize)]
struct Notification {
    #[serde(rename = "Records", default)]
    records: Vec<EventRecord>,
    // Set when the notification was fanned out through SNS first.
    #[serde(rename = "Type")]
    kind: Option<String>,
    #[serde(rename = "Message")]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventRecord {
    s3: Option<S3Entity>,
}

#[derive(Debug, Deserialize)]
struct S3Entity {
    bucket: BucketEntity,
    object: ObjectEntity,
}

#[derive(Debug, Deserialize)]
struct BucketEntity {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ObjectEntity {
    key: String,
}

/// Object keys arrive form-urlencoded (`+` for space).
fn decode_key(key: &str) -> String {
    let spaced = key.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(e) => {
            log::warn!("Keeping undecodable object key {key:?}: {e}");
            key.to_string()
        }
    }
}

/// Extracts the object references of a notification body.
///
/// Returns an empty list for notifications without S3 records, such as the
/// `s3:TestEvent` sent when a bucket notification is configured.
///
/// # Errors
///
/// Returns [`Error::MalformedEvent`] if the body is not a JSON notification.
pub fn object_refs(body: &str) -> Result<Vec<ObjectRef>, Error> {
    let notification: Notification = serde_json::from_str(body)?;

    if notification.kind.as_deref() == Some("Notification")
        && let Some(message) = notification.message.as_deref()
    {
        return object_refs(message);
    }

    Ok(notification
        .records
        .into_iter()
        .filter_map(|record| record.s3)
        .map(|s3| ObjectRef {
            bucket: s3.bucket.name,
            key: decode_key(&s3.object.key),
        })
        .collect())
}
