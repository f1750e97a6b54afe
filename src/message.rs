use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Broker-assigned identifier of one delivery on one channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeliveryTag(pub u64);

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Application-level identifier. Survives redelivery, unlike the tag.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        MessageId(id.into())
    }

    /// Generates a fresh random identifier.
    pub fn generate() -> Self {
        MessageId(Uuid::new_v4().to_string())
    }

    /// Stable identifier for messages published without one.
    pub fn from_payload(payload: &[u8]) -> Self {
        let mut hasher = DefaultHasher::new();
        payload.hash(&mut hasher);
        MessageId(format!("payload-{:016x}", hasher.finish()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        MessageId::new(id)
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        MessageId(id)
    }
}

/// Properties carried alongside a payload through the broker.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageProperties {
    pub message_id: Option<MessageId>,
    pub content_type: Option<String>,
    /// Unix timestamp, seconds.
    pub timestamp: Option<u64>,
    pub persistent: bool,
}

/// A delivery as produced by a backend, before the consumer takes ownership.
#[derive(Clone, Debug)]
pub struct RawDelivery {
    pub delivery_tag: DeliveryTag,
    pub redelivered: bool,
    pub payload: Vec<u8>,
    pub properties: MessageProperties,
}

/// A received message. Owned by the consumer until its ack is resolved.
#[derive(Clone, Debug)]
pub struct Message {
    id: MessageId,
    delivery_tag: DeliveryTag,
    redelivered: bool,
    timestamp: Option<DateTime<Utc>>,
    content_type: Option<String>,
    payload: Vec<u8>,
}

impl Message {
    pub(crate) fn from_raw(raw: RawDelivery) -> Self {
        let id = raw
            .properties
            .message_id
            .clone()
            .unwrap_or_else(|| MessageId::from_payload(&raw.payload));
        let timestamp = raw
            .properties
            .timestamp
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single());

        Message {
            id,
            delivery_tag: raw.delivery_tag,
            redelivered: raw.redelivered,
            timestamp,
            content_type: raw.properties.content_type,
            payload: raw.payload,
        }
    }

    pub fn id(&self) -> &MessageId {
        &self.id
    }

    pub fn delivery_tag(&self) -> DeliveryTag {
        self.delivery_tag
    }

    /// True when the broker has handed this message out before.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Deserializes a JSON payload.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}
