//! Message types for queue operations including core domain identifiers.

use crate::error::{SerializationError, ValidationError};
use crate::provider::ProviderType;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Validated queue name with length and character restrictions
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueName(String);

impl QueueName {
    /// Create new queue name with validation
    pub fn new(name: String) -> Result<Self, ValidationError> {
        if name.is_empty() || name.len() > 260 {
            return Err(ValidationError::OutOfRange {
                field: "queue_name".to_string(),
                message: "must be 1-260 characters".to_string(),
            });
        }

        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(ValidationError::InvalidFormat {
                field: "queue_name".to_string(),
                message: "only ASCII alphanumeric, hyphens, underscores and dots allowed"
                    .to_string(),
            });
        }

        // Names double as directory names for the filesystem store
        if name.starts_with('-') || name.ends_with('-') || name.contains("--") || name.starts_with('.')
        {
            return Err(ValidationError::InvalidFormat {
                field: "queue_name".to_string(),
                message: "no leading dots, leading/trailing hyphens or consecutive hyphens"
                    .to_string(),
            });
        }

        Ok(Self(name))
    }

    /// Get queue name as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for QueueName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

/// Unique identifier for messages within the queue system
///
/// Identifiers are assigned by the producing side when a message is added and
/// are never reused. A generated identifier combines a nanosecond timestamp
/// with a random 128-bit UUIDv4, so collisions across producers are
/// negligible. The value is not meant to be unguessable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub struct MessageId(String);

impl MessageId {
    /// Generate a new message ID
    pub fn generate() -> Self {
        let nanos = Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default()
            .unsigned_abs();
        let random = uuid::Uuid::new_v4();
        Self(format!("{:x}-{}", nanos, random.simple()))
    }

    /// Get message ID as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for MessageId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() {
            return Err(ValidationError::Required {
                field: "message_id".to_string(),
            });
        }

        Ok(Self(value))
    }
}

impl FromStr for MessageId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s.to_string())
    }
}

/// Timestamp wrapper for consistent time handling
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for current time
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Create timestamp from DateTime
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Get underlying DateTime
    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    /// Timestamp offset from now by the given number of milliseconds
    pub fn after_millis(millis: u64) -> Self {
        let offset = chrono::Duration::milliseconds(i64::try_from(millis).unwrap_or(i64::MAX));
        Self(Utc::now() + offset)
    }

    /// Check whether this timestamp has been reached
    pub fn has_passed(&self) -> bool {
        Utc::now() >= self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S%.3f UTC"))
    }
}

impl FromStr for Timestamp {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let dt = s.parse::<DateTime<Utc>>()?;
        Ok(Self::from_datetime(dt))
    }
}

// ============================================================================
// Message Types
// ============================================================================

/// A message as handed to the queue by a producer
///
/// The caller supplies the logical name and payload only. The identity is
/// assigned when the message is added to a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    name: String,
    payload: String,
}

impl NewMessage {
    /// Create new message with a textual payload
    pub fn new(name: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: payload.into(),
        }
    }

    /// Create new message from raw payload bytes
    ///
    /// # Errors
    ///
    /// Returns [`SerializationError::InvalidUtf8`] when the bytes are not valid
    /// UTF-8, since the wire encoding carries the payload as text.
    pub fn from_bytes(name: impl Into<String>, payload: &[u8]) -> Result<Self, SerializationError> {
        let payload = std::str::from_utf8(payload).map_err(|_| SerializationError::InvalidUtf8)?;
        Ok(Self::new(name, payload))
    }

    /// Logical name of the message
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Payload of the message
    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub(crate) fn into_message(self, id: MessageId) -> Message {
        Message {
            id,
            name: self.name,
            payload: self.payload,
        }
    }
}

/// The unit of work carried through the queue
///
/// Wire format is a JSON object with exactly three fields: `id`, `name` and
/// `payload`. Unknown fields are ignored when decoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    id: MessageId,
    name: String,
    payload: String,
}

impl Message {
    /// Create a message with an explicit identity
    ///
    /// Producers never need this: identities are assigned by
    /// [`Queue::add_message`](crate::client::Queue::add_message). It exists for
    /// consumers that want to build messages for their own tests.
    pub fn new(id: MessageId, name: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            payload: payload.into(),
        }
    }

    pub fn id(&self) -> &MessageId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Encode the message to its wire representation
    pub fn encode(&self) -> Result<Bytes, SerializationError> {
        let json = serde_json::to_vec(self)?;
        Ok(Bytes::from(json))
    }

    /// Decode a message from its wire representation
    pub fn decode(bytes: &[u8]) -> Result<Self, SerializationError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

// ============================================================================
// Store-level Delivery Types
// ============================================================================

/// One occurrence of a stored entry being handed to a consumer
#[derive(Debug, Clone)]
pub struct Delivery {
    pub receipt_handle: ReceiptHandle,
    pub body: Bytes,
    pub delivery_count: u32,
    pub enqueued_at: Timestamp,
    pub delivered_at: Timestamp,
}

/// Opaque token for acknowledging or rejecting a delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptHandle {
    handle: String,
    queue: QueueName,
    consumer: String,
    provider_type: ProviderType,
}

impl ReceiptHandle {
    /// Create new receipt handle
    pub fn new(
        handle: String,
        queue: QueueName,
        consumer: String,
        provider_type: ProviderType,
    ) -> Self {
        Self {
            handle,
            queue,
            consumer,
            provider_type,
        }
    }

    /// Get handle string
    pub fn handle(&self) -> &str {
        &self.handle
    }

    /// Queue the delivery came from
    pub fn queue(&self) -> &QueueName {
        &self.queue
    }

    /// Consumer tag that owns the delivery
    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Get provider type
    pub fn provider_type(&self) -> ProviderType {
        self.provider_type
    }
}

impl std::fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.queue, self.handle)
    }
}

/// Result of rejecting a delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectOutcome {
    /// Entry is back in the ready set and becomes deliverable at `available_at`
    Requeued { available_at: Timestamp },
    /// Entry exhausted its deliveries and moved to the dead-letter set
    DeadLettered,
}

/// Entry counts for a single queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub ready: usize,
    pub unacked: usize,
    pub dead_lettered: usize,
}

impl QueueStats {
    /// Entries that still await successful processing
    pub fn pending(&self) -> usize {
        self.ready + self.unacked
    }
}

/// Custom serialization for Bytes
pub(crate) mod bytes_serde {
    use base64::{engine::general_purpose, Engine as _};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let encoded = general_purpose::STANDARD.encode(bytes);
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let decoded = general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)?;
        Ok(Bytes::from(decoded))
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
