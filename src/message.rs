use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Delivery attempts so far, absent means zero
pub const HEADER_RETRY_COUNT: &str = "x-retry-count";
/// Ladder level the message was last republished with
pub const HEADER_DELAY_LEVEL: &str = "x-delay-level";
/// Topic a delay-level record is re-delivered to after its delay elapses
pub const HEADER_RESEND_TOPIC: &str = "x-resend-topic";

/// Original placement of a retried message, stamped on the first republish
/// and never rewritten afterwards.
pub const HEADER_REAL_TOPIC: &str = "x-real-topic";
pub const HEADER_REAL_PARTITION: &str = "x-real-partition";
pub const HEADER_REAL_OFFSET: &str = "x-real-offset";
pub const HEADER_REAL_STORE_TIME: &str = "x-real-store-time";

/// A message consumed from or published to the broker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Message ID
    pub id: String,

    /// Topic the message belongs to
    pub topic: String,

    /// Partition ID
    pub partition: u32,

    /// Message offset within partition
    pub offset: u64,

    /// Message key for partitioning
    pub key: Option<Bytes>,

    /// Message payload
    pub payload: Bytes,

    /// Message headers/properties
    pub headers: HashMap<String, String>,

    /// Broker store timestamp in milliseconds
    pub timestamp: u64,

    /// Payload plus key size in bytes
    pub size: usize,
}

/// Builder for creating messages
#[derive(Debug, Default)]
pub struct MessageBuilder {
    id: Option<String>,
    topic: Option<String>,
    partition: Option<u32>,
    offset: Option<u64>,
    key: Option<Bytes>,
    payload: Option<Bytes>,
    headers: HashMap<String, String>,
}

impl MessageBuilder {
    /// Create a new message builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set message ID
    pub fn id<T: Into<String>>(mut self, id: T) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set topic
    pub fn topic<T: Into<String>>(mut self, topic: T) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Set partition
    pub fn partition(mut self, partition: u32) -> Self {
        self.partition = Some(partition);
        self
    }

    /// Set the partition offset
    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Set message key
    pub fn key<T: Into<Bytes>>(mut self, key: T) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Set message payload
    pub fn payload<T: Into<Bytes>>(mut self, payload: T) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// Add a header
    pub fn header<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Build the message
    pub fn build(self) -> Result<Message, String> {
        let payload = self.payload.ok_or("Message payload is required")?;
        let topic = self.topic.ok_or("Message topic is required")?;

        let id = self.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let size = payload.len() + self.key.as_ref().map_or(0, |k| k.len());

        Ok(Message {
            id,
            topic,
            partition: self.partition.unwrap_or(0),
            offset: self.offset.unwrap_or(0),
            key: self.key,
            payload,
            headers: self.headers,
            timestamp,
            size,
        })
    }
}

impl Message {
    /// Create a new message builder
    pub fn builder() -> MessageBuilder {
        MessageBuilder::new()
    }

    /// Get header value
    pub fn get_header(&self, key: &str) -> Option<&String> {
        self.headers.get(key)
    }

    /// Set a header, replacing any previous value
    pub fn set_header<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        self.headers.insert(key.into(), value.into());
    }

    fn header_u64(&self, key: &str) -> Option<u64> {
        self.headers.get(key).and_then(|v| v.parse().ok())
    }

    /// Number of delivery attempts already made for this message
    pub fn retry_count(&self) -> u32 {
        self.header_u64(HEADER_RETRY_COUNT).unwrap_or(0) as u32
    }

    /// Bump the retry count by one
    pub fn increment_retry_count(&mut self) {
        let next = self.retry_count() + 1;
        self.set_header(HEADER_RETRY_COUNT, next.to_string());
    }

    /// Ladder level this message was last republished with
    pub fn delay_level(&self) -> u32 {
        self.header_u64(HEADER_DELAY_LEVEL).unwrap_or(0) as u32
    }

    /// Set the ladder level for the next republish
    pub fn set_delay_level(&mut self, level: u32) {
        self.set_header(HEADER_DELAY_LEVEL, level.to_string());
    }

    /// Topic the message originally landed on, when it has been retried
    pub fn real_topic(&self) -> Option<&String> {
        self.get_header(HEADER_REAL_TOPIC)
    }

    /// Record the original placement. Only the first call writes; retries
    /// of a retry keep pointing at the original message.
    pub fn stamp_real_placement(&mut self) {
        if self.headers.contains_key(HEADER_REAL_TOPIC) {
            return;
        }
        let (topic, partition, offset, timestamp) =
            (self.topic.clone(), self.partition, self.offset, self.timestamp);
        self.set_header(HEADER_REAL_TOPIC, topic);
        self.set_header(HEADER_REAL_PARTITION, partition.to_string());
        self.set_header(HEADER_REAL_OFFSET, offset.to_string());
        self.set_header(HEADER_REAL_STORE_TIME, timestamp.to_string());
    }

    /// Rebuild the message a retry-topic record was created from, so the
    /// handler sees the original topic and partition. The returned clone is
    /// for the handler only; acknowledgment still uses `self`'s placement.
    pub fn rehydrate(&self) -> Message {
        let mut msg = self.clone();
        if let Some(topic) = self.get_header(HEADER_REAL_TOPIC) {
            msg.topic = topic.clone();
        }
        if let Some(partition) = self.header_u64(HEADER_REAL_PARTITION) {
            msg.partition = partition as u32;
        }
        msg
    }

    /// Get message payload as string (UTF-8)
    pub fn payload_as_string(&self) -> Result<String, std::string::FromUtf8Error> {
        String::from_utf8(self.payload.to_vec())
    }

    /// Get message as JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Create message from JSON string
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(topic: &str, partition: u32, offset: u64) -> Message {
        Message::builder()
            .topic(topic)
            .partition(partition)
            .offset(offset)
            .payload("payload")
            .build()
            .unwrap()
    }

    #[test]
    fn retry_count_roundtrip() {
        let mut m = msg("orders", 1, 42);
        assert_eq!(m.retry_count(), 0);

        m.increment_retry_count();
        m.increment_retry_count();
        assert_eq!(m.retry_count(), 2);
    }

    #[test]
    fn real_placement_is_stamped_once() {
        let mut m = msg("orders", 1, 42);
        m.stamp_real_placement();

        // Simulate the message travelling through a retry topic.
        m.topic = "%RETRY%group".to_string();
        m.partition = 0;
        m.offset = 7;
        m.stamp_real_placement();

        assert_eq!(m.real_topic().unwrap(), "orders");
        assert_eq!(m.get_header(HEADER_REAL_PARTITION).unwrap(), "1");
        assert_eq!(m.get_header(HEADER_REAL_OFFSET).unwrap(), "42");
    }

    #[test]
    fn rehydrate_restores_original_topic_and_partition() {
        let mut m = msg("orders", 3, 42);
        m.stamp_real_placement();
        m.topic = "%RETRY%group".to_string();
        m.partition = 0;
        m.offset = 7;

        let restored = m.rehydrate();
        assert_eq!(restored.topic, "orders");
        assert_eq!(restored.partition, 3);
        // The retry-topic offset is what gets acknowledged.
        assert_eq!(restored.offset, 7);
    }

    #[test]
    fn builder_requires_topic_and_payload() {
        assert!(MessageBuilder::new().topic("t").build().is_err());
        assert!(MessageBuilder::new().payload("p").build().is_err());
        assert!(MessageBuilder::new().topic("t").payload("p").build().is_ok());
    }
}
