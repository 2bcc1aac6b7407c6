//! # Publish Capability
//!
//! The slice of the pub/sub transport the core depends on. The MQTT
//! connection implements it for production; [`MemoryPublisher`] records
//! messages in memory for tests.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::core::error::PublishError;

/// Delivery guarantee requested for a single message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryQos {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

/// Topic-addressed, at-least-once publishing.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: DeliveryQos, retain: bool) -> Result<(), PublishError>;
}

/// A message captured by [`MemoryPublisher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: DeliveryQos,
    pub retain: bool,
}

/// Keeps every published message in memory. Can be switched into a failing
/// mode to exercise error paths.
#[derive(Debug, Default)]
pub struct MemoryPublisher {
    messages: Mutex<Vec<PublishedMessage>>,
    failing: Mutex<Option<String>>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent publish fail with `reason`; `None` restores success.
    pub fn fail_with(&self, reason: Option<&str>) {
        *self.failing.lock().unwrap_or_else(|p| p.into_inner()) = reason.map(str::to_string);
    }

    pub fn messages(&self) -> Vec<PublishedMessage> {
        self.messages.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn messages_on(&self, topic: &str) -> Vec<PublishedMessage> {
        self.messages().into_iter().filter(|m| m.topic == topic).collect()
    }
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: DeliveryQos, retain: bool) -> Result<(), PublishError> {
        if let Some(reason) = self.failing.lock().unwrap_or_else(|p| p.into_inner()).as_deref() {
            return Err(PublishError::new(topic, reason));
        }
        self.messages
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(PublishedMessage {
                topic: topic.to_string(),
                payload,
                qos,
                retain,
            });
        Ok(())
    }
}
