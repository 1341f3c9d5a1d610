//! # Messaging Service Traits
//!
//! Provider-agnostic transport contract. The queue controller is written
//! against [`MessageQueueService`]; RabbitMQ and in-memory implementations
//! live in sibling modules.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::messaging::errors::MessagingError;
use crate::messaging::message::MessageHeaders;

/// Unique identifier assigned to a published message by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for MessageId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Handle for acknowledging a received message; format is provider-specific
/// (AMQP delivery tag, in-memory counter).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptHandle(pub String);

impl ReceiptHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_u64(&self) -> Option<u64> {
        self.0.parse().ok()
    }
}

impl std::fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ReceiptHandle {
    fn from(tag: u64) -> Self {
        Self(tag.to_string())
    }
}

/// A delivery pulled off a queue: raw body plus headers. Deserialization is
/// deliberately left to the consumer so malformed bodies reach the handler
/// (which owns the malformed-input policy) instead of failing in transport.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub receipt: ReceiptHandle,
    pub payload: Vec<u8>,
    pub headers: MessageHeaders,
    pub enqueued_at: DateTime<Utc>,
    /// How many times the provider believes this delivery has been handed out
    pub receive_count: u32,
}

///// Core transport trait: queue lifecycle, publish with headers, polling
/// receive, and ack/nack.
#[async_trait]
pub trait MessageQueueService: Send + Sync + 'static {
    /// Create a queue if it doesn't exist. Must be idempotent.
    async fn ensure_queue(&self, queue_name: &str) -> Result<(), MessagingError>;

    /// Publish raw bytes with headers. Returns the provider's message ID.
    async fn send_bytes(
        &self,
        queue_name: &str,
        payload: &[u8],
        headers: MessageHeaders,
    ) -> Result<MessageId, MessagingError>;

    /// Serialize and publish a message with headers.
    async fn send_message<T: serde::Serialize + Send + Sync>(
        &self,
        queue_name: &str,
        message: &T,
        headers: MessageHeaders,
    ) -> Result<MessageId, MessagingError> {
        let payload = serde_json::to_vec(message)
            .map_err(|e| MessagingError::message_serialization(e.to_string()))?;
        self.send_bytes(queue_name, &payload, headers).await
    }

    /// Receive up to `max_messages`, invisible to other consumers for
    /// `visibility_timeout` (providers without a native timeout approximate
    /// with ack discipline).
    async fn receive_messages(
        &self,
        queue_name: &str,
        max_messages: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<ReceivedMessage>, MessagingError>;

    /// Acknowledge successful processing (delete the message).
    async fn ack_message(
        &self,
        queue_name: &str,
        receipt: &ReceiptHandle,
    ) -> Result<(), MessagingError>;

    /// Negative acknowledge; `requeue` returns the message to the queue,
    /// otherwise it moves to the provider's dead-letter destination.
    async fn nack_message(
        &self,
        queue_name: &str,
        receipt: &ReceiptHandle,
        requeue: bool,
    ) -> Result<(), MessagingError>;

    /// Verify the backend is reachable.
    async fn health_check(&self) -> Result<bool, MessagingError>;

    /// Provider name for logging/metrics.
    fn provider_name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receipt_handle_roundtrip() {
        let handle = ReceiptHandle::from(42u64);
        assert_eq!(handle.as_str(), "42");
        assert_eq!(handle.as_u64(), Some(42));

        let bogus = ReceiptHandle("not-a-tag".to_string());
        assert_eq!(bogus.as_u64(), None);
    }

    #[test]
    fn test_message_id_display() {
        let id = MessageId::from(7u64);
        assert_eq!(format!("{id}"), "7");
    }
}
