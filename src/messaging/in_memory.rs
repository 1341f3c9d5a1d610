//! # In-Memory Queue Service
//!
//! Thread-safe in-memory transport for tests and development. Honors the
//! `x-delay` header through a visible-at timestamp and simulates visibility
//! timeouts the same way.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::messaging::errors::MessagingError;
use crate::messaging::message::MessageHeaders;
use crate::messaging::traits::{MessageId, MessageQueueService, ReceiptHandle, ReceivedMessage};

#[derive(Debug, Clone)]
struct StoredMessage {
    id: u64,
    payload: Vec<u8>,
    headers: MessageHeaders,
    enqueued_at: DateTime<Utc>,
    /// When the message becomes visible (None = visible now)
    visible_at: Option<DateTime<Utc>>,
    receive_count: u32,
}

#[derive(Debug, Default)]
struct InMemoryQueue {
    messages: VecDeque<StoredMessage>,
    dead_letters: Vec<StoredMessage>,
}

/// In-memory transport implementing the full [`MessageQueueService`] contract.
#[derive(Debug, Default)]
pub struct InMemoryQueueService {
    queues: RwLock<HashMap<String, InMemoryQueue>>,
    next_id: AtomicU64,
}

impl InMemoryQueueService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with pre-initialized queues.
    pub async fn with_queues(queue_names: &[&str]) -> Self {
        let service = Self::new();
        {
            let mut queues = service.queues.write().await;
            for name in queue_names {
                queues.insert(name.to_string(), InMemoryQueue::default());
            }
        }
        service
    }

    /// Number of messages currently stored in a queue (visible or not).
    pub async fn queue_length(&self, queue_name: &str) -> usize {
        let queues = self.queues.read().await;
        queues.get(queue_name).map(|q| q.messages.len()).unwrap_or(0)
    }

    /// Number of messages parked in a queue's dead-letter store.
    pub async fn dead_letter_count(&self, queue_name: &str) -> usize {
        let queues = self.queues.read().await;
        queues
            .get(queue_name)
            .map(|q| q.dead_letters.len())
            .unwrap_or(0)
    }

    /// Force every delayed/invisible message visible now. Test hook so
    /// delayed redelivery can be asserted without sleeping.
    pub async fn release_delays(&self, queue_name: &str) {
        let mut queues = self.queues.write().await;
        if let Some(queue) = queues.get_mut(queue_name) {
            for msg in &mut queue.messages {
                msg.visible_at = None;
            }
        }
    }
}

#[async_trait]
impl MessageQueueService for InMemoryQueueService {
    async fn ensure_queue(&self, queue_name: &str) -> Result<(), MessagingError> {
        let mut queues = self.queues.write().await;
        queues.entry(queue_name.to_string()).or_default();
        Ok(())
    }

    async fn send_bytes(
        &self,
        queue_name: &str,
        payload: &[u8],
        headers: MessageHeaders,
    ) -> Result<MessageId, MessagingError> {
        let mut queues = self.queues.write().await;
        let queue = queues
            .get_mut(queue_name)
            .ok_or_else(|| MessagingError::queue_not_found(queue_name))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now();
        let visible_at = headers
            .delay_ms
            .filter(|ms| *ms > 0)
            .map(|ms| now + chrono::Duration::milliseconds(ms));

        queue.messages.push_back(StoredMessage {
            id,
            payload: payload.to_vec(),
            headers,
            enqueued_at: now,
            visible_at,
            receive_count: 0,
        });

        Ok(MessageId::from(id))
    }

    async fn receive_messages(
        &self,
        queue_name: &str,
        max_messages: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<ReceivedMessage>, MessagingError> {
        let mut queues = self.queues.write().await;
        let queue = queues
            .get_mut(queue_name)
            .ok_or_else(|| MessagingError::queue_not_found(queue_name))?;

        let now = Utc::now();
        let invisible_until =
            now + chrono::Duration::milliseconds(visibility_timeout.as_millis() as i64);
        let mut received = Vec::new();

        for msg in queue.messages.iter_mut() {
            if received.len() >= max_messages {
                break;
            }
            let visible = msg.visible_at.map(|at| at <= now).unwrap_or(true);
            if !visible {
                continue;
            }
            msg.visible_at = Some(invisible_until);
            msg.receive_count += 1;
            received.push(ReceivedMessage {
                receipt: ReceiptHandle::from(msg.id),
                payload: msg.payload.clone(),
                headers: msg.headers,
                enqueued_at: msg.enqueued_at,
                receive_count: msg.receive_count,
            });
        }

        Ok(received)
    }

    async fn ack_message(
        &self,
        queue_name: &str,
        receipt: &ReceiptHandle,
    ) -> Result<(), MessagingError> {
        let id = receipt
            .as_u64()
            .ok_or_else(|| MessagingError::invalid_receipt_handle(receipt.as_str()))?;

        let mut queues = self.queues.write().await;
        let queue = queues
            .get_mut(queue_name)
            .ok_or_else(|| MessagingError::queue_not_found(queue_name))?;

        queue.messages.retain(|msg| msg.id != id);
        Ok(())
    }

    async fn nack_message(
        &self,
        queue_name: &str,
        receipt: &ReceiptHandle,
        requeue: bool,
    ) -> Result<(), MessagingError> {
        let id = receipt
            .as_u64()
            .ok_or_else(|| MessagingError::invalid_receipt_handle(receipt.as_str()))?;

        let mut queues = self.queues.write().await;
        let queue = queues
            .get_mut(queue_name)
            .ok_or_else(|| MessagingError::queue_not_found(queue_name))?;

        if requeue {
            if let Some(msg) = queue.messages.iter_mut().find(|m| m.id == id) {
                msg.visible_at = None;
            }
        } else if let Some(pos) = queue.messages.iter().position(|m| m.id == id) {
            let msg = queue
                .messages
                .remove(pos)
                .ok_or_else(|| MessagingError::internal("message vanished during nack"))?;
            queue.dead_letters.push(msg);
        }

        Ok(())
    }

    async fn health_check(&self) -> Result<bool, MessagingError> {
        Ok(true)
    }

    fn provider_name(&self) -> &'static str {
        "in_memory"
    }
}
