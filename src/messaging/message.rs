//! # Message Structures
//!
//! Envelope and notification shapes for the four engine queues. The
//! envelope pairs a serialized `Instructions` body with the two transport
//! headers whose propagation rules drive the retry machinery: `retryCount`
//! (reset on round advance, carried through partial retry, incremented on
//! kickback) and `x-delay` (set only on Delayed outcomes).

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::messaging::errors::{MessagingError, MessagingResult};
use crate::orchestration::instructions::Instructions;
use crate::orchestration::outcome::Outcome;

/// Transport headers attached to every delivery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageHeaders {
    /// Whole-round kickback counter; present on every message
    pub retry_count: i64,
    /// Redelivery delay in milliseconds, set only for delayed polls
    pub delay_ms: Option<i64>,
}

/// A new outbound message: the next job state plus its headers.
///
/// Produced by the delivery handler, published by the queue controller.
/// Each constructor encodes one header-propagation rule.
#[derive(Debug, Clone)]
pub struct DeliveryEnvelope {
    pub instructions: Instructions,
    pub headers: MessageHeaders,
}

impl DeliveryEnvelope {
    /// Round advance: next round, retry counter reset to zero.
    pub fn advanced(instructions: Instructions) -> Self {
        Self {
            instructions,
            headers: MessageHeaders::default(),
        }
    }

    /// Partial retry: narrowed round at the same cursor, inbound retry
    /// counter carried through unchanged.
    pub fn narrowed(instructions: Instructions, inbound: MessageHeaders) -> Self {
        Self {
            instructions,
            headers: MessageHeaders {
                retry_count: inbound.retry_count,
                delay_ms: None,
            },
        }
    }

    /// Whole-round kickback: same body, retry counter incremented. Errors
    /// once the incremented counter exceeds the configured maximum.
    pub fn kickback(
        instructions: Instructions,
        inbound: MessageHeaders,
        max_retries: i64,
    ) -> MessagingResult<Self> {
        let retry_count = inbound.retry_count + 1;
        if retry_count > max_retries {
            return Err(MessagingError::retries_exhausted(retry_count, max_retries));
        }
        Ok(Self {
            instructions,
            headers: MessageHeaders {
                retry_count,
                delay_ms: None,
            },
        })
    }

    /// Delayed poll: same round, same retry counter, `x-delay` set so the
    /// transport redelivers after the wait instead of busy-looping.
    pub fn delayed(instructions: Instructions, inbound: MessageHeaders, delay: Duration) -> Self {
        Self {
            instructions,
            headers: MessageHeaders {
                retry_count: inbound.retry_count,
                delay_ms: Some(delay.as_millis() as i64),
            },
        }
    }
}

/// Progress report emitted on every handler invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusMessage {
    pub id: Uuid,
    pub finished: bool,
    #[serde(rename = "stepsLeft")]
    pub steps_left: usize,
    pub message: String,
}

/// Destroy-biome notice keyed by job ID, published on AllDone and Fatal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeardownMessage {
    pub id: Uuid,
    #[serde(rename = "orgID")]
    pub org_id: Uuid,
    #[serde(rename = "definitionID")]
    pub definition_id: Uuid,
}

impl TeardownMessage {
    pub fn for_job(instructions: &Instructions) -> Self {
        Self {
            id: instructions.id,
            org_id: instructions.org_id,
            definition_id: instructions.definition_id,
        }
    }
}

/// Structured serialization of a Fatal outcome for operator visibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: Option<Uuid>,
    pub kind: String,
    pub error: String,
    pub metadata: HashMap<String, serde_json::Value>,
    pub provenance: String,
    pub occurred_at: chrono::DateTime<chrono::Utc>,
}

impl ErrorRecord {
    pub fn from_outcome(job_id: Option<Uuid>, outcome: &Outcome) -> Self {
        Self {
            id: job_id,
            kind: format!("{:?}", outcome.kind).to_lowercase(),
            error: outcome.error_message().to_string(),
            metadata: outcome.metadata.clone(),
            provenance: outcome.provenance.clone(),
            occurred_at: chrono::Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Instructions {
        Instructions::new(Uuid::new_v4(), Uuid::new_v4(), vec![vec![]])
    }

    #[test]
    fn test_advance_resets_retry_count() {
        let envelope = DeliveryEnvelope::advanced(job());
        assert_eq!(envelope.headers.retry_count, 0);
        assert_eq!(envelope.headers.delay_ms, None);
    }

    #[test]
    fn test_narrow_carries_retry_count() {
        let inbound = MessageHeaders {
            retry_count: 2,
            delay_ms: Some(1000),
        };
        let envelope = DeliveryEnvelope::narrowed(job(), inbound);
        assert_eq!(envelope.headers.retry_count, 2);
        // Delay never survives into a retry message.
        assert_eq!(envelope.headers.delay_ms, None);
    }

    #[test]
    fn test_kickback_increments_until_exhausted() {
        let mut headers = MessageHeaders::default();
        for expected in 1..=3 {
            let envelope =
                DeliveryEnvelope::kickback(job(), headers, 3).expect("within retry budget");
            assert_eq!(envelope.headers.retry_count, expected);
            headers = envelope.headers;
        }

        let exhausted = DeliveryEnvelope::kickback(job(), headers, 3);
        assert!(matches!(
            exhausted,
            Err(MessagingError::RetriesExhausted {
                retry_count: 4,
                max_retries: 3
            })
        ));
    }

    #[test]
    fn test_delayed_sets_header() {
        let envelope =
            DeliveryEnvelope::delayed(job(), MessageHeaders::default(), Duration::from_secs(3));
        assert_eq!(envelope.headers.delay_ms, Some(3000));
    }

    #[test]
    fn test_error_record_captures_outcome() {
        let outcome = Outcome::fatal("handler", "disk full")
            .with_meta("orgID", serde_json::json!("abc"));
        let record = ErrorRecord::from_outcome(None, &outcome);

        assert_eq!(record.kind, "fatal");
        assert_eq!(record.error, "disk full");
        assert_eq!(record.provenance, "handler");
        assert_eq!(record.metadata["orgID"], serde_json::json!("abc"));
    }
}
