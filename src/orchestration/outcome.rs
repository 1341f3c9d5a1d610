//! # Outcome Taxonomy
//!
//! The sum-typed result value every layer uses to report what happened and
//! what should happen next. Every downstream decision — retry, dead-letter,
//! teardown, continue — is a pure function of an outcome's kind, so the
//! taxonomy is closed and its aggregation precedence fixed (see the
//! executor's `aggregate`).

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Closed set of outcome kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    /// The work succeeded
    Success,
    /// The whole job is finished
    AllDone,
    /// Unrecoverable; triggers teardown
    Fatal,
    /// Failed but worth retrying later
    Retryable,
    /// Explicit requeue request (round advance, partial retry, kickback)
    Requeue,
    /// Deliberate terminal state; acknowledged without success or failure
    Trap,
    /// Not worth retrying, not worth tearing down (e.g. empty input)
    Ignore,
    /// Wait-and-poll condition; redeliver after the attached delay
    Delayed,
}

/// Classification of an attached error, decided at the boundary that
/// produced it rather than inferred downstream from message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Temporary inability to reach a remote Docker daemon
    TransientConnection,
    /// The operation itself failed; retrying the command may help
    Business,
    /// Will never succeed if retried
    Permanent,
}

/// A tagged outcome with optional error, additive metadata, and provenance.
///
/// Transient: never persisted, only passed along a single processing path
/// and optionally serialized into a status or error-queue message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub kind: OutcomeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,
    /// Redelivery delay in milliseconds, meaningful only for `Delayed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Component that produced this outcome
    pub provenance: String,
}

impl Outcome {
    fn bare(kind: OutcomeKind, provenance: &str) -> Self {
        Self {
            kind,
            error: None,
            error_class: None,
            delay_ms: None,
            metadata: HashMap::new(),
            provenance: provenance.to_string(),
        }
    }

    pub fn success(provenance: &str) -> Self {
        Self::bare(OutcomeKind::Success, provenance)
    }

    pub fn all_done(provenance: &str) -> Self {
        Self::bare(OutcomeKind::AllDone, provenance)
    }

    pub fn fatal(provenance: &str, error: impl Into<String>) -> Self {
        let mut outcome = Self::bare(OutcomeKind::Fatal, provenance);
        outcome.error = Some(error.into());
        outcome.error_class = Some(ErrorClass::Permanent);
        outcome
    }

    pub fn retryable(provenance: &str, error: impl Into<String>) -> Self {
        let mut outcome = Self::bare(OutcomeKind::Retryable, provenance);
        outcome.error = Some(error.into());
        outcome.error_class = Some(ErrorClass::Business);
        outcome
    }

    /// Retryable failure explicitly classified as a transient inability to
    /// reach a Docker daemon. The executor retries these locally.
    pub fn transient_connection(provenance: &str, error: impl Into<String>) -> Self {
        let mut outcome = Self::bare(OutcomeKind::Retryable, provenance);
        outcome.error = Some(error.into());
        outcome.error_class = Some(ErrorClass::TransientConnection);
        outcome
    }

    pub fn requeue(provenance: &str) -> Self {
        Self::bare(OutcomeKind::Requeue, provenance)
    }

    pub fn trap(provenance: &str) -> Self {
        Self::bare(OutcomeKind::Trap, provenance)
    }

    pub fn ignore(provenance: &str) -> Self {
        Self::bare(OutcomeKind::Ignore, provenance)
    }

    pub fn delayed(provenance: &str, delay: Duration) -> Self {
        let mut outcome = Self::bare(OutcomeKind::Delayed, provenance);
        outcome.delay_ms = Some(delay.as_millis() as i64);
        outcome
    }

    /// True iff no error is attached. Covers Success, AllDone, and the
    /// "too soon" Delayed condition.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// True iff an error is attached and it is non-retryable.
    pub fn is_fatal(&self) -> bool {
        self.error.is_some() && self.kind == OutcomeKind::Fatal
    }

    /// True iff the outcome should be retried later via the queue.
    pub fn is_requeue(&self) -> bool {
        matches!(self.kind, OutcomeKind::Retryable | OutcomeKind::Requeue)
    }

    pub fn is_all_done(&self) -> bool {
        self.kind == OutcomeKind::AllDone
    }

    pub fn is_trap(&self) -> bool {
        self.kind == OutcomeKind::Trap
    }

    pub fn is_ignore(&self) -> bool {
        self.kind == OutcomeKind::Ignore
    }

    pub fn is_delayed(&self) -> bool {
        self.kind == OutcomeKind::Delayed && self.delay_ms.unwrap_or(0) > 0
    }

    /// True iff the attached error is a transient daemon-connectivity fault.
    pub fn is_transient_connection(&self) -> bool {
        self.is_requeue() && self.error_class == Some(ErrorClass::TransientConnection)
    }

    pub fn delay(&self) -> Option<Duration> {
        self.delay_ms
            .filter(|ms| *ms > 0)
            .map(|ms| Duration::from_millis(ms as u64))
    }

    pub fn error_message(&self) -> &str {
        self.error.as_deref().unwrap_or("")
    }

    /// Escalate to Fatal, keeping metadata and provenance. If no new error
    /// is given, the existing error text (or a placeholder) is kept.
    pub fn into_fatal(mut self, error: Option<String>) -> Self {
        self.kind = OutcomeKind::Fatal;
        self.error_class = Some(ErrorClass::Permanent);
        self.error = error
            .or(self.error)
            .or_else(|| Some("unspecified fatal error".to_string()));
        self
    }

    /// Downgrade to Trap, keeping metadata and provenance. Used by debug
    /// mode to suppress teardown without losing diagnostic context.
    pub fn into_trap(mut self) -> Self {
        self.kind = OutcomeKind::Trap;
        self
    }

    /// Merge metadata additively. Existing keys are preserved unless the
    /// incoming map explicitly carries the same key.
    pub fn inject_meta(mut self, meta: HashMap<String, serde_json::Value>) -> Self {
        for (key, value) in meta {
            self.metadata.insert(key, value);
        }
        self
    }

    pub fn with_meta(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}
