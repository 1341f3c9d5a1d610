//! # Delivery Handler
//!
//! The state machine for one command-queue delivery. Pure with respect to
//! transport: it takes the raw body and headers, runs at most one round,
//! and reports what should happen next as data. Publishing, acking, and
//! queue wiring belong to the controller.
//!
//! Retry counter rules, per delivery:
//! - round advance resets it to zero
//! - partial retry (narrowed round) carries it unchanged
//! - whole-round kickback increments it; exceeding the budget is fatal
//!
//! Every invocation produces a status message, whatever the outcome.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::messaging::message::{
    DeliveryEnvelope, MessageHeaders, StatusMessage, TeardownMessage,
};
use crate::orchestration::executor::RoundExecutor;
use crate::orchestration::instructions::Instructions;
use crate::orchestration::outcome::Outcome;

const PROVENANCE: &str = "handler";

/// Tunables for delivery handling.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// Whole-round kickbacks allowed before the job is declared dead
    pub max_kickback_retries: i64,
    /// Pause before reprocessing a redelivered message
    pub redelivery_cooldown: Duration,
    /// Trap fatals instead of tearing the biome down, for postmortems
    pub debug_mode: bool,
}

impl From<&EngineConfig> for HandlerConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_kickback_retries: config.max_kickback_retries,
            redelivery_cooldown: config.redelivery_cooldown,
            debug_mode: config.debug_mode,
        }
    }
}

/// Everything the controller must do after one delivery, as data.
#[derive(Debug)]
pub struct HandlerReport {
    /// Drives the delivery disposition (ack, publish, teardown)
    pub outcome: Outcome,
    /// Next message for the command queue, if the job continues
    pub outbound: Option<DeliveryEnvelope>,
    /// Destroy notice for the completion queues, if the job ended
    pub teardown: Option<TeardownMessage>,
    /// Progress report, emitted on every invocation
    pub status: StatusMessage,
}

/// Processes one delivery end to end.
pub struct DeliveryHandler {
    executor: RoundExecutor,
    config: HandlerConfig,
}

impl DeliveryHandler {
    pub fn new(executor: RoundExecutor, config: HandlerConfig) -> Self {
        Self { executor, config }
    }

    #[instrument(skip_all, fields(retry_count = headers.retry_count))]
    pub async fn handle(&self, payload: &[u8], headers: MessageHeaders) -> HandlerReport {
        // Redeliveries back off briefly so a hot requeue loop cannot spin.
        if headers.retry_count > 0 {
            tokio::time::sleep(self.config.redelivery_cooldown).await;
        }

        let instructions: Instructions = match serde_json::from_slice(payload) {
            Ok(instructions) => instructions,
            Err(err) => return self.malformed_body(payload, &err),
        };

        if instructions.is_empty() {
            debug!(job_id = %instructions.id, "Delivery carries no work, ignoring");
            let outcome = Outcome::ignore(PROVENANCE);
            let status = status_for(&instructions, &outcome);
            return HandlerReport {
                outcome,
                outbound: None,
                teardown: None,
                status,
            };
        }

        if instructions.is_finished() {
            return self.already_finished(instructions);
        }

        let round = instructions.peek_round().unwrap_or_default().to_vec();
        info!(
            job_id = %instructions.id,
            round_size = round.len(),
            steps_left = instructions.steps_left(),
            "Executing round"
        );
        let outcome = self.executor.execute_round(&round).await;

        if outcome.is_delayed() {
            let delay = outcome.delay().unwrap_or(Duration::from_millis(1));
            let status = status_for(&instructions, &outcome);
            return HandlerReport {
                outbound: Some(DeliveryEnvelope::delayed(instructions, headers, delay)),
                teardown: None,
                status,
                outcome,
            };
        }

        if outcome.is_fatal() {
            return self.job_fatal(instructions, outcome);
        }

        if outcome.is_requeue() {
            return self.round_failed(instructions, headers, round.len(), outcome);
        }

        if outcome.is_trap() {
            let status = status_for(&instructions, &outcome);
            return HandlerReport {
                outcome,
                outbound: None,
                teardown: None,
                status,
            };
        }

        self.round_succeeded(instructions, outcome)
    }

    /// The body never parsed: declare the job dead with whatever identity
    /// can be salvaged so a teardown still reaches the completion queues.
    fn malformed_body(&self, payload: &[u8], err: &serde_json::Error) -> HandlerReport {
        warn!(error = %err, "Delivery body failed to parse");

        let salvaged: Option<serde_json::Value> = serde_json::from_slice(payload).ok();
        let field_uuid = |name: &str| -> Option<Uuid> {
            salvaged
                .as_ref()
                .and_then(|v| v.get(name))
                .and_then(|v| v.as_str())
                .and_then(|s| Uuid::parse_str(s).ok())
        };

        let job_id = field_uuid("id");
        let teardown = match (job_id, field_uuid("orgID"), field_uuid("definitionID")) {
            (Some(id), Some(org_id), Some(definition_id)) => Some(TeardownMessage {
                id,
                org_id,
                definition_id,
            }),
            _ => None,
        };

        let outcome = Outcome::fatal(PROVENANCE, format!("malformed delivery body: {err}"));
        let (outcome, teardown) = self.apply_debug_trap(outcome, teardown);

        let status = StatusMessage {
            id: job_id.unwrap_or_else(Uuid::nil),
            finished: outcome.is_fatal(),
            steps_left: 0,
            message: outcome.error_message().to_string(),
        };

        HandlerReport {
            outcome,
            outbound: None,
            teardown,
            status,
        }
    }

    /// Redelivery of a job whose rounds are all done. Nothing re-executes;
    /// the terminal disposition is repeated so the delivery settles.
    fn already_finished(&self, instructions: Instructions) -> HandlerReport {
        let (outcome, teardown) = if instructions.never_terminate {
            (Outcome::trap(PROVENANCE), None)
        } else {
            (
                Outcome::all_done(PROVENANCE),
                Some(TeardownMessage::for_job(&instructions)),
            )
        };
        debug!(job_id = %instructions.id, "Job already finished");
        let status = status_for(&instructions, &outcome);
        HandlerReport {
            outcome,
            outbound: None,
            teardown,
            status,
        }
    }

    fn round_succeeded(&self, instructions: Instructions, outcome: Outcome) -> HandlerReport {
        if instructions.on_final_round() {
            let finished = instructions.advance();
            return self.already_finished(finished);
        }

        let advanced = instructions.advance();
        let outcome = Outcome::requeue(outcome.provenance.as_str());
        let status = status_for(&advanced, &outcome);
        HandlerReport {
            outbound: Some(DeliveryEnvelope::advanced(advanced)),
            teardown: None,
            status,
            outcome,
        }
    }

    /// A retryable round: narrow to the failing commands when they are a
    /// strict subset, otherwise kick the whole round back.
    fn round_failed(
        &self,
        instructions: Instructions,
        headers: MessageHeaders,
        round_size: usize,
        outcome: Outcome,
    ) -> HandlerReport {
        let failed_ids = failed_command_ids(&outcome);

        if let Some(ids) = &failed_ids {
            if !ids.is_empty() && ids.len() < round_size {
                info!(
                    job_id = %instructions.id,
                    failed = ids.len(),
                    round_size,
                    "Partial failure, narrowing round"
                );
                let narrowed = instructions.narrow(ids);
                let status = status_for(&narrowed, &outcome);
                return HandlerReport {
                    outbound: Some(DeliveryEnvelope::narrowed(narrowed, headers)),
                    teardown: None,
                    status,
                    outcome,
                };
            }
        }

        match DeliveryEnvelope::kickback(
            instructions.clone(),
            headers,
            self.config.max_kickback_retries,
        ) {
            Ok(envelope) => {
                warn!(
                    job_id = %envelope.instructions.id,
                    retry_count = envelope.headers.retry_count,
                    error = outcome.error_message(),
                    "Round failed, kicking back"
                );
                let status = status_for(&envelope.instructions, &outcome);
                HandlerReport {
                    outbound: Some(envelope),
                    teardown: None,
                    status,
                    outcome,
                }
            }
            Err(exhausted) => {
                // Kickback budget spent: the round failure hardens into a
                // job failure.
                let fatal = outcome
                    .into_fatal(None)
                    .with_meta("secondary_error", serde_json::json!(exhausted.to_string()));
                self.job_fatal(instructions, fatal)
            }
        }
    }

    fn job_fatal(&self, instructions: Instructions, outcome: Outcome) -> HandlerReport {
        let fatal = outcome.inject_meta(identity_meta(&instructions));
        let teardown = Some(TeardownMessage::for_job(&instructions));
        let (outcome, teardown) = self.apply_debug_trap(fatal, teardown);

        let status = status_for(&instructions, &outcome);
        HandlerReport {
            outcome,
            outbound: None,
            teardown,
            status,
        }
    }

    /// In debug mode a fatal becomes a trap and the biome survives for
    /// inspection.
    fn apply_debug_trap(
        &self,
        outcome: Outcome,
        teardown: Option<TeardownMessage>,
    ) -> (Outcome, Option<TeardownMessage>) {
        if self.config.debug_mode && outcome.is_fatal() {
            warn!(
                error = outcome.error_message(),
                "Debug mode: trapping fatal outcome, biome left running"
            );
            (outcome.into_trap(), None)
        } else {
            (outcome, teardown)
        }
    }
}

fn status_for(instructions: &Instructions, outcome: &Outcome) -> StatusMessage {
    StatusMessage {
        id: instructions.id,
        finished: outcome.is_all_done() || outcome.is_fatal(),
        steps_left: instructions.steps_left(),
        message: outcome.error_message().to_string(),
    }
}

fn identity_meta(instructions: &Instructions) -> HashMap<String, serde_json::Value> {
    HashMap::from([
        (
            "orgID".to_string(),
            serde_json::json!(instructions.org_id.to_string()),
        ),
        (
            "testID".to_string(),
            serde_json::json!(instructions.id.to_string()),
        ),
        (
            "definitionID".to_string(),
            serde_json::json!(instructions.definition_id.to_string()),
        ),
    ])
}

/// Failing command IDs reported by the executor, if any parse.
fn failed_command_ids(outcome: &Outcome) -> Option<Vec<Uuid>> {
    let raw = outcome.metadata.get("failed")?;
    let ids: Vec<String> = serde_json::from_value(raw.clone()).ok()?;
    let parsed: Vec<Uuid> = ids
        .iter()
        .filter_map(|s| Uuid::parse_str(s).ok())
        .collect();
    if parsed.len() == ids.len() {
        Some(parsed)
    } else {
        None
    }
}
