//! # Queue Controller
//!
//! Owns the transport side of the engine: declares the four queues, polls
//! the command queue, fans deliveries out to the handler under a
//! concurrency bound, and settles each delivery according to the handler's
//! report. Disposition is decided purely by the outcome kind; the
//! controller never inspects instructions.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::EngineConfig;
use crate::messaging::errors::MessagingError;
use crate::messaging::message::ErrorRecord;
use crate::messaging::traits::MessageQueueService;
use crate::orchestration::handler::{DeliveryHandler, HandlerReport};

const RECEIVE_BATCH: usize = 10;
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Queue names and limits, carved out of the engine configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub command_queue: String,
    pub completion_queues: Vec<String>,
    pub error_queue: String,
    pub status_queue: String,
    pub max_concurrency: usize,
}

impl From<&EngineConfig> for ControllerConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            command_queue: config.command_queue.clone(),
            completion_queues: config.completion_queues.clone(),
            error_queue: config.error_queue.clone(),
            status_queue: config.status_queue.clone(),
            max_concurrency: config.queue_max_concurrency,
        }
    }
}

/// Drives deliveries from the command queue through the handler.
pub struct QueueController<Q: MessageQueueService> {
    queue: Arc<Q>,
    handler: Arc<DeliveryHandler>,
    config: ControllerConfig,
    semaphore: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl<Q: MessageQueueService> QueueController<Q> {
    pub fn new(queue: Arc<Q>, handler: DeliveryHandler, config: ControllerConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        Self {
            queue,
            handler: Arc::new(handler),
            config,
            semaphore,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops the poll loop when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Declare all engine queues. Failures are logged, not fatal; a
    /// missing queue surfaces again on first use.
    pub async fn initialize_queues(&self) {
        let mut names = vec![
            self.config.command_queue.as_str(),
            self.config.error_queue.as_str(),
            self.config.status_queue.as_str(),
        ];
        names.extend(self.config.completion_queues.iter().map(|q| q.as_str()));

        for name in names {
            match self.queue.ensure_queue(name).await {
                Ok(()) => debug!(queue = name, "Queue ready"),
                Err(err) => warn!(queue = name, error = %err, "Queue declaration failed"),
            }
        }
    }

    /// Poll the command queue until shutdown. Each delivery runs on its
    /// own task under the controller's concurrency bound.
    #[instrument(skip_all, fields(provider = self.queue.provider_name()))]
    pub async fn run(&self) {
        self.initialize_queues().await;
        info!(
            queue = %self.config.command_queue,
            max_concurrency = self.config.max_concurrency,
            "Queue controller started"
        );

        loop {
            let received = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                received = self.queue.receive_messages(
                    &self.config.command_queue,
                    RECEIVE_BATCH,
                    VISIBILITY_TIMEOUT,
                ) => received,
            };

            let messages = match received {
                Ok(messages) => messages,
                Err(err) => {
                    error!(error = %err, "Receive from command queue failed");
                    tokio::time::sleep(POLL_INTERVAL).await;
                    continue;
                }
            };

            if messages.is_empty() {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                }
                continue;
            }

            for message in messages {
                let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                let queue = Arc::clone(&self.queue);
                let handler = Arc::clone(&self.handler);
                let config = self.config.clone();

                tokio::spawn(async move {
                    let _permit = permit;
                    process_delivery(queue, handler, config, message).await;
                });
            }
        }

        info!("Queue controller stopped");
    }
}

/// Handle one delivery and settle it.
async fn process_delivery<Q: MessageQueueService>(
    queue: Arc<Q>,
    handler: Arc<DeliveryHandler>,
    config: ControllerConfig,
    message: crate::messaging::traits::ReceivedMessage,
) {
    let report = handler.handle(&message.payload, message.headers).await;

    publish_notifications(&queue, &config, &report).await;

    // Teardown and the outbound envelope must be durable before the
    // inbound delivery is released; publish failure leaves the message to
    // redeliver, and terminal redeliveries re-emit their teardown.
    if let Some(teardown) = &report.teardown {
        for completion_queue in &config.completion_queues {
            if let Err(err) = queue
                .send_message(completion_queue, teardown, Default::default())
                .await
            {
                error!(
                    queue = %completion_queue,
                    error = %err,
                    "Teardown publish failed, delivery will retry"
                );
                nack_for_retry(&queue, &config.command_queue, &message.receipt).await;
                return;
            }
        }
    }

    if let Some(envelope) = &report.outbound {
        if let Err(err) = publish_envelope(&queue, &config.command_queue, envelope).await {
            error!(error = %err, "Failed to republish job, delivery will retry");
            nack_for_retry(&queue, &config.command_queue, &message.receipt).await;
            return;
        }
    }

    if let Err(err) = queue
        .ack_message(&config.command_queue, &message.receipt)
        .await
    {
        warn!(error = %err, "Ack failed, delivery may reprocess");
    }
}

async fn nack_for_retry<Q: MessageQueueService>(
    queue: &Arc<Q>,
    command_queue: &str,
    receipt: &crate::messaging::traits::ReceiptHandle,
) {
    if let Err(err) = queue.nack_message(command_queue, receipt, true).await {
        error!(error = %err, "Nack failed after publish failure");
    }
}

async fn publish_envelope<Q: MessageQueueService>(
    queue: &Arc<Q>,
    command_queue: &str,
    envelope: &crate::messaging::message::DeliveryEnvelope,
) -> Result<(), MessagingError> {
    let payload = serde_json::to_vec(&envelope.instructions)
        .map_err(|e| MessagingError::message_serialization(e.to_string()))?;
    queue
        .send_bytes(command_queue, &payload, envelope.headers)
        .await?;
    Ok(())
}

/// Status and error-record publications. Best-effort: a lost
/// notification never blocks the delivery from settling.
async fn publish_notifications<Q: MessageQueueService>(
    queue: &Arc<Q>,
    config: &ControllerConfig,
    report: &HandlerReport,
) {
    if let Err(err) = queue
        .send_message(&config.status_queue, &report.status, Default::default())
        .await
    {
        warn!(error = %err, "Status publish failed");
    }

    if report.outcome.is_fatal() {
        let record = ErrorRecord::from_outcome(Some(report.status.id), &report.outcome);
        if let Err(err) = queue
            .send_message(&config.error_queue, &record, Default::default())
            .await
        {
            warn!(error = %err, "Error record publish failed");
        }
    }
}
