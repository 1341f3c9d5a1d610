//! # Messaging Layer
//!
//! Provider-agnostic message transport for the round engine. The
//! orchestration code only sees [`MessageQueueService`]; the concrete
//! provider (RabbitMQ in production, in-memory for tests) is chosen at
//! startup.
//!
//! Message envelopes ([`DeliveryEnvelope`], [`StatusMessage`],
//! [`TeardownMessage`], [`ErrorRecord`]) live here too, since their header
//! propagation rules are part of the transport contract.

pub mod errors;
pub mod in_memory;
pub mod message;
pub mod rabbitmq;
pub mod traits;

pub use errors::{MessagingError, MessagingResult};
pub use in_memory::InMemoryQueueService;
pub use message::{DeliveryEnvelope, ErrorRecord, MessageHeaders, StatusMessage, TeardownMessage};
pub use rabbitmq::{RabbitMqConfig, RabbitMqQueueService};
pub use traits::{MessageId, MessageQueueService, ReceiptHandle, ReceivedMessage};
