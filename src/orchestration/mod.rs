//! # Orchestration
//!
//! The round engine proper: outcome taxonomy, job instructions, the
//! concurrent round executor, the per-delivery state machine, and the
//! queue controller that ties them to the transport.
//!
//! No orchestration state survives outside a message. The instructions a
//! delivery carries are the whole truth about its job; crashes lose at
//! most one in-flight delivery, which the broker redelivers.

pub mod controller;
pub mod executor;
pub mod handler;
pub mod instructions;
pub mod outcome;

pub use controller::{ControllerConfig, QueueController};
pub use executor::{ExecutorConfig, RoundExecutor};
pub use handler::{DeliveryHandler, HandlerConfig, HandlerReport};
pub use instructions::{gate_commands, CompletedSetLookup, Instructions};
pub use outcome::{ErrorClass, Outcome, OutcomeKind};
