//! # Biome Core
//!
//! Round-based, message-driven orchestration engine for ephemeral
//! multi-host Docker test networks ("biomes").
//!
//! A job arrives on the command queue as an `Instructions` message: an
//! ordered list of rounds, each round a set of Docker commands that run
//! concurrently. The engine executes exactly one round per delivery and
//! republishes the remaining work, so the queue itself is the scheduler
//! and no engine instance holds job state. Round failures retry through
//! message redelivery (narrowed to the failing commands when possible),
//! terminal outcomes notify the completion queues to tear the biome down,
//! and every delivery emits a status report.
//!
//! ## Architecture
//!
//! - [`command`]: the imperative unit of work and its closed order set
//! - [`orchestration`]: outcomes, instructions, executor, handler, controller
//! - [`messaging`]: queue transport (RabbitMQ, in-memory) and envelopes
//! - [`docker`]: the use-case boundary to remote Docker daemons
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use biome_core::config::EngineConfig;
//! use biome_core::docker::BollardUseCase;
//! use biome_core::messaging::{RabbitMqConfig, RabbitMqQueueService};
//! use biome_core::orchestration::{
//!     DeliveryHandler, QueueController, RoundExecutor,
//! };
//!
//! # async fn run() -> biome_core::error::Result<()> {
//! let config = EngineConfig::from_env()?;
//! let queue = Arc::new(
//!     RabbitMqQueueService::new(&RabbitMqConfig {
//!         url: config.amqp_url.clone(),
//!         ..Default::default()
//!     })
//!     .await?,
//! );
//!
//! let usecase = Arc::new(BollardUseCase::new(config.docker_port));
//! let executor = RoundExecutor::new(usecase, (&config).into());
//! let handler = DeliveryHandler::new(executor, (&config).into());
//! let controller = QueueController::new(queue, handler, (&config).into());
//!
//! controller.run().await;
//! # Ok(())
//! # }
//! ```

pub mod command;
pub mod config;
pub mod docker;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod orchestration;

pub use command::{AuthMaterial, Command, Order, Target};
pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use orchestration::{DeliveryHandler, Instructions, Outcome, QueueController, RoundExecutor};
