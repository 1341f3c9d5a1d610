//! # Docker Use-Case Boundary
//!
//! The single seam between orchestration and the Docker control plane.
//! Orchestration never constructs Docker API calls; it hands a [`Command`]
//! to a [`DockerUseCase`] and gets an [`Outcome`] back. Error
//! classification happens here, where the transport detail still exists,
//! so the executor can act on `ErrorClass` instead of sniffing strings.

pub mod bollard;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::command::Command;
use crate::orchestration::outcome::Outcome;

pub use self::bollard::BollardUseCase;

/// Provenance string attached to outcomes produced at this boundary.
pub const DOCKER_PROVENANCE: &str = "docker";

/// Executes a single command against a remote Docker daemon.
///
/// Implementations never return `Err`; every failure is folded into the
/// returned [`Outcome`] with an error class the orchestration layer can
/// dispatch on.
#[async_trait]
pub trait DockerUseCase: Send + Sync + 'static {
    async fn run(&self, token: &CancellationToken, command: &Command) -> Outcome;
}
