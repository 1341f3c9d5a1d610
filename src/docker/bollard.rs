//! Bollard-backed [`DockerUseCase`] talking HTTP to remote daemons.
//!
//! One client per target host, cached for the life of the use-case. All
//! bollard errors are folded into outcomes here: daemon 4xx responses are
//! permanent, 5xx are retryable, and anything that never reached the
//! daemon (transport, IO, timeout) is a transient connection failure the
//! executor may retry in place.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{EndpointSettings, Ipam, IpamConfig};
use bollard::network::{ConnectNetworkOptions, CreateNetworkOptions};
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use bollard::Docker;
use futures::StreamExt;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::command::{Command, Order};
use crate::docker::{DockerUseCase, DOCKER_PROVENANCE};
use crate::orchestration::outcome::Outcome;

const CONNECT_TIMEOUT_SECS: u64 = 120;

/// Docker use-case implemented over the HTTP API.
pub struct BollardUseCase {
    docker_port: u16,
    /// One connected client per target host
    clients: RwLock<HashMap<String, Docker>>,
}

impl BollardUseCase {
    pub fn new(docker_port: u16) -> Self {
        Self {
            docker_port,
            clients: RwLock::new(HashMap::new()),
        }
    }

    async fn client_for(&self, ip: &str) -> Result<Docker, bollard::errors::Error> {
        {
            let cache = self.clients.read().await;
            if let Some(client) = cache.get(ip) {
                return Ok(client.clone());
            }
        }

        let address = format!("http://{ip}:{}", self.docker_port);
        let client =
            Docker::connect_with_http(&address, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)?;

        let mut cache = self.clients.write().await;
        let client = cache.entry(ip.to_string()).or_insert(client).clone();
        Ok(client)
    }

    async fn dispatch(&self, command: &Command) -> Outcome {
        let client = match self.client_for(&command.target.ip).await {
            Ok(client) => client,
            Err(err) => return classify(command.order.kind(), err),
        };

        match &command.order {
            Order::CreateContainer {
                name,
                image,
                env,
                entrypoint,
            } => self.create_container(&client, name, image, env, entrypoint.as_deref()).await,
            Order::StartContainer { name } => self.start_container(&client, name).await,
            Order::RemoveContainer { name } => self.remove_container(&client, name).await,
            Order::AwaitContainerExit { name, poll_ms } => {
                self.await_container_exit(&client, name, *poll_ms).await
            }
            Order::CreateNetwork { name, subnet } => {
                self.create_network(&client, name, subnet.as_deref()).await
            }
            Order::AttachNetwork { network, container } => {
                self.attach_network(&client, network, container).await
            }
            Order::RemoveNetwork { name } => self.remove_network(&client, name).await,
            Order::CreateVolume { name } => self.create_volume(&client, name).await,
            Order::RemoveVolume { name } => self.remove_volume(&client, name).await,
            Order::Exec { container, cmd } => self.exec(&client, container, cmd).await,
        }
    }

    async fn create_container(
        &self,
        client: &Docker,
        name: &str,
        image: &str,
        env: &[String],
        entrypoint: Option<&[String]>,
    ) -> Outcome {
        let options = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };
        let config = Config {
            image: Some(image.to_string()),
            env: Some(env.to_vec()),
            entrypoint: entrypoint.map(|e| e.to_vec()),
            ..Default::default()
        };

        match client.create_container(Some(options), config).await {
            Ok(response) => {
                debug!(container = name, id = %response.id, "Container created");
                Outcome::success(DOCKER_PROVENANCE)
            }
            Err(err) => classify("create_container", err),
        }
    }

    async fn start_container(&self, client: &Docker, name: &str) -> Outcome {
        match client
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => Outcome::success(DOCKER_PROVENANCE),
            Err(err) => classify("start_container", err),
        }
    }

    async fn remove_container(&self, client: &Docker, name: &str) -> Outcome {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match client.remove_container(name, Some(options)).await {
            Ok(()) => Outcome::success(DOCKER_PROVENANCE),
            Err(err) => classify("remove_container", err),
        }
    }

    /// Reports a delayed outcome while the container still runs so the
    /// round is re-polled by the broker instead of a local sleep loop.
    async fn await_container_exit(&self, client: &Docker, name: &str, poll_ms: u64) -> Outcome {
        match client
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(details) => {
                let state = details.state.unwrap_or_default();
                if state.running.unwrap_or(false) {
                    return Outcome::delayed(DOCKER_PROVENANCE, Duration::from_millis(poll_ms));
                }
                match state.exit_code.unwrap_or(0) {
                    0 => Outcome::success(DOCKER_PROVENANCE),
                    code => Outcome::fatal(
                        DOCKER_PROVENANCE,
                        format!("container {name} exited with code {code}"),
                    ),
                }
            }
            Err(err) => classify("await_container_exit", err),
        }
    }

    async fn create_network(&self, client: &Docker, name: &str, subnet: Option<&str>) -> Outcome {
        let options = CreateNetworkOptions {
            name: name.to_string(),
            check_duplicate: true,
            driver: "bridge".to_string(),
            ipam: Ipam {
                driver: Some("default".to_string()),
                config: subnet.map(|s| {
                    vec![IpamConfig {
                        subnet: Some(s.to_string()),
                        ..Default::default()
                    }]
                }),
                options: None,
            },
            ..Default::default()
        };

        match client.create_network(options).await {
            Ok(_) => Outcome::success(DOCKER_PROVENANCE),
            Err(err) => classify("create_network", err),
        }
    }

    async fn attach_network(&self, client: &Docker, network: &str, container: &str) -> Outcome {
        let options = ConnectNetworkOptions {
            container: container.to_string(),
            endpoint_config: EndpointSettings::default(),
        };
        match client.connect_network(network, options).await {
            Ok(()) => Outcome::success(DOCKER_PROVENANCE),
            Err(err) => classify("attach_network", err),
        }
    }

    async fn remove_network(&self, client: &Docker, name: &str) -> Outcome {
        match client.remove_network(name).await {
            Ok(()) => Outcome::success(DOCKER_PROVENANCE),
            Err(err) => classify("remove_network", err),
        }
    }

    async fn create_volume(&self, client: &Docker, name: &str) -> Outcome {
        let options = CreateVolumeOptions {
            name: name.to_string(),
            driver: "local".to_string(),
            ..Default::default()
        };
        match client.create_volume(options).await {
            Ok(_) => Outcome::success(DOCKER_PROVENANCE),
            Err(err) => classify("create_volume", err),
        }
    }

    async fn remove_volume(&self, client: &Docker, name: &str) -> Outcome {
        let options = RemoveVolumeOptions { force: true };
        match client.remove_volume(name, Some(options)).await {
            Ok(()) => Outcome::success(DOCKER_PROVENANCE),
            Err(err) => classify("remove_volume", err),
        }
    }

    async fn exec(&self, client: &Docker, container: &str, cmd: &[String]) -> Outcome {
        let options = CreateExecOptions {
            cmd: Some(cmd.to_vec()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = match client.create_exec(container, options).await {
            Ok(exec) => exec,
            Err(err) => return classify("exec", err),
        };

        let mut captured = String::new();
        match client.start_exec(&exec.id, None).await {
            Ok(StartExecResults::Attached { mut output, .. }) => {
                while let Some(chunk) = output.next().await {
                    match chunk {
                        Ok(log) => {
                            // Keep a bounded tail for the error report.
                            captured.push_str(&log.to_string());
                            if captured.len() > 4096 {
                                captured.drain(..captured.len() - 4096);
                            }
                        }
                        Err(err) => return classify("exec", err),
                    }
                }
            }
            Ok(StartExecResults::Detached) => {}
            Err(err) => return classify("exec", err),
        }

        match client.inspect_exec(&exec.id).await {
            Ok(details) => match details.exit_code.unwrap_or(0) {
                0 => Outcome::success(DOCKER_PROVENANCE),
                code => Outcome::retryable(
                    DOCKER_PROVENANCE,
                    format!(
                        "exec in {container} exited with code {code}: {}",
                        captured.trim()
                    ),
                ),
            },
            Err(err) => classify("exec", err),
        }
    }
}

#[async_trait]
impl DockerUseCase for BollardUseCase {
    #[instrument(skip(self, token), fields(op = command.order.kind(), target = %command.target.ip))]
    async fn run(&self, token: &CancellationToken, command: &Command) -> Outcome {
        tokio::select! {
            _ = token.cancelled() => Outcome::success(DOCKER_PROVENANCE),
            result = tokio::time::timeout(command.timeout(), self.dispatch(command)) => {
                match result {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!(op = command.order.kind(), "Command timed out");
                        Outcome::retryable(
                            DOCKER_PROVENANCE,
                            format!(
                                "{} timed out after {}s",
                                command.order.kind(),
                                command.timeout_seconds
                            ),
                        )
                    }
                }
            }
        }
    }
}

/// Fold a bollard error into an outcome the executor can dispatch on.
fn classify(operation: &str, err: bollard::errors::Error) -> Outcome {
    use bollard::errors::Error;

    match err {
        Error::DockerResponseServerError {
            status_code,
            message,
        } => {
            if (400..500).contains(&status_code) {
                Outcome::fatal(DOCKER_PROVENANCE, format!("{operation}: {message}"))
            } else {
                Outcome::retryable(DOCKER_PROVENANCE, format!("{operation}: {message}"))
            }
        }
        Error::JsonDataError { .. } | Error::JsonSerdeError { .. } => {
            Outcome::fatal(DOCKER_PROVENANCE, format!("{operation}: {err}"))
        }
        // Everything else never reached the daemon.
        other => Outcome::transient_connection(DOCKER_PROVENANCE, format!("{operation}: {other}")),
    }
}
