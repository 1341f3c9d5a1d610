//! # Command Model
//!
//! The imperative unit of work the engine schedules: one Docker operation
//! against one remote host. Commands are opaque to the orchestration layers
//! beyond identity, target, and timeout; the payload is a closed tagged
//! union decoded once at the Docker use-case boundary.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One imperative unit of work, immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    /// Command identity, used for failure attribution and partial retry
    pub id: Uuid,
    /// Remote host the operation runs against
    pub target: Target,
    /// The operation itself
    pub order: Order,
    /// Per-command execution budget in seconds
    #[serde(rename = "timeout")]
    pub timeout_seconds: u64,
    /// Commands that must have completed before this one is placed in a
    /// round. Evaluated against an external completed-set lookup at
    /// round-building time, never inside the engine.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<Uuid>,
}

impl Command {
    pub fn new(target: Target, order: Order, timeout: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            target,
            order,
            timeout_seconds: timeout.as_secs(),
            depends_on: Vec::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Host address a command executes against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub ip: String,
}

impl Target {
    pub fn new(ip: impl Into<String>) -> Self {
        Self { ip: ip.into() }
    }
}

/// The closed set of operations the Docker use-case understands.
///
/// Serialized as `{"type": ..., "payload": ...}` so submitters in other
/// languages can build orders without knowing Rust enum conventions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Order {
    CreateContainer {
        name: String,
        image: String,
        #[serde(default)]
        env: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        entrypoint: Option<Vec<String>>,
    },
    StartContainer {
        name: String,
    },
    RemoveContainer {
        name: String,
    },
    /// Poll a container and report a delayed outcome while it still runs.
    AwaitContainerExit {
        name: String,
        poll_ms: u64,
    },
    CreateNetwork {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subnet: Option<String>,
    },
    AttachNetwork {
        network: String,
        container: String,
    },
    RemoveNetwork {
        name: String,
    },
    CreateVolume {
        name: String,
    },
    RemoveVolume {
        name: String,
    },
    Exec {
        container: String,
        cmd: Vec<String>,
    },
}

impl Order {
    /// Stable operation name for logging and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Order::CreateContainer { .. } => "create_container",
            Order::StartContainer { .. } => "start_container",
            Order::RemoveContainer { .. } => "remove_container",
            Order::AwaitContainerExit { .. } => "await_container_exit",
            Order::CreateNetwork { .. } => "create_network",
            Order::AttachNetwork { .. } => "attach_network",
            Order::RemoveNetwork { .. } => "remove_network",
            Order::CreateVolume { .. } => "create_volume",
            Order::RemoveVolume { .. } => "remove_volume",
            Order::Exec { .. } => "exec",
        }
    }
}

/// TLS material for reaching remote Docker daemons. Opaque to the engine;
/// consumed only by the Docker use-case.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthMaterial {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_shape() {
        let cmd = Command::new(
            Target::new("10.1.0.2"),
            Order::CreateContainer {
                name: "node0".to_string(),
                image: "geth:latest".to_string(),
                env: vec!["NETWORK=testnet".to_string()],
                entrypoint: None,
            },
            Duration::from_secs(30),
        );

        let json = serde_json::to_value(&cmd).expect("serialize");
        assert_eq!(json["target"]["ip"], "10.1.0.2");
        assert_eq!(json["order"]["type"], "create_container");
        assert_eq!(json["order"]["payload"]["image"], "geth:latest");
        assert_eq!(json["timeout"], 30);
        assert!(json.get("depends_on").is_none());

        let decoded: Command = serde_json::from_value(json).expect("deserialize");
        assert_eq!(decoded.id, cmd.id);
        assert_eq!(decoded.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_order_kind_names() {
        let order = Order::AttachNetwork {
            network: "vlan10".to_string(),
            container: "node0".to_string(),
        };
        assert_eq!(order.kind(), "attach_network");
    }

    #[test]
    fn test_unknown_order_type_rejected() {
        let json = serde_json::json!({
            "id": Uuid::new_v4(),
            "target": {"ip": "10.0.0.1"},
            "order": {"type": "reboot_host", "payload": {}},
            "timeout": 10,
        });
        assert!(serde_json::from_value::<Command>(json).is_err());
    }
}
