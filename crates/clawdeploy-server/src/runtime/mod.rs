use std::collections::BTreeMap;

use async_trait::async_trait;

pub mod docker;

/// Port the gateway listens on inside every sandbox container.
pub const CONTAINER_GATEWAY_PORT: u16 = 18789;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("container {0} not found")]
    NotFound(String),
    #[error("host port {port} is already allocated")]
    PortConflict { port: u16 },
    #[error("{operation} failed for {target}: {message}")]
    Other {
        operation: &'static str,
        target: String,
        message: String,
    },
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    Exited,
    Dead,
    NotFound,
    Unknown,
}

impl ContainerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Exited => "exited",
            Self::Dead => "dead",
            Self::NotFound => "not_found",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What the engine needs to run one instance's sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub instance_id: String,
    pub gateway_token: String,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedContainer {
    pub container_ref: String,
    pub port: u16,
}

/// Typed operations against a container engine.
///
/// Operations on a container that no longer exists fail with
/// [`RuntimeError::NotFound`]; `create` reports a taken host port as
/// [`RuntimeError::PortConflict`]. Nothing here retries.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Creates the container with `host_port` bound to the gateway port and
    /// starts it. Returns the engine's container reference.
    async fn create(&self, spec: &ContainerSpec, host_port: u16) -> Result<String, RuntimeError>;

    async fn start(&self, container_ref: &str) -> Result<(), RuntimeError>;

    async fn stop(&self, container_ref: &str) -> Result<(), RuntimeError>;

    /// Stops the container first when it is observed running.
    async fn remove(&self, container_ref: &str) -> Result<(), RuntimeError>;

    /// A missing container is reported as [`ContainerStatus::NotFound`], not
    /// as an error.
    async fn status(&self, container_ref: &str) -> Result<ContainerStatus, RuntimeError>;

    async fn logs(&self, container_ref: &str, tail: usize) -> Result<String, RuntimeError>;

    async fn ping(&self) -> Result<(), RuntimeError>;
}
