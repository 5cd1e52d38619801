use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogsOptions, RemoveContainerOptions,
    StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::models::{
    ContainerStateStatusEnum, HostConfig, PortBinding, PortMap, RestartPolicy,
    RestartPolicyNameEnum,
};
use bollard::Docker;
use futures::StreamExt;
use rand::Rng;
use tracing::{debug, info, warn};

use super::{ContainerRuntime, ContainerSpec, ContainerStatus, RuntimeError, CONTAINER_GATEWAY_PORT};
use crate::instance_config::InstancePaths;

const CONTAINER_NAME_PREFIX: &str = "clawdeploy";
const CONTAINER_HOME: &str = "/home/node";
const STOP_GRACE_SECS: i64 = 10;

#[derive(Debug, Clone)]
pub struct DockerRuntimeConfig {
    pub image: String,
    pub data_root: PathBuf,
    pub nano_cpus: i64,
    pub memory_bytes: i64,
}

impl DockerRuntimeConfig {
    pub fn new(image: impl Into<String>, data_root: impl Into<PathBuf>) -> Self {
        Self {
            image: image.into(),
            data_root: data_root.into(),
            nano_cpus: 1_000_000_000,
            memory_bytes: 1024 * 1024 * 1024,
        }
    }
}

pub struct DockerRuntime {
    docker: Docker,
    config: DockerRuntimeConfig,
}

impl DockerRuntime {
    pub fn connect(config: DockerRuntimeConfig) -> anyhow::Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker, config })
    }

    fn container_config(&self, spec: &ContainerSpec, host_port: u16) -> Config<String> {
        let port_key = format!("{CONTAINER_GATEWAY_PORT}/tcp");
        let paths = InstancePaths::new(&self.config.data_root, &spec.instance_id);

        let mut env = vec![
            format!("HOME={CONTAINER_HOME}"),
            "TERM=xterm-256color".to_string(),
            format!("OPENCLAW_GATEWAY_TOKEN={}", spec.gateway_token),
        ];
        env.extend(
            spec.env
                .iter()
                .filter(|(_, value)| !value.is_empty())
                .map(|(key, value)| format!("{key}={value}")),
        );

        let mut port_bindings: PortMap = HashMap::new();
        port_bindings.insert(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(host_port.to_string()),
            }]),
        );

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            binds: Some(vec![
                format!("{}:{CONTAINER_HOME}/.openclaw", paths.config.display()),
                format!(
                    "{}:{CONTAINER_HOME}/.openclaw/workspace",
                    paths.workspace.display()
                ),
            ]),
            nano_cpus: Some(self.config.nano_cpus),
            memory: Some(self.config.memory_bytes),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                maximum_retry_count: None,
            }),
            init: Some(true),
            ..Default::default()
        };

        Config {
            image: Some(self.config.image.clone()),
            cmd: Some(vec![
                "node".to_string(),
                "openclaw.mjs".to_string(),
                "gateway".to_string(),
                "--bind".to_string(),
                "lan".to_string(),
                "--port".to_string(),
                CONTAINER_GATEWAY_PORT.to_string(),
                "--allow-unconfigured".to_string(),
            ]),
            env: Some(env),
            user: Some("node".to_string()),
            exposed_ports: Some(HashMap::from([(port_key, HashMap::new())])),
            labels: Some(HashMap::from([
                ("clawdeploy".to_string(), "true".to_string()),
                ("instanceId".to_string(), spec.instance_id.clone()),
            ])),
            host_config: Some(host_config),
            ..Default::default()
        }
    }
}

fn container_name(instance_id: &str) -> String {
    format!(
        "{CONTAINER_NAME_PREFIX}-{instance_id}-{:08x}",
        rand::thread_rng().r#gen::<u32>()
    )
}

fn docker_error_message(error: &BollardError) -> String {
    match error {
        BollardError::DockerResponseServerError { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

fn is_not_found_error(error: &BollardError) -> bool {
    match error {
        BollardError::DockerResponseServerError { status_code, .. } if *status_code == 404 => {
            true
        }
        other => docker_error_message(other)
            .to_lowercase()
            .contains("no such container"),
    }
}

fn is_not_modified(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError {
            status_code: 304,
            ..
        }
    )
}

fn is_port_conflict(error: &BollardError) -> bool {
    docker_error_message(error)
        .to_lowercase()
        .contains("port is already allocated")
}

fn map_docker_error(operation: &'static str, target: &str, error: BollardError) -> RuntimeError {
    if is_not_found_error(&error) {
        return RuntimeError::NotFound(target.to_string());
    }
    RuntimeError::Other {
        operation,
        target: target.to_string(),
        message: docker_error_message(&error),
    }
}

fn map_create_error(
    operation: &'static str,
    target: &str,
    host_port: u16,
    error: BollardError,
) -> RuntimeError {
    if is_port_conflict(&error) {
        return RuntimeError::PortConflict { port: host_port };
    }
    map_docker_error(operation, target, error)
}

fn map_status(status: Option<ContainerStateStatusEnum>) -> ContainerStatus {
    match status {
        Some(ContainerStateStatusEnum::RUNNING) => ContainerStatus::Running,
        Some(ContainerStateStatusEnum::EXITED) => ContainerStatus::Exited,
        Some(ContainerStateStatusEnum::DEAD) => ContainerStatus::Dead,
        _ => ContainerStatus::Unknown,
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, spec: &ContainerSpec, host_port: u16) -> Result<String, RuntimeError> {
        let name = container_name(&spec.instance_id);
        let options = CreateContainerOptions {
            name: name.clone(),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(Some(options), self.container_config(spec, host_port))
            .await
            .map_err(|e| map_create_error("create_container", &name, host_port, e))?;
        let container_ref = response.id;

        // Docker only binds host ports at start, so a conflict surfaces here.
        if let Err(e) = self
            .docker
            .start_container::<String>(&container_ref, None)
            .await
        {
            if let Err(cleanup) = self
                .docker
                .remove_container(
                    &container_ref,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await
            {
                warn!(
                    container_ref = %container_ref,
                    error = %docker_error_message(&cleanup),
                    "failed to remove container after start failure"
                );
            }
            return Err(map_create_error(
                "start_container",
                &container_ref,
                host_port,
                e,
            ));
        }

        info!(
            instance_id = %spec.instance_id,
            container_ref = %container_ref,
            host_port,
            "created and started container"
        );
        Ok(container_ref)
    }

    async fn start(&self, container_ref: &str) -> Result<(), RuntimeError> {
        match self
            .docker
            .start_container::<String>(container_ref, None)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_modified(&e) => Ok(()),
            Err(e) => Err(map_docker_error("start_container", container_ref, e)),
        }
    }

    async fn stop(&self, container_ref: &str) -> Result<(), RuntimeError> {
        match self
            .docker
            .stop_container(
                container_ref,
                Some(StopContainerOptions { t: STOP_GRACE_SECS }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_modified(&e) => Ok(()),
            Err(e) => Err(map_docker_error("stop_container", container_ref, e)),
        }
    }

    async fn remove(&self, container_ref: &str) -> Result<(), RuntimeError> {
        let details = self
            .docker
            .inspect_container(container_ref, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_docker_error("inspect_container", container_ref, e))?;

        let running = details
            .state
            .as_ref()
            .and_then(|state| state.running)
            .unwrap_or(false);
        if running {
            debug!(container_ref, "stopping running container before removal");
            self.stop(container_ref).await?;
        }

        self.docker
            .remove_container(
                container_ref,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| map_docker_error("remove_container", container_ref, e))
    }

    async fn status(&self, container_ref: &str) -> Result<ContainerStatus, RuntimeError> {
        match self
            .docker
            .inspect_container(container_ref, None::<InspectContainerOptions>)
            .await
        {
            Ok(details) => Ok(map_status(details.state.and_then(|state| state.status))),
            Err(e) if is_not_found_error(&e) => Ok(ContainerStatus::NotFound),
            Err(e) => Err(map_docker_error("inspect_container", container_ref, e)),
        }
    }

    async fn logs(&self, container_ref: &str, tail: usize) -> Result<String, RuntimeError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            timestamps: false,
            ..Default::default()
        };
        let mut stream = self.docker.logs(container_ref, Some(options));
        let mut output = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| map_docker_error("logs", container_ref, e))?;
            output.extend_from_slice(&chunk.into_bytes());
        }
        Ok(String::from_utf8_lossy(&output).into_owned())
    }

    async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| map_docker_error("ping", "docker", e))
    }
}
