use super::ContainerRuntime;
use crate::command;
use crate::error::{CommandError, RuntimeError};
use crate::types::{Capabilities, ContainerInfo, NetworkBackend, RestartPolicy, RunRequest};
use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, ListContainersOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{
    HostConfig, PortBinding, RestartPolicy as ApiRestartPolicy, RestartPolicyNameEnum,
};
use bollard::{Docker, API_DEFAULT_VERSION};
use futures_util::stream::StreamExt;
use log::{debug, warn};
use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::time::Duration;

const CLI: &str = "podman";
const API_TIMEOUT_SECS: u64 = 120;
const STOP_TIMEOUT_SECS: i64 = 10;
const INFO_TIMEOUT: Duration = Duration::from_secs(30);
const BUILD_ERROR_LINES: usize = 20;

/// Podman, driven through its Docker-compatible API socket for container
/// lifecycle and through the CLI for image builds and host capability queries.
pub struct PodmanRuntime {
    docker: Docker,
    build_timeout: Duration,
}

impl PodmanRuntime {
    pub fn connect(socket: Option<&str>, build_timeout: Duration) -> Result<Self, RuntimeError> {
        let socket = socket.map(str::to_string).unwrap_or_else(default_socket);
        debug!("Connecting to Podman API at {}", socket);
        let docker = Docker::connect_with_unix(&socket, API_TIMEOUT_SECS, API_DEFAULT_VERSION)?;
        Ok(Self {
            docker,
            build_timeout,
        })
    }
}

/// Rootless socket under `$XDG_RUNTIME_DIR`, otherwise the system socket.
fn default_socket() -> String {
    match env::var("XDG_RUNTIME_DIR") {
        Ok(dir) if !dir.is_empty() => format!("{}/podman/podman.sock", dir),
        _ => "/run/podman/podman.sock".to_string(),
    }
}

#[async_trait]
impl ContainerRuntime for PodmanRuntime {
    async fn build(
        &self,
        image: &str,
        containerfile: &Path,
        context: &Path,
    ) -> Result<(), RuntimeError> {
        let containerfile = containerfile.to_string_lossy();
        let context = context.to_string_lossy();
        let args = ["build", "-t", image, "-f", &containerfile, &context];
        let output = command::run_raw(CLI, &args, self.build_timeout).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(CommandError::Failed {
            program: format!("{} build", CLI),
            code: output.status.code(),
            stderr: last_lines(&stderr, BUILD_ERROR_LINES),
        }
        .into())
    }

    async fn run(&self, request: &RunRequest) -> Result<String, RuntimeError> {
        let port_key = request.port_key();
        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: Some(request.bind_address.clone()),
                host_port: Some(request.port.host_port.to_string()),
            }]),
        );
        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(port_key, HashMap::new());

        let host_config = HostConfig {
            binds: Some(request.binds()),
            port_bindings: Some(port_bindings),
            memory: Some(request.limits.memory_bytes),
            nano_cpus: Some(request.limits.nano_cpus()),
            restart_policy: Some(ApiRestartPolicy {
                name: Some(restart_policy_name(request.restart)),
                maximum_retry_count: None,
            }),
            network_mode: request.network.network_mode().map(str::to_string),
            security_opt: request
                .labels_disabled
                .then(|| vec!["label=disable".to_string()]),
            userns_mode: request.userns.clone(),
            ..Default::default()
        };

        let config = ContainerConfig {
            image: Some(request.image.clone()),
            env: Some(request.env.clone()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        debug!(
            "Creating {} ({} strategy, network {})",
            request.name, request.strategy, request.network
        );
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: request.name.clone(),
                    platform: None,
                }),
                config,
            )
            .await?;
        for warning in &created.warnings {
            warn!("Runtime warning for {}: {}", request.name, warning);
        }

        self.docker
            .start_container(&request.name, None::<StartContainerOptions<String>>)
            .await?;
        Ok(created.id)
    }

    async fn stop(&self, name: &str) -> Result<(), RuntimeError> {
        let opts = StopContainerOptions {
            t: STOP_TIMEOUT_SECS,
        };
        match self.docker.stop_container(name, Some(opts)).await {
            Ok(()) => Ok(()),
            // 304: already stopped, 404: already gone
            Err(e) if status_code(&e) == Some(304) || status_code(&e) == Some(404) => {
                debug!("stop {}: nothing to do", name);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
        let opts = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(name, Some(opts)).await {
            Ok(()) => Ok(()),
            Err(e) if status_code(&e) == Some(404) => {
                debug!("remove {}: already absent", name);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn ps(&self, name_filter: &str) -> Result<Vec<ContainerInfo>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![name_filter.to_string()]);
        let opts = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(opts)).await?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let name = c
                    .names
                    .as_ref()
                    .and_then(|n| n.first())
                    .map(|n| n.trim_start_matches('/').to_string())?;
                Some(ContainerInfo {
                    id: c.id.unwrap_or_default(),
                    name,
                    image: c.image.unwrap_or_default(),
                    running: c.state.as_deref() == Some("running"),
                })
            })
            .collect())
    }

    async fn logs(&self, name: &str, tail: usize) -> Result<String, RuntimeError> {
        let opts = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            ..Default::default()
        };
        let mut stream = Box::pin(self.docker.logs(name, Some(opts)));
        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(output) => text.push_str(&output.to_string()),
                Err(e) if status_code(&e) == Some(404) => {
                    return Err(RuntimeError::NotFound(name.to_string()))
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(text)
    }

    async fn exec(&self, name: &str, command: &[&str]) -> Result<String, RuntimeError> {
        let created = self
            .docker
            .create_exec(
                name,
                CreateExecOptions {
                    cmd: Some(command.iter().map(|s| s.to_string()).collect()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        match self.docker.start_exec(&created.id, None).await? {
            StartExecResults::Attached { mut output, .. } => {
                let mut text = String::new();
                while let Some(chunk) = output.next().await {
                    text.push_str(&chunk?.to_string());
                }
                Ok(text)
            }
            StartExecResults::Detached => Ok(String::new()),
        }
    }

    async fn network_backends(&self) -> Result<Capabilities, RuntimeError> {
        let info = command::run(CLI, &["info", "--format", "json"], INFO_TIMEOUT).await?;
        let info: serde_json::Value =
            serde_json::from_str(&info).map_err(|e| RuntimeError::Parse(e.to_string()))?;
        Ok(parse_capabilities(&info))
    }
}

fn status_code(err: &bollard::errors::Error) -> Option<u16> {
    match err {
        bollard::errors::Error::DockerResponseServerError { status_code, .. } => {
            Some(*status_code)
        }
        _ => None,
    }
}

fn restart_policy_name(policy: RestartPolicy) -> RestartPolicyNameEnum {
    match policy {
        RestartPolicy::No => RestartPolicyNameEnum::NO,
        RestartPolicy::Always => RestartPolicyNameEnum::ALWAYS,
        RestartPolicy::OnFailure => RestartPolicyNameEnum::ON_FAILURE,
        RestartPolicy::UnlessStopped => RestartPolicyNameEnum::UNLESS_STOPPED,
    }
}

/// Reads the rootless network helpers out of `podman info` JSON.
/// The runtime default is always available.
fn parse_capabilities(info: &serde_json::Value) -> Capabilities {
    let mut capabilities = Capabilities::new();
    capabilities.insert(NetworkBackend::Default);
    let host = &info["host"];
    if has_executable(&host["pasta"]) {
        capabilities.insert(NetworkBackend::Pasta);
    }
    if has_executable(&host["slirp4netns"]) {
        capabilities.insert(NetworkBackend::Slirp4netns);
    }
    capabilities
}

fn has_executable(helper: &serde_json::Value) -> bool {
    helper["executable"]
        .as_str()
        .map_or(false, |path| !path.is_empty())
}

fn last_lines(text: &str, count: usize) -> String {
    let lines: Vec<&str> = text.trim_end().lines().collect();
    let start = lines.len().saturating_sub(count);
    lines[start..].join("\n")
}
