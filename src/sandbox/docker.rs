//! Local Docker engine as a sandbox platform.
//!
//! Each sandbox is one container whose PID 1 is `sleep <timeout>`, so the
//! container reaps itself when the wall-clock budget runs out. The source is
//! cloned into `/app` and every command runs through `docker exec`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, RemoveContainerOptions,
    StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerStateStatusEnum, HostConfig, PortBinding};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use secrecy::ExposeSecret;
use tokio::sync::RwLock;
use url::Url;
use uuid::Uuid;

use crate::error::PlatformError;
use crate::sandbox::{
    CommandOutcome, CommandRequest, GitSource, OutputMode, OutputStream, PortRoute, SandboxHandle,
    SandboxId, SandboxPlatform, SandboxSpec, SandboxStatus, write_output,
};

const WORKDIR: &str = "/app";
const DOCKER_SOCKET: &str = "/var/run/docker.sock";
const LABEL: &str = "sandcron.sandbox";

/// Docker-backed platform.
pub struct DockerPlatform {
    mount_socket: bool,
    /// Cached Docker connection (created on first use).
    docker: Arc<RwLock<Option<Docker>>>,
}

impl DockerPlatform {
    pub fn new(mount_socket: bool) -> Self {
        Self {
            mount_socket,
            docker: Arc::new(RwLock::new(None)),
        }
    }

    /// Get or create a Docker connection.
    async fn docker(&self) -> Result<Docker, PlatformError> {
        {
            let guard = self.docker.read().await;
            if let Some(ref d) = *guard {
                return Ok(d.clone());
            }
        }
        let docker = Docker::connect_with_local_defaults().map_err(docker_err)?;
        docker.ping().await.map_err(docker_err)?;
        *self.docker.write().await = Some(docker.clone());
        Ok(docker)
    }

    async fn pull(&self, docker: &Docker, image: &str) -> Result<(), PlatformError> {
        tracing::info!(image = %image, "Pulling sandbox image");
        let mut progress = docker.create_image(
            Some(CreateImageOptions {
                from_image: image,
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(item) = progress.next().await {
            item.map_err(docker_err)?;
        }
        Ok(())
    }

    async fn exec(
        &self,
        docker: &Docker,
        container: &str,
        command: &CommandRequest,
    ) -> Result<CommandOutcome, PlatformError> {
        let mut cmd = vec![command.cmd.clone()];
        cmd.extend(command.args.iter().cloned());

        let attach = !(command.detached && command.output == OutputMode::Discard);
        let exec = docker
            .create_exec(
                container,
                CreateExecOptions {
                    cmd: Some(cmd),
                    env: Some(command.env.to_env_list()),
                    user: command.sudo.then(|| "root".to_string()),
                    working_dir: Some(WORKDIR.to_string()),
                    attach_stdout: Some(attach),
                    attach_stderr: Some(attach),
                    ..Default::default()
                },
            )
            .await
            .map_err(docker_err)?;

        let started = docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: !attach,
                    ..Default::default()
                }),
            )
            .await
            .map_err(docker_err)?;

        let output = match started {
            StartExecResults::Attached { output, .. } => Some(output),
            StartExecResults::Detached => None,
        };

        if command.detached {
            if let Some(mut output) = output {
                let container = container.to_string();
                tokio::spawn(async move {
                    while let Some(item) = output.next().await {
                        match item {
                            Ok(chunk) => relay(chunk).await,
                            Err(e) => {
                                tracing::debug!(container = %container, error = %e, "Detached exec stream ended");
                                break;
                            }
                        }
                    }
                });
            }
            return Ok(CommandOutcome::detached());
        }

        if let Some(mut output) = output {
            while let Some(item) = output.next().await {
                let chunk = item.map_err(docker_err)?;
                if command.output == OutputMode::Inherit {
                    relay(chunk).await;
                }
            }
        }

        let inspect = docker.inspect_exec(&exec.id).await.map_err(docker_err)?;
        Ok(CommandOutcome {
            exit_code: inspect.exit_code,
        })
    }
}

#[async_trait]
impl SandboxPlatform for DockerPlatform {
    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxHandle, PlatformError> {
        let docker = self.docker().await?;
        let image = spec
            .image
            .clone()
            .unwrap_or_else(|| runtime_image(&spec.runtime));

        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();
        for port in &spec.ports {
            let key = format!("{}/tcp", port);
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: Some("127.0.0.1".to_string()),
                    // Empty host port: the engine picks an ephemeral one.
                    host_port: Some(String::new()),
                }]),
            );
        }

        let binds = self
            .mount_socket
            .then(|| vec![format!("{}:{}", DOCKER_SOCKET, DOCKER_SOCKET)]);

        let host_config = HostConfig {
            binds,
            nano_cpus: Some(spec.vcpus as i64 * 1_000_000_000),
            port_bindings: Some(port_bindings),
            network_mode: Some("bridge".to_string()),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(image.clone()),
            cmd: Some(vec![
                "sleep".to_string(),
                spec.timeout.as_secs().max(1).to_string(),
            ]),
            exposed_ports: Some(exposed_ports),
            labels: Some([(LABEL.to_string(), "true".to_string())].into_iter().collect()),
            host_config: Some(host_config),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: format!("sandcron-{}", Uuid::new_v4()),
            ..Default::default()
        };

        let response = match docker
            .create_container(Some(options.clone()), container_config.clone())
            .await
        {
            Ok(r) => r,
            Err(e) if is_status(&e, 404) => {
                self.pull(&docker, &image).await?;
                docker
                    .create_container(Some(options), container_config)
                    .await
                    .map_err(docker_err)?
            }
            Err(e) => return Err(docker_err(e)),
        };
        let container_id = response.id;

        docker
            .start_container::<String>(&container_id, None)
            .await
            .map_err(|e| PlatformError::Docker {
                reason: format!("failed to start container: {}", e),
            })?;

        let clone = CommandRequest::new("git")
            .args(clone_args(&spec.source))
            .output(OutputMode::Discard);
        let outcome = self.exec(&docker, &container_id, &clone).await?;
        if !outcome.success() {
            // Nothing else will ever use this container.
            if let Err(e) = docker
                .remove_container(
                    &container_id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await
            {
                tracing::warn!(container = %container_id, error = %e, "Failed to remove container (may require manual cleanup)");
            }
            return Err(PlatformError::Docker {
                reason: format!("git clone exited with {:?}", outcome.exit_code),
            });
        }

        tracing::info!(sandbox_id = %container_id, image = %image, "Created and started sandbox container");
        self.get(&SandboxId::new(container_id)).await
    }

    async fn get(&self, id: &SandboxId) -> Result<SandboxHandle, PlatformError> {
        let docker = self.docker().await?;
        let info = match docker
            .inspect_container(id.as_str(), None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => info,
            Err(e) if is_status(&e, 404) => {
                return Err(PlatformError::NotFound { id: id.to_string() });
            }
            Err(e) => return Err(docker_err(e)),
        };

        let status = info
            .state
            .and_then(|s| s.status)
            .map(map_state)
            .unwrap_or(SandboxStatus::Pending);

        let mut routes = Vec::new();
        if let Some(ports) = info.network_settings.and_then(|n| n.ports) {
            for (key, bindings) in ports {
                let Some(port) = key.split('/').next().and_then(|p| p.parse::<u16>().ok()) else {
                    continue;
                };
                let host_port = bindings
                    .unwrap_or_default()
                    .into_iter()
                    .find_map(|b| b.host_port.filter(|p| !p.is_empty()));
                if let Some(host_port) = host_port
                    && let Ok(url) = Url::parse(&format!("http://127.0.0.1:{}", host_port))
                {
                    routes.push(PortRoute { port, url });
                }
            }
        }
        routes.sort_by_key(|r| r.port);

        let created_at = info
            .created
            .as_deref()
            .and_then(|c| DateTime::parse_from_rfc3339(c).ok())
            .map(|c| c.with_timezone(&Utc));

        Ok(SandboxHandle {
            id: SandboxId::new(info.id.unwrap_or_else(|| id.to_string())),
            status,
            routes,
            created_at,
        })
    }

    async fn stop(&self, handle: &SandboxHandle) -> Result<(), PlatformError> {
        let docker = self.docker().await?;

        // 304: already stopped, 404: already removed.
        match docker
            .stop_container(handle.id.as_str(), Some(StopContainerOptions { t: 10 }))
            .await
        {
            Ok(()) => {}
            Err(e) if is_status(&e, 304) => {}
            Err(e) if is_status(&e, 404) => return Ok(()),
            Err(e) => {
                tracing::warn!(sandbox_id = %handle.id, error = %e, "Failed to stop container (may already be stopped)");
            }
        }

        if let Err(e) = docker
            .remove_container(
                handle.id.as_str(),
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            && !is_status(&e, 404)
        {
            tracing::warn!(sandbox_id = %handle.id, error = %e, "Failed to remove container (may require manual cleanup)");
        }

        tracing::info!(sandbox_id = %handle.id, "Stopped sandbox container");
        Ok(())
    }

    async fn run_command(
        &self,
        handle: &SandboxHandle,
        command: &CommandRequest,
    ) -> Result<CommandOutcome, PlatformError> {
        let docker = self.docker().await?;
        self.exec(&docker, handle.id.as_str(), command).await
    }
}

fn docker_err(e: bollard::errors::Error) -> PlatformError {
    PlatformError::Docker {
        reason: e.to_string(),
    }
}

fn is_status(e: &bollard::errors::Error, code: u16) -> bool {
    matches!(
        e,
        bollard::errors::Error::DockerResponseServerError { status_code, .. } if *status_code == code
    )
}

async fn relay(chunk: LogOutput) {
    match chunk {
        LogOutput::StdOut { message } | LogOutput::Console { message } => {
            write_output(OutputStream::Stdout, &message).await
        }
        LogOutput::StdErr { message } => write_output(OutputStream::Stderr, &message).await,
        LogOutput::StdIn { .. } => {}
    }
}

fn map_state(state: ContainerStateStatusEnum) -> SandboxStatus {
    match state {
        ContainerStateStatusEnum::CREATED | ContainerStateStatusEnum::EMPTY => {
            SandboxStatus::Pending
        }
        ContainerStateStatusEnum::RUNNING
        | ContainerStateStatusEnum::PAUSED
        | ContainerStateStatusEnum::RESTARTING => SandboxStatus::Running,
        ContainerStateStatusEnum::REMOVING => SandboxStatus::Stopping,
        ContainerStateStatusEnum::EXITED => SandboxStatus::Stopped,
        ContainerStateStatusEnum::DEAD => SandboxStatus::Failed,
    }
}

/// `node22` -> `node:22`. Anything without a version suffix is used as is.
fn runtime_image(runtime: &str) -> String {
    match runtime.find(|c: char| c.is_ascii_digit()) {
        Some(0) | None => runtime.to_string(),
        Some(idx) => format!("{}:{}", &runtime[..idx], &runtime[idx..]),
    }
}

fn clone_args(source: &GitSource) -> Vec<String> {
    let mut args = vec!["clone".to_string(), "--depth".to_string(), "1".to_string()];
    if let Some(ref rev) = source.revision {
        args.push("--branch".to_string());
        args.push(rev.clone());
    }
    args.push(authenticated_url(source));
    args.push(WORKDIR.to_string());
    args
}

/// Embed credentials into an http(s) clone URL.
fn authenticated_url(source: &GitSource) -> String {
    let Ok(mut url) = Url::parse(&source.url) else {
        return source.url.clone();
    };
    if !matches!(url.scheme(), "http" | "https") {
        return source.url.clone();
    }
    if let Some(ref user) = source.username {
        let _ = url.set_username(user);
    }
    if let Some(ref password) = source.password {
        if source.username.is_none() {
            let _ = url.set_username("x-access-token");
        }
        let _ = url.set_password(Some(password.expose_secret()));
    }
    url.to_string()
}
