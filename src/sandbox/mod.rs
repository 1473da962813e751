//! Sandbox platform contract and backends.
//!
//! A sandbox is an isolated, time-boxed remote environment that can run
//! commands and expose ports. sandcron never implements one; it drives an
//! external platform through [`SandboxPlatform`]:
//!
//! ```text
//! ┌──────────────────────────────┐
//! │ SandboxPlatform              │
//! │   create(spec)   -> handle   │──▶ RestPlatform   (hosted API)
//! │   get(id)        -> handle   │
//! │   stop(handle)               │──▶ DockerPlatform (local engine)
//! │   run_command(handle, cmd)   │
//! └──────────────────────────────┘
//! ```

mod docker;
mod env;
mod rest;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::config::{PlatformConfig, SandboxBackend, SandboxConfig};
use crate::error::{ConfigError, PlatformError};

pub use docker::DockerPlatform;
pub use env::EnvOverlay;
pub use rest::RestPlatform;

/// Platform-assigned sandbox identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SandboxId(String);

impl SandboxId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SandboxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state, owned by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxStatus {
    Pending,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl SandboxStatus {
    /// Whether a stop request still makes sense.
    pub fn can_stop(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for SandboxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" | "creating" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "stopping" => Ok(Self::Stopping),
            "stopped" => Ok(Self::Stopped),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown sandbox status '{}'", other)),
        }
    }
}

/// A public route to an exposed sandbox port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRoute {
    pub port: u16,
    pub url: Url,
}

/// Read-only view of a sandbox. Status only changes through
/// [`SandboxPlatform::create`] and [`SandboxPlatform::stop`].
#[derive(Debug, Clone)]
pub struct SandboxHandle {
    pub id: SandboxId,
    pub status: SandboxStatus,
    pub routes: Vec<PortRoute>,
    pub created_at: Option<DateTime<Utc>>,
}

impl SandboxHandle {
    /// Public URL for an exposed port.
    pub fn route(&self, port: u16) -> Option<&Url> {
        self.routes.iter().find(|r| r.port == port).map(|r| &r.url)
    }
}

/// Git checkout provisioned into a new sandbox.
#[derive(Debug, Clone)]
pub struct GitSource {
    pub url: String,
    pub revision: Option<String>,
    pub username: Option<String>,
    /// Only needed for private repositories.
    pub password: Option<SecretString>,
}

/// Everything the platform needs to create a sandbox.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub source: GitSource,
    pub vcpus: u32,
    /// Wall-clock budget after which the platform reclaims the sandbox.
    pub timeout: Duration,
    pub ports: Vec<u16>,
    pub runtime: String,
    /// Only consulted by the Docker backend.
    pub image: Option<String>,
}

impl SandboxSpec {
    /// Assemble a spec from configuration. The source URL is mandatory here.
    pub fn from_config(config: &SandboxConfig) -> Result<Self, ConfigError> {
        let url = config
            .source_url
            .clone()
            .ok_or_else(|| ConfigError::MissingRequired("SANDBOX_SOURCE_URL".to_string()))?;

        Ok(Self {
            source: GitSource {
                url,
                revision: config.source_revision.clone(),
                username: config.source_username.clone(),
                password: config.source_password.clone(),
            },
            vcpus: config.vcpus,
            timeout: config.timeout,
            ports: vec![config.port],
            runtime: config.runtime.clone(),
            image: config.docker_image.clone(),
        })
    }
}

/// Where a remote command's output goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// Stream to this process's stdout/stderr.
    #[default]
    Inherit,
    Discard,
}

/// One command to run inside a sandbox.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub cmd: String,
    pub args: Vec<String>,
    pub env: EnvOverlay,
    /// Run with elevated privileges.
    pub sudo: bool,
    /// Return as soon as the command is started; no exit code is awaited.
    pub detached: bool,
    pub output: OutputMode,
}

impl CommandRequest {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            args: Vec::new(),
            env: EnvOverlay::new(),
            sudo: false,
            detached: false,
            output: OutputMode::Inherit,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, env: EnvOverlay) -> Self {
        self.env = env;
        self
    }

    pub fn sudo(mut self, sudo: bool) -> Self {
        self.sudo = sudo;
        self
    }

    pub fn detached(mut self, detached: bool) -> Self {
        self.detached = detached;
        self
    }

    pub fn output(mut self, output: OutputMode) -> Self {
        self.output = output;
        self
    }

    /// `cmd arg1 arg2`, for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.cmd.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Result of a remote command. `exit_code` is `None` for detached commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandOutcome {
    pub exit_code: Option<i64>,
}

impl CommandOutcome {
    pub fn exited(code: i64) -> Self {
        Self {
            exit_code: Some(code),
        }
    }

    pub fn detached() -> Self {
        Self { exit_code: None }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// The external platform capability sandcron is built on.
#[async_trait]
pub trait SandboxPlatform: Send + Sync {
    /// Provision a new sandbox.
    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxHandle, PlatformError>;

    /// Look up an existing sandbox. Must succeed for a sandbox that is
    /// already stopping.
    async fn get(&self, id: &SandboxId) -> Result<SandboxHandle, PlatformError>;

    /// Stop a sandbox. Idempotent: stopping a stopped sandbox is `Ok`.
    async fn stop(&self, handle: &SandboxHandle) -> Result<(), PlatformError>;

    /// Run a command inside the sandbox.
    async fn run_command(
        &self,
        handle: &SandboxHandle,
        command: &CommandRequest,
    ) -> Result<CommandOutcome, PlatformError>;
}

/// Build the configured platform backend.
pub fn connect(config: &PlatformConfig) -> Result<Arc<dyn SandboxPlatform>, ConfigError> {
    match config.backend {
        SandboxBackend::Rest => Ok(Arc::new(RestPlatform::new(config)?)),
        SandboxBackend::Docker => Ok(Arc::new(DockerPlatform::new(config.docker_mount_socket))),
    }
}

/// Which host stream a chunk of remote output belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutputStream {
    Stdout,
    Stderr,
}

/// Relay remote output to the host's own streams.
pub(crate) async fn write_output(stream: OutputStream, data: &[u8]) {
    let result = match stream {
        OutputStream::Stdout => {
            let mut out = tokio::io::stdout();
            match out.write_all(data).await {
                Ok(()) => out.flush().await,
                Err(e) => Err(e),
            }
        }
        OutputStream::Stderr => {
            let mut err = tokio::io::stderr();
            match err.write_all(data).await {
                Ok(()) => err.flush().await,
                Err(e) => Err(e),
            }
        }
    };
    if let Err(e) = result {
        tracing::debug!(error = %e, "Failed to relay sandbox output");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_display() {
        for status in [
            SandboxStatus::Pending,
            SandboxStatus::Running,
            SandboxStatus::Stopping,
            SandboxStatus::Stopped,
            SandboxStatus::Failed,
        ] {
            assert_eq!(status.to_string().parse::<SandboxStatus>().unwrap(), status);
        }
        assert!("exploded".parse::<SandboxStatus>().is_err());
    }

    #[test]
    fn only_live_sandboxes_can_stop() {
        assert!(SandboxStatus::Pending.can_stop());
        assert!(SandboxStatus::Running.can_stop());
        assert!(!SandboxStatus::Stopping.can_stop());
        assert!(!SandboxStatus::Stopped.can_stop());
        assert!(!SandboxStatus::Failed.can_stop());
    }

    #[test]
    fn spec_requires_source() {
        let err = SandboxSpec::from_config(&SandboxConfig::default()).unwrap_err();
        assert!(err.to_string().contains("SANDBOX_SOURCE_URL"));

        let config = SandboxConfig {
            source_url: Some("https://github.com/acme/jobs.git".to_string()),
            ..Default::default()
        };
        let spec = SandboxSpec::from_config(&config).unwrap();
        assert_eq!(spec.ports, vec![3000]);
        assert_eq!(spec.vcpus, 2);
    }

    #[test]
    fn handle_resolves_route_by_port() {
        let handle = SandboxHandle {
            id: SandboxId::new("sbx_1"),
            status: SandboxStatus::Running,
            routes: vec![PortRoute {
                port: 3000,
                url: Url::parse("https://sbx-1.example.run").unwrap(),
            }],
            created_at: None,
        };
        assert!(handle.route(3000).is_some());
        assert!(handle.route(8080).is_none());
    }

    #[test]
    fn command_display_joins_args() {
        let cmd = CommandRequest::new("pnpm").args(["run", "build"]);
        assert_eq!(cmd.display(), "pnpm run build");
        assert!(!cmd.detached);
        assert_eq!(cmd.output, OutputMode::Inherit);
    }
}
