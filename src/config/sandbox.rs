//! Sandbox backend, source repository and bootstrap command settings.

use std::time::Duration;

use secrecy::SecretString;
use url::Url;

use crate::config::helpers::{
    EnvSource, optional_env, parse_bool_env, parse_optional_env, parse_string_env, raw_env,
};
use crate::error::ConfigError;

/// Which platform provisions sandboxes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SandboxBackend {
    /// Hosted sandbox service reached over its REST API.
    #[default]
    Rest,
    /// Local Docker engine, for development.
    Docker,
}

impl std::str::FromStr for SandboxBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rest" | "api" | "vercel" => Ok(Self::Rest),
            "docker" | "local" => Ok(Self::Docker),
            _ => Err(format!(
                "invalid sandbox backend '{}', expected one of: rest, docker",
                s
            )),
        }
    }
}

impl std::fmt::Display for SandboxBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rest => write!(f, "rest"),
            Self::Docker => write!(f, "docker"),
        }
    }
}

/// Connection settings for the sandbox platform.
#[derive(Debug, Clone)]
pub struct PlatformConfig {
    pub backend: SandboxBackend,
    /// Base URL of the REST platform.
    pub api_url: Url,
    /// Platform identity token. Mandatory for the REST backend.
    pub api_token: Option<SecretString>,
    /// Optional team scope appended to every REST call.
    pub team_id: Option<String>,
    /// Bind the host's Docker socket into Docker sandboxes so the inner
    /// worker can stop its own container.
    pub docker_mount_socket: bool,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            backend: SandboxBackend::Rest,
            api_url: Url::parse(DEFAULT_API_URL).expect("default API URL is valid"),
            api_token: None,
            team_id: None,
            docker_mount_socket: true,
        }
    }
}

const DEFAULT_API_URL: &str = "https://api.vercel.com";

impl PlatformConfig {
    pub(crate) fn resolve(env: &EnvSource) -> Result<Self, ConfigError> {
        let api_url = parse_string_env(env, "SANDBOX_API_URL", DEFAULT_API_URL)?;
        let api_url = Url::parse(&api_url).map_err(|e| ConfigError::InvalidValue {
            key: "SANDBOX_API_URL".to_string(),
            message: e.to_string(),
        })?;

        Ok(Self {
            backend: parse_optional_env(env, "SANDBOX_BACKEND", SandboxBackend::default())?,
            api_url,
            api_token: optional_env(env, "SANDBOX_API_TOKEN")?.map(SecretString::from),
            team_id: optional_env(env, "SANDBOX_TEAM_ID")?,
            docker_mount_socket: parse_bool_env(env, "SANDBOX_DOCKER_MOUNT_SOCKET", true)?,
        })
    }

    /// The REST backend cannot provision anything without an identity token.
    pub fn require_token(&self) -> Result<&SecretString, ConfigError> {
        self.api_token
            .as_ref()
            .ok_or_else(|| ConfigError::MissingRequired("SANDBOX_API_TOKEN".to_string()))
    }
}

/// What to provision: source, resource shape and exposed port.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Git URL of the project booted inside the sandbox. Required on the
    /// outer path only.
    pub source_url: Option<String>,
    pub source_revision: Option<String>,
    pub source_username: Option<String>,
    pub source_password: Option<SecretString>,
    pub vcpus: u32,
    pub timeout: Duration,
    /// Port the inner service listens on; it is the only port exposed.
    pub port: u16,
    pub runtime: String,
    /// Docker image override; derived from `runtime` when unset.
    pub docker_image: Option<String>,
    /// Forward the host environment into bootstrap steps.
    pub forward_env: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            source_url: None,
            source_revision: None,
            source_username: None,
            source_password: None,
            vcpus: 2,
            timeout: Duration::from_secs(300),
            port: 3000,
            runtime: "node22".to_string(),
            docker_image: None,
            forward_env: true,
        }
    }
}

impl SandboxConfig {
    pub(crate) fn resolve(env: &EnvSource) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let vcpus = parse_optional_env(env, "SANDBOX_VCPUS", defaults.vcpus)?;
        if vcpus == 0 {
            return Err(ConfigError::InvalidValue {
                key: "SANDBOX_VCPUS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            source_url: optional_env(env, "SANDBOX_SOURCE_URL")?,
            source_revision: optional_env(env, "SANDBOX_SOURCE_REVISION")?,
            source_username: optional_env(env, "SANDBOX_SOURCE_USERNAME")?,
            source_password: optional_env(env, "SANDBOX_SOURCE_PASSWORD")?.map(SecretString::from),
            vcpus,
            timeout: Duration::from_secs(parse_optional_env(
                env,
                "SANDBOX_TIMEOUT_SECS",
                defaults.timeout.as_secs(),
            )?),
            port: parse_optional_env(env, "SANDBOX_PORT", defaults.port)?,
            runtime: parse_string_env(env, "SANDBOX_RUNTIME", &defaults.runtime)?,
            docker_image: optional_env(env, "SANDBOX_DOCKER_IMAGE")?,
            forward_env: parse_bool_env(env, "SANDBOX_FORWARD_ENV", defaults.forward_env)?,
        })
    }
}

/// Command lines for the bootstrap plan.
///
/// Install and build are optional (an empty value disables them); the start
/// command is required because it launches the inner service.
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    pub install: Option<String>,
    pub build: Option<String>,
    pub start: String,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            install: Some("pnpm install".to_string()),
            build: Some("pnpm build".to_string()),
            start: "pnpm start".to_string(),
        }
    }
}

impl BootstrapConfig {
    pub(crate) fn resolve(env: &EnvSource) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let start = match raw_env(env, "BOOTSTRAP_START_CMD") {
            Some(cmd) if cmd.is_empty() => {
                return Err(ConfigError::InvalidValue {
                    key: "BOOTSTRAP_START_CMD".to_string(),
                    message: "the start command cannot be empty".to_string(),
                });
            }
            Some(cmd) => cmd,
            None => defaults.start,
        };

        Ok(Self {
            install: optional_step(env, "BOOTSTRAP_INSTALL_CMD", defaults.install),
            build: optional_step(env, "BOOTSTRAP_BUILD_CMD", defaults.build),
            start,
        })
    }
}

/// Unset keeps the default, an explicit empty value disables the step.
fn optional_step(env: &EnvSource, key: &str, default: Option<String>) -> Option<String> {
    match raw_env(env, key) {
        Some(cmd) if cmd.is_empty() => None,
        Some(cmd) => Some(cmd),
        None => default,
    }
}
