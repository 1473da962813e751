//! Listener, shared secret and execution-context settings.

use std::net::{IpAddr, SocketAddr};

use secrecy::SecretString;

use crate::config::helpers::{
    EnvSource, optional_env, parse_bool_env, parse_optional_env, required_env,
};
use crate::error::ConfigError;
use crate::orchestrator::ExecutionContext;
use crate::sandbox::SandboxId;

/// Env var carrying the shared bearer secret.
pub const CRON_SECRET_VAR: &str = "CRON_SECRET";
/// Set to `true` by the bootstrap start step inside a provisioned sandbox.
pub const IN_SANDBOX_VAR: &str = "IN_SANDBOX";
/// The sandbox's own identifier, set alongside [`IN_SANDBOX_VAR`].
pub const SANDBOX_ID_VAR: &str = "SANDBOX_ID";
/// Listener address. Pinned on the start step so a forwarded outer value
/// cannot move the inner listener off the exposed port.
pub const SERVER_HOST_VAR: &str = "SERVER_HOST";
pub const SERVER_PORT_VAR: &str = "SERVER_PORT";

/// HTTP listener configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::from([0, 0, 0, 0]),
            port: 3000,
        }
    }
}

impl ServerConfig {
    pub(crate) fn resolve(env: &EnvSource) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            host: parse_optional_env(env, SERVER_HOST_VAR, defaults.host)?,
            port: parse_optional_env(env, SERVER_PORT_VAR, defaults.port)?,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

/// Shared-secret authentication for the trigger endpoint.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    /// `None` means misconfigured: the gate then refuses every request.
    pub secret: Option<SecretString>,
}

impl AuthConfig {
    pub(crate) fn resolve(env: &EnvSource) -> Result<Self, ConfigError> {
        Ok(Self {
            secret: optional_env(env, CRON_SECRET_VAR)?.map(SecretString::from),
        })
    }

    /// Refuse to start without a secret.
    pub fn require_secret(&self) -> Result<&SecretString, ConfigError> {
        self.secret
            .as_ref()
            .ok_or_else(|| ConfigError::MissingRequired(CRON_SECRET_VAR.to_string()))
    }
}

/// Derive the execution context from the inner-sandbox markers.
pub(crate) fn resolve_context(env: &EnvSource) -> Result<ExecutionContext, ConfigError> {
    if !parse_bool_env(env, IN_SANDBOX_VAR, false)? {
        return Ok(ExecutionContext::Outer);
    }

    // Set by the bootstrap sequencer on the start step.
    let sandbox_id = required_env(env, SANDBOX_ID_VAR)?;

    Ok(ExecutionContext::Inner {
        sandbox_id: SandboxId::new(sandbox_id),
    })
}
