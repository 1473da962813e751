//! Configuration for sandcron.
//!
//! Everything is resolved from environment variables (optionally seeded from
//! a `.env` file via dotenvy) into typed sub-configs. The process environment
//! is captured once into an [`EnvSource`]; the resolved [`Config`] is then
//! passed explicitly to whatever needs it.

mod helpers;
mod orchestrator;
mod sandbox;
mod server;

use crate::error::ConfigError;
use crate::orchestrator::ExecutionContext;
use crate::sandbox::EnvOverlay;

pub use self::helpers::EnvSource;
pub use self::orchestrator::{JobConfig, ReadinessConfig};
pub use self::sandbox::{BootstrapConfig, PlatformConfig, SandboxBackend, SandboxConfig};
pub use self::server::{
    AuthConfig, CRON_SECRET_VAR, IN_SANDBOX_VAR, SANDBOX_ID_VAR, SERVER_HOST_VAR, SERVER_PORT_VAR,
    ServerConfig,
};

/// Main configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    /// Outer orchestrator or inner worker, fixed for the process lifetime.
    pub context: ExecutionContext,
    pub platform: PlatformConfig,
    pub sandbox: SandboxConfig,
    pub bootstrap: BootstrapConfig,
    pub readiness: ReadinessConfig,
    pub job: JobConfig,
    /// Host environment forwarded into bootstrap steps (empty when
    /// `SANDBOX_FORWARD_ENV=false`).
    pub forwarded_env: EnvOverlay,
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// Loads `./.env` first via dotenvy, which never overwrites variables
    /// that are already set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::resolve(&EnvSource::from_process())
    }

    /// Build config from an environment snapshot.
    pub fn resolve(env: &EnvSource) -> Result<Self, ConfigError> {
        let sandbox = SandboxConfig::resolve(env)?;
        let forwarded_env = if sandbox.forward_env {
            EnvOverlay::from_host(env)
        } else {
            EnvOverlay::new()
        };

        Ok(Self {
            server: ServerConfig::resolve(env)?,
            auth: AuthConfig::resolve(env)?,
            context: server::resolve_context(env)?,
            platform: PlatformConfig::resolve(env)?,
            sandbox,
            bootstrap: BootstrapConfig::resolve(env)?,
            readiness: ReadinessConfig::resolve(env)?,
            job: JobConfig::resolve(env)?,
            forwarded_env,
        })
    }
}
