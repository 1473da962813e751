//! Readiness polling and job selection settings.

use std::time::Duration;

use url::Url;

use crate::config::helpers::{EnvSource, optional_env, parse_optional_env};
use crate::error::ConfigError;
use crate::orchestrator::readiness::{DEFAULT_DELAY, DEFAULT_MAX_ATTEMPTS, ProbeKind};
use crate::worker::JobKind;

/// Readiness polling and forwarding policy.
#[derive(Debug, Clone)]
pub struct ReadinessConfig {
    pub max_attempts: u32,
    /// Fixed pause between attempts. No backoff, no jitter.
    pub delay: Duration,
    /// Budget for a single probe.
    pub probe_timeout: Duration,
    /// Budget for a single forwarded request.
    pub forward_timeout: Duration,
    pub probe: ProbeKind,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay: DEFAULT_DELAY,
            probe_timeout: Duration::from_secs(5),
            forward_timeout: Duration::from_secs(30),
            probe: ProbeKind::default(),
        }
    }
}

impl ReadinessConfig {
    pub(crate) fn resolve(env: &EnvSource) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let max_attempts = parse_optional_env(env, "READINESS_MAX_ATTEMPTS", defaults.max_attempts)?;
        if max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "READINESS_MAX_ATTEMPTS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            max_attempts,
            delay: Duration::from_millis(parse_optional_env(
                env,
                "READINESS_DELAY_MS",
                defaults.delay.as_millis() as u64,
            )?),
            probe_timeout: positive_secs(
                env,
                "READINESS_PROBE_TIMEOUT_SECS",
                defaults.probe_timeout,
            )?,
            forward_timeout: positive_secs(
                env,
                "READINESS_FORWARD_TIMEOUT_SECS",
                defaults.forward_timeout,
            )?,
            probe: parse_optional_env(env, "READINESS_PROBE", defaults.probe)?,
        })
    }
}

/// A timeout in whole seconds. Zero would fail every attempt instantly.
fn positive_secs(
    env: &EnvSource,
    key: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let secs = parse_optional_env(env, key, default.as_secs())?;
    if secs == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be at least 1".to_string(),
        });
    }
    Ok(Duration::from_secs(secs))
}

/// The job body executed on the inner path.
#[derive(Debug, Clone, Default)]
pub struct JobConfig {
    pub kind: JobKind,
    /// Command line for [`JobKind::Shell`].
    pub command: Option<String>,
    /// Target for [`JobKind::Webhook`].
    pub webhook_url: Option<Url>,
}

impl JobConfig {
    pub(crate) fn resolve(env: &EnvSource) -> Result<Self, ConfigError> {
        let webhook_url = optional_env(env, "JOB_WEBHOOK_URL")?
            .map(|raw| {
                Url::parse(&raw).map_err(|e| ConfigError::InvalidValue {
                    key: "JOB_WEBHOOK_URL".to_string(),
                    message: e.to_string(),
                })
            })
            .transpose()?;

        Ok(Self {
            kind: parse_optional_env(env, "JOB_KIND", JobKind::default())?,
            command: optional_env(env, "JOB_COMMAND")?,
            webhook_url,
        })
    }
}
