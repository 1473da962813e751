//! Bounded polling until the bootstrapped service answers.
//!
//! Polling and forwarding share one attempt budget: a probe that succeeds is
//! immediately followed by the forward, and a forward that hits a transport
//! error counts as a failed attempt.

use std::sync::Arc;
use std::time::Duration;

use crate::config::ReadinessConfig;
use crate::error::{OrchestratorError, ReadinessError};
use crate::orchestrator::forwarder::{ForwardedResponse, RequestForwarder};
use crate::orchestrator::trigger::TriggerRequest;
use crate::sandbox::{CommandRequest, OutputMode, SandboxHandle, SandboxPlatform};

/// Attempt ceiling before the service is declared dead.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 15;
/// Fixed pause between attempts.
pub const DEFAULT_DELAY: Duration = Duration::from_secs(2);

/// How a single readiness attempt is made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProbeKind {
    /// `curl` the service from inside the sandbox; exit 0 means it answered.
    #[default]
    Command,
    /// Request the sandbox's public route from here; any HTTP answer counts.
    Http,
    /// Skip probing and go straight to the forward.
    None,
}

impl std::str::FromStr for ProbeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "command" | "curl" => Ok(Self::Command),
            "http" => Ok(Self::Http),
            "none" | "off" => Ok(Self::None),
            _ => Err(format!(
                "invalid probe '{}', expected one of: command, http, none",
                s
            )),
        }
    }
}

/// Retry policy. No backoff, no jitter.
#[derive(Debug, Clone)]
pub struct ReadinessPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub probe_timeout: Duration,
    pub probe: ProbeKind,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay: DEFAULT_DELAY,
            probe_timeout: Duration::from_secs(5),
            probe: ProbeKind::default(),
        }
    }
}

impl From<&ReadinessConfig> for ReadinessPolicy {
    fn from(config: &ReadinessConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            delay: config.delay,
            probe_timeout: config.probe_timeout,
            probe: config.probe,
        }
    }
}

/// What one probe saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeObservation {
    ExitCode(Option<i64>),
    Status(u16),
    Unreachable(String),
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    /// 1-based.
    pub attempt: u32,
    pub success: bool,
    pub observed: ProbeObservation,
}

/// Polls one sandbox's service port.
#[derive(Clone)]
pub struct ReadinessPoller {
    platform: Arc<dyn SandboxPlatform>,
    client: reqwest::Client,
    policy: ReadinessPolicy,
    port: u16,
}

impl ReadinessPoller {
    pub fn new(platform: Arc<dyn SandboxPlatform>, policy: ReadinessPolicy, port: u16) -> Self {
        Self {
            platform,
            client: reqwest::Client::new(),
            policy,
            port,
        }
    }

    /// The service as seen from inside the sandbox.
    pub fn local_target(&self, trigger: &TriggerRequest) -> String {
        let mut target = format!("http://localhost:{}{}", self.port, trigger.path_and_query);
        if let Some(ref fragment) = trigger.fragment {
            target.push('#');
            target.push_str(fragment);
        }
        target
    }

    async fn probe(&self, handle: &SandboxHandle, trigger: &TriggerRequest, attempt: u32) -> ProbeResult {
        let observed = match self.policy.probe {
            ProbeKind::None => ProbeObservation::Skipped,
            ProbeKind::Command => self.probe_command(handle, trigger).await,
            ProbeKind::Http => self.probe_http(handle, trigger).await,
        };
        let success = match observed {
            ProbeObservation::ExitCode(code) => code == Some(0),
            ProbeObservation::Status(_) | ProbeObservation::Skipped => true,
            ProbeObservation::Unreachable(_) => false,
        };
        ProbeResult {
            attempt,
            success,
            observed,
        }
    }

    async fn probe_command(&self, handle: &SandboxHandle, trigger: &TriggerRequest) -> ProbeObservation {
        let timeout = self.policy.probe_timeout;
        let request = CommandRequest::new("curl")
            .args([
                "-s".to_string(),
                "-o".to_string(),
                "/dev/null".to_string(),
                "--max-time".to_string(),
                timeout.as_secs().max(1).to_string(),
                self.local_target(trigger),
            ])
            .output(OutputMode::Discard);

        // Grace on top of curl's own limit for the exec round trip.
        match tokio::time::timeout(timeout * 2, self.platform.run_command(handle, &request)).await {
            Ok(Ok(outcome)) => ProbeObservation::ExitCode(outcome.exit_code),
            Ok(Err(e)) => ProbeObservation::Unreachable(e.to_string()),
            Err(_) => ProbeObservation::Unreachable("probe timed out".to_string()),
        }
    }

    async fn probe_http(&self, handle: &SandboxHandle, trigger: &TriggerRequest) -> ProbeObservation {
        let Some(route) = handle.route(self.port) else {
            return ProbeObservation::Unreachable(format!("no route for port {}", self.port));
        };
        let url = trigger.resolve_against(route);
        match self
            .client
            .get(url)
            .timeout(self.policy.probe_timeout)
            .send()
            .await
        {
            Ok(resp) => ProbeObservation::Status(resp.status().as_u16()),
            Err(e) => ProbeObservation::Unreachable(e.to_string()),
        }
    }

    /// Poll until a probe succeeds or the budget is spent, without forwarding.
    #[cfg(test)]
    async fn wait_until_ready(
        &self,
        handle: &SandboxHandle,
        trigger: &TriggerRequest,
    ) -> Result<ProbeResult, ReadinessError> {
        for attempt in 1..=self.policy.max_attempts {
            let result = self.probe(handle, trigger, attempt).await;
            if result.success {
                tracing::info!(sandbox_id = %handle.id, attempt, "Service is ready");
                return Ok(result);
            }
            self.log_failure(handle, &result);
            self.pause(attempt).await;
        }
        Err(ReadinessError::Timeout {
            attempts: self.policy.max_attempts,
        })
    }

    /// Poll, then forward the trigger as soon as the service answers.
    pub async fn wait_and_forward(
        &self,
        handle: &SandboxHandle,
        trigger: &TriggerRequest,
        forwarder: &RequestForwarder,
    ) -> Result<ForwardedResponse, OrchestratorError> {
        for attempt in 1..=self.policy.max_attempts {
            let result = self.probe(handle, trigger, attempt).await;
            if !result.success {
                self.log_failure(handle, &result);
                self.pause(attempt).await;
                continue;
            }

            match forwarder.forward(handle, trigger).await {
                Ok(response) => {
                    tracing::info!(
                        sandbox_id = %handle.id,
                        attempt,
                        status = response.status.as_u16(),
                        "Request forwarded"
                    );
                    return Ok(response);
                }
                Err(e) if e.is_transient() => {
                    tracing::debug!(sandbox_id = %handle.id, attempt, error = %e, "Forward failed, retrying");
                    self.pause(attempt).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        tracing::error!(
            sandbox_id = %handle.id,
            attempts = self.policy.max_attempts,
            "Service never became ready"
        );
        Err(ReadinessError::Timeout {
            attempts: self.policy.max_attempts,
        }
        .into())
    }

    fn log_failure(&self, handle: &SandboxHandle, result: &ProbeResult) {
        tracing::debug!(
            sandbox_id = %handle.id,
            attempt = result.attempt,
            max_attempts = self.policy.max_attempts,
            observed = ?result.observed,
            "Service not ready"
        );
    }

    /// Sleep between attempts, never after the last one.
    async fn pause(&self, attempt: u32) {
        if attempt < self.policy.max_attempts {
            tokio::time::sleep(self.policy.delay).await;
        }
    }
}
