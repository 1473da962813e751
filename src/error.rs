//! Error types for sandcron.
//!
//! One enum per concern, with `OrchestratorError` as the umbrella that the
//! HTTP entrypoint turns into a response.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Configuration errors. Always fatal, and always raised before any sandbox
/// is provisioned.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    MissingRequired(String),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

/// Errors reported by a sandbox platform backend.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("Sandbox API request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Sandbox API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Docker error: {reason}")]
    Docker { reason: String },

    #[error("Sandbox {id} not found")]
    NotFound { id: String },

    #[error("Invalid sandbox API response: {reason}")]
    InvalidResponse { reason: String },
}

/// A bootstrap step could not complete.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("Bootstrap step '{step}' exited with code {exit_code}")]
    StepFailed { step: String, exit_code: i64 },

    #[error("Bootstrap step '{step}' finished without an exit code")]
    MissingExitCode { step: String },

    #[error("Bootstrap step '{step}' could not be run: {source}")]
    Platform {
        step: String,
        #[source]
        source: PlatformError,
    },
}

/// The bootstrapped service never became reachable.
#[derive(Debug, thiserror::Error)]
pub enum ReadinessError {
    #[error("Server failed to respond after {attempts} attempts")]
    Timeout { attempts: u32 },
}

/// Forwarding the trigger request into the sandbox failed.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("Inner service unreachable: {0}")]
    Transport(#[source] reqwest::Error),

    /// The request went out but no answer came back in time. It may already
    /// have been delivered, so it is never re-sent.
    #[error("Inner service did not answer in time (request may have been delivered): {0}")]
    TimedOut(#[source] reqwest::Error),

    #[error("Sandbox {sandbox_id} exposes no route for port {port}")]
    NoRoute { sandbox_id: String, port: u16 },

    #[error("Invalid forward target: {0}")]
    InvalidTarget(String),
}

impl ForwardError {
    /// Transient failures are retried under the readiness budget; anything
    /// else aborts the outer path.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => !e.is_builder(),
            Self::TimedOut(_) | Self::NoRoute { .. } | Self::InvalidTarget(_) => false,
        }
    }
}

/// Failure of the job body on the inner path.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobError {
    #[error("Job could not be started: {reason}")]
    Spawn { reason: String },

    #[error("Job failed: {reason}")]
    Failed { reason: String },

    #[error("Job aborted: {0}")]
    Aborted(String),
}

/// Top-level error for one dispatcher invocation.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to provision sandbox: {0}")]
    Provisioning(#[source] PlatformError),

    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),

    #[error(transparent)]
    Readiness(#[from] ReadinessError),

    #[error(transparent)]
    Forward(#[from] ForwardError),
}

impl From<PlatformError> for OrchestratorError {
    fn from(err: PlatformError) -> Self {
        Self::Provisioning(err)
    }
}

impl IntoResponse for OrchestratorError {
    fn into_response(self) -> Response {
        (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response()
    }
}
