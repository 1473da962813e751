//! Job bodies executed on the inner path.
//!
//! Inside a sandbox the dispatcher hands the job to a background task and
//! answers `202` right away; the job runs to completion afterwards and the
//! sandbox is stopped behind it.
//!
//! ```text
//! ┌───────────────────────────────┐
//! │ Sandbox                       │
//! │                               │
//! │  sandcron serve (inner)       │
//! │    └─ JobTask                 │
//! │        ├─ Job::run()          │──▶ ShellJob / WebhookJob
//! │        └─ teardown(own id)    │──▶ platform get + stop
//! └───────────────────────────────┘
//! ```

mod shell;
mod webhook;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::config::JobConfig;
use crate::error::{ConfigError, JobError};

pub use shell::ShellJob;
pub use webhook::WebhookJob;

/// The unit of work performed once per inner invocation.
#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self) -> Result<(), JobError>;
}

/// Handle to a job running in the background.
///
/// Dropping it detaches the task; the job still runs to completion.
#[derive(Debug)]
pub struct JobTask {
    handle: JoinHandle<Result<(), JobError>>,
}

impl JobTask {
    pub(crate) fn spawn<F>(fut: F) -> Self
    where
        F: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        Self {
            handle: tokio::spawn(fut),
        }
    }

    /// Wait for the job and its teardown to finish.
    pub async fn join(self) -> Result<(), JobError> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(JobError::Aborted(e.to_string())),
        }
    }
}

/// Built-in job bodies selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JobKind {
    /// Run `JOB_COMMAND` as a local process.
    #[default]
    Shell,
    /// POST a notification to `JOB_WEBHOOK_URL`.
    Webhook,
}

impl std::str::FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "shell" | "command" => Ok(Self::Shell),
            "webhook" => Ok(Self::Webhook),
            _ => Err(format!(
                "invalid job kind '{}', expected one of: shell, webhook",
                s
            )),
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Shell => write!(f, "shell"),
            Self::Webhook => write!(f, "webhook"),
        }
    }
}

/// Build the configured job.
pub fn job_from_config(config: &JobConfig) -> Result<Arc<dyn Job>, ConfigError> {
    match config.kind {
        JobKind::Shell => {
            let line = config
                .command
                .as_deref()
                .ok_or_else(|| ConfigError::MissingRequired("JOB_COMMAND".to_string()))?;
            let job = ShellJob::parse(line).ok_or_else(|| ConfigError::InvalidValue {
                key: "JOB_COMMAND".to_string(),
                message: "command is empty".to_string(),
            })?;
            Ok(Arc::new(job))
        }
        JobKind::Webhook => {
            let url = config
                .webhook_url
                .clone()
                .ok_or_else(|| ConfigError::MissingRequired("JOB_WEBHOOK_URL".to_string()))?;
            Ok(Arc::new(WebhookJob::new(url)))
        }
    }
}

#[cfg(test)]
mod tests {
    use url::Url;

    use super::*;

    #[test]
    fn kind_parses() {
        assert_eq!("webhook".parse::<JobKind>().unwrap(), JobKind::Webhook);
        assert_eq!("SHELL".parse::<JobKind>().unwrap(), JobKind::Shell);
        assert!("cron".parse::<JobKind>().is_err());
    }

    #[test]
    fn shell_job_requires_command() {
        let err = job_from_config(&JobConfig::default()).err().unwrap();
        assert!(err.to_string().contains("JOB_COMMAND"));

        let config = JobConfig {
            command: Some("echo hi".to_string()),
            ..Default::default()
        };
        assert_eq!(job_from_config(&config).unwrap().name(), "shell");
    }

    #[test]
    fn webhook_job_requires_url() {
        let mut config = JobConfig {
            kind: JobKind::Webhook,
            ..Default::default()
        };
        assert!(job_from_config(&config).is_err());

        config.webhook_url = Some(Url::parse("https://hooks.example.com/x").unwrap());
        assert_eq!(job_from_config(&config).unwrap().name(), "webhook");
    }

    #[tokio::test]
    async fn panicking_task_is_reported_as_aborted() {
        let task = JobTask::spawn(async {
            if true {
                panic!("boom");
            }
            Ok(())
        });
        let err = task.join().await.unwrap_err();
        assert!(matches!(err, JobError::Aborted(_)));
    }
}
