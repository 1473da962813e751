use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::error::JobError;
use crate::worker::Job;

/// Runs a local command and streams its output into the log.
#[derive(Debug, Clone)]
pub struct ShellJob {
    program: String,
    args: Vec<String>,
}

impl ShellJob {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Whitespace-split command line; `None` if empty.
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }
}

#[async_trait]
impl Job for ShellJob {
    fn name(&self) -> &str {
        "shell"
    }

    async fn run(&self) -> Result<(), JobError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| JobError::Spawn {
                reason: format!("failed to spawn {}: {}", self.program, e),
            })?;

        let stdout = child.stdout.take().ok_or_else(|| JobError::Spawn {
            reason: "failed to capture stdout".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| JobError::Spawn {
            reason: "failed to capture stderr".to_string(),
        })?;

        let program = self.program.clone();
        let stderr_handle = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::warn!(program = %program, "{}", line);
            }
        });

        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::info!(program = %self.program, "{}", line);
        }

        let status = child.wait().await.map_err(|e| JobError::Failed {
            reason: format!("failed waiting for {}: {}", self.program, e),
        })?;
        let _ = stderr_handle.await;

        if !status.success() {
            let code = status.code().unwrap_or(-1);
            return Err(JobError::Failed {
                reason: format!("{} exited with code {}", self.program, code),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_splits_on_whitespace() {
        let job = ShellJob::parse("  node  scripts/cleanup.js --dry-run ").unwrap();
        assert_eq!(job.program, "node");
        assert_eq!(job.args, vec!["scripts/cleanup.js", "--dry-run"]);
        assert!(ShellJob::parse("   ").is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn zero_exit_is_success() {
        ShellJob::parse("true").unwrap().run().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_is_failure() {
        let err = ShellJob::new("sh", vec!["-c".into(), "echo oops >&2; exit 3".into()])
            .run()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exited with code 3"), "got: {}", err);
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let err = ShellJob::parse("definitely-not-a-real-binary-xyz")
            .unwrap()
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Spawn { .. }));
    }
}
