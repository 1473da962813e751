//! Ordered bootstrap steps run inside a freshly provisioned sandbox.
//!
//! The default plan mirrors a Node project: install, build, then launch the
//! service detached with the inner-context markers set so the same binary
//! takes the inner path when the forwarded request arrives.

use std::sync::Arc;

use crate::config::{
    BootstrapConfig, IN_SANDBOX_VAR, SANDBOX_ID_VAR, SERVER_HOST_VAR, SERVER_PORT_VAR,
};
use crate::error::BootstrapError;
use crate::sandbox::{CommandRequest, EnvOverlay, SandboxHandle, SandboxPlatform};

/// One command in the plan.
#[derive(Debug, Clone)]
pub struct BootstrapStep {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    /// Per-step overrides layered over the forwarded environment.
    pub env: EnvOverlay,
    pub detached: bool,
    /// Launches the inner service, so it receives the inner-context markers.
    pub starts_service: bool,
}

impl BootstrapStep {
    /// Split a command line on whitespace. No shell quoting is interpreted.
    pub fn parse(name: impl Into<String>, line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let command = parts.next()?;
        Some(Self {
            name: name.into(),
            command,
            args: parts.collect(),
            env: EnvOverlay::new(),
            detached: false,
            starts_service: false,
        })
    }

    pub fn detached(mut self) -> Self {
        self.detached = true;
        self
    }

    pub fn starts_service(mut self) -> Self {
        self.starts_service = true;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.set(key, value);
        self
    }
}

/// Steps in execution order.
#[derive(Debug, Clone, Default)]
pub struct BootstrapPlan {
    pub steps: Vec<BootstrapStep>,
}

impl BootstrapPlan {
    pub fn new(steps: Vec<BootstrapStep>) -> Self {
        Self { steps }
    }

    pub fn from_config(config: &BootstrapConfig) -> Self {
        let mut steps = Vec::new();
        if let Some(step) = config
            .install
            .as_deref()
            .and_then(|line| BootstrapStep::parse("install", line))
        {
            steps.push(step);
        }
        if let Some(step) = config
            .build
            .as_deref()
            .and_then(|line| BootstrapStep::parse("build", line))
        {
            steps.push(step);
        }
        if let Some(step) = BootstrapStep::parse("start", &config.start) {
            steps.push(step.detached().starts_service());
        }
        Self { steps }
    }

    pub fn names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }
}

/// Runs a [`BootstrapPlan`] against one sandbox.
#[derive(Clone)]
pub struct BootstrapSequencer {
    platform: Arc<dyn SandboxPlatform>,
    /// Forwarded outer environment, the lowest layer of every step's env.
    base_env: EnvOverlay,
    /// Exposed sandbox port the started service must listen on.
    service_port: u16,
}

impl BootstrapSequencer {
    pub fn new(platform: Arc<dyn SandboxPlatform>, base_env: EnvOverlay, service_port: u16) -> Self {
        Self {
            platform,
            base_env,
            service_port,
        }
    }

    /// The environment a step runs with.
    pub fn step_env(&self, handle: &SandboxHandle, step: &BootstrapStep) -> EnvOverlay {
        let env = self.base_env.clone().merged(&step.env);
        if step.starts_service {
            env.with(IN_SANDBOX_VAR, "true")
                .with(SANDBOX_ID_VAR, handle.id.as_str())
                .with(SERVER_HOST_VAR, "0.0.0.0")
                .with(SERVER_PORT_VAR, self.service_port.to_string())
        } else {
            env
        }
    }

    /// Run every step in order. The first failing non-detached step aborts
    /// the rest; detached steps already launched keep running.
    pub async fn run(
        &self,
        handle: &SandboxHandle,
        plan: &BootstrapPlan,
    ) -> Result<(), BootstrapError> {
        for step in &plan.steps {
            let request = CommandRequest::new(step.command.clone())
                .args(step.args.iter().cloned())
                .env(self.step_env(handle, step))
                .detached(step.detached);

            tracing::info!(
                sandbox_id = %handle.id,
                step = %step.name,
                command = %request.display(),
                detached = step.detached,
                "Running bootstrap step"
            );

            let outcome = self
                .platform
                .run_command(handle, &request)
                .await
                .map_err(|source| BootstrapError::Platform {
                    step: step.name.clone(),
                    source,
                })?;

            if step.detached {
                continue;
            }

            match outcome.exit_code {
                Some(0) => {}
                Some(exit_code) => {
                    tracing::error!(
                        sandbox_id = %handle.id,
                        step = %step.name,
                        exit_code,
                        "Bootstrap step failed"
                    );
                    return Err(BootstrapError::StepFailed {
                        step: step.name.clone(),
                        exit_code,
                    });
                }
                None => {
                    return Err(BootstrapError::MissingExitCode {
                        step: step.name.clone(),
                    });
                }
            }
        }

        tracing::info!(sandbox_id = %handle.id, steps = plan.steps.len(), "Bootstrap complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use super::*;
    use crate::config::{Config, EnvSource};
    use crate::orchestrator::ExecutionContext;
    use crate::testing::{MockPlatform, PlatformCall, test_handle};

    fn commands(calls: &[PlatformCall]) -> Vec<String> {
        calls
            .iter()
            .filter_map(|c| match c {
                PlatformCall::RunCommand { command, .. } => Some(command.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn default_plan_is_install_build_start() {
        let plan = BootstrapPlan::from_config(&BootstrapConfig::default());
        assert_eq!(plan.names(), vec!["install", "build", "start"]);
        let start = &plan.steps[2];
        assert!(start.detached && start.starts_service);
        assert_eq!(start.command, "pnpm");
        assert_eq!(start.args, vec!["start"]);
    }

    #[test]
    fn disabled_steps_are_skipped() {
        let config = BootstrapConfig {
            install: None,
            build: Some("   ".to_string()),
            start: "node server.js".to_string(),
        };
        assert_eq!(BootstrapPlan::from_config(&config).names(), vec!["start"]);
    }

    #[test]
    fn only_start_step_gets_markers() {
        let mock = Arc::new(MockPlatform::new());
        let base = EnvOverlay::new().with("CRON_SECRET", "abc").with("IN_SANDBOX", "false");
        let sequencer = BootstrapSequencer::new(mock, base, 3000);
        let handle = test_handle();
        let plan = BootstrapPlan::from_config(&BootstrapConfig::default());

        let install = sequencer.step_env(&handle, &plan.steps[0]);
        assert_eq!(install.get("CRON_SECRET"), Some("abc"));
        assert_eq!(install.get(SANDBOX_ID_VAR), None);

        let start = sequencer.step_env(&handle, &plan.steps[2]);
        assert_eq!(start.get(IN_SANDBOX_VAR), Some("true"));
        assert_eq!(start.get(SANDBOX_ID_VAR), Some(handle.id.as_str()));
        assert_eq!(start.get("CRON_SECRET"), Some("abc"));
    }

    #[test]
    fn start_step_listens_on_the_exposed_port() {
        // Outer instance listening on 127.0.0.1:8080, sandbox exposing 3000.
        let outer = Config::resolve(&EnvSource::from_pairs([
            ("CRON_SECRET", "abc"),
            ("SERVER_HOST", "127.0.0.1"),
            ("SERVER_PORT", "8080"),
        ]))
        .unwrap();
        let sequencer = BootstrapSequencer::new(
            Arc::new(MockPlatform::new()),
            outer.forwarded_env.clone(),
            outer.sandbox.port,
        );
        let handle = test_handle();
        let plan = BootstrapPlan::from_config(&outer.bootstrap);

        let install = sequencer.step_env(&handle, &plan.steps[0]);
        assert_eq!(install.get(SERVER_PORT_VAR), Some("8080"));

        // The inner instance resolves its config from the start step's env.
        let start = sequencer.step_env(&handle, &plan.steps[2]);
        let inner = Config::resolve(&EnvSource::from_pairs(start.defined())).unwrap();
        assert_eq!(inner.server.port, outer.sandbox.port);
        assert_eq!(inner.server.host, IpAddr::from([0, 0, 0, 0]));
        assert!(matches!(inner.context, ExecutionContext::Inner { .. }));
    }

    #[test]
    fn step_overrides_win_over_forwarded_env() {
        let mock = Arc::new(MockPlatform::new());
        let sequencer = BootstrapSequencer::new(
            mock,
            EnvOverlay::new().with("NODE_ENV", "development"),
            3000,
        );
        let step = BootstrapStep::parse("build", "pnpm build")
            .unwrap()
            .with_env("NODE_ENV", "production");
        let env = sequencer.step_env(&test_handle(), &step);
        assert_eq!(env.get("NODE_ENV"), Some("production"));
    }

    #[tokio::test]
    async fn runs_steps_in_order() {
        let mock = Arc::new(MockPlatform::new());
        let sequencer = BootstrapSequencer::new(mock.clone(), EnvOverlay::new(), 3000);
        let plan = BootstrapPlan::from_config(&BootstrapConfig::default());

        sequencer.run(&test_handle(), &plan).await.unwrap();
        assert_eq!(
            commands(&mock.calls()),
            vec!["pnpm install", "pnpm build", "pnpm start"]
        );
    }

    #[tokio::test]
    async fn failing_step_stops_the_plan() {
        let mock = Arc::new(MockPlatform::new().fail_command("pnpm install", 1));
        let sequencer = BootstrapSequencer::new(mock.clone(), EnvOverlay::new(), 3000);
        let plan = BootstrapPlan::from_config(&BootstrapConfig::default());

        let err = sequencer.run(&test_handle(), &plan).await.unwrap_err();
        assert!(matches!(
            err,
            BootstrapError::StepFailed { ref step, exit_code: 1 } if step == "install"
        ));
        assert_eq!(commands(&mock.calls()), vec!["pnpm install"]);
    }

    #[tokio::test]
    async fn failing_build_leaves_start_unrun() {
        let mock = Arc::new(MockPlatform::new().fail_command("pnpm build", 2));
        let sequencer = BootstrapSequencer::new(mock.clone(), EnvOverlay::new(), 3000);
        let plan = BootstrapPlan::from_config(&BootstrapConfig::default());

        let err = sequencer.run(&test_handle(), &plan).await.unwrap_err();
        assert_eq!(err.to_string(), "Bootstrap step 'build' exited with code 2");
        assert_eq!(commands(&mock.calls()), vec!["pnpm install", "pnpm build"]);
    }
}
