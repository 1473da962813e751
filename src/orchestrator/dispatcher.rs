//! Per-invocation state machine.
//!
//! ```text
//! START ──auth──▶ AUTH_CHECKED ──context──┬──▶ OUTER ──▶ DONE(Started)
//!   │                                     └──▶ INNER ──▶ DONE(Accepted)
//!   └──rejected──▶ DONE(Unauthorized)
//! ```

use std::sync::Arc;

use crate::config::Config;
use crate::error::{ConfigError, JobError, OrchestratorError};
use crate::orchestrator::auth::{AuthDecision, AuthGate};
use crate::orchestrator::bootstrap::{BootstrapPlan, BootstrapSequencer};
use crate::orchestrator::forwarder::{ForwardedResponse, RequestForwarder};
use crate::orchestrator::provisioner::Provisioner;
use crate::orchestrator::readiness::{ReadinessPoller, ReadinessPolicy};
use crate::orchestrator::trigger::TriggerRequest;
use crate::sandbox::{SandboxId, SandboxPlatform, SandboxSpec};
use crate::worker::{Job, JobTask};

/// Which role this process plays. Fixed for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionContext {
    /// Outside any sandbox: provision one and hand the request over.
    Outer,
    /// Inside the sandbox `sandbox_id`: run the job, then stop the sandbox.
    Inner { sandbox_id: SandboxId },
}

/// Terminal result of one invocation.
#[derive(Debug)]
pub enum DispatchOutcome {
    Unauthorized,
    /// Outer path finished; the inner service has answered.
    Started(ForwardedResponse),
    /// Inner path accepted; the job continues in the background.
    Accepted(JobTask),
}

#[derive(Debug)]
pub enum DispatchState {
    Start,
    AuthChecked,
    Outer,
    Inner(SandboxId),
    Done(DispatchOutcome),
}

impl DispatchState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::AuthChecked => "auth_checked",
            Self::Outer => "outer",
            Self::Inner(_) => "inner",
            Self::Done(_) => "done",
        }
    }
}

/// Wires the auth gate, the outer pipeline and the inner job together.
pub struct Dispatcher {
    gate: AuthGate,
    context: ExecutionContext,
    provisioner: Provisioner,
    sequencer: BootstrapSequencer,
    plan: BootstrapPlan,
    poller: ReadinessPoller,
    forwarder: RequestForwarder,
    job: Arc<dyn Job>,
}

impl Dispatcher {
    /// Build from resolved configuration. The sandbox source is only
    /// required when running as the outer orchestrator.
    pub fn from_config(
        config: &Config,
        platform: Arc<dyn SandboxPlatform>,
        job: Arc<dyn Job>,
    ) -> Result<Self, ConfigError> {
        let spec = match config.context {
            ExecutionContext::Outer => Some(SandboxSpec::from_config(&config.sandbox)?),
            ExecutionContext::Inner { .. } => None,
        };
        let port = config.sandbox.port;

        Ok(Self {
            gate: AuthGate::new(config.auth.secret.clone()),
            context: config.context.clone(),
            provisioner: Provisioner::new(platform.clone(), spec),
            sequencer: BootstrapSequencer::new(
                platform.clone(),
                config.forwarded_env.clone(),
                port,
            ),
            plan: BootstrapPlan::from_config(&config.bootstrap),
            poller: ReadinessPoller::new(platform, ReadinessPolicy::from(&config.readiness), port),
            forwarder: RequestForwarder::new(port, config.readiness.forward_timeout),
            job,
        })
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// Drive one trigger from `START` to `DONE`.
    pub async fn dispatch(&self, trigger: TriggerRequest) -> Result<DispatchOutcome, OrchestratorError> {
        let mut state = DispatchState::Start;
        loop {
            if let DispatchState::Done(outcome) = state {
                return Ok(outcome);
            }
            let from = state.name();
            state = self.advance(state, &trigger).await?;
            tracing::debug!(from, to = state.name(), "Dispatch transition");
        }
    }

    async fn advance(
        &self,
        state: DispatchState,
        trigger: &TriggerRequest,
    ) -> Result<DispatchState, OrchestratorError> {
        match state {
            DispatchState::Start => match self.gate.check(trigger.authorization())? {
                AuthDecision::Authorized => Ok(DispatchState::AuthChecked),
                AuthDecision::Rejected => {
                    tracing::warn!(method = %trigger.method, path = %trigger.path(), "Rejected unauthorized trigger");
                    Ok(DispatchState::Done(DispatchOutcome::Unauthorized))
                }
            },
            DispatchState::AuthChecked => Ok(match self.context {
                ExecutionContext::Outer => DispatchState::Outer,
                ExecutionContext::Inner { ref sandbox_id } => DispatchState::Inner(sandbox_id.clone()),
            }),
            DispatchState::Outer => {
                let response = self.run_outer(trigger).await?;
                Ok(DispatchState::Done(DispatchOutcome::Started(response)))
            }
            DispatchState::Inner(sandbox_id) => {
                Ok(DispatchState::Done(DispatchOutcome::Accepted(self.spawn_job(sandbox_id))))
            }
            done @ DispatchState::Done(_) => Ok(done),
        }
    }

    /// Provision, bootstrap, wait, forward. The sandbox is never stopped
    /// here; on failure it is reclaimed by the platform timeout.
    async fn run_outer(&self, trigger: &TriggerRequest) -> Result<ForwardedResponse, OrchestratorError> {
        let handle = self.provisioner.create().await?;
        let sandbox_id = handle.id.clone();

        let result = match self.sequencer.run(&handle, &self.plan).await {
            Ok(()) => {
                self.poller
                    .wait_and_forward(&handle, trigger, &self.forwarder)
                    .await
            }
            Err(e) => Err(OrchestratorError::from(e)),
        };

        if let Err(ref e) = result {
            tracing::error!(
                sandbox_id = %sandbox_id,
                error = %e,
                "Outer path failed; sandbox left to its timeout"
            );
        }
        result
    }

    /// Run the job in the background, then stop this sandbox whatever the
    /// job's outcome.
    fn spawn_job(&self, sandbox_id: SandboxId) -> JobTask {
        let job = Arc::clone(&self.job);
        let provisioner = self.provisioner.clone();

        JobTask::spawn(async move {
            let name = job.name().to_string();
            tracing::info!(sandbox_id = %sandbox_id, job = %name, "Job started");

            // Separate task so a panicking job still reaches teardown.
            let result = match tokio::spawn(async move { job.run().await }).await {
                Ok(result) => result,
                Err(e) => Err(JobError::Aborted(e.to_string())),
            };

            match result {
                Ok(()) => tracing::info!(sandbox_id = %sandbox_id, job = %name, "Job finished"),
                Err(ref e) => {
                    tracing::error!(sandbox_id = %sandbox_id, job = %name, error = %e, "Job failed")
                }
            }

            provisioner.teardown(&sandbox_id).await;
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use axum::http::{HeaderMap, HeaderValue, Method, header};
    use bytes::Bytes;

    use super::*;
    use crate::config::EnvSource;
    use crate::testing::{MockPlatform, PlatformCall, RecordingJob, spawn_capture_server};

    fn config(pairs: &[(&str, &str)]) -> Config {
        let mut all = vec![
            ("CRON_SECRET", "s3cret"),
            ("SANDBOX_SOURCE_URL", "https://github.com/acme/jobs.git"),
            ("READINESS_DELAY_MS", "1"),
        ];
        all.extend_from_slice(pairs);
        Config::resolve(&EnvSource::from_pairs(all)).unwrap()
    }

    fn trigger(auth: Option<&'static str>) -> TriggerRequest {
        let mut headers = HeaderMap::new();
        if let Some(auth) = auth {
            headers.insert(header::AUTHORIZATION, HeaderValue::from_static(auth));
        }
        TriggerRequest::new(Method::GET, &"/api/cron".parse().unwrap(), headers, Bytes::new())
    }

    #[tokio::test]
    async fn rejects_bad_token_in_both_contexts() {
        for pairs in [
            vec![],
            vec![("IN_SANDBOX", "true"), ("SANDBOX_ID", "sbx_1")],
        ] {
            let mock = Arc::new(MockPlatform::new());
            let job = Arc::new(RecordingJob::new());
            let dispatcher = Dispatcher::from_config(&config(&pairs), mock.clone(), job.clone()).unwrap();

            for auth in [None, Some("Bearer wrong")] {
                let outcome = dispatcher.dispatch(trigger(auth)).await.unwrap();
                assert!(matches!(outcome, DispatchOutcome::Unauthorized));
            }
            assert!(mock.calls().is_empty());
            assert_eq!(job.runs(), 0);
        }
    }

    #[tokio::test]
    async fn missing_secret_fails_before_platform() {
        let env = EnvSource::from_pairs([("SANDBOX_SOURCE_URL", "https://github.com/acme/jobs.git")]);
        let config = Config::resolve(&env).unwrap();
        let mock = Arc::new(MockPlatform::new());
        let dispatcher =
            Dispatcher::from_config(&config, mock.clone(), Arc::new(RecordingJob::new())).unwrap();

        let err = dispatcher.dispatch(trigger(Some("Bearer "))).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Config(_)));
        assert!(mock.calls().is_empty());
    }

    #[test]
    fn outer_requires_source() {
        let env = EnvSource::from_pairs([("CRON_SECRET", "s3cret")]);
        let config = Config::resolve(&env).unwrap();
        let result = Dispatcher::from_config(
            &config,
            Arc::new(MockPlatform::new()),
            Arc::new(RecordingJob::new()),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn inner_runs_job_then_stops_own_sandbox() {
        let config = config(&[("IN_SANDBOX", "true"), ("SANDBOX_ID", "sbx_self")]);
        let mock = Arc::new(MockPlatform::new());
        let job = Arc::new(RecordingJob::new());
        let dispatcher = Dispatcher::from_config(&config, mock.clone(), job.clone()).unwrap();

        let outcome = dispatcher.dispatch(trigger(Some("Bearer s3cret"))).await.unwrap();
        let DispatchOutcome::Accepted(task) = outcome else {
            panic!("expected accepted outcome");
        };
        task.join().await.unwrap();

        assert_eq!(job.runs(), 1);
        assert_eq!(
            mock.calls(),
            vec![
                PlatformCall::Get {
                    id: "sbx_self".to_string()
                },
                PlatformCall::Stop {
                    id: "sbx_self".to_string()
                },
            ]
        );
    }

    #[tokio::test]
    async fn inner_teardown_runs_even_when_job_fails() {
        let config = config(&[("IN_SANDBOX", "true"), ("SANDBOX_ID", "sbx_self")]);
        let mock = Arc::new(MockPlatform::new());
        let job = Arc::new(RecordingJob::failing());
        let dispatcher = Dispatcher::from_config(&config, mock.clone(), job.clone()).unwrap();

        let DispatchOutcome::Accepted(task) =
            dispatcher.dispatch(trigger(Some("Bearer s3cret"))).await.unwrap()
        else {
            panic!("expected accepted outcome");
        };
        assert!(task.join().await.is_err());
        assert_eq!(job.runs(), 1);
        assert_eq!(mock.calls().len(), 2);
        assert!(matches!(mock.calls()[1], PlatformCall::Stop { .. }));
    }

    struct PanickingJob;

    #[async_trait]
    impl Job for PanickingJob {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn run(&self) -> Result<(), JobError> {
            panic!("job blew up");
        }
    }

    #[tokio::test]
    async fn inner_teardown_runs_even_when_job_panics() {
        let config = config(&[("IN_SANDBOX", "true"), ("SANDBOX_ID", "sbx_self")]);
        let mock = Arc::new(MockPlatform::new());
        let dispatcher = Dispatcher::from_config(&config, mock.clone(), Arc::new(PanickingJob)).unwrap();

        let DispatchOutcome::Accepted(task) =
            dispatcher.dispatch(trigger(Some("Bearer s3cret"))).await.unwrap()
        else {
            panic!("expected accepted outcome");
        };
        let err = task.join().await.unwrap_err();
        assert!(matches!(err, JobError::Aborted(_)), "got: {:?}", err);
        assert_eq!(
            mock.calls(),
            vec![
                PlatformCall::Get {
                    id: "sbx_self".to_string()
                },
                PlatformCall::Stop {
                    id: "sbx_self".to_string()
                },
            ]
        );
    }

    #[tokio::test]
    async fn outer_happy_path_creates_once_and_never_stops() {
        let (url, log) = spawn_capture_server().await;
        let mock = Arc::new(MockPlatform::new().with_route(3000, url));
        let job = Arc::new(RecordingJob::new());
        let dispatcher = Dispatcher::from_config(&config(&[]), mock.clone(), job.clone()).unwrap();

        let outcome = dispatcher.dispatch(trigger(Some("Bearer s3cret"))).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Started(_)));

        let calls = mock.calls();
        assert_eq!(calls.iter().filter(|c| **c == PlatformCall::Create).count(), 1);
        assert!(!calls.iter().any(|c| matches!(c, PlatformCall::Stop { .. })));
        assert_eq!(log.requests().len(), 1);
        assert_eq!(job.runs(), 0);
    }

    #[tokio::test]
    async fn outer_bootstrap_failure_is_fatal_without_stop() {
        let (url, log) = spawn_capture_server().await;
        let mock = Arc::new(
            MockPlatform::new()
                .with_route(3000, url)
                .fail_command("pnpm build", 1),
        );
        let dispatcher =
            Dispatcher::from_config(&config(&[]), mock.clone(), Arc::new(RecordingJob::new())).unwrap();

        let err = dispatcher.dispatch(trigger(Some("Bearer s3cret"))).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Bootstrap(_)));
        assert!(!mock.calls().iter().any(|c| matches!(c, PlatformCall::Stop { .. })));
        assert!(log.requests().is_empty());
    }
}
