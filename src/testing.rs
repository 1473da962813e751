//! Test doubles shared by unit and integration tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use url::Url;

use crate::error::{JobError, PlatformError};
use crate::sandbox::{
    CommandOutcome, CommandRequest, GitSource, PortRoute, SandboxHandle, SandboxId,
    SandboxPlatform, SandboxSpec, SandboxStatus,
};
use crate::worker::Job;

/// One call observed by [`MockPlatform`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformCall {
    Create,
    Get {
        id: String,
    },
    Stop {
        id: String,
    },
    RunCommand {
        id: String,
        /// `cmd arg1 arg2`
        command: String,
        detached: bool,
        sudo: bool,
        env: BTreeMap<String, String>,
    },
}

/// In-memory platform that records every call.
///
/// `curl` commands are treated as readiness probes and answered from a
/// queue of exit codes (0 once the queue is empty). Other commands exit 0
/// unless registered with [`MockPlatform::fail_command`].
pub struct MockPlatform {
    id: String,
    status: SandboxStatus,
    routes: Vec<PortRoute>,
    probe_exit_codes: Mutex<VecDeque<i64>>,
    failing_commands: HashMap<String, i64>,
    fail_create: bool,
    fail_get: bool,
    calls: Mutex<Vec<PlatformCall>>,
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPlatform {
    pub fn new() -> Self {
        Self {
            id: "sbx_mock".to_string(),
            status: SandboxStatus::Running,
            routes: Vec::new(),
            probe_exit_codes: Mutex::new(VecDeque::new()),
            failing_commands: HashMap::new(),
            fail_create: false,
            fail_get: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Status reported by `get`.
    pub fn with_status(mut self, status: SandboxStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_route(mut self, port: u16, url: Url) -> Self {
        self.routes.push(PortRoute { port, url });
        self
    }

    pub fn with_probe_exit_codes(self, codes: impl IntoIterator<Item = i64>) -> Self {
        self.lock_probes().extend(codes);
        self
    }

    /// Make the command whose display form is `command` exit with `exit_code`.
    pub fn fail_command(mut self, command: impl Into<String>, exit_code: i64) -> Self {
        self.failing_commands.insert(command.into(), exit_code);
        self
    }

    pub fn fail_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    pub fn fail_get(mut self) -> Self {
        self.fail_get = true;
        self
    }

    /// The handle this mock hands out.
    pub fn handle(&self) -> SandboxHandle {
        SandboxHandle {
            id: SandboxId::new(self.id.clone()),
            status: self.status,
            routes: self.routes.clone(),
            created_at: None,
        }
    }

    pub fn calls(&self) -> Vec<PlatformCall> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn record(&self, call: PlatformCall) {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(call);
    }

    fn lock_probes(&self) -> std::sync::MutexGuard<'_, VecDeque<i64>> {
        self.probe_exit_codes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl SandboxPlatform for MockPlatform {
    async fn create(&self, _spec: &SandboxSpec) -> Result<SandboxHandle, PlatformError> {
        self.record(PlatformCall::Create);
        if self.fail_create {
            return Err(PlatformError::Api {
                status: 503,
                body: "capacity exhausted".to_string(),
            });
        }
        Ok(SandboxHandle {
            status: SandboxStatus::Running,
            ..self.handle()
        })
    }

    async fn get(&self, id: &SandboxId) -> Result<SandboxHandle, PlatformError> {
        self.record(PlatformCall::Get { id: id.to_string() });
        if self.fail_get {
            return Err(PlatformError::Api {
                status: 500,
                body: "lookup failed".to_string(),
            });
        }
        Ok(SandboxHandle {
            id: id.clone(),
            ..self.handle()
        })
    }

    async fn stop(&self, handle: &SandboxHandle) -> Result<(), PlatformError> {
        self.record(PlatformCall::Stop {
            id: handle.id.to_string(),
        });
        Ok(())
    }

    async fn run_command(
        &self,
        handle: &SandboxHandle,
        command: &CommandRequest,
    ) -> Result<CommandOutcome, PlatformError> {
        let display = command.display();
        self.record(PlatformCall::RunCommand {
            id: handle.id.to_string(),
            command: display.clone(),
            detached: command.detached,
            sudo: command.sudo,
            env: command.env.defined(),
        });

        if command.cmd == "curl" {
            let code = self.lock_probes().pop_front().unwrap_or(0);
            return Ok(CommandOutcome::exited(code));
        }
        if let Some(code) = self.failing_commands.get(&display) {
            return Ok(CommandOutcome::exited(*code));
        }
        if command.detached {
            return Ok(CommandOutcome::detached());
        }
        Ok(CommandOutcome::exited(0))
    }
}

/// Job that counts its runs and optionally fails.
#[derive(Debug, Default)]
pub struct RecordingJob {
    runs: AtomicUsize,
    fail: bool,
}

impl RecordingJob {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            runs: AtomicUsize::new(0),
            fail: true,
        }
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Job for RecordingJob {
    fn name(&self) -> &str {
        "recording"
    }

    async fn run(&self) -> Result<(), JobError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(JobError::Failed {
                reason: "configured to fail".to_string(),
            });
        }
        Ok(())
    }
}

/// A spec pointing at a throwaway repository.
pub fn test_spec() -> SandboxSpec {
    SandboxSpec {
        source: GitSource {
            url: "https://github.com/acme/jobs.git".to_string(),
            revision: None,
            username: None,
            password: None,
        },
        vcpus: 2,
        timeout: Duration::from_secs(300),
        ports: vec![3000],
        runtime: "node22".to_string(),
        image: None,
    }
}

pub fn test_handle() -> SandboxHandle {
    MockPlatform::new().handle()
}

/// A request seen by the capture server.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub method: Method,
    /// Path and query as received.
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Requests received so far by a capture server.
#[derive(Debug, Clone, Default)]
pub struct CaptureLog {
    inner: Arc<Mutex<Vec<CapturedRequest>>>,
}

impl CaptureLog {
    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

async fn capture(
    State(log): State<CaptureLog>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, &'static str) {
    let path = uri.path().to_string();
    log.inner
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .push(CapturedRequest {
            method,
            uri: uri
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or(path.clone()),
            headers,
            body,
        });

    // `/delay/<ms>` answers late.
    if let Some(ms) = path
        .strip_prefix("/delay/")
        .and_then(|ms| ms.parse::<u64>().ok())
    {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    // `/status/<code>` answers with that code.
    if let Some(code) = path
        .strip_prefix("/status/")
        .and_then(|c| c.parse::<u16>().ok())
        .and_then(|c| StatusCode::from_u16(c).ok())
    {
        return (code, "status");
    }
    (StatusCode::ACCEPTED, "Running...")
}

/// Start a local HTTP server that records every request it receives and
/// answers `202 Running...`, like an inner instance would. `/delay/<ms>`
/// and `/status/<code>` paths answer late or with another status.
pub async fn spawn_capture_server() -> (Url, CaptureLog) {
    let log = CaptureLog::default();
    let app = Router::new().fallback(capture).with_state(log.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind capture server");
    let addr = listener.local_addr().expect("capture server address");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let url = Url::parse(&format!("http://{}", addr)).expect("capture server url");
    (url, log)
}
