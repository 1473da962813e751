//! Hosted sandbox service reached over HTTP.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::PlatformConfig;
use crate::error::{ConfigError, PlatformError};
use crate::sandbox::{
    CommandOutcome, CommandRequest, OutputMode, OutputStream, PortRoute, SandboxHandle, SandboxId,
    SandboxPlatform, SandboxSpec, SandboxStatus, write_output,
};

/// REST client for the sandbox service.
#[derive(Clone)]
pub struct RestPlatform {
    client: reqwest::Client,
    base_url: Url,
    token: SecretString,
    team_id: Option<String>,
}

impl std::fmt::Debug for RestPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestPlatform")
            .field("base_url", &self.base_url.as_str())
            .field("team_id", &self.team_id)
            .finish()
    }
}

impl RestPlatform {
    pub fn new(config: &PlatformConfig) -> Result<Self, ConfigError> {
        let token = config.require_token()?.clone();
        let client = reqwest::Client::builder()
            .user_agent(concat!("sandcron/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConfigError::ParseError(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.api_url.clone(),
            token,
            team_id: config.team_id.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, PlatformError> {
        let mut url = self
            .base_url
            .join(path)
            .map_err(|e| PlatformError::InvalidResponse {
                reason: format!("bad endpoint {}: {}", path, e),
            })?;
        if let Some(ref team) = self.team_id {
            url.query_pairs_mut().append_pair("teamId", team);
        }
        Ok(url)
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .bearer_auth(self.token.expose_secret())
    }

    async fn start_command(
        &self,
        id: &SandboxId,
        command: &CommandRequest,
    ) -> Result<String, PlatformError> {
        let url = self.endpoint(&format!("/v1/sandboxes/{}/cmd", id))?;
        let body = RunCommandBody {
            command: &command.cmd,
            args: &command.args,
            env: command.env.defined(),
            sudo: command.sudo,
        };
        let resp = self
            .request(reqwest::Method::POST, url)
            .json(&body)
            .send()
            .await?;
        let resp: CommandEnvelope = check(resp).await?.json().await?;
        Ok(resp.command.id)
    }

    async fn wait_command(&self, id: &SandboxId, cmd_id: &str) -> Result<CommandOutcome, PlatformError> {
        let mut url = self.endpoint(&format!("/v1/sandboxes/{}/cmd/{}", id, cmd_id))?;
        url.query_pairs_mut().append_pair("wait", "true");
        let resp = self.request(reqwest::Method::GET, url).send().await?;
        let resp: CommandEnvelope = check(resp).await?.json().await?;
        Ok(CommandOutcome {
            exit_code: resp.command.exit_code,
        })
    }

    fn logs_url(&self, id: &SandboxId, cmd_id: &str) -> Result<Url, PlatformError> {
        self.endpoint(&format!("/v1/sandboxes/{}/cmd/{}/logs", id, cmd_id))
    }
}

#[async_trait]
impl SandboxPlatform for RestPlatform {
    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxHandle, PlatformError> {
        let url = self.endpoint("/v1/sandboxes")?;
        let body = CreateSandboxBody::from_spec(spec);
        let resp = self
            .request(reqwest::Method::POST, url)
            .json(&body)
            .send()
            .await?;
        let envelope: SandboxEnvelope = check(resp).await?.json().await?;
        let handle = envelope.into_handle()?;
        tracing::info!(sandbox_id = %handle.id, status = %handle.status, "Sandbox created");
        Ok(handle)
    }

    async fn get(&self, id: &SandboxId) -> Result<SandboxHandle, PlatformError> {
        let url = self.endpoint(&format!("/v1/sandboxes/{}", id))?;
        let resp = self.request(reqwest::Method::GET, url).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(PlatformError::NotFound { id: id.to_string() });
        }
        let envelope: SandboxEnvelope = check(resp).await?.json().await?;
        envelope.into_handle()
    }

    async fn stop(&self, handle: &SandboxHandle) -> Result<(), PlatformError> {
        let url = self.endpoint(&format!("/v1/sandboxes/{}/stop", handle.id))?;
        let resp = self.request(reqwest::Method::POST, url).send().await?;
        if already_stopped(resp.status()) {
            tracing::debug!(sandbox_id = %handle.id, status = %resp.status(), "Sandbox already stopped");
            return Ok(());
        }
        check(resp).await?;
        tracing::info!(sandbox_id = %handle.id, "Sandbox stop requested");
        Ok(())
    }

    async fn run_command(
        &self,
        handle: &SandboxHandle,
        command: &CommandRequest,
    ) -> Result<CommandOutcome, PlatformError> {
        let cmd_id = self.start_command(&handle.id, command).await?;
        tracing::debug!(
            sandbox_id = %handle.id,
            cmd_id = %cmd_id,
            command = %command.display(),
            detached = command.detached,
            "Command started"
        );

        if command.detached {
            if command.output == OutputMode::Inherit {
                let req = self.request(reqwest::Method::GET, self.logs_url(&handle.id, &cmd_id)?);
                let sandbox_id = handle.id.clone();
                tokio::spawn(async move {
                    if let Err(e) = follow_logs(req).await {
                        tracing::debug!(sandbox_id = %sandbox_id, error = %e, "Detached log stream ended");
                    }
                });
            }
            return Ok(CommandOutcome::detached());
        }

        if command.output == OutputMode::Inherit {
            let req = self.request(reqwest::Method::GET, self.logs_url(&handle.id, &cmd_id)?);
            follow_logs(req).await?;
        }
        self.wait_command(&handle.id, &cmd_id).await
    }
}

/// 404, 409 and 410 on stop all mean there is nothing left to stop.
fn already_stopped(status: reqwest::StatusCode) -> bool {
    matches!(status.as_u16(), 404 | 409 | 410)
}

async fn check(resp: reqwest::Response) -> Result<reqwest::Response, PlatformError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(PlatformError::Api {
        status: status.as_u16(),
        body,
    })
}

/// Relay an NDJSON log stream to the host until the command exits.
async fn follow_logs(req: reqwest::RequestBuilder) -> Result<(), PlatformError> {
    let resp = check(req.send().await?).await?;
    let mut stream = resp.bytes_stream();
    let mut buf: Vec<u8> = Vec::new();

    while let Some(chunk) = stream.next().await {
        buf.extend_from_slice(&chunk?);
        while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buf.drain(..=pos).collect();
            relay_log_line(&line[..line.len() - 1]).await;
        }
    }
    if !buf.is_empty() {
        relay_log_line(&buf).await;
    }
    Ok(())
}

async fn relay_log_line(line: &[u8]) {
    if line.iter().all(u8::is_ascii_whitespace) {
        return;
    }
    match parse_log_line(line) {
        Some((stream, data)) => write_output(stream, data.as_bytes()).await,
        None => tracing::debug!(
            line = %String::from_utf8_lossy(line),
            "Skipping malformed log line"
        ),
    }
}

fn parse_log_line(line: &[u8]) -> Option<(OutputStream, String)> {
    let entry: LogLine = serde_json::from_slice(line).ok()?;
    let stream = match entry.stream.as_str() {
        "stdout" => OutputStream::Stdout,
        "stderr" => OutputStream::Stderr,
        _ => return None,
    };
    Some((stream, entry.data))
}

// Wire types.

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSandboxBody<'a> {
    source: SourceBody<'a>,
    ports: &'a [u16],
    resources: ResourcesBody,
    /// Milliseconds.
    timeout: u64,
    runtime: &'a str,
}

#[derive(Debug, Serialize)]
struct SourceBody<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    revision: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    password: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct ResourcesBody {
    vcpus: u32,
}

impl<'a> CreateSandboxBody<'a> {
    fn from_spec(spec: &'a SandboxSpec) -> Self {
        Self {
            source: SourceBody {
                kind: "git",
                url: &spec.source.url,
                revision: spec.source.revision.as_deref(),
                username: spec.source.username.as_deref(),
                password: spec.source.password.as_ref().map(|p| p.expose_secret()),
            },
            ports: &spec.ports,
            resources: ResourcesBody { vcpus: spec.vcpus },
            timeout: spec.timeout.as_millis() as u64,
            runtime: &spec.runtime,
        }
    }
}

#[derive(Debug, Serialize)]
struct RunCommandBody<'a> {
    command: &'a str,
    args: &'a [String],
    env: BTreeMap<String, String>,
    sudo: bool,
}

#[derive(Debug, Deserialize)]
struct SandboxEnvelope {
    sandbox: SandboxBody,
    #[serde(default)]
    routes: Vec<RouteBody>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SandboxBody {
    id: String,
    status: String,
    #[serde(default)]
    created_at: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RouteBody {
    port: u16,
    url: String,
}

impl SandboxEnvelope {
    fn into_handle(self) -> Result<SandboxHandle, PlatformError> {
        let status = self
            .sandbox
            .status
            .parse::<SandboxStatus>()
            .map_err(|reason| PlatformError::InvalidResponse { reason })?;

        let routes = self
            .routes
            .into_iter()
            .map(|r| {
                // Some deployments return bare hostnames.
                let raw = if r.url.contains("://") {
                    r.url
                } else {
                    format!("https://{}", r.url)
                };
                Url::parse(&raw)
                    .map(|url| PortRoute { port: r.port, url })
                    .map_err(|e| PlatformError::InvalidResponse {
                        reason: format!("bad route url '{}': {}", raw, e),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let created_at: Option<DateTime<Utc>> = self
            .sandbox
            .created_at
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single());

        Ok(SandboxHandle {
            id: SandboxId::new(self.sandbox.id),
            status,
            routes,
            created_at,
        })
    }
}

#[derive(Debug, Deserialize)]
struct CommandEnvelope {
    command: CommandBody,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommandBody {
    id: String,
    #[serde(default)]
    exit_code: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct LogLine {
    stream: String,
    data: String,
}
