//! Replays the trigger request against the sandbox's public route.

use std::time::Duration;

use axum::http::{HeaderMap, Method, StatusCode, header};

use crate::error::ForwardError;
use crate::orchestrator::trigger::TriggerRequest;
use crate::sandbox::SandboxHandle;

/// The inner service's answer, body already drained.
#[derive(Debug, Clone)]
pub struct ForwardedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub drained_bytes: u64,
}

/// Sends one trigger to the service port of a sandbox.
#[derive(Debug, Clone)]
pub struct RequestForwarder {
    client: reqwest::Client,
    port: u16,
    timeout: Duration,
}

impl RequestForwarder {
    pub fn new(port: u16, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            port,
            timeout,
        }
    }

    /// Original headers minus `host` and `content-length`, which belong to
    /// the outer hop. The client recomputes both.
    pub fn forwarded_headers(headers: &HeaderMap) -> HeaderMap {
        let mut out = headers.clone();
        out.remove(header::HOST);
        out.remove(header::CONTENT_LENGTH);
        out
    }

    pub fn forwards_body(method: &Method) -> bool {
        !matches!(*method, Method::GET | Method::HEAD)
    }

    pub async fn forward(
        &self,
        handle: &SandboxHandle,
        trigger: &TriggerRequest,
    ) -> Result<ForwardedResponse, ForwardError> {
        let route = handle.route(self.port).ok_or_else(|| ForwardError::NoRoute {
            sandbox_id: handle.id.to_string(),
            port: self.port,
        })?;
        let target = trigger.resolve_against(route);

        let mut request = self
            .client
            .request(trigger.method.clone(), target.clone())
            .headers(Self::forwarded_headers(&trigger.headers))
            .timeout(self.timeout);
        if Self::forwards_body(&trigger.method)
            && let Some(ref body) = trigger.body
        {
            request = request.body(body.clone());
        }

        tracing::debug!(
            sandbox_id = %handle.id,
            method = %trigger.method,
            target = %target,
            "Forwarding request"
        );

        let mut response = request.send().await.map_err(|e| {
            if e.is_builder() {
                ForwardError::InvalidTarget(e.to_string())
            } else if e.is_timeout() && !e.is_connect() {
                ForwardError::TimedOut(e)
            } else {
                ForwardError::Transport(e)
            }
        })?;

        let status = response.status();
        let headers = response.headers().clone();

        // The inner handler may still be writing; reading to the end keeps
        // the connection alive until it is done.
        let mut drained_bytes = 0u64;
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => drained_bytes += chunk.len() as u64,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(sandbox_id = %handle.id, error = %e, "Failed to drain inner response");
                    break;
                }
            }
        }

        Ok(ForwardedResponse {
            status,
            headers,
            drained_bytes,
        })
    }
}
