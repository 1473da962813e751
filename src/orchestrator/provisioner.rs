//! Facade over the sandbox platform's lifecycle calls.

use std::sync::Arc;

use crate::error::{ConfigError, OrchestratorError, PlatformError};
use crate::sandbox::{SandboxHandle, SandboxId, SandboxPlatform, SandboxSpec, SandboxStatus};

/// Creates, looks up and stops sandboxes with parameters fixed at
/// construction.
#[derive(Clone)]
pub struct Provisioner {
    platform: Arc<dyn SandboxPlatform>,
    /// Only the outer path creates sandboxes, so only it needs a spec.
    spec: Option<SandboxSpec>,
}

impl Provisioner {
    pub fn new(platform: Arc<dyn SandboxPlatform>, spec: Option<SandboxSpec>) -> Self {
        Self { platform, spec }
    }

    /// Provision a fresh sandbox. Failures are not retried.
    pub async fn create(&self) -> Result<SandboxHandle, OrchestratorError> {
        let spec = self
            .spec
            .as_ref()
            .ok_or_else(|| ConfigError::MissingRequired("SANDBOX_SOURCE_URL".to_string()))?;

        tracing::info!(
            source = %spec.source.url,
            revision = spec.source.revision.as_deref().unwrap_or("HEAD"),
            vcpus = spec.vcpus,
            timeout_secs = spec.timeout.as_secs(),
            "Provisioning sandbox"
        );
        let handle = self.platform.create(spec).await?;
        Ok(handle)
    }

    pub async fn get(&self, id: &SandboxId) -> Result<SandboxHandle, PlatformError> {
        self.platform.get(id).await
    }

    /// Stop a sandbox. A handle that is already stopping or stopped is left
    /// alone.
    pub async fn stop(&self, handle: &SandboxHandle) -> Result<(), PlatformError> {
        if matches!(
            handle.status,
            SandboxStatus::Stopping | SandboxStatus::Stopped
        ) {
            tracing::debug!(sandbox_id = %handle.id, status = %handle.status, "Sandbox already stopping");
            return Ok(());
        }
        self.platform.stop(handle).await
    }

    /// Resolve a sandbox by id and stop it. Best effort: failures are logged
    /// and swallowed.
    pub async fn teardown(&self, id: &SandboxId) {
        let handle = match self.get(id).await {
            Ok(handle) => handle,
            Err(PlatformError::NotFound { .. }) => {
                tracing::info!(sandbox_id = %id, "Sandbox already gone");
                return;
            }
            Err(e) => {
                tracing::warn!(sandbox_id = %id, error = %e, "Failed to look up sandbox for teardown");
                return;
            }
        };

        match self.stop(&handle).await {
            Ok(()) => tracing::info!(sandbox_id = %id, "Sandbox torn down"),
            Err(e) => tracing::warn!(sandbox_id = %id, error = %e, "Failed to stop sandbox"),
        }
    }
}
