use async_trait::async_trait;

use crate::config::SandboxConfig;
use crate::error::Result;
use crate::types::{CommandResult, ExecRequest};

/// Backend that creates, runs commands in, and destroys isolated environments.
///
/// Implementations hold no per-sandbox state; the caller owns the lifecycle.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Human-readable name for this runtime (e.g. "docker").
    fn name(&self) -> &str;
    /// Ensure the image, start the container, and run the init command.
    ///
    /// Returns [`crate::SandboxError::ProvisioningFailed`] if any step fails,
    /// including an init command exiting nonzero.
    async fn provision(&self, config: &SandboxConfig) -> Result<()>;
    /// Run one shell command inside the sandbox.
    ///
    /// A command exceeding `request.timeout` yields [`CommandResult::timed_out`].
    async fn exec(&self, id: &str, request: &ExecRequest<'_>) -> Result<CommandResult>;
    /// Stop and remove the sandbox.
    async fn teardown(&self, id: &str) -> Result<()>;
}
