// Host tool abstraction for sandbox registry operations

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;

use super::types::CommandResult;

/// The host-side tool that owns sandboxes.
///
/// Every method that shells out takes an explicit timeout and reports
/// failures as a [`CommandResult`] rather than an error.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Short identifier for logs ("wsl", "local").
    fn kind(&self) -> &'static str;

    /// Raw tabular listing (`NAME STATE VERSION`).
    async fn list(&self, timeout: Duration) -> CommandResult;

    /// Boot a stopped sandbox.
    async fn boot(&self, name: &str, timeout: Duration) -> CommandResult;

    /// Terminate one sandbox.
    async fn terminate(&self, name: &str, timeout: Duration) -> CommandResult;

    /// Terminate every sandbox.
    async fn shutdown_all(&self, timeout: Duration) -> CommandResult;

    /// Remove a sandbox and its filesystem.
    async fn unregister(&self, name: &str, timeout: Duration) -> CommandResult;

    async fn set_default(&self, name: &str, timeout: Duration) -> CommandResult;

    /// Create a sandbox from a root filesystem archive.
    async fn import(
        &self,
        name: &str,
        install_dir: &Path,
        tar_path: &Path,
        timeout: Duration,
    ) -> CommandResult;

    /// Build (but do not spawn) a command that runs `script` in a shell inside
    /// the sandbox as `user`. Used both for one-shot execution and for
    /// long-running supervised processes.
    fn command(&self, name: &str, user: Option<&str>, script: &str) -> Command;
}
