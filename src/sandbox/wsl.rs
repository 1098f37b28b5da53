// WSL backend: drives wsl.exe on a Windows host.

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;

use super::backend::SandboxBackend;
use super::exec::run_with_timeout;
use super::types::CommandResult;

/// Sandbox backend for WSL distributions.
pub struct WslBackend {
    program: String,
    /// Kernel-interface version requested on import.
    import_version: u8,
}

impl WslBackend {
    pub fn new() -> Self {
        Self {
            program: "wsl.exe".to_string(),
            import_version: 2,
        }
    }

    /// Use a different executable (e.g. a full path when wsl.exe is not on PATH).
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_import_version(mut self, version: u8) -> Self {
        self.import_version = version;
        self
    }

    fn base_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        // Ask wsl.exe for UTF-8 where supported; decode_output handles UTF-16 otherwise.
        cmd.env("WSL_UTF8", "1");
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }
        cmd
    }

    async fn tool<I, S>(&self, args: I, timeout: Duration) -> CommandResult
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut cmd = self.base_command();
        cmd.args(args);
        run_with_timeout(cmd, timeout).await
    }
}

impl Default for WslBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SandboxBackend for WslBackend {
    fn kind(&self) -> &'static str {
        "wsl"
    }

    async fn list(&self, timeout: Duration) -> CommandResult {
        self.tool(["--list", "--verbose"], timeout).await
    }

    async fn boot(&self, name: &str, timeout: Duration) -> CommandResult {
        // Running any command starts the distribution; `true` returns at once.
        self.tool(["-d", name, "--", "true"], timeout).await
    }

    async fn terminate(&self, name: &str, timeout: Duration) -> CommandResult {
        self.tool(["--terminate", name], timeout).await
    }

    async fn shutdown_all(&self, timeout: Duration) -> CommandResult {
        self.tool(["--shutdown"], timeout).await
    }

    async fn unregister(&self, name: &str, timeout: Duration) -> CommandResult {
        self.tool(["--unregister", name], timeout).await
    }

    async fn set_default(&self, name: &str, timeout: Duration) -> CommandResult {
        self.tool(["--set-default", name], timeout).await
    }

    async fn import(
        &self,
        name: &str,
        install_dir: &Path,
        tar_path: &Path,
        timeout: Duration,
    ) -> CommandResult {
        let version = self.import_version.to_string();
        let mut cmd = self.base_command();
        cmd.arg("--import")
            .arg(name)
            .arg(install_dir)
            .arg(tar_path)
            .arg("--version")
            .arg(version);
        run_with_timeout(cmd, timeout).await
    }

    fn command(&self, name: &str, user: Option<&str>, script: &str) -> Command {
        let mut cmd = self.base_command();
        cmd.arg("-d").arg(name);
        if let Some(user) = user {
            cmd.arg("-u").arg(user);
        }
        cmd.arg("--").arg("bash").arg("-lc").arg(script);
        cmd
    }
}
