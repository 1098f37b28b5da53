// Local backend: sandboxes modeled in memory, scripts run with `sh -c` on the host.
//
// Used on hosts without WSL (development on Linux/macOS) and by tests. Its
// listing is rendered in the same tabular format wsl.exe produces so the
// registry parses it through the same path.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::Command;

use super::backend::SandboxBackend;
use super::parser::render_list_output;
use super::types::{CommandResult, Sandbox, SandboxStatus};

struct LocalSandbox {
    info: Sandbox,
    root: Option<PathBuf>,
}

/// In-memory sandbox backend.
#[derive(Default)]
pub struct LocalBackend {
    sandboxes: Mutex<Vec<LocalSandbox>>,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style registration of a sandbox.
    pub fn with_sandbox(self, name: &str, status: SandboxStatus) -> Self {
        self.add_sandbox(name, status);
        self
    }

    pub fn add_sandbox(&self, name: &str, status: SandboxStatus) {
        let mut sandboxes = self.lock();
        let is_default = sandboxes.is_empty();
        let mut info = Sandbox::new(name, status, 2);
        info.is_default = is_default;
        sandboxes.push(LocalSandbox { info, root: None });
    }

    /// Current status without going through the listing.
    pub fn status_of(&self, name: &str) -> Option<SandboxStatus> {
        self.lock()
            .iter()
            .find(|s| s.info.name == name)
            .map(|s| s.info.status)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<LocalSandbox>> {
        self.sandboxes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ok() -> CommandResult {
        CommandResult {
            success: true,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
            timed_out: false,
            duration: Duration::ZERO,
        }
    }

    fn not_found(name: &str) -> CommandResult {
        let mut result = CommandResult::failure(format!(
            "There is no distribution with the supplied name: {}",
            name
        ));
        result.exit_code = 1;
        result
    }

    fn update<F>(&self, name: &str, f: F) -> CommandResult
    where
        F: FnOnce(&mut LocalSandbox),
    {
        let mut sandboxes = self.lock();
        match sandboxes.iter_mut().find(|s| s.info.name == name) {
            Some(sb) => {
                f(sb);
                Self::ok()
            }
            None => Self::not_found(name),
        }
    }
}

#[async_trait]
impl SandboxBackend for LocalBackend {
    fn kind(&self) -> &'static str {
        "local"
    }

    async fn list(&self, _timeout: Duration) -> CommandResult {
        let infos: Vec<Sandbox> = self.lock().iter().map(|s| s.info.clone()).collect();
        let mut result = Self::ok();
        result.stdout = render_list_output(&infos);
        result
    }

    async fn boot(&self, name: &str, _timeout: Duration) -> CommandResult {
        self.update(name, |sb| sb.info.status = SandboxStatus::Running)
    }

    async fn terminate(&self, name: &str, _timeout: Duration) -> CommandResult {
        self.update(name, |sb| sb.info.status = SandboxStatus::Stopped)
    }

    async fn shutdown_all(&self, _timeout: Duration) -> CommandResult {
        for sb in self.lock().iter_mut() {
            sb.info.status = SandboxStatus::Stopped;
        }
        Self::ok()
    }

    async fn unregister(&self, name: &str, _timeout: Duration) -> CommandResult {
        let mut sandboxes = self.lock();
        let before = sandboxes.len();
        sandboxes.retain(|s| s.info.name != name);
        if sandboxes.len() == before {
            return Self::not_found(name);
        }
        Self::ok()
    }

    async fn set_default(&self, name: &str, _timeout: Duration) -> CommandResult {
        let mut sandboxes = self.lock();
        if !sandboxes.iter().any(|s| s.info.name == name) {
            return Self::not_found(name);
        }
        for sb in sandboxes.iter_mut() {
            sb.info.is_default = sb.info.name == name;
        }
        Self::ok()
    }

    async fn import(
        &self,
        name: &str,
        install_dir: &Path,
        _tar_path: &Path,
        _timeout: Duration,
    ) -> CommandResult {
        if self.lock().iter().any(|s| s.info.name == name) {
            let mut result =
                CommandResult::failure(format!("A distribution with the supplied name already exists: {}", name));
            result.exit_code = 1;
            return result;
        }
        if let Err(e) = tokio::fs::create_dir_all(install_dir).await {
            return CommandResult::failure(format!(
                "Failed to create install directory {}: {}",
                install_dir.display(),
                e
            ));
        }
        let mut sandboxes = self.lock();
        let mut info = Sandbox::new(name, SandboxStatus::Stopped, 2);
        info.is_default = sandboxes.is_empty();
        sandboxes.push(LocalSandbox {
            info,
            root: Some(install_dir.to_path_buf()),
        });
        Self::ok()
    }

    fn command(&self, name: &str, _user: Option<&str>, script: &str) -> Command {
        let root = self
            .lock()
            .iter()
            .find(|s| s.info.name == name)
            .and_then(|s| s.root.clone());
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script).env("SANDBOT_SANDBOX", name);
        if let Some(root) = root {
            cmd.current_dir(root);
        }
        cmd
    }
}
