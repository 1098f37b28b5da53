// Core data structures for the sandbox registry

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::time::Duration;

/// Lifecycle status reported by the host tool.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Running,
    Stopped,
    Installing,
    Error,
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SandboxStatus::Running => "Running",
            SandboxStatus::Stopped => "Stopped",
            SandboxStatus::Installing => "Installing",
            SandboxStatus::Error => "Error",
        };
        f.write_str(s)
    }
}

/// Point-in-time resource usage of a running sandbox.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourceSnapshot {
    pub cpu_percent: f64,
    pub memory_used: u64,
    pub memory_total: u64,
    pub disk_used: u64,
    pub disk_total: u64,
}

/// A sandbox as seen by the last enumeration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Sandbox {
    pub name: String,
    /// Kernel-interface version (1 or 2 for WSL).
    pub version: u8,
    pub status: SandboxStatus,
    pub is_default: bool,
    #[serde(default)]
    pub resources: Option<ResourceSnapshot>,
    #[serde(default)]
    pub ip_address: Option<Ipv4Addr>,
}

impl Sandbox {
    pub fn new(name: impl Into<String>, status: SandboxStatus, version: u8) -> Self {
        Self {
            name: name.into(),
            version,
            status,
            is_default: false,
            resources: None,
            ip_address: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == SandboxStatus::Running
    }
}

/// Structured outcome of a shelled-out command. Failures are values, not errors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(skip)]
    pub duration: Duration,
}

impl CommandResult {
    /// Failure that never reached a process (validation, missing archive, spawn error).
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: message.into(),
            exit_code: -1,
            timed_out: false,
            duration: Duration::ZERO,
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: format!("Command timed out after {}s", after.as_secs_f64()),
            exit_code: -1,
            timed_out: true,
            duration: after,
        }
    }

    /// Best human-readable message for a failed result.
    pub fn error_message(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        format!("exit code {}", self.exit_code)
    }
}
