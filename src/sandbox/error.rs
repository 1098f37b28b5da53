// Error types for sandbox registry operations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Main sandbox error type
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Caller-supplied identifier failed a format check; the host tool was never invoked.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The host tool returned non-zero.
    #[error("{message} (exit code {exit_code}): {stderr}")]
    Tool {
        message: String,
        stderr: String,
        exit_code: i32,
    },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Sandbox not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SandboxError {
    /// Convert error to a structured report for logs and the presentation layer.
    pub fn to_error_report(
        &self,
        sandbox: Option<&str>,
        context: Option<HashMap<String, String>>,
    ) -> ErrorReport {
        let (error_code, suggestion) = match self {
            SandboxError::Validation(_) => (
                "SANDBOX_VALIDATION_ERROR",
                "Use only letters, digits, '_', '-' and '.' in sandbox names",
            ),
            SandboxError::Tool { .. } => (
                "SANDBOX_TOOL_FAILED",
                "Check that WSL is installed and the sandbox exists",
            ),
            SandboxError::Timeout(_) => (
                "SANDBOX_TIMEOUT",
                "Increase the command timeout or check whether the sandbox is hung",
            ),
            SandboxError::NotFound(_) => (
                "SANDBOX_NOT_FOUND",
                "Refresh the sandbox list and verify the name",
            ),
            SandboxError::Io(_) => ("IO_ERROR", "Check file permissions and disk space"),
            SandboxError::Json(_) => (
                "JSON_PARSE_ERROR",
                "Ensure the JSON data is properly formatted",
            ),
        };

        let mut error_context = context.unwrap_or_default();
        error_context.insert("platform".to_string(), std::env::consts::OS.to_string());
        if let Some(name) = sandbox {
            error_context.insert("sandbox".to_string(), name.to_string());
        }
        if let SandboxError::Tool { exit_code, .. } = self {
            error_context.insert("exit_code".to_string(), exit_code.to_string());
        }

        ErrorReport {
            error_code: error_code.to_string(),
            error_message: self.to_string(),
            timestamp: Utc::now(),
            context: error_context,
            suggestion: suggestion.to_string(),
        }
    }

    /// Check if retrying the same call can succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SandboxError::Tool { .. } | SandboxError::Timeout(_) | SandboxError::Io(_)
        )
    }
}

/// Detailed error report structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    pub error_code: String,
    pub error_message: String,
    pub timestamp: DateTime<Utc>,
    pub context: HashMap<String, String>,
    pub suggestion: String,
}

impl ErrorReport {
    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Result type alias for sandbox operations
pub type Result<T> = std::result::Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_error_report_carries_exit_code() {
        let error = SandboxError::Tool {
            message: "wsl --terminate failed".to_string(),
            stderr: "There is no distribution with the supplied name.".to_string(),
            exit_code: 1,
        };
        let report = error.to_error_report(Some("ubuntu-1"), None);

        assert_eq!(report.error_code, "SANDBOX_TOOL_FAILED");
        assert_eq!(report.context.get("sandbox").unwrap(), "ubuntu-1");
        assert_eq!(report.context.get("exit_code").unwrap(), "1");
        assert!(report.error_message.contains("no distribution"));
    }

    #[test]
    fn test_error_recoverability() {
        assert!(SandboxError::Timeout(Duration::from_secs(1)).is_recoverable());
        assert!(!SandboxError::Validation("bad name".to_string()).is_recoverable());
        assert!(!SandboxError::NotFound("x".to_string()).is_recoverable());
    }

    #[test]
    fn test_report_json() {
        let report = SandboxError::NotFound("arch".to_string()).to_error_report(None, None);
        let json = report.to_json().unwrap();
        assert!(json.contains("SANDBOX_NOT_FOUND"));
    }
}
