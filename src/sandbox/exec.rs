//! Timed command execution and defensive output decoding.

use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, warn};

use super::types::CommandResult;

/// Decode host tool output.
///
/// `wsl.exe` writes UTF-16LE for its own messages and UTF-8 for whatever runs
/// inside the distribution, so both are accepted. Invalid sequences are
/// replaced and embedded NULs removed.
pub fn decode_output(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return String::new();
    }
    let text = if looks_like_utf16le(bytes) {
        let (decoded, _, _) = encoding_rs::UTF_16LE.decode(bytes);
        decoded.into_owned()
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    };
    text.replace('\0', "")
}

fn looks_like_utf16le(bytes: &[u8]) -> bool {
    if bytes.starts_with(&[0xFF, 0xFE]) {
        return true;
    }
    if bytes.len() < 4 {
        return false;
    }
    // ASCII text encoded as UTF-16LE has a NUL in (nearly) every odd position.
    let odd = bytes.iter().skip(1).step_by(2);
    let total = bytes.len() / 2;
    let zeros = odd.filter(|b| **b == 0).count();
    zeros * 10 >= total * 8
}

/// Run `cmd` to completion, converting a timeout into a structured failure.
///
/// The child is killed when the timeout fires.
pub async fn run_with_timeout(mut cmd: Command, timeout: Duration) -> CommandResult {
    cmd.kill_on_drop(true)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());

    let start = Instant::now();
    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(error = %e, "Failed to spawn command");
            return CommandResult::failure(format!("Failed to spawn command: {}", e));
        }
    };

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let exit_code = output.status.code().unwrap_or(-1);
            let result = CommandResult {
                success: output.status.success(),
                stdout: decode_output(&output.stdout),
                stderr: decode_output(&output.stderr),
                exit_code,
                timed_out: false,
                duration: start.elapsed(),
            };
            debug!(exit_code, elapsed_ms = result.duration.as_millis() as u64, "Command finished");
            result
        }
        Ok(Err(e)) => CommandResult::failure(format!("Failed to collect command output: {}", e)),
        Err(_) => {
            warn!(timeout_secs = timeout.as_secs_f64(), "Command timed out");
            CommandResult::timeout(timeout)
        }
    }
}

/// Quote a string for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Quote a sandbox path, leaving a leading `~/` unquoted so the shell expands it.
pub fn shell_path(path: &str) -> String {
    match path.strip_prefix("~/") {
        Some(rest) => format!("~/{}", shell_quote(rest)),
        None if path == "~" => "~".to_string(),
        None => shell_quote(path),
    }
}
