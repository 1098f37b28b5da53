//! Host automation primitives behind the IPC handlers.
//!
//! [`SystemAutomation`] shells out to PowerShell on Windows and to the usual
//! X11 tools elsewhere (`xdotool`, `xclip`, `wmctrl`, ImageMagick `import`).
//! All calls are blocking; the server runs them on the blocking pool. Every
//! helper process is bounded by [`TOOL_TIMEOUT`] and killed when it overruns.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::process::{Command, Stdio};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// Upper bound for one helper process (xdotool, xclip, powershell, ...).
pub const TOOL_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    Left,
    Middle,
    Right,
}

impl MouseButton {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "left" => Ok(MouseButton::Left),
            "middle" => Ok(MouseButton::Middle),
            "right" => Ok(MouseButton::Right),
            other => bail!("Unknown mouse button: {}", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowInfo {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub pid: Option<u32>,
}

/// Host-side automation capabilities.
pub trait Automation: Send + Sync {
    fn mouse_move(&self, x: i32, y: i32) -> Result<()>;
    /// Click at the given position, or at the current one when `None`.
    fn mouse_click(&self, at: Option<(i32, i32)>, button: MouseButton, clicks: u32) -> Result<()>;
    fn mouse_drag(&self, from: (i32, i32), to: (i32, i32), button: MouseButton) -> Result<()>;
    /// Positive scrolls up, negative down.
    fn mouse_scroll(&self, amount: i32) -> Result<()>;
    fn mouse_position(&self) -> Result<(i32, i32)>;

    /// Synthesize key presses for ASCII text.
    fn keyboard_type(&self, text: &str) -> Result<()>;
    fn keyboard_press(&self, key: &str) -> Result<()>;
    fn keyboard_hotkey(&self, keys: &[String]) -> Result<()>;

    /// Full-screen capture as PNG bytes.
    fn screenshot(&self) -> Result<Vec<u8>>;
    fn screen_size(&self) -> Result<(u32, u32)>;

    fn clipboard_get(&self) -> Result<String>;
    fn clipboard_set(&self, text: &str) -> Result<()>;

    fn window_list(&self) -> Result<Vec<WindowInfo>>;

    /// Start a program detached; returns its pid.
    fn launch(&self, program: &str, args: &[String]) -> Result<u32>;
    /// Hand a URL to the OS default handler.
    fn open_url(&self, url: &str) -> Result<()>;
}

/// Automation backed by the host's own tools.
#[derive(Debug, Default)]
pub struct SystemAutomation;

impl SystemAutomation {
    pub fn new() -> Self {
        Self
    }
}

/// Drive `fut` to completion from a blocking thread.
fn block_on<F: Future>(fut: F) -> Result<F::Output> {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => Ok(handle.block_on(fut)),
        Err(_) => {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("building helper runtime")?;
            Ok(runtime.block_on(fut))
        }
    }
}

/// Run `cmd` to completion within `timeout`, optionally feeding `input`.
///
/// With input the helper's stdout and stderr are discarded: clipboard owners
/// such as xclip keep serving in a forked child that inherits them.
fn run_bounded(
    mut cmd: tokio::process::Command,
    input: Option<&[u8]>,
    timeout: Duration,
) -> Result<Vec<u8>> {
    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    let (out, err) = if input.is_some() {
        (Stdio::null(), Stdio::null())
    } else {
        (Stdio::piped(), Stdio::piped())
    };
    cmd.stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(out)
        .stderr(err)
        .kill_on_drop(true);

    let task = async {
        let mut child = cmd.spawn().with_context(|| format!("running {}", program))?;
        if let (Some(bytes), Some(mut stdin)) = (input, child.stdin.take()) {
            stdin.write_all(bytes).await?;
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            bail!(
                "{} failed ({}): {}",
                program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok::<_, anyhow::Error>(output.stdout)
    };
    block_on(async {
        match tokio::time::timeout(timeout, task).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!("{} timed out after {}s", program, timeout.as_secs_f64())),
        }
    })?
}

fn tool(program: &str, args: &[&str]) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args);
    cmd
}

fn run(program: &str, args: &[&str]) -> Result<Vec<u8>> {
    run_bounded(tool(program, args), None, TOOL_TIMEOUT)
}

fn run_text(program: &str, args: &[&str]) -> Result<String> {
    Ok(String::from_utf8_lossy(&run(program, args)?).into_owned())
}

#[cfg_attr(target_os = "windows", allow(dead_code))]
fn run_with_stdin(program: &str, args: &[&str], input: &[u8]) -> Result<()> {
    run_bounded(tool(program, args), Some(input), TOOL_TIMEOUT).map(|_| ())
}

// ---------------------------------------------------------------------------
// Unix (X11 tools)
// ---------------------------------------------------------------------------

#[cfg(not(target_os = "windows"))]
mod platform {
    use super::*;

    fn button_code(button: MouseButton) -> &'static str {
        match button {
            MouseButton::Left => "1",
            MouseButton::Middle => "2",
            MouseButton::Right => "3",
        }
    }

    /// Parse `xdotool getmouselocation --shell` output.
    pub(super) fn parse_mouse_location(text: &str) -> Option<(i32, i32)> {
        let mut x = None;
        let mut y = None;
        for line in text.lines() {
            if let Some(v) = line.strip_prefix("X=") {
                x = v.trim().parse().ok();
            } else if let Some(v) = line.strip_prefix("Y=") {
                y = v.trim().parse().ok();
            }
        }
        Some((x?, y?))
    }

    /// Parse `wmctrl -lp` output: `id desktop pid host title...`.
    pub(super) fn parse_wmctrl(text: &str) -> Vec<WindowInfo> {
        text.lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                let id = parts.next()?.to_string();
                let _desktop = parts.next()?;
                let pid = parts.next()?.parse().ok();
                let _host = parts.next()?;
                let title = parts.collect::<Vec<_>>().join(" ");
                Some(WindowInfo { id, title, pid })
            })
            .collect()
    }

    impl Automation for SystemAutomation {
        fn mouse_move(&self, x: i32, y: i32) -> Result<()> {
            run("xdotool", &["mousemove", &x.to_string(), &y.to_string()]).map(|_| ())
        }

        fn mouse_click(&self, at: Option<(i32, i32)>, button: MouseButton, clicks: u32) -> Result<()> {
            if let Some((x, y)) = at {
                self.mouse_move(x, y)?;
            }
            let repeat = clicks.max(1).to_string();
            run("xdotool", &["click", "--repeat", &repeat, button_code(button)]).map(|_| ())
        }

        fn mouse_drag(&self, from: (i32, i32), to: (i32, i32), button: MouseButton) -> Result<()> {
            let code = button_code(button);
            run(
                "xdotool",
                &[
                    "mousemove", &from.0.to_string(), &from.1.to_string(),
                    "mousedown", code,
                    "mousemove", &to.0.to_string(), &to.1.to_string(),
                    "mouseup", code,
                ],
            )
            .map(|_| ())
        }

        fn mouse_scroll(&self, amount: i32) -> Result<()> {
            if amount == 0 {
                return Ok(());
            }
            let code = if amount > 0 { "4" } else { "5" };
            let repeat = amount.unsigned_abs().to_string();
            run("xdotool", &["click", "--repeat", &repeat, code]).map(|_| ())
        }

        fn mouse_position(&self) -> Result<(i32, i32)> {
            let text = run_text("xdotool", &["getmouselocation", "--shell"])?;
            parse_mouse_location(&text).context("unexpected xdotool output")
        }

        fn keyboard_type(&self, text: &str) -> Result<()> {
            run("xdotool", &["type", "--delay", "0", "--", text]).map(|_| ())
        }

        fn keyboard_press(&self, key: &str) -> Result<()> {
            run("xdotool", &["key", "--", key]).map(|_| ())
        }

        fn keyboard_hotkey(&self, keys: &[String]) -> Result<()> {
            let combo = keys.join("+");
            run("xdotool", &["key", "--", &combo]).map(|_| ())
        }

        fn screenshot(&self) -> Result<Vec<u8>> {
            run("import", &["-window", "root", "png:-"])
        }

        fn screen_size(&self) -> Result<(u32, u32)> {
            let text = run_text("xdotool", &["getdisplaygeometry"])?;
            let mut parts = text.split_whitespace().filter_map(|v| v.parse().ok());
            match (parts.next(), parts.next()) {
                (Some(w), Some(h)) => Ok((w, h)),
                _ => bail!("unexpected xdotool output: {}", text.trim()),
            }
        }

        fn clipboard_get(&self) -> Result<String> {
            run_text("xclip", &["-selection", "clipboard", "-o"])
        }

        fn clipboard_set(&self, text: &str) -> Result<()> {
            run_with_stdin("xclip", &["-selection", "clipboard", "-i"], text.as_bytes())
        }

        fn window_list(&self) -> Result<Vec<WindowInfo>> {
            Ok(parse_wmctrl(&run_text("wmctrl", &["-lp"])?))
        }

        fn launch(&self, program: &str, args: &[String]) -> Result<u32> {
            let child = Command::new(program)
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
                .with_context(|| format!("launching {}", program))?;
            Ok(child.id())
        }

        fn open_url(&self, url: &str) -> Result<()> {
            open::that(url).with_context(|| format!("opening {}", url))
        }
    }
}

// ---------------------------------------------------------------------------
// Windows (PowerShell)
// ---------------------------------------------------------------------------

#[cfg(target_os = "windows")]
mod platform {
    use super::*;

    const USER32: &str = r#"
Add-Type @"
using System;
using System.Runtime.InteropServices;
public static class U32 {
  [DllImport("user32.dll")] public static extern bool SetCursorPos(int x, int y);
  [DllImport("user32.dll")] public static extern void mouse_event(uint f, uint x, uint y, int d, UIntPtr e);
}
"@
"#;

    fn powershell(script: &str) -> Result<String> {
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        let mut cmd = tool("powershell.exe", &["-NoProfile", "-NonInteractive", "-Command", script]);
        cmd.creation_flags(CREATE_NO_WINDOW);
        let stdout = run_bounded(cmd, None, TOOL_TIMEOUT)?;
        Ok(String::from_utf8_lossy(&stdout).into_owned())
    }

    fn ps_quote(s: &str) -> String {
        format!("'{}'", s.replace('\'', "''"))
    }

    fn button_flags(button: MouseButton) -> (u32, u32) {
        match button {
            MouseButton::Left => (0x0002, 0x0004),
            MouseButton::Right => (0x0008, 0x0010),
            MouseButton::Middle => (0x0020, 0x0040),
        }
    }

    /// SendKeys notation for one key name.
    fn send_key(key: &str) -> String {
        match key.to_ascii_lowercase().as_str() {
            "enter" | "return" => "{ENTER}".into(),
            "tab" => "{TAB}".into(),
            "esc" | "escape" => "{ESC}".into(),
            "backspace" => "{BACKSPACE}".into(),
            "delete" | "del" => "{DELETE}".into(),
            "up" => "{UP}".into(),
            "down" => "{DOWN}".into(),
            "left" => "{LEFT}".into(),
            "right" => "{RIGHT}".into(),
            "home" => "{HOME}".into(),
            "end" => "{END}".into(),
            "pageup" => "{PGUP}".into(),
            "pagedown" => "{PGDN}".into(),
            "space" => " ".into(),
            k if k.starts_with('f') && k[1..].parse::<u8>().is_ok() => format!("{{{}}}", k.to_uppercase()),
            k => escape_send_keys(k),
        }
    }

    fn escape_send_keys(text: &str) -> String {
        text.chars()
            .map(|c| match c {
                '+' | '^' | '%' | '~' | '(' | ')' | '{' | '}' | '[' | ']' => format!("{{{}}}", c),
                c => c.to_string(),
            })
            .collect()
    }

    fn send_keys(keys: &str) -> Result<()> {
        powershell(&format!(
            "Add-Type -AssemblyName System.Windows.Forms; [System.Windows.Forms.SendKeys]::SendWait({})",
            ps_quote(keys)
        ))
        .map(|_| ())
    }

    impl Automation for SystemAutomation {
        fn mouse_move(&self, x: i32, y: i32) -> Result<()> {
            powershell(&format!("{}[U32]::SetCursorPos({}, {}) | Out-Null", USER32, x, y)).map(|_| ())
        }

        fn mouse_click(&self, at: Option<(i32, i32)>, button: MouseButton, clicks: u32) -> Result<()> {
            let (down, up) = button_flags(button);
            let mut script = USER32.to_string();
            if let Some((x, y)) = at {
                script.push_str(&format!("[U32]::SetCursorPos({}, {}) | Out-Null\n", x, y));
            }
            for _ in 0..clicks.max(1) {
                script.push_str(&format!(
                    "[U32]::mouse_event({}, 0, 0, 0, [UIntPtr]::Zero); [U32]::mouse_event({}, 0, 0, 0, [UIntPtr]::Zero)\n",
                    down, up
                ));
            }
            powershell(&script).map(|_| ())
        }

        fn mouse_drag(&self, from: (i32, i32), to: (i32, i32), button: MouseButton) -> Result<()> {
            let (down, up) = button_flags(button);
            let script = format!(
                "{}[U32]::SetCursorPos({}, {}) | Out-Null\n\
                 [U32]::mouse_event({}, 0, 0, 0, [UIntPtr]::Zero)\n\
                 Start-Sleep -Milliseconds 50\n\
                 [U32]::SetCursorPos({}, {}) | Out-Null\n\
                 Start-Sleep -Milliseconds 50\n\
                 [U32]::mouse_event({}, 0, 0, 0, [UIntPtr]::Zero)\n",
                USER32, from.0, from.1, down, to.0, to.1, up
            );
            powershell(&script).map(|_| ())
        }

        fn mouse_scroll(&self, amount: i32) -> Result<()> {
            const WHEEL: u32 = 0x0800;
            powershell(&format!(
                "{}[U32]::mouse_event({}, 0, 0, {}, [UIntPtr]::Zero)",
                USER32,
                WHEEL,
                amount * 120
            ))
            .map(|_| ())
        }

        fn mouse_position(&self) -> Result<(i32, i32)> {
            let out = powershell(
                "Add-Type -AssemblyName System.Windows.Forms; \
                 $p = [System.Windows.Forms.Cursor]::Position; \"$($p.X) $($p.Y)\"",
            )?;
            let mut parts = out.split_whitespace().filter_map(|v| v.parse().ok());
            match (parts.next(), parts.next()) {
                (Some(x), Some(y)) => Ok((x, y)),
                _ => bail!("unexpected cursor output: {}", out.trim()),
            }
        }

        fn keyboard_type(&self, text: &str) -> Result<()> {
            send_keys(&escape_send_keys(text))
        }

        fn keyboard_press(&self, key: &str) -> Result<()> {
            send_keys(&send_key(key))
        }

        fn keyboard_hotkey(&self, keys: &[String]) -> Result<()> {
            let mut prefix = String::new();
            let mut rest = Vec::new();
            for key in keys {
                match key.to_ascii_lowercase().as_str() {
                    "ctrl" | "control" => prefix.push('^'),
                    "shift" => prefix.push('+'),
                    "alt" => prefix.push('%'),
                    _ => rest.push(send_key(key)),
                }
            }
            send_keys(&format!("{}{}", prefix, rest.concat()))
        }

        fn screenshot(&self) -> Result<Vec<u8>> {
            use base64::Engine;
            let out = powershell(
                "Add-Type -AssemblyName System.Windows.Forms,System.Drawing; \
                 $b = [System.Windows.Forms.SystemInformation]::VirtualScreen; \
                 $bmp = New-Object System.Drawing.Bitmap $b.Width, $b.Height; \
                 $g = [System.Drawing.Graphics]::FromImage($bmp); \
                 $g.CopyFromScreen($b.Left, $b.Top, 0, 0, $bmp.Size); \
                 $ms = New-Object System.IO.MemoryStream; \
                 $bmp.Save($ms, [System.Drawing.Imaging.ImageFormat]::Png); \
                 [Convert]::ToBase64String($ms.ToArray())",
            )?;
            base64::engine::general_purpose::STANDARD
                .decode(out.trim())
                .context("decoding screenshot")
        }

        fn screen_size(&self) -> Result<(u32, u32)> {
            let out = powershell(
                "Add-Type -AssemblyName System.Windows.Forms; \
                 $s = [System.Windows.Forms.Screen]::PrimaryScreen.Bounds; \"$($s.Width) $($s.Height)\"",
            )?;
            let mut parts = out.split_whitespace().filter_map(|v| v.parse().ok());
            match (parts.next(), parts.next()) {
                (Some(w), Some(h)) => Ok((w, h)),
                _ => bail!("unexpected screen output: {}", out.trim()),
            }
        }

        fn clipboard_get(&self) -> Result<String> {
            Ok(powershell("Get-Clipboard -Raw")?.trim_end_matches(['\r', '\n']).to_string())
        }

        fn clipboard_set(&self, text: &str) -> Result<()> {
            powershell(&format!("Set-Clipboard -Value {}", ps_quote(text))).map(|_| ())
        }

        fn window_list(&self) -> Result<Vec<WindowInfo>> {
            let out = powershell(
                "Get-Process | Where-Object { $_.MainWindowTitle } | \
                 Select-Object Id, MainWindowTitle, MainWindowHandle | ConvertTo-Json -Compress",
            )?;
            let value: serde_json::Value = match out.trim() {
                "" => return Ok(Vec::new()),
                text => serde_json::from_str(text).context("parsing window list")?,
            };
            let items = match value {
                serde_json::Value::Array(items) => items,
                single => vec![single],
            };
            Ok(items
                .iter()
                .map(|w| WindowInfo {
                    id: w["MainWindowHandle"].to_string(),
                    title: w["MainWindowTitle"].as_str().unwrap_or_default().to_string(),
                    pid: w["Id"].as_u64().and_then(|p| u32::try_from(p).ok()),
                })
                .collect())
        }

        fn launch(&self, program: &str, args: &[String]) -> Result<u32> {
            let child = Command::new(program)
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
                .with_context(|| format!("launching {}", program))?;
            Ok(child.id())
        }

        fn open_url(&self, url: &str) -> Result<()> {
            open::that(url).with_context(|| format!("opening {}", url))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mouse_button_parse() {
        assert_eq!(MouseButton::parse("LEFT").unwrap(), MouseButton::Left);
        assert_eq!(MouseButton::parse("right").unwrap(), MouseButton::Right);
        assert!(MouseButton::parse("fourth").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_hung_helper_is_killed() {
        let started = std::time::Instant::now();
        let err = run_bounded(tool("sleep", &["5"]), None, Duration::from_millis(200)).unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn test_helpers_run_on_blocking_pool() {
        let out = tokio::task::spawn_blocking(|| {
            let text = run_text("sh", &["-c", "echo ready"])?;
            run_with_stdin("sh", &["-c", "cat >/dev/null"], b"payload")?;
            let failed = run("sh", &["-c", "echo nope >&2; exit 4"]).unwrap_err();
            assert!(failed.to_string().contains("nope"));
            anyhow::Ok(text)
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(out.trim(), "ready");
    }

    #[cfg(not(target_os = "windows"))]
    #[test]
    fn test_parse_tool_output() {
        assert_eq!(
            platform::parse_mouse_location("X=640\nY=480\nSCREEN=0\nWINDOW=123\n"),
            Some((640, 480))
        );
        assert_eq!(platform::parse_mouse_location("garbage"), None);

        let windows = platform::parse_wmctrl(
            "0x03a00007  0 4242   host Terminal - bash\n0x04000001 -1 17 host Mozilla Firefox\n",
        );
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].title, "Terminal - bash");
        assert_eq!(windows[0].pid, Some(4242));
        assert_eq!(windows[1].title, "Mozilla Firefox");
    }
}
