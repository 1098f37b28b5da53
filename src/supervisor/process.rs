//! Supervised long-running process inside a sandbox.
//!
//! A [`ManagedProcess`] drives one gateway or bridge process through
//! `Stopped → Starting → Running → Stopping → Stopped`. `Error` is reached
//! only from `Starting`: spawn failure, sandbox start failure, port
//! exhaustion, or an exit inside the startup grace period. A process that
//! exits after it was confirmed running moves to `Stopped`.
//!
//! The OS child is owned by a watcher task for its whole life. `stop` asks
//! the watcher to terminate it; nothing else signals the child.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::log_buffer::{create_log_buffer, LogLine, LogStream, SharedLogBuffer};
use crate::bus::{invoke_isolated, Event, EventBus};
use crate::ports::{port_key, PortAllocator};
use crate::sandbox::exec::shell_quote;
use crate::sandbox::SandboxRegistry;

/// Bound on reading the remaining output of a process that died during startup.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
/// Timeout of the in-sandbox `pkill` cleanup.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Gateway,
    Bridge,
}

impl ProcessKind {
    /// Purpose component of the port allocation key.
    pub fn purpose(&self) -> &'static str {
        match self {
            ProcessKind::Gateway => "gateway",
            ProcessKind::Bridge => "bridge",
        }
    }
}

impl std::fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.purpose())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProcessStatus::Stopped => "stopped",
            ProcessStatus::Starting => "starting",
            ProcessStatus::Running => "running",
            ProcessStatus::Stopping => "stopping",
            ProcessStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Static description of how to run and clean up a supervised process.
#[derive(Debug, Clone)]
pub struct ProcessSettings {
    /// Shell script run inside the sandbox; `{port}`, `{host}` and `{sandbox}` are substituted.
    pub command_template: String,
    /// `pkill -f` pattern run in the sandbox after stop. Same placeholders.
    pub cleanup_pattern: Option<String>,
    /// In-sandbox user; the registry default when unset.
    pub user: Option<String>,
    pub grace_period: Duration,
    pub stop_timeout: Duration,
    pub restart_delay: Duration,
    pub log_capacity: usize,
}

impl Default for ProcessSettings {
    fn default() -> Self {
        Self {
            command_template: "agent gateway --port {port}".to_string(),
            cleanup_pattern: None,
            user: None,
            grace_period: Duration::from_secs(2),
            stop_timeout: Duration::from_secs(5),
            restart_delay: Duration::from_secs(1),
            log_capacity: 1000,
        }
    }
}

/// Parameters of one start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartRequest {
    /// Explicit port; one is assigned from the allocator when unset.
    pub port: Option<u16>,
    /// Value of `{host}` in templates.
    pub host: Option<String>,
    /// The port belongs to another component and is not reserved or released here.
    pub external_port: bool,
}

impl StartRequest {
    pub fn with_port(port: u16) -> Self {
        Self {
            port: Some(port),
            ..Default::default()
        }
    }

    /// Connect to a port owned elsewhere (the bridge's IPC port).
    pub fn external(port: u16, host: impl Into<String>) -> Self {
        Self {
            port: Some(port),
            host: Some(host.into()),
            external_port: true,
        }
    }
}

/// Substitute `{port}`, `{host}` and `{sandbox}` in a command template.
pub fn render_command(template: &str, port: u16, host: &str, sandbox: &str) -> String {
    template
        .replace("{port}", &port.to_string())
        .replace("{host}", host)
        .replace("{sandbox}", sandbox)
}

/// Strip ANSI escape sequences and control characters (tabs are kept).
pub fn sanitize_line(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\u{1b}' {
            match chars.peek() {
                // CSI: ESC [ params final-byte
                Some('[') => {
                    chars.next();
                    for c in chars.by_ref() {
                        if ('@'..='~').contains(&c) {
                            break;
                        }
                    }
                }
                // OSC: ESC ] ... BEL or ESC \
                Some(']') => {
                    chars.next();
                    while let Some(c) = chars.next() {
                        if c == '\u{7}' {
                            break;
                        }
                        if c == '\u{1b}' && chars.peek() == Some(&'\\') {
                            chars.next();
                            break;
                        }
                    }
                }
                Some(_) => {
                    chars.next();
                }
                None => {}
            }
            continue;
        }
        if c == '\t' || !c.is_control() {
            out.push(c);
        }
    }
    out
}

/// Serializable view of a managed process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub sandbox: String,
    pub kind: ProcessKind,
    pub status: ProcessStatus,
    pub pid: Option<u32>,
    pub port: Option<u16>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

pub type StatusCallback = Arc<dyn Fn(ProcessStatus, Option<&str>) + Send + Sync>;

struct ProcessState {
    status: ProcessStatus,
    pid: Option<u32>,
    port: Option<u16>,
    port_owned: bool,
    started_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    last_request: Option<StartRequest>,
    generation: u64,
    stop_tx: Option<oneshot::Sender<()>>,
    watcher: Option<JoinHandle<()>>,
}

struct Inner {
    sandbox: String,
    kind: ProcessKind,
    settings: ProcessSettings,
    registry: Arc<SandboxRegistry>,
    ports: Arc<PortAllocator>,
    bus: Arc<EventBus>,
    state: Mutex<ProcessState>,
    op_lock: tokio::sync::Mutex<()>,
    logs: SharedLogBuffer,
    callbacks: Mutex<Vec<(u64, StatusCallback)>>,
    next_callback: AtomicU64,
}

/// Handle to one supervised process. Cloning shares the same process.
#[derive(Clone)]
pub struct ManagedProcess {
    inner: Arc<Inner>,
}

impl ManagedProcess {
    pub fn new(
        sandbox: impl Into<String>,
        kind: ProcessKind,
        settings: ProcessSettings,
        registry: Arc<SandboxRegistry>,
        ports: Arc<PortAllocator>,
        bus: Arc<EventBus>,
    ) -> Self {
        let logs = create_log_buffer(settings.log_capacity);
        Self {
            inner: Arc::new(Inner {
                sandbox: sandbox.into(),
                kind,
                settings,
                registry,
                ports,
                bus,
                state: Mutex::new(ProcessState {
                    status: ProcessStatus::Stopped,
                    pid: None,
                    port: None,
                    port_owned: false,
                    started_at: None,
                    last_error: None,
                    last_request: None,
                    generation: 0,
                    stop_tx: None,
                    watcher: None,
                }),
                op_lock: tokio::sync::Mutex::new(()),
                logs,
                callbacks: Mutex::new(Vec::new()),
                next_callback: AtomicU64::new(1),
            }),
        }
    }

    pub fn sandbox(&self) -> &str {
        &self.inner.sandbox
    }

    pub fn kind(&self) -> ProcessKind {
        self.inner.kind
    }

    pub fn settings(&self) -> &ProcessSettings {
        &self.inner.settings
    }

    pub fn status(&self) -> ProcessStatus {
        self.inner.lock_state().status
    }

    pub fn is_running(&self) -> bool {
        self.status() == ProcessStatus::Running
    }

    pub fn port(&self) -> Option<u16> {
        self.inner.lock_state().port
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.lock_state().pid
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.lock_state().last_error.clone()
    }

    pub fn info(&self) -> ProcessInfo {
        let state = self.inner.lock_state();
        ProcessInfo {
            sandbox: self.inner.sandbox.clone(),
            kind: self.inner.kind,
            status: state.status,
            pid: state.pid,
            port: state.port,
            started_at: state.started_at,
            last_error: state.last_error.clone(),
        }
    }

    pub fn logs(&self) -> SharedLogBuffer {
        Arc::clone(&self.inner.logs)
    }

    /// The last `n` captured output lines.
    pub fn tail(&self, n: usize) -> Vec<LogLine> {
        self.inner
            .logs
            .lock()
            .map(|buffer| buffer.tail(n))
            .unwrap_or_default()
    }

    /// Register a status observer. Returns an id for `remove_callback`.
    pub fn on_status<F>(&self, callback: F) -> u64
    where
        F: Fn(ProcessStatus, Option<&str>) + Send + Sync + 'static,
    {
        let id = self.inner.next_callback.fetch_add(1, Ordering::Relaxed);
        self.inner
            .lock_callbacks()
            .push((id, Arc::new(callback)));
        id
    }

    pub fn remove_callback(&self, id: u64) -> bool {
        let mut callbacks = self.inner.lock_callbacks();
        let before = callbacks.len();
        callbacks.retain(|(cid, _)| *cid != id);
        callbacks.len() != before
    }

    // -----------------------------------------------------------------------
    // Start
    // -----------------------------------------------------------------------

    /// Start the process. Returns true when it is running afterwards.
    pub async fn start(&self, request: StartRequest) -> bool {
        self.start_with(request, |_port| async { Ok(()) }).await
    }

    /// Like `start`, running `before_spawn` once the port is known and the
    /// sandbox is up. An `Err` from the hook fails the start with its message.
    pub async fn start_with<F, Fut>(&self, request: StartRequest, before_spawn: F) -> bool
    where
        F: FnOnce(u16) -> Fut,
        Fut: Future<Output = std::result::Result<(), String>>,
    {
        let _op = self.inner.op_lock.lock().await;
        let inner = &self.inner;

        if inner.lock_state().status == ProcessStatus::Running {
            return true;
        }
        inner.set_status(ProcessStatus::Starting, None);
        info!(sandbox = %inner.sandbox, kind = %inner.kind, "Starting process");

        let port = match inner.acquire_port(&request) {
            Ok(port) => port,
            Err(message) => return inner.fail_start(message),
        };

        if !inner.registry.ensure_running(&inner.sandbox).await {
            inner.release_port();
            return inner.fail_start(format!("Failed to start sandbox {}", inner.sandbox));
        }

        if let Err(message) = before_spawn(port).await {
            inner.release_port();
            return inner.fail_start(message);
        }

        let host = request.host.clone().unwrap_or_else(|| "0.0.0.0".to_string());
        let script = render_command(&inner.settings.command_template, port, &host, &inner.sandbox);
        let user = inner
            .settings
            .user
            .clone()
            .unwrap_or_else(|| crate::sandbox::DEFAULT_USER.to_string());

        let mut cmd = inner
            .registry
            .backend()
            .command(&inner.sandbox, Some(&user), &script);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                inner.release_port();
                return inner.fail_start(format!("Failed to spawn {}: {}", inner.kind, e));
            }
        };
        let pid = child.id();
        debug!(sandbox = %inner.sandbox, kind = %inner.kind, pid = ?pid, "Process spawned");

        if let Ok(mut logs) = inner.logs.lock() {
            logs.clear();
        }
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(self.spawn_reader(stdout, LogStream::Stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(self.spawn_reader(stderr, LogStream::Stderr));
        }

        tokio::time::sleep(inner.settings.grace_period).await;

        match child.try_wait() {
            Ok(Some(exit)) => {
                // Exited during the grace period: collect what it printed.
                let drain = futures_util::future::join_all(readers);
                let _ = tokio::time::timeout(DRAIN_TIMEOUT, drain).await;
                let output = inner
                    .logs
                    .lock()
                    .map(|buffer| buffer.joined())
                    .unwrap_or_default();
                let message = if output.trim().is_empty() {
                    format!("{} exited during startup ({})", inner.kind, exit)
                } else {
                    output
                };
                inner.release_port();
                return inner.fail_start(message);
            }
            Ok(None) => {}
            Err(e) => {
                let _ = child.kill().await;
                inner.release_port();
                return inner.fail_start(format!("Failed to poll {}: {}", inner.kind, e));
            }
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let generation = {
            let mut state = inner.lock_state();
            state.generation += 1;
            state.pid = pid;
            state.port = Some(port);
            state.started_at = Some(Utc::now());
            state.last_error = None;
            state.last_request = Some(request);
            state.stop_tx = Some(stop_tx);
            state.generation
        };
        inner.set_status(ProcessStatus::Running, None);
        info!(sandbox = %inner.sandbox, kind = %inner.kind, port, pid = ?pid, "Process running");

        let watcher = tokio::spawn(watch_child(
            Arc::clone(&self.inner),
            child,
            stop_rx,
            generation,
        ));
        inner.lock_state().watcher = Some(watcher);
        true
    }

    fn spawn_reader<R>(&self, pipe: R, stream: LogStream) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut lines = BufReader::new(pipe).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(raw)) => {
                        let line = sanitize_line(&raw);
                        if line.trim().is_empty() {
                            continue;
                        }
                        match stream {
                            LogStream::Stdout => {
                                info!(target: "sandbot::agent", sandbox = %inner.sandbox, kind = %inner.kind, stream = %stream, "{}", line)
                            }
                            LogStream::Stderr => {
                                warn!(target: "sandbot::agent", sandbox = %inner.sandbox, kind = %inner.kind, stream = %stream, "{}", line)
                            }
                        }
                        let entry = LogLine::new(stream, line.clone());
                        let timestamp = entry.timestamp;
                        if let Ok(mut logs) = inner.logs.lock() {
                            logs.push(entry);
                        }
                        inner.bus.publish(Event::AgentLog {
                            sandbox: inner.sandbox.clone(),
                            kind: inner.kind,
                            stream,
                            line,
                            timestamp,
                        });
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(sandbox = %inner.sandbox, stream = %stream, error = %e, "Output reader stopped");
                        break;
                    }
                }
            }
        })
    }

    // -----------------------------------------------------------------------
    // Stop / restart
    // -----------------------------------------------------------------------

    /// Stop the process. A process that is not running is left alone.
    pub async fn stop(&self) -> bool {
        let _op = self.inner.op_lock.lock().await;
        let inner = &self.inner;

        let (stop_tx, watcher, port) = {
            let mut state = inner.lock_state();
            if state.status != ProcessStatus::Running {
                return true;
            }
            state.status = ProcessStatus::Stopping;
            (state.stop_tx.take(), state.watcher.take(), state.port)
        };
        inner.notify(ProcessStatus::Stopping, None);
        info!(sandbox = %inner.sandbox, kind = %inner.kind, "Stopping process");

        if let Some(tx) = stop_tx {
            let _ = tx.send(());
        }
        if let Some(watcher) = watcher {
            let bound = inner.settings.stop_timeout + Duration::from_secs(2);
            if tokio::time::timeout(bound, watcher).await.is_err() {
                warn!(sandbox = %inner.sandbox, kind = %inner.kind, "Watcher did not finish in time");
            }
        }

        if let Some(pattern) = &inner.settings.cleanup_pattern {
            let pattern = render_command(
                pattern,
                port.unwrap_or(0),
                "0.0.0.0",
                &inner.sandbox,
            );
            let script = format!("pkill -f {}", shell_quote(&pattern));
            let result = inner
                .registry
                .execute_command(&inner.sandbox, &script, CLEANUP_TIMEOUT)
                .await;
            if !result.success {
                // pkill exits 1 when nothing matched.
                debug!(sandbox = %inner.sandbox, exit_code = result.exit_code, "Cleanup found nothing to kill");
            }
        }

        inner.release_port();
        {
            let mut state = inner.lock_state();
            state.pid = None;
            state.port = None;
        }
        inner.set_status(ProcessStatus::Stopped, None);
        info!(sandbox = %inner.sandbox, kind = %inner.kind, "Process stopped");
        true
    }

    /// Stop, wait the settle delay, then start again with the previous request.
    pub async fn restart(&self) -> bool {
        let request = self
            .inner
            .lock_state()
            .last_request
            .clone()
            .unwrap_or_default();
        self.stop().await;
        tokio::time::sleep(self.inner.settings.restart_delay).await;
        self.start(request).await
    }
}

impl std::fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("sandbox", &self.inner.sandbox)
            .field("kind", &self.inner.kind)
            .field("status", &self.status())
            .finish()
    }
}

impl Inner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, ProcessState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_callbacks(&self) -> std::sync::MutexGuard<'_, Vec<(u64, StatusCallback)>> {
        self.callbacks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn port_key(&self) -> String {
        port_key(&self.sandbox, self.kind.purpose())
    }

    fn acquire_port(&self, request: &StartRequest) -> std::result::Result<u16, String> {
        let key = self.port_key();
        let (port, owned) = match (request.port, request.external_port) {
            (Some(port), true) => (port, false),
            (Some(port), false) => match self.ports.reserve_port(&key, port) {
                Ok(true) => (port, true),
                Ok(false) => return Err(format!("Port {} is already in use", port)),
                Err(e) => return Err(e.to_string()),
            },
            (None, _) => match self.ports.assign_port(&key) {
                Ok(port) => (port, true),
                Err(e) => return Err(e.to_string()),
            },
        };
        let mut state = self.lock_state();
        state.port = Some(port);
        state.port_owned = owned;
        Ok(port)
    }

    fn release_port(&self) {
        let owned = {
            let mut state = self.lock_state();
            std::mem::replace(&mut state.port_owned, false)
        };
        if owned {
            self.ports.release_port(&self.port_key());
        }
    }

    fn fail_start(&self, message: String) -> bool {
        error!(sandbox = %self.sandbox, kind = %self.kind, error = %message, "Process failed to start");
        {
            let mut state = self.lock_state();
            state.pid = None;
            state.port = None;
            state.last_error = Some(message.clone());
        }
        self.set_status(ProcessStatus::Error, Some(message));
        false
    }

    fn set_status(&self, status: ProcessStatus, message: Option<String>) {
        self.lock_state().status = status;
        self.notify(status, message.as_deref());
    }

    /// Invoke callbacks and publish to the bus. Never called with the state lock held.
    fn notify(&self, status: ProcessStatus, message: Option<&str>) {
        let callbacks: Vec<StatusCallback> = self
            .lock_callbacks()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in callbacks {
            invoke_isolated("process status", || callback(status, message));
        }
        self.bus.publish(Event::AgentStatusChanged {
            sandbox: self.sandbox.clone(),
            kind: self.kind,
            status,
            message: message.map(str::to_string),
        });
    }
}

/// Owns the child until it exits or a stop is requested.
async fn watch_child(
    inner: Arc<Inner>,
    mut child: Child,
    stop_rx: oneshot::Receiver<()>,
    generation: u64,
) {
    tokio::select! {
        exit = child.wait() => {
            let description = match &exit {
                Ok(status) => status.to_string(),
                Err(e) => format!("wait failed: {}", e),
            };
            let unexpected = {
                let mut state = inner.lock_state();
                let current = state.generation == generation && state.status == ProcessStatus::Running;
                if current {
                    state.pid = None;
                    state.stop_tx = None;
                    state.watcher = None;
                }
                current
            };
            if unexpected {
                warn!(sandbox = %inner.sandbox, kind = %inner.kind, exit = %description, "Process exited unexpectedly");
                inner.release_port();
                let message = format!("{} exited ({})", inner.kind, description);
                {
                    let mut state = inner.lock_state();
                    state.port = None;
                    state.last_error = Some(message.clone());
                }
                inner.set_status(ProcessStatus::Stopped, Some(message));
            }
        }
        _ = stop_rx => {
            terminate(&inner, &mut child).await;
        }
    }
}

/// Graceful terminate, bounded wait, then force kill.
async fn terminate(inner: &Inner, child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!(pid, error = %e, "SIGTERM failed");
            }
        }
    }
    #[cfg(not(unix))]
    {
        // No graceful signal for the host tool's process here; the in-sandbox cleanup follows.
        let _ = child.start_kill();
    }

    match tokio::time::timeout(inner.settings.stop_timeout, child.wait()).await {
        Ok(_) => debug!(sandbox = %inner.sandbox, kind = %inner.kind, "Process exited after terminate"),
        Err(_) => {
            warn!(sandbox = %inner.sandbox, kind = %inner.kind, "Process ignored terminate, killing");
            if let Err(e) = child.kill().await {
                warn!(sandbox = %inner.sandbox, error = %e, "Force kill failed");
            }
        }
    }
}
