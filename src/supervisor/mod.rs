//! Supervision of the long-running processes hosted in sandboxes.

pub mod log_buffer;
pub mod process;
pub mod gateway;
pub mod bridge;
pub mod fleet;
pub mod probe;

pub use log_buffer::{LogLine, LogStream, ProcessLogBuffer, SharedLogBuffer};
pub use process::{
    render_command, sanitize_line, ManagedProcess, ProcessInfo, ProcessKind, ProcessSettings,
    ProcessStatus, StartRequest,
};
pub use gateway::{GatewayManager, GatewayStartOptions};
pub use bridge::BridgeManager;
pub use fleet::GatewayFleet;
pub use probe::probe_gateway;
