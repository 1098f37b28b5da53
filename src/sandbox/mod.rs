// Sandbox registry module
//
// Enumerates the sandboxes owned by the host tool (WSL on Windows, an
// in-memory local backend elsewhere), drives their lifecycle and runs
// commands inside them.

pub mod types;
pub mod error;
pub mod parser;
pub mod paths;
pub mod exec;
pub mod backend;
pub mod wsl;
pub mod local;
pub mod registry;
pub mod monitor;

// Re-export commonly used types
pub use error::{SandboxError, Result, ErrorReport};
pub use types::*;
pub use backend::SandboxBackend;
pub use wsl::WslBackend;
pub use local::LocalBackend;
pub use registry::{SandboxRegistry, RegistryTimeouts, DEFAULT_USER};
pub use monitor::SandboxMonitor;
pub use paths::{to_host_path, to_sandbox_path};
