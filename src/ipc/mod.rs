//! Host automation link used by the bridge agent.

pub mod automation;
pub mod handlers;
pub mod protocol;
pub mod server;

pub use automation::{Automation, MouseButton, SystemAutomation, WindowInfo};
pub use handlers::HandlerRegistry;
pub use protocol::{Envelope, MessageKind, RequestPayload, ResponsePayload, PROTOCOL_VERSION};
pub use server::AutomationServer;

/// Default listen port of the automation server.
pub const DEFAULT_IPC_PORT: u16 = 19876;
