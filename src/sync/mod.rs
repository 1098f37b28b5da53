//! Configuration synchronization between the host and sandboxed agents.

pub mod casing;
pub mod schema;
pub mod engine;
pub mod store;

pub use engine::{merge_into, ConfigSyncEngine, SyncError, DEFAULT_SANDBOX_CONFIG_PATH};
pub use schema::{HostAgentConfig, ProviderSettings, CHANNELS};
pub use store::ConfigStore;
