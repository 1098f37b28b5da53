//! # sandbot
//!
//! Host-side control plane for a fleet of sandboxes (WSL distributions on
//! Windows), each running an agent gateway and optionally a bridge agent.
//!
//! ## Modules
//!
//! - [`sandbox`] - sandbox enumeration, lifecycle and command execution
//! - [`ports`] - port allocation for gateways
//! - [`supervisor`] - gateway and bridge process supervision
//! - [`sync`] - agent configuration sync between host and sandbox
//! - [`ipc`] - the host automation server used by the bridge agent
//! - [`bus`] - process-wide event bus
//! - [`config`] - application configuration
//!
//! ## Wiring
//!
//! Services are built once and shared explicitly:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sandbot::bus::EventBus;
//! use sandbot::ports::PortAllocator;
//! use sandbot::sandbox::{SandboxRegistry, WslBackend};
//! use sandbot::supervisor::{GatewayFleet, ProcessSettings};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let bus = Arc::new(EventBus::new());
//! let registry = Arc::new(SandboxRegistry::new(Arc::new(WslBackend::new()), Arc::clone(&bus)));
//! let ports = Arc::new(PortAllocator::default());
//! let fleet = GatewayFleet::new(registry, ports, bus, ProcessSettings::default());
//! fleet.start("ubuntu", None).await;
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod cli;
pub mod config;
pub mod ipc;
pub mod logging;
pub mod ports;
pub mod sandbox;
pub mod supervisor;
pub mod sync;
