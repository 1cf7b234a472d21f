//! mtunnel - leak-proof VPN client core
//!
//! Drives an external tunnel binary and keeps all traffic inside the tunnel
//! while it connects, runs and fails.
//!
//! # Architecture
//!
//! - `orchestrator`: connection state machine (connect, monitor, disconnect)
//! - `master`: account server protocol and certificate policy
//! - `tunnel`: tunnel process supervision, management socket, log watching
//! - `platform`: firewall, routing, DNS and interface capabilities
//! - `privilege`: pipe RPC between an unprivileged UI and the root worker
//! - `wire`: framing shared by the master and privilege protocols
//! - `config`, `paths`, `state`, `server`: settings, locations, cached state
//!
//! # Usage
//!
//! ```bash
//! sudo mtunnel connect
//! sudo mtunnel worker --pipedir /run/mtunnel
//! ```

pub mod config;
pub mod master;
pub mod orchestrator;
pub mod paths;
pub mod platform;
pub mod privilege;
pub mod server;
pub mod state;
pub mod tunnel;
pub mod wire;

pub use config::{Settings, SettingsStore};
pub use orchestrator::{Controller, Orchestrator};
pub use paths::Paths;
