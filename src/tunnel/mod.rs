//! Tunnel process supervision
//!
//! The tunnel binary is an external program. This module launches it,
//! notices when it dies, talks to its management socket and reads its log.

pub mod args;
pub mod log_watch;
pub mod management;
pub mod obfsproxy;
pub mod process;

pub use args::{TunnelArgs, compose, parse_version};
pub use log_watch::{LogEvent, LogWatcher, TailOutcome, follow};
pub use management::{MANAGEMENT_ADDR, ManagementSession, TunnelManagement};
pub use obfsproxy::{Obfsproxy, SOCKS_PORT};
pub use process::{ChildSlot, ProcessBackend, kill_by_name};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0} not found")]
    MissingBinary(String),
    #[error("{0} is already running")]
    AlreadyRunning(&'static str),
    #[error("Unrecognised tunnel version output: {0:?}")]
    Version(String),
    #[error("Management interface error: {0}")]
    Management(String),
}

/// Lifecycle of the tunnel binary and its optional obfuscation proxy
pub trait TunnelBackend: Send + Sync {
    /// (major, minor) of the installed tunnel binary
    fn version(&self) -> Result<(u32, u32), TunnelError>;
    /// Spawn the tunnel; at most one may be live
    fn start(&self, args: &[String]) -> Result<(), TunnelError>;
    fn is_alive(&self) -> bool;
    /// Kill every tunnel process on the system by name
    fn kill_stale(&self);
    fn management(&self) -> Result<Box<dyn TunnelManagement>, TunnelError>;
    /// Start the obfuscation proxy, returns its local SOCKS port
    fn start_obfsproxy(&self) -> Result<u16, TunnelError>;
    fn stop_obfsproxy(&self);
}
