//! Obfuscation proxy helper process

use super::TunnelError;
use super::process::{ChildSlot, spawn_detached, terminate};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

/// Local SOCKS port the proxy listens on
pub const SOCKS_PORT: u16 = 10194;

const STOP_TIMEOUT: Duration = Duration::from_secs(3);

pub struct Obfsproxy {
    binary: PathBuf,
    slot: ChildSlot,
}

impl Obfsproxy {
    pub fn new(binary: PathBuf) -> Self {
        Self {
            binary,
            slot: ChildSlot::new(),
        }
    }

    pub fn start(&self) -> Result<u16, TunnelError> {
        if self.slot.is_alive() {
            return Err(TunnelError::AlreadyRunning("obfsproxy"));
        }
        let args = vec![
            "obfs2".to_string(),
            "socks".to_string(),
            format!("127.0.0.1:{}", SOCKS_PORT),
        ];
        let child = spawn_detached(&self.binary, &args)?;
        self.slot.watch(child, "Obfsproxy");
        Ok(SOCKS_PORT)
    }

    pub fn stop(&self) {
        let Some(pid) = self.slot.pid() else {
            return;
        };
        debug!("Stopping obfsproxy (pid {})", pid);
        terminate(pid);
        if !self.slot.wait_exit(STOP_TIMEOUT) {
            warn!("Obfsproxy did not exit after {:?}", STOP_TIMEOUT);
        }
    }

    pub fn is_running(&self) -> bool {
        self.slot.is_alive()
    }
}
