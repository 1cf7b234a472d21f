//! Persisted client state
//!
//! Two small files survive restarts so a connection can still be made when
//! the master is unreachable:
//!
//! - the backup server list, one descriptor per line
//!   (`address port protocol name location cipher`)
//! - the last DNS server the master recommended, one address per line

use crate::server::ServerDescriptor;
use std::fs;
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum StateError {
    #[error("Failed to access state file: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid DNS fallback address: {0:?}")]
    InvalidDns(String),
}

/// On-disk copy of the last server list fetched from the master
#[derive(Debug, Clone)]
pub struct ServerCache {
    path: PathBuf,
}

impl ServerCache {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Load the cached servers. A missing file is an empty list; lines that
    /// do not parse are skipped.
    pub fn load(&self) -> Result<Vec<ServerDescriptor>, StateError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut servers = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match line.parse() {
                Ok(server) => servers.push(server),
                Err(e) => warn!("Skipping cached server {:?}: {}", line, e),
            }
        }
        Ok(servers)
    }

    /// Replace the cached list
    pub fn save(&self, servers: &[ServerDescriptor]) -> Result<(), StateError> {
        let mut content = String::new();
        for server in servers {
            content.push_str(&server.to_string());
            content.push('\n');
        }
        fs::write(&self.path, content)?;
        debug!("Cached {} servers", servers.len());
        Ok(())
    }
}

/// Last-known-good DNS server, used when the master cannot be asked
#[derive(Debug, Clone)]
pub struct DnsFallback {
    path: PathBuf,
}

impl DnsFallback {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn load(&self) -> Result<Option<String>, StateError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let first = content.lines().next().unwrap_or_default().trim();
        if first.is_empty() {
            return Ok(None);
        }
        if first.parse::<std::net::IpAddr>().is_err() {
            return Err(StateError::InvalidDns(first.to_string()));
        }
        Ok(Some(first.to_string()))
    }

    pub fn save(&self, server: &str) -> Result<(), StateError> {
        fs::write(&self.path, format!("{}\n", server.trim()))?;
        Ok(())
    }
}
