//! Filesystem locations
//!
//! Everything the client reads or writes lives under three directories:
//! the config directory (settings, certificates, cached state), the log
//! directory (tunnel logs) and the installation directory (tunnel config
//! templates, bundled scripts and the shipped CA/master certificates).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

const APP_DIR: &str = "mtunnel";

const TUNNEL_LOG_PREFIX: &str = "openvpn.";
const TUNNEL_LOG_SUFFIX: &str = ".log";

/// Number of tunnel logs kept after pruning
pub const TUNNEL_LOGS_KEPT: usize = 5;

#[derive(Debug, Clone)]
pub struct Paths {
    pub config_dir: PathBuf,
    pub log_dir: PathBuf,
    pub install_dir: PathBuf,
}

impl Paths {
    pub fn new(config_dir: PathBuf, log_dir: PathBuf, install_dir: PathBuf) -> Self {
        Self {
            config_dir,
            log_dir,
            install_dir,
        }
    }

    /// Platform default locations, each overridable
    pub fn resolve(config_dir: Option<PathBuf>, log_dir: Option<PathBuf>) -> Self {
        let config_dir = config_dir.unwrap_or_else(default_config_dir);
        let log_dir = log_dir.unwrap_or_else(|| {
            dirs::data_local_dir()
                .map(|d| d.join(APP_DIR).join("logs"))
                .unwrap_or_else(|| config_dir.join("logs"))
        });
        Self {
            config_dir,
            log_dir,
            install_dir: default_install_dir(),
        }
    }

    /// Create the config and log directories if missing
    pub fn ensure_dirs(&self) -> io::Result<()> {
        fs::create_dir_all(&self.config_dir)?;
        fs::create_dir_all(&self.log_dir)?;
        fs::create_dir_all(self.ssl_dir())?;
        Ok(())
    }

    pub fn settings_file(&self) -> PathBuf {
        self.config_dir.join(crate::config::SETTINGS_FILE)
    }

    pub fn ssl_dir(&self) -> PathBuf {
        self.config_dir.join("ssl")
    }

    pub fn installed_ssl_dir(&self) -> PathBuf {
        self.install_dir.join("ssl")
    }

    pub fn backup_servers_file(&self) -> PathBuf {
        self.config_dir.join("backupservers.txt")
    }

    pub fn dns_fallback_file(&self) -> PathBuf {
        self.config_dir.join("harddnsbackup.txt")
    }

    pub fn default_gateway_file(&self) -> PathBuf {
        self.config_dir.join("defaultgw")
    }

    /// Tunnel config template shipped for the given OS
    pub fn tunnel_config(&self, os: crate::platform::TargetOs) -> PathBuf {
        self.install_dir.join(format!("client.conf.{}", os.config_suffix()))
    }

    /// Path for a fresh, empty tunnel log, pruning older logs
    pub fn new_tunnel_log(&self) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.log_dir)?;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let stamp = match self.tunnel_logs()?.last() {
            Some((_, last)) if *last >= now => last + 1,
            _ => now,
        };

        let path = self
            .log_dir
            .join(format!("{TUNNEL_LOG_PREFIX}{stamp}{TUNNEL_LOG_SUFFIX}"));
        fs::File::create(&path)?;
        self.prune_tunnel_logs(TUNNEL_LOGS_KEPT);
        Ok(path)
    }

    /// Newest tunnel log, if any
    pub fn latest_tunnel_log(&self) -> Option<PathBuf> {
        self.tunnel_logs()
            .ok()?
            .pop()
            .map(|(name, _)| self.log_dir.join(name))
    }

    /// Delete all but the `keep` newest tunnel logs
    pub fn prune_tunnel_logs(&self, keep: usize) {
        let Ok(logs) = self.tunnel_logs() else {
            return;
        };
        let excess = logs.len().saturating_sub(keep);
        for (name, _) in logs.into_iter().take(excess) {
            let path = self.log_dir.join(name);
            if let Err(e) = fs::remove_file(&path) {
                warn!("Unable to delete {}: {}", path.display(), e);
            }
        }
    }

    /// Tunnel logs as (file name, stamp), oldest first
    fn tunnel_logs(&self) -> io::Result<Vec<(String, u64)>> {
        let mut logs = Vec::new();
        for entry in fs::read_dir(&self.log_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(stamp) = parse_log_stamp(&name) {
                logs.push((name, stamp));
            }
        }
        logs.sort_by_key(|(_, stamp)| *stamp);
        Ok(logs)
    }
}

fn parse_log_stamp(name: &str) -> Option<u64> {
    name.strip_prefix(TUNNEL_LOG_PREFIX)?
        .strip_suffix(TUNNEL_LOG_SUFFIX)?
        .parse()
        .ok()
}

fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from(".").join(APP_DIR))
}

fn default_install_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}
