//! Configuration handling for mtunnel
//!
//! Settings are stored as TOML. Server filter fields accept `"any"` (or the
//! legacy `"xx"`) as a wildcard, and numeric fields may be written either as
//! integers or as strings.

use crate::server::{Cipher, Protocol};
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;
use thiserror::Error;
use tracing::{debug, warn};

pub const SETTINGS_FILE: &str = "settings.toml";

/// Bounds accepted for `send_recv_buffers`
pub const SEND_RECV_BUFFERS_MIN: u32 = 8192;
pub const SEND_RECV_BUFFERS_MAX: u32 = 67_108_864;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),
    #[error("Invalid setting {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// A filter value: either a wildcard or one concrete value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Choice<T> {
    Any,
    Only(T),
}

impl<T> Choice<T> {
    pub fn is_any(&self) -> bool {
        matches!(self, Choice::Any)
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Choice::Any => None,
            Choice::Only(v) => Some(v),
        }
    }

    pub fn matches(&self, candidate: &T) -> bool
    where
        T: PartialEq,
    {
        match self {
            Choice::Any => true,
            Choice::Only(v) => v == candidate,
        }
    }
}

impl<T> Default for Choice<T> {
    fn default() -> Self {
        Choice::Any
    }
}

fn is_wildcard(s: &str) -> bool {
    matches!(s, "any" | "xx")
}

impl<T: FromStr> FromStr for Choice<T> {
    type Err = T::Err;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if is_wildcard(s) {
            Ok(Choice::Any)
        } else {
            s.parse().map(Choice::Only)
        }
    }
}

impl<T: fmt::Display> fmt::Display for Choice<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Choice::Any => f.write_str("any"),
            Choice::Only(v) => v.fmt(f),
        }
    }
}

impl<T: fmt::Display> Serialize for Choice<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Loose scalar accepted wherever a setting may be written as text or number
#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Text(String),
    Number(i64),
}

impl Scalar {
    fn into_text(self) -> String {
        match self {
            Scalar::Text(s) => s,
            Scalar::Number(n) => n.to_string(),
        }
    }
}

impl<'de, T> Deserialize<'de> for Choice<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = Scalar::deserialize(deserializer)?.into_text();
        text.parse().map_err(de::Error::custom)
    }
}

/// When to route the tunnel through the obfuscation proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObfsproxyMode {
    #[default]
    Auto,
    Yes,
    No,
}

/// Socket buffer size passed to the tunnel binary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferSize {
    #[default]
    Auto,
    Bytes(u32),
}

impl Serialize for BufferSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            BufferSize::Auto => serializer.serialize_str("auto"),
            BufferSize::Bytes(n) => serializer.serialize_u32(*n),
        }
    }
}

impl<'de> Deserialize<'de> for BufferSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = Scalar::deserialize(deserializer)?.into_text();
        if text == "auto" {
            return Ok(BufferSize::Auto);
        }
        text.trim()
            .parse()
            .map(BufferSize::Bytes)
            .map_err(|_| {
                de::Error::custom(format!("expected \"auto\" or a byte count, got {text:?}"))
            })
    }
}

/// User settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<u64>,
    pub delete_default_route: bool,
    pub tunnel_ipv6: bool,
    pub location: Choice<String>,
    pub protocol: Choice<Protocol>,
    pub server: Choice<String>,
    pub port: Choice<u16>,
    pub cipher: Choice<Cipher>,
    pub stop_dns_leaks: bool,
    pub obfsproxy: ObfsproxyMode,
    pub block_local_network: bool,
    /// Connect timeout in seconds
    pub timeout: u64,
    pub windows_block_outside_dns: bool,
    pub block_incoming_udp: bool,
    pub send_recv_buffers: BufferSize,
    pub autoconnect_on_start: bool,
    pub custom_tunnel_args: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            account_id: None,
            delete_default_route: true,
            tunnel_ipv6: false,
            location: Choice::Only("se".to_string()),
            protocol: Choice::Any,
            server: Choice::Any,
            port: Choice::Any,
            cipher: Choice::Any,
            stop_dns_leaks: true,
            obfsproxy: ObfsproxyMode::Auto,
            block_local_network: false,
            timeout: 35,
            windows_block_outside_dns: true,
            block_incoming_udp: true,
            send_recv_buffers: BufferSize::Auto,
            autoconnect_on_start: true,
            custom_tunnel_args: String::new(),
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check values that the file format alone cannot constrain
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let BufferSize::Bytes(n) = self.send_recv_buffers {
            if !(SEND_RECV_BUFFERS_MIN..=SEND_RECV_BUFFERS_MAX).contains(&n) {
                return Err(ConfigError::Invalid {
                    name: "send_recv_buffers",
                    reason: format!(
                        "must be an integer between {} and {}",
                        SEND_RECV_BUFFERS_MIN, SEND_RECV_BUFFERS_MAX
                    ),
                });
            }
        }
        if self.timeout == 0 {
            return Err(ConfigError::Invalid {
                name: "timeout",
                reason: "must be at least one second".to_string(),
            });
        }
        Ok(())
    }

    /// Whitespace separated extra arguments for the tunnel binary
    pub fn custom_args(&self) -> Vec<String> {
        self.custom_tunnel_args
            .split(' ')
            .filter(|a| !a.is_empty())
            .map(str::to_string)
            .collect()
    }
}

struct Cached {
    mtime: Option<SystemTime>,
    settings: Arc<Settings>,
}

/// Settings backed by a file, reloaded when the file changes on disk
pub struct SettingsStore {
    path: PathBuf,
    cached: Mutex<Cached>,
}

impl SettingsStore {
    /// Open the store, writing defaults if the file does not exist yet
    pub fn open(path: PathBuf) -> Result<Self, ConfigError> {
        if !path.exists() {
            Settings::default().save(&path)?;
        }
        let settings = Settings::load(&path)?;
        let mtime = modified(&path);
        Ok(Self {
            path,
            cached: Mutex::new(Cached {
                mtime,
                settings: Arc::new(settings),
            }),
        })
    }

    /// In-memory store, used where no settings file exists
    pub fn in_memory(settings: Settings) -> Self {
        Self {
            path: PathBuf::new(),
            cached: Mutex::new(Cached {
                mtime: None,
                settings: Arc::new(settings),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current settings, re-read from disk if the file changed
    pub fn snapshot(&self) -> Arc<Settings> {
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        if self.path.as_os_str().is_empty() {
            return Arc::clone(&cached.settings);
        }

        let mtime = modified(&self.path);
        if mtime != cached.mtime {
            match Settings::load(&self.path) {
                Ok(settings) => {
                    debug!("Reloaded settings from {}", self.path.display());
                    cached.settings = Arc::new(settings);
                    cached.mtime = mtime;
                }
                Err(e) => warn!("Keeping previous settings: {}", e),
            }
        }
        Arc::clone(&cached.settings)
    }

    /// Apply a change and persist it
    pub fn update<F>(&self, change: F) -> Result<Arc<Settings>, ConfigError>
    where
        F: FnOnce(&mut Settings),
    {
        let current = self.snapshot();
        let mut settings = (*current).clone();
        change(&mut settings);

        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.path.as_os_str().is_empty() {
            settings.save(&self.path)?;
            cached.mtime = modified(&self.path);
        }
        cached.settings = Arc::new(settings);
        Ok(Arc::clone(&cached.settings))
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
