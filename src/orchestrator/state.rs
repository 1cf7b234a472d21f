use serde::{Deserialize, Serialize};
use std::fmt;

/// Where the connection actually is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal; the control loop has ended or is about to
    Off,
    /// Sticky until an explicit connect or shutdown request
    Unrecoverable,
}

/// Where the user wants the connection to be
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    Connected,
    Disconnected,
    Off,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Off => "off",
            ConnectionState::Unrecoverable => "unrecoverable",
        };
        f.write_str(name)
    }
}
