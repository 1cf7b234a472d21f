//! VPN server descriptors
//!
//! The master hands out servers as whitespace separated lines, and the same
//! format is used for the on-disk backup list:
//!
//! ```text
//! 185.65.132.10 1194 udp se1.example.net se aes256
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ServerParseError {
    #[error("Expected 6 fields in server description, got {0}")]
    FieldCount(usize),
    #[error("Invalid server address: {0}")]
    Address(String),
    #[error("Invalid server port: {0}")]
    Port(String),
    #[error("Unknown protocol: {0}")]
    Protocol(String),
    #[error("Unknown cipher: {0}")]
    Cipher(String),
}

/// Transport used to reach a server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Udp,
    Tcp,
    Obfs2,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Udp => "udp",
            Protocol::Tcp => "tcp",
            Protocol::Obfs2 => "obfs2",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ServerParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "udp" => Ok(Protocol::Udp),
            "tcp" => Ok(Protocol::Tcp),
            "obfs2" => Ok(Protocol::Obfs2),
            _ => Err(ServerParseError::Protocol(s.to_string())),
        }
    }
}

/// Data channel cipher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cipher {
    Bf128,
    Aes256,
}

impl Cipher {
    pub fn as_str(&self) -> &'static str {
        match self {
            Cipher::Bf128 => "bf128",
            Cipher::Aes256 => "aes256",
        }
    }

    /// Name understood by the tunnel binary's `--cipher`
    pub fn tunnel_name(&self) -> &'static str {
        match self {
            Cipher::Bf128 => "BF-CBC",
            Cipher::Aes256 => "AES-256-CBC",
        }
    }
}

impl fmt::Display for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Cipher {
    type Err = ServerParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bf128" => Ok(Cipher::Bf128),
            "aes256" => Ok(Cipher::Aes256),
            _ => Err(ServerParseError::Cipher(s.to_string())),
        }
    }
}

/// One VPN server
///
/// Two descriptors are equal when address, port, protocol and cipher match;
/// name and location are informational.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerDescriptor {
    pub address: Ipv4Addr,
    pub port: u16,
    pub protocol: Protocol,
    pub name: String,
    pub location: String,
    pub cipher: Cipher,
}

impl ServerDescriptor {
    /// Same server reached over a different transport
    pub fn with_protocol(&self, protocol: Protocol) -> Self {
        Self {
            protocol,
            ..self.clone()
        }
    }
}

impl PartialEq for ServerDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
            && self.port == other.port
            && self.protocol == other.protocol
            && self.cipher == other.cipher
    }
}

impl Eq for ServerDescriptor {}

impl fmt::Display for ServerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {} {}",
            self.address, self.port, self.protocol, self.name, self.location, self.cipher
        )
    }
}

impl FromStr for ServerDescriptor {
    type Err = ServerParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split_whitespace().collect();
        if fields.len() != 6 {
            return Err(ServerParseError::FieldCount(fields.len()));
        }

        let address = fields[0]
            .parse()
            .map_err(|_| ServerParseError::Address(fields[0].to_string()))?;
        let port = fields[1]
            .parse()
            .map_err(|_| ServerParseError::Port(fields[1].to_string()))?;

        Ok(Self {
            address,
            port,
            protocol: fields[2].parse()?,
            name: fields[3].to_string(),
            location: fields[4].to_string(),
            cipher: fields[5].parse()?,
        })
    }
}
