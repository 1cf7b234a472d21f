//! Server filter and selection

use crate::config::{Choice, ObfsproxyMode, Settings};
use crate::server::{Cipher, Protocol, ServerDescriptor};
use rand::Rng;
use rand::seq::SliceRandom;
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};
use tracing::debug;

/// Which servers an attempt may use
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionFilter {
    pub location: Choice<String>,
    pub protocol: Choice<Protocol>,
    pub name: Choice<String>,
    pub port: Choice<u16>,
    pub cipher: Choice<Cipher>,
}

/// Should this attempt go through the obfuscation proxy?
pub fn use_obfuscation(mode: ObfsproxyMode, dpi_counter: u32) -> bool {
    match mode {
        ObfsproxyMode::Yes => true,
        ObfsproxyMode::No => false,
        ObfsproxyMode::Auto => dpi_counter > 0,
    }
}

impl ConnectionFilter {
    /// Filter for one attempt
    ///
    /// A suspected firewall narrows a protocol wildcard to TCP; obfuscation
    /// replaces the protocol with obfs2.
    pub fn for_attempt(
        settings: &Settings,
        maybe_blocked_by_firewall: bool,
        obfuscate: bool,
    ) -> Self {
        let mut protocol = settings.protocol.clone();
        if protocol.is_any() && maybe_blocked_by_firewall {
            protocol = Choice::Only(Protocol::Tcp);
        }
        if obfuscate {
            protocol = Choice::Only(Protocol::Obfs2);
        }
        Self {
            location: settings.location.clone(),
            protocol,
            name: settings.server.clone(),
            port: settings.port.clone(),
            cipher: settings.cipher.clone(),
        }
    }

    pub fn matches(&self, server: &ServerDescriptor) -> bool {
        self.location.matches(&server.location)
            && self.protocol.matches(&server.protocol)
            && self.name.matches(&server.name)
            && self.port.matches(&server.port)
            && self.cipher.matches(&server.cipher)
    }

    /// Servers from `servers` that pass the filter
    ///
    /// Any TCP server can also be reached through the obfuscation proxy, so
    /// an obfs2 filter accepts TCP servers rewritten to obfs2.
    pub fn matching(&self, servers: &[ServerDescriptor]) -> Vec<ServerDescriptor> {
        let obfs2 = self.protocol == Choice::Only(Protocol::Obfs2);
        let mut out: Vec<ServerDescriptor> = Vec::new();
        for server in servers {
            let candidate = if obfs2 && server.protocol == Protocol::Tcp {
                server.with_protocol(Protocol::Obfs2)
            } else {
                server.clone()
            };
            if self.matches(&candidate) && !out.contains(&candidate) {
                out.push(candidate);
            }
        }
        out
    }

    /// A server built from the filter alone, when every field is concrete
    /// and the name resolves to an IPv4 address
    pub fn custom_server_with<F>(&self, resolve: F) -> Option<ServerDescriptor>
    where
        F: Fn(&str) -> Option<Ipv4Addr>,
    {
        let location = self.location.value()?;
        let protocol = self.protocol.value()?;
        let name = self.name.value()?;
        let port = self.port.value()?;
        let cipher = self.cipher.value()?;
        let address = resolve(name)?;
        Some(ServerDescriptor {
            address,
            port: *port,
            protocol: *protocol,
            name: name.clone(),
            location: location.clone(),
            cipher: *cipher,
        })
    }

    pub fn custom_server(&self) -> Option<ServerDescriptor> {
        self.custom_server_with(resolve_ipv4)
    }
}

/// First IPv4 address of a host name or address literal
pub fn resolve_ipv4(name: &str) -> Option<Ipv4Addr> {
    (name, 0)
        .to_socket_addrs()
        .ok()?
        .find_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(*v4.ip()),
            SocketAddr::V6(_) => None,
        })
}

/// Pick one of `candidates`, preferring UDP, uniformly at random
pub fn select_server<R: Rng + ?Sized>(
    candidates: &[ServerDescriptor],
    rng: &mut R,
) -> Option<ServerDescriptor> {
    let udp: Vec<&ServerDescriptor> = candidates
        .iter()
        .filter(|s| s.protocol == Protocol::Udp)
        .collect();
    let all: Vec<&ServerDescriptor> = candidates.iter().collect();
    let pool = if udp.is_empty() { all } else { udp };
    let selected = pool.choose(rng).map(|s| (*s).clone());
    if let Some(server) = &selected {
        debug!("Selected server: {}", server);
    }
    selected
}
