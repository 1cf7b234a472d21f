//! Master (account server) protocol
//!
//! The master issues client certificates, server lists, subscription status
//! and the recommended DNS server. It is reached over TCP, either directly
//! at its well-known address or relayed through port 53 of any VPN server.

pub mod certs;
pub mod client;

pub use certs::{CertError, CertStore, CertTool, OpenSslTool, RenewReason};
pub use client::{MasterClient, TcpConnector};

use crate::server::ServerDescriptor;
use crate::wire::FrameError;
use rand::seq::SliceRandom;
use rand::Rng;
use std::net::{Ipv4Addr, SocketAddrV4};
use thiserror::Error;

/// Canonical master address, used when no relay answers
pub const MASTER_ADDR: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(193, 138, 219, 42), 51678);

/// Port on every VPN server that relays to the master
pub const RELAY_PORT: u16 = 53;

const MAX_PREFERRED: usize = 3;
const MAX_OTHERS: usize = 2;

#[derive(Error, Debug)]
pub enum MasterError {
    #[error("Connection to master failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Master framing error: {0}")]
    Frame(#[from] FrameError),
    #[error("{description}")]
    Remote { kind: String, description: String },
    #[error("Malformed reply to {command}: {reason}")]
    Malformed { command: &'static str, reason: String },
    #[error("{0}: signature verification failed")]
    SignatureVerification(&'static str),
    #[error("Certificate error: {0}")]
    Cert(#[from] CertError),
}

impl MasterError {
    /// True when the master could not be talked to at all
    ///
    /// Such failures are soft: the caller falls back to cached data.
    pub fn is_transport(&self) -> bool {
        matches!(self, MasterError::Io(_) | MasterError::Frame(_))
    }
}

/// Commands understood by the master
pub trait MasterApi: Send {
    /// Handshake; returns the master's version string
    fn version(&mut self) -> Result<String, MasterError>;
    /// PEM of the master's own certificate
    fn get_certificate(&mut self) -> Result<Vec<u8>, MasterError>;
    /// Submit a CSR, returns the signed certificate
    fn sign_certificate(&mut self, csr: &[u8]) -> Result<Vec<u8>, MasterError>;
    fn get_vpn_servers(&mut self) -> Result<Vec<ServerDescriptor>, MasterError>;
    /// Seconds of subscription left
    fn subscription_time_left(&mut self, account_id: u64) -> Result<i64, MasterError>;
    /// Current and maximum number of concurrent connections
    fn connection_count(&mut self, account_id: u64) -> Result<(u32, u32), MasterError>;
    /// Recommended DNS server, signature checked against the master cert
    fn dns_server(&mut self) -> Result<String, MasterError>;
    fn exit_address(&mut self) -> Result<String, MasterError>;
    fn latest_version(&mut self) -> Result<String, MasterError>;
    fn ports(&mut self, account_id: u64) -> Result<Vec<u16>, MasterError>;
    fn new_port(&mut self, account_id: u64) -> Result<Vec<u16>, MasterError>;
    fn remove_port(&mut self, account_id: u64, port: u16) -> Result<Vec<u16>, MasterError>;
    fn max_ports(&mut self) -> Result<u32, MasterError>;
    /// End the session
    fn quit(&mut self) -> Result<(), MasterError>;
}

/// Opens master sessions
pub trait MasterConnector: Send + Sync {
    fn connect(&self, addr: SocketAddrV4) -> Result<Box<dyn MasterApi>, MasterError>;
}

/// Order in which master addresses are tried
///
/// Up to three relays matching the user's filter (or only the custom server
/// when one is configured), then the canonical master, then up to two
/// relays outside the filter.
pub fn candidate_addresses<R: Rng + ?Sized>(
    matching: &[Ipv4Addr],
    others: &[Ipv4Addr],
    custom: Option<Ipv4Addr>,
    rng: &mut R,
) -> Vec<SocketAddrV4> {
    let mut preferred = dedup(matching);
    let mut rest: Vec<Ipv4Addr> = dedup(others)
        .into_iter()
        .filter(|a| !preferred.contains(a))
        .collect();
    preferred.shuffle(rng);
    rest.shuffle(rng);

    let mut candidates: Vec<SocketAddrV4> = match custom {
        Some(addr) => vec![SocketAddrV4::new(addr, RELAY_PORT)],
        None => preferred
            .into_iter()
            .take(MAX_PREFERRED)
            .map(|a| SocketAddrV4::new(a, RELAY_PORT))
            .collect(),
    };
    candidates.push(MASTER_ADDR);
    candidates.extend(
        rest.into_iter()
            .take(MAX_OTHERS)
            .map(|a| SocketAddrV4::new(a, RELAY_PORT)),
    );
    candidates
}

fn dedup(addrs: &[Ipv4Addr]) -> Vec<Ipv4Addr> {
    let mut out: Vec<Ipv4Addr> = Vec::with_capacity(addrs.len());
    for addr in addrs {
        if !out.contains(addr) {
            out.push(*addr);
        }
    }
    out
}
