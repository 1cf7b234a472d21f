//! Route probe
//!
//! One UDP datagram with TTL 1 is sent toward an address that will never
//! answer. The first router on the path replies with ICMP time exceeded,
//! which names the next hop. While the tunnel carries the default route
//! that hop lies inside the tunnel's private network.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::time::{Duration, Instant};
use tracing::debug;

pub const PROBE_DEST: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(193, 0, 14, 129), 65501);
pub const PROBE_PAYLOAD: &[u8] = b"Meaningless dummy data.";

const READ_TIMEOUT: Duration = Duration::from_secs(2);
const OVERALL_TIMEOUT: Duration = Duration::from_secs(3);

const ICMP_TIME_EXCEEDED: u8 = 11;
const ICMP_HEADER_LEN: usize = 8;
const UDP_HEADER_LEN: usize = 8;

/// What a probe found out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    NextHop(Ipv4Addr),
    /// No matching reply within the time limit
    Timeout,
}

impl ProbeOutcome {
    /// Is this outcome consistent with all traffic going through the tunnel?
    pub fn inside_tunnel(&self) -> bool {
        match self {
            ProbeOutcome::NextHop(hop) => hop.octets()[0] == 10,
            ProbeOutcome::Timeout => true,
        }
    }
}

/// Sends one probe and reports the next hop
pub trait RouteProbe: Send + Sync {
    fn probe(&self) -> io::Result<ProbeOutcome>;
}

/// Probe over a raw ICMP socket; needs root
#[derive(Debug, Default, Clone, Copy)]
pub struct IcmpProbe;

impl RouteProbe for IcmpProbe {
    fn probe(&self) -> io::Result<ProbeOutcome> {
        let listener = raw_icmp_socket()?;
        listener.set_read_timeout(Some(READ_TIMEOUT))?;

        let sender = UdpSocket::bind("0.0.0.0:0")?;
        sender.set_ttl(1)?;
        sender.send_to(PROBE_PAYLOAD, PROBE_DEST)?;

        let deadline = Instant::now() + OVERALL_TIMEOUT;
        let mut buf = [0u8; 1500];
        while Instant::now() < deadline {
            let n = match listener.recv(&mut buf) {
                Ok(n) => n,
                Err(e)
                    if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
                {
                    return Ok(ProbeOutcome::Timeout);
                }
                Err(e) => return Err(e),
            };
            if let Some(hop) = parse_time_exceeded(&buf[..n], PROBE_DEST, PROBE_PAYLOAD) {
                return Ok(ProbeOutcome::NextHop(hop));
            }
            debug!("Ignoring unrelated ICMP packet ({} bytes)", n);
        }
        Ok(ProbeOutcome::Timeout)
    }
}

#[cfg(unix)]
fn raw_icmp_socket() -> io::Result<UdpSocket> {
    use nix::sys::socket::{AddressFamily, SockFlag, SockProtocol, SockType, socket};

    let fd = socket(
        AddressFamily::Inet,
        SockType::Raw,
        SockFlag::empty(),
        SockProtocol::Icmp,
    )
    .map_err(io::Error::from)?;
    // A raw socket reads with plain recv(2), as UDP sockets do
    Ok(UdpSocket::from(fd))
}

#[cfg(not(unix))]
fn raw_icmp_socket() -> io::Result<UdpSocket> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "raw sockets are not available"))
}

fn ip_header_len(packet: &[u8]) -> Option<usize> {
    let len = (*packet.first()? & 0x0f) as usize * 4;
    (len >= 20 && packet.len() >= len).then_some(len)
}

/// Next hop named by an ICMP time exceeded packet that quotes our probe
///
/// `packet` starts at the IPv4 header, as a raw socket delivers it.
pub fn parse_time_exceeded(packet: &[u8], dest: SocketAddrV4, payload: &[u8]) -> Option<Ipv4Addr> {
    let ihl = ip_header_len(packet)?;
    let source = Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]);

    let icmp = &packet[ihl..];
    if icmp.len() < ICMP_HEADER_LEN || icmp[0] != ICMP_TIME_EXCEEDED {
        return None;
    }

    let original = &icmp[ICMP_HEADER_LEN..];
    let inner_ihl = ip_header_len(original)?;
    if original[16..20] != dest.ip().octets() {
        return None;
    }

    let udp = &original[inner_ihl..];
    if udp.len() < UDP_HEADER_LEN {
        return None;
    }
    let port = u16::from_be_bytes([udp[2], udp[3]]);
    let length = u16::from_be_bytes([udp[4], udp[5]]) as usize;
    if port != dest.port() || length.checked_sub(UDP_HEADER_LEN)? != payload.len() {
        return None;
    }
    // Routers may quote only part of the datagram
    payload.starts_with(&udp[UDP_HEADER_LEN..]).then_some(source)
}
