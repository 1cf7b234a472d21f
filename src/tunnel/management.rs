//! Tunnel management interface
//!
//! A line protocol on a local TCP port. `state` answers with one or more
//! comma separated lines followed by `END`; `signal SIGINT` answers with a
//! `SUCCESS:` line when the tunnel accepted the signal.

use super::TunnelError;
use std::io::{Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, SocketAddrV4, TcpStream};
use std::time::Duration;

pub const MANAGEMENT_ADDR: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 7505);

const TIMEOUT: Duration = Duration::from_secs(2);
const STATE_TERMINATOR: &str = "END\r\n";
const KILL_REPLY_LEN: usize = 8;

/// Status polling and forced termination of a running tunnel
pub trait TunnelManagement: Send {
    /// Second field of the `state` reply, e.g. `CONNECTED`
    fn status(&mut self) -> Result<String, TunnelError>;
    /// Ask the tunnel to exit; true if it acknowledged
    fn force_kill(&mut self) -> Result<bool, TunnelError>;
    fn close(&mut self);
}

pub struct ManagementSession<S> {
    stream: S,
}

impl ManagementSession<TcpStream> {
    pub fn connect(addr: SocketAddrV4) -> Result<Self, TunnelError> {
        let stream = TcpStream::connect_timeout(&SocketAddr::V4(addr), TIMEOUT)?;
        stream.set_read_timeout(Some(TIMEOUT))?;
        stream.set_write_timeout(Some(TIMEOUT))?;
        Self::new(stream)
    }
}

impl<S: Read + Write> ManagementSession<S> {
    /// Wrap a stream and consume the greeting banner
    pub fn new(mut stream: S) -> Result<Self, TunnelError> {
        let mut greeting = [0u8; 500];
        let n = stream.read(&mut greeting)?;
        let greeting = String::from_utf8_lossy(&greeting[..n]);
        tracing::trace!("Management greeting: {}", greeting.trim_end());
        Ok(Self { stream })
    }

    fn read_more(&mut self, into: &mut String) -> Result<(), TunnelError> {
        let mut buf = [0u8; 1 << 16];
        let n = self.stream.read(&mut buf)?;
        if n == 0 {
            return Err(TunnelError::Management("closed".to_string()));
        }
        into.push_str(&String::from_utf8_lossy(&buf[..n]));
        Ok(())
    }

    /// Raw `state` reply, terminator included
    pub fn state_info(&mut self) -> Result<String, TunnelError> {
        self.stream.write_all(b"state\n")?;
        let mut reply = String::new();
        while !reply.ends_with(STATE_TERMINATOR) {
            self.read_more(&mut reply)?;
        }
        Ok(reply)
    }

    pub fn connection_state(&mut self) -> Result<String, TunnelError> {
        let info = self.state_info()?;
        info.split(',')
            .nth(1)
            .map(str::to_string)
            .ok_or_else(|| TunnelError::Management(format!("unexpected state reply {:?}", info)))
    }

    pub fn kill(&mut self) -> Result<bool, TunnelError> {
        self.stream.write_all(b"signal SIGINT\n")?;
        let mut reply = String::new();
        while reply.len() < KILL_REPLY_LEN {
            self.read_more(&mut reply)?;
        }
        Ok(reply.starts_with("SUCCESS:"))
    }
}

impl TunnelManagement for ManagementSession<TcpStream> {
    fn status(&mut self) -> Result<String, TunnelError> {
        self.connection_state()
    }

    fn force_kill(&mut self) -> Result<bool, TunnelError> {
        self.kill()
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}
