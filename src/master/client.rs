//! Master client over a framed byte stream

use super::certs::CertTool;
use super::{MasterApi, MasterConnector, MasterError};
use crate::server::ServerDescriptor;
use crate::wire::{decode_sequence, encode_sequence, read_frame, write_frame, FrameError};
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, SocketAddrV4, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Bound on establishing the TCP connection
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(4);
/// Bound on each read or write once connected
pub const IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Numeric client version sent in the handshake
fn client_version() -> &'static str {
    let version = env!("CARGO_PKG_VERSION");
    let end = version
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(version.len());
    if end == 0 { "0" } else { &version[..end] }
}

type Reply = Vec<Vec<u8>>;

/// One session with the master
pub struct MasterClient<S: Read + Write> {
    stream: S,
    cert_tool: Arc<dyn CertTool>,
    master_cert: PathBuf,
}

impl MasterClient<TcpStream> {
    pub fn connect(
        addr: SocketAddrV4,
        cert_tool: Arc<dyn CertTool>,
        master_cert: PathBuf,
    ) -> Result<Self, MasterError> {
        let stream = TcpStream::connect_timeout(&SocketAddr::V4(addr), CONNECT_TIMEOUT)?;
        stream.set_read_timeout(Some(IO_TIMEOUT))?;
        stream.set_write_timeout(Some(IO_TIMEOUT))?;
        Ok(Self::new(stream, cert_tool, master_cert))
    }
}

impl<S: Read + Write> MasterClient<S> {
    pub fn new(stream: S, cert_tool: Arc<dyn CertTool>, master_cert: PathBuf) -> Self {
        Self {
            stream,
            cert_tool,
            master_cert,
        }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    fn send(&mut self, command: &'static str, args: &[&[u8]]) -> Result<Reply, MasterError> {
        let mut fields: Vec<&[u8]> = Vec::with_capacity(args.len() + 1);
        fields.push(command.as_bytes());
        fields.extend_from_slice(args);

        write_frame(&mut self.stream, &encode_sequence(&fields))?;
        let reply = decode_sequence(&read_frame(&mut self.stream)?);

        if reply.first().map(Vec::as_slice) == Some(b"error".as_slice()) {
            let kind = text_field(&reply, 1);
            let description = text_field(&reply, 2);
            debug!("Master replied error to {}: {} ({})", command, description, kind);
            return Err(MasterError::Remote { kind, description });
        }
        Ok(reply)
    }

    fn send_text(&mut self, command: &'static str, args: &[&str]) -> Result<Reply, MasterError> {
        let args: Vec<&[u8]> = args.iter().map(|a| a.as_bytes()).collect();
        self.send(command, &args)
    }
}

fn text_field(reply: &Reply, index: usize) -> String {
    reply
        .get(index)
        .map(|f| String::from_utf8_lossy(f).into_owned())
        .unwrap_or_default()
}

fn field<'a>(
    command: &'static str,
    reply: &'a Reply,
    index: usize,
) -> Result<&'a [u8], MasterError> {
    reply
        .get(index)
        .map(Vec::as_slice)
        .ok_or_else(|| MasterError::Malformed {
            command,
            reason: format!("missing field {index}"),
        })
}

fn string_field(command: &'static str, reply: &Reply, index: usize) -> Result<String, MasterError> {
    let raw = field(command, reply, index)?;
    String::from_utf8(raw.to_vec()).map_err(|_| MasterError::Malformed {
        command,
        reason: format!("field {index} is not UTF-8"),
    })
}

fn number_field<T: std::str::FromStr>(
    command: &'static str,
    reply: &Reply,
    index: usize,
) -> Result<T, MasterError> {
    let text = string_field(command, reply, index)?;
    text.trim().parse().map_err(|_| MasterError::Malformed {
        command,
        reason: format!("expected a number, got {text:?}"),
    })
}

fn port_list(command: &'static str, reply: &Reply) -> Result<Vec<u16>, MasterError> {
    (1..reply.len())
        .map(|i| number_field(command, reply, i))
        .collect()
}

impl<S: Read + Write + Send> MasterApi for MasterClient<S> {
    fn version(&mut self) -> Result<String, MasterError> {
        let reply = self.send_text("version", &[client_version()])?;
        string_field("version", &reply, 1)
    }

    fn get_certificate(&mut self) -> Result<Vec<u8>, MasterError> {
        let reply = self.send("get cert", &[])?;
        Ok(field("get cert", &reply, 1)?.to_vec())
    }

    fn sign_certificate(&mut self, csr: &[u8]) -> Result<Vec<u8>, MasterError> {
        let reply = self.send("sign", &[csr])?;
        Ok(field("sign", &reply, 1)?.to_vec())
    }

    fn get_vpn_servers(&mut self) -> Result<Vec<ServerDescriptor>, MasterError> {
        let reply = self.send("get server", &[])?;
        let mut servers = Vec::with_capacity(reply.len().saturating_sub(1));
        for raw in reply.iter().skip(1) {
            let line = String::from_utf8_lossy(raw);
            match line.parse() {
                Ok(server) => servers.push(server),
                Err(e) => warn!("Unknown server description {:?}: {}", line, e),
            }
        }
        Ok(servers)
    }

    fn subscription_time_left(&mut self, account_id: u64) -> Result<i64, MasterError> {
        let id = account_id.to_string();
        let reply = self.send_text("subscription time", &[&id, "fingerprint_deprecated"])?;
        number_field("subscription time", &reply, 1)
    }

    fn connection_count(&mut self, account_id: u64) -> Result<(u32, u32), MasterError> {
        let reply = self.send_text("connections", &[&account_id.to_string()])?;
        Ok((
            number_field("connections", &reply, 1)?,
            number_field("connections", &reply, 2)?,
        ))
    }

    fn dns_server(&mut self) -> Result<String, MasterError> {
        let reply = self.send("dns server", &[])?;
        let dns = field("dns server", &reply, 1)?.to_vec();
        let signature = field("dns server", &reply, 2)?;

        let digest = hex::encode(Sha256::digest(&dns));
        let recovered = self.cert_tool.recover_signed(signature, &self.master_cert)?;
        match recovered {
            Some(data) if String::from_utf8_lossy(&data).trim() == digest => {
                Ok(String::from_utf8_lossy(&dns).trim().to_string())
            }
            _ => Err(MasterError::SignatureVerification("dns server")),
        }
    }

    fn exit_address(&mut self) -> Result<String, MasterError> {
        let reply = self.send("ip address", &[])?;
        string_field("ip address", &reply, 1)
    }

    fn latest_version(&mut self) -> Result<String, MasterError> {
        let reply = self.send("latest version", &[])?;
        Ok(string_field("latest version", &reply, 1)?.trim().to_string())
    }

    fn ports(&mut self, account_id: u64) -> Result<Vec<u16>, MasterError> {
        let reply = self.send_text("forward port", &[&account_id.to_string()])?;
        port_list("forward port", &reply)
    }

    fn new_port(&mut self, account_id: u64) -> Result<Vec<u16>, MasterError> {
        let reply = self.send_text("new port", &[&account_id.to_string()])?;
        port_list("new port", &reply)
    }

    fn remove_port(&mut self, account_id: u64, port: u16) -> Result<Vec<u16>, MasterError> {
        let reply = self.send_text("remove port", &[&account_id.to_string(), &port.to_string()])?;
        port_list("remove port", &reply)
    }

    fn max_ports(&mut self) -> Result<u32, MasterError> {
        let reply = self.send("max ports", &[])?;
        number_field("max ports", &reply, 1)
    }

    fn quit(&mut self) -> Result<(), MasterError> {
        write_frame(&mut self.stream, &encode_sequence(&["quit"]))?;
        // The master may hang up without acknowledging
        match read_frame(&mut self.stream) {
            Ok(_) | Err(FrameError::Closed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Connects to the master over TCP
pub struct TcpConnector {
    cert_tool: Arc<dyn CertTool>,
    master_cert: PathBuf,
}

impl TcpConnector {
    pub fn new(cert_tool: Arc<dyn CertTool>, master_cert: PathBuf) -> Self {
        Self {
            cert_tool,
            master_cert,
        }
    }
}

struct TcpSession(MasterClient<TcpStream>);

impl Drop for TcpSession {
    fn drop(&mut self) {
        let _ = self.0.stream.shutdown(Shutdown::Both);
    }
}

impl MasterConnector for TcpConnector {
    fn connect(&self, addr: SocketAddrV4) -> Result<Box<dyn MasterApi>, MasterError> {
        let client =
            MasterClient::connect(addr, Arc::clone(&self.cert_tool), self.master_cert.clone())?;
        Ok(Box::new(TcpSession(client)))
    }
}

impl MasterApi for TcpSession {
    fn version(&mut self) -> Result<String, MasterError> {
        self.0.version()
    }
    fn get_certificate(&mut self) -> Result<Vec<u8>, MasterError> {
        self.0.get_certificate()
    }
    fn sign_certificate(&mut self, csr: &[u8]) -> Result<Vec<u8>, MasterError> {
        self.0.sign_certificate(csr)
    }
    fn get_vpn_servers(&mut self) -> Result<Vec<ServerDescriptor>, MasterError> {
        self.0.get_vpn_servers()
    }
    fn subscription_time_left(&mut self, account_id: u64) -> Result<i64, MasterError> {
        self.0.subscription_time_left(account_id)
    }
    fn connection_count(&mut self, account_id: u64) -> Result<(u32, u32), MasterError> {
        self.0.connection_count(account_id)
    }
    fn dns_server(&mut self) -> Result<String, MasterError> {
        self.0.dns_server()
    }
    fn exit_address(&mut self) -> Result<String, MasterError> {
        self.0.exit_address()
    }
    fn latest_version(&mut self) -> Result<String, MasterError> {
        self.0.latest_version()
    }
    fn ports(&mut self, account_id: u64) -> Result<Vec<u16>, MasterError> {
        self.0.ports(account_id)
    }
    fn new_port(&mut self, account_id: u64) -> Result<Vec<u16>, MasterError> {
        self.0.new_port(account_id)
    }
    fn remove_port(&mut self, account_id: u64, port: u16) -> Result<Vec<u16>, MasterError> {
        self.0.remove_port(account_id, port)
    }
    fn max_ports(&mut self) -> Result<u32, MasterError> {
        self.0.max_ports()
    }
    fn quit(&mut self) -> Result<(), MasterError> {
        self.0.quit()
    }
}
