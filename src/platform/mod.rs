//! Platform-specific implementations
//!
//! The connection orchestrator only sees the capability traits defined
//! here. A concrete set is assembled once at startup by
//! [`system_services`]; tests assemble their own.

#[cfg(target_os = "linux")]
pub mod linux;

use crate::master::{CertTool, MasterConnector};
use crate::paths::Paths;
use crate::tunnel::TunnelBackend;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Failed to add route: {0}")]
    AddRouteError(String),
    #[error("Failed to delete route: {0}")]
    DeleteRouteError(String),
    #[error("Firewall error: {0}")]
    FirewallError(String),
    #[error("Failed to update DNS configuration: {0}")]
    DnsError(String),
    #[error("Failed to list interfaces: {0}")]
    InterfaceError(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unsupported platform")]
    UnsupportedPlatform,
}

/// Operating system the tunnel is configured for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetOs {
    Linux,
    Mac,
    Windows,
}

impl TargetOs {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            TargetOs::Windows
        } else if cfg!(target_os = "macos") {
            TargetOs::Mac
        } else {
            TargetOs::Linux
        }
    }

    /// Suffix of the shipped tunnel config template
    pub fn config_suffix(&self) -> &'static str {
        match self {
            TargetOs::Linux => "linux",
            TargetOs::Mac => "mac",
            TargetOs::Windows => "windows",
        }
    }
}

/// Where a route sends its traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteTarget {
    /// Through the system's default gateway
    Default,
    /// Nowhere: matching packets are refused
    Reject,
    Gateway(Ipv4Addr),
}

impl fmt::Display for RouteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteTarget::Default => f.write_str("default"),
            RouteTarget::Reject => f.write_str("reject"),
            RouteTarget::Gateway(gw) => gw.fmt(f),
        }
    }
}

/// Mask of a single-host route
pub const HOST_MASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 255);

/// Packet filter used to pin traffic to the tunnel
pub trait Firewall: Send + Sync {
    /// (Re)install the base rules; run at the start of every attempt
    fn setup(&self) -> Result<(), PlatformError>;
    /// Let traffic to and from exactly this address (or none) bypass
    fn set_allowed_ip(&self, ip: Option<Ipv4Addr>) -> Result<(), PlatformError>;
    fn block_local_network(&self) -> Result<(), PlatformError>;
    fn unblock_local_network(&self) -> Result<(), PlatformError>;
    fn block_incoming_udp(&self) -> Result<(), PlatformError>;
    fn unblock_incoming_udp(&self) -> Result<(), PlatformError>;
    fn block_ipv6(&self) -> Result<(), PlatformError>;
    fn unblock_ipv6(&self) -> Result<(), PlatformError>;
}

/// Platform-agnostic routing interface
pub trait RouteManager: Send + Sync {
    fn route_add(
        &self,
        net: Ipv4Addr,
        mask: Ipv4Addr,
        target: RouteTarget,
    ) -> Result<(), PlatformError>;
    /// Removing a route that does not exist is not an error
    fn route_del(
        &self,
        net: Ipv4Addr,
        mask: Ipv4Addr,
        target: RouteTarget,
    ) -> Result<(), PlatformError>;
    fn default_gateway(&self) -> Result<Option<Ipv4Addr>, PlatformError>;
    /// Remove the default route, remembering it (also on disk)
    fn delete_default_gateway(&self) -> Result<(), PlatformError>;
    /// Put back the default route removed earlier in this process
    fn restore_default_gateway(&self) -> Result<(), PlatformError>;
    /// Put back the default route saved on disk by an earlier process
    fn restore_saved_default_gateway(&self) -> Result<(), PlatformError>;
    /// Route all IPv6 into the void
    fn block_ipv6(&self) -> Result<(), PlatformError>;
    fn unblock_ipv6(&self) -> Result<(), PlatformError>;
}

/// System resolver configuration
pub trait DnsConfig: Send + Sync {
    /// Snapshot the current configuration; no-op if one is already saved
    fn save(&self) -> Result<(), PlatformError>;
    /// Put the saved configuration back and forget it
    fn restore(&self) -> Result<(), PlatformError>;
    fn set(&self, servers: &[String]) -> Result<(), PlatformError>;
}

/// Network interface discovery
pub trait InterfaceEnumerator: Send + Sync {
    fn interfaces(&self, prefix: &str) -> Result<Vec<String>, PlatformError>;

    fn loopback_interfaces(&self) -> Result<Vec<String>, PlatformError> {
        self.interfaces("lo")
    }

    fn tunnel_interfaces(&self) -> Result<Vec<String>, PlatformError> {
        self.interfaces("tun")
    }
}

/// Everything the orchestrator needs from the outside world
#[derive(Clone)]
pub struct Services {
    pub os: TargetOs,
    pub firewall: Option<Arc<dyn Firewall>>,
    pub routes: Arc<dyn RouteManager>,
    pub dns: Arc<dyn DnsConfig>,
    pub interfaces: Arc<dyn InterfaceEnumerator>,
    pub tunnel: Arc<dyn TunnelBackend>,
    pub master: Arc<dyn MasterConnector>,
    pub certs: Arc<dyn CertTool>,
    pub is_privileged: fn() -> bool,
}

/// Does the process hold the privileges needed to change routes?
pub fn is_privileged() -> bool {
    #[cfg(unix)]
    {
        nix::unistd::geteuid().is_root()
    }

    #[cfg(windows)]
    {
        // SAFETY: no arguments, only reads the process token
        unsafe { windows::Win32::UI::Shell::IsUserAnAdmin().as_bool() }
    }

    #[cfg(not(any(unix, windows)))]
    {
        false
    }
}

/// Assemble the implementations for the current platform
pub fn system_services(paths: &Paths) -> Result<Services, PlatformError> {
    #[cfg(target_os = "linux")]
    {
        use crate::master::{OpenSslTool, TcpConnector};
        use crate::tunnel::process::ProcessBackend;

        let interfaces: Arc<dyn InterfaceEnumerator> = Arc::new(linux::LinuxInterfaces::new());
        let certs: Arc<dyn CertTool> = {
            let config = paths.install_dir.join("openssl.cnf");
            let tool = OpenSslTool::new();
            Arc::new(if config.exists() { tool.with_config(config) } else { tool })
        };
        let master_cert = paths.ssl_dir().join("master.crt");

        let firewall: Option<Arc<dyn Firewall>> = match linux::LinuxFirewall::new() {
            Ok(fw) => Some(Arc::new(fw)),
            Err(e) => {
                tracing::error!("{}", e);
                None
            }
        };

        Ok(Services {
            os: TargetOs::Linux,
            firewall,
            routes: Arc::new(linux::LinuxRouteManager::new(
                paths.default_gateway_file(),
                Arc::clone(&interfaces),
            )),
            dns: Arc::new(linux::LinuxDnsConfig::new()),
            interfaces,
            tunnel: Arc::new(ProcessBackend::new(TargetOs::Linux)),
            master: Arc::new(TcpConnector::new(Arc::clone(&certs), master_cert)),
            certs,
            is_privileged,
        })
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = paths;
        Err(PlatformError::UnsupportedPlatform)
    }
}
