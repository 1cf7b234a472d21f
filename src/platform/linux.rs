//! Linux-specific implementation
//!
//! Routes go through `ip`, the packet filter is a dedicated iptables chain
//! hooked into INPUT, FORWARD and OUTPUT, and DNS is changed by swapping
//! `/etc/resolv.conf`.

use super::{
    DnsConfig, Firewall, InterfaceEnumerator, PlatformError, RouteManager, RouteTarget,
};
use std::fs;
use std::io;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

const CHAIN: &str = "MTUNNEL";
const HOOKED_CHAINS: [&str; 3] = ["INPUT", "FORWARD", "OUTPUT"];
const BLOCK_TRAFFIC_RULE: [&str; 3] = [CHAIN, "-j", "REJECT"];
const BLOCK_INCOMING_UDP_RULE: [&str; 5] = [CHAIN, "-p", "udp", "-j", "DROP"];

const IPV6_IF_PATH: &str = "/proc/net/if_inet6";
const IPV6_DISABLE_PATH: &str = "/proc/sys/net/ipv6/conf/all/disable_ipv6";
const IPV6_BLOCK_NETS: [&str; 2] = ["::/1", "8000::/1"];

const RESOLV_CONF: &str = "/etc/resolv.conf";
const SAVED_RESOLV_CONF: &str = "/etc/resolv.conf.pre-mtunnel";
const SYS_NET: &str = "/sys/class/net";

fn run(program: &str, args: &[&str]) -> io::Result<Output> {
    debug!("Running {} {}", program, args.join(" "));
    Command::new(program).args(args).output()
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

fn prefix_len(mask: Ipv4Addr) -> u32 {
    u32::from(mask).count_ones()
}

fn cidr(net: Ipv4Addr, mask: Ipv4Addr) -> String {
    format!("{}/{}", net, prefix_len(mask))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Gateway of the first default route in `ip -4 route show default` output
pub fn parse_default_gateway(table: &str) -> Option<Ipv4Addr> {
    table.lines().find_map(|line| {
        let mut columns = line.split_whitespace();
        if columns.next() != Some("default") {
            return None;
        }
        let mut columns = columns.skip_while(|c| *c != "via");
        columns.next()?;
        columns.next()?.parse().ok()
    })
}

/// Build the `ip route` arguments for a route operation
fn route_args(
    verb: &str,
    net: Ipv4Addr,
    mask: Ipv4Addr,
    target: RouteTarget,
    gateway: Option<Ipv4Addr>,
) -> Option<Vec<String>> {
    let mut args = vec!["route".to_string(), verb.to_string()];
    match target {
        RouteTarget::Reject => {
            args.push("prohibit".to_string());
            args.push(cidr(net, mask));
        }
        RouteTarget::Default => {
            args.push(cidr(net, mask));
            args.push("via".to_string());
            args.push(gateway?.to_string());
        }
        RouteTarget::Gateway(gw) => {
            args.push(cidr(net, mask));
            args.push("via".to_string());
            args.push(gw.to_string());
        }
    }
    Some(args)
}

/// Routing table changes through iproute2
pub struct LinuxRouteManager {
    gateway_file: PathBuf,
    gateway: Mutex<Option<Ipv4Addr>>,
    interfaces: Arc<dyn InterfaceEnumerator>,
}

impl LinuxRouteManager {
    pub fn new(gateway_file: PathBuf, interfaces: Arc<dyn InterfaceEnumerator>) -> Self {
        Self {
            gateway_file,
            gateway: Mutex::new(None),
            interfaces,
        }
    }

    /// Cached gateway, looked up on first use
    fn gateway(&self) -> Result<Option<Ipv4Addr>, PlatformError> {
        let mut cached = lock(&self.gateway);
        if cached.is_none() {
            *cached = find_default_gateway()?;
        }
        if cached.is_none() {
            warn!("Default gateway not found");
        }
        Ok(*cached)
    }

    fn loopback(&self) -> String {
        self.interfaces
            .loopback_interfaces()
            .ok()
            .and_then(|names| names.into_iter().next())
            .unwrap_or_else(|| "lo".to_string())
    }
}

fn find_default_gateway() -> Result<Option<Ipv4Addr>, PlatformError> {
    let output = run("ip", &["-4", "route", "show", "default"])?;
    if !output.status.success() {
        return Err(PlatformError::AddRouteError(stderr_of(&output)));
    }
    Ok(parse_default_gateway(&String::from_utf8_lossy(&output.stdout)))
}

fn ip_route(args: &[String], add: bool) -> Result<(), PlatformError> {
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    let output = run("ip", &args).map_err(|e| {
        if add {
            PlatformError::AddRouteError(e.to_string())
        } else {
            PlatformError::DeleteRouteError(e.to_string())
        }
    })?;

    if output.status.success() {
        return Ok(());
    }
    let stderr = stderr_of(&output);
    if add && stderr.contains("File exists") {
        return Ok(());
    }
    if !add && (stderr.contains("No such process") || stderr.contains("Cannot find")) {
        return Ok(());
    }
    if add {
        Err(PlatformError::AddRouteError(stderr))
    } else {
        Err(PlatformError::DeleteRouteError(stderr))
    }
}

impl RouteManager for LinuxRouteManager {
    fn route_add(
        &self,
        net: Ipv4Addr,
        mask: Ipv4Addr,
        target: RouteTarget,
    ) -> Result<(), PlatformError> {
        let gateway = match target {
            RouteTarget::Default => self.gateway()?,
            _ => None,
        };
        match route_args("add", net, mask, target, gateway) {
            Some(args) => ip_route(&args, true),
            None => Err(PlatformError::AddRouteError("default gateway not found".to_string())),
        }
    }

    fn route_del(
        &self,
        net: Ipv4Addr,
        mask: Ipv4Addr,
        target: RouteTarget,
    ) -> Result<(), PlatformError> {
        let gateway = match target {
            RouteTarget::Default => self.gateway()?,
            _ => None,
        };
        match route_args("del", net, mask, target, gateway) {
            Some(args) => ip_route(&args, false),
            // Nothing was routed through an unknown gateway
            None => Ok(()),
        }
    }

    fn default_gateway(&self) -> Result<Option<Ipv4Addr>, PlatformError> {
        self.gateway()
    }

    fn delete_default_gateway(&self) -> Result<(), PlatformError> {
        let Some(gw) = self.gateway()? else {
            return Ok(());
        };
        fs::write(&self.gateway_file, gw.to_string())?;
        ip_route(&["route".to_string(), "del".to_string(), "default".to_string()], false)
    }

    fn restore_default_gateway(&self) -> Result<(), PlatformError> {
        let Some(gw) = self.gateway()? else {
            return Ok(());
        };
        info!("Restoring default gateway {}", gw);
        let args: Vec<String> = vec![
            "route".to_string(),
            "add".to_string(),
            "default".to_string(),
            "via".to_string(),
            gw.to_string(),
        ];
        ip_route(&args, true)
    }

    fn restore_saved_default_gateway(&self) -> Result<(), PlatformError> {
        let content = match fs::read_to_string(&self.gateway_file) {
            Ok(content) => content,
            Err(e) => {
                warn!("No saved default gateway: {}", e);
                return Ok(());
            }
        };
        let gw: Ipv4Addr = content
            .trim()
            .parse()
            .map_err(|_| {
                PlatformError::AddRouteError(format!("invalid saved gateway {:?}", content.trim()))
            })?;
        info!("Restoring saved default gateway {}", gw);
        *lock(&self.gateway) = Some(gw);
        self.restore_default_gateway()
    }

    fn block_ipv6(&self) -> Result<(), PlatformError> {
        let dev = self.loopback();
        for net in IPV6_BLOCK_NETS {
            let args: Vec<String> = ["-6", "route", "add", net, "dev", dev.as_str()]
                .iter()
                .map(|s| s.to_string())
                .collect();
            ip_route(&args, true)?;
        }
        Ok(())
    }

    fn unblock_ipv6(&self) -> Result<(), PlatformError> {
        let dev = self.loopback();
        for net in IPV6_BLOCK_NETS {
            let args: Vec<String> = ["-6", "route", "del", net, "dev", dev.as_str()]
                .iter()
                .map(|s| s.to_string())
                .collect();
            ip_route(&args, false)?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct FirewallState {
    allowed_ip: Option<Ipv4Addr>,
    block_traffic: bool,
    block_ipv6: bool,
}

/// iptables based packet filter
pub struct LinuxFirewall {
    iptables: Vec<&'static str>,
    ip6tables: Vec<&'static str>,
    has_ipv6: bool,
    state: Mutex<FirewallState>,
}

impl LinuxFirewall {
    pub fn new() -> Result<Self, PlatformError> {
        let has_ipv6 = kernel_has_ipv6(Path::new(IPV6_IF_PATH), Path::new(IPV6_DISABLE_PATH));
        if !has_ipv6 {
            info!("Found no IPv6 in kernel, not going to block");
        }

        run("iptables", &["-L", "-n"])
            .map_err(|e| PlatformError::FirewallError(format!("iptables unavailable: {}", e)))?;

        let mut iptables = vec!["iptables"];
        let mut ip6tables = vec!["ip6tables"];
        if supports_wait_flag() {
            iptables.push("-w");
            ip6tables.push("-w");
        }

        let firewall = Self {
            iptables,
            ip6tables,
            has_ipv6,
            state: Mutex::new(FirewallState::default()),
        };
        firewall.setup()?;
        Ok(firewall)
    }

    fn commands(&self) -> Vec<&[&'static str]> {
        let mut cmds: Vec<&[&'static str]> = vec![self.iptables.as_slice()];
        if self.has_ipv6 {
            cmds.push(self.ip6tables.as_slice());
        }
        cmds
    }

    fn exec(cmd: &[&str], args: &[&str]) -> Result<bool, PlatformError> {
        let mut full: Vec<&str> = cmd[1..].to_vec();
        full.extend_from_slice(args);
        let output = run(cmd[0], &full).map_err(|e| PlatformError::FirewallError(e.to_string()))?;
        Ok(output.status.success())
    }

    fn exec_ok(cmd: &[&str], args: &[&str]) -> Result<(), PlatformError> {
        let mut full: Vec<&str> = cmd[1..].to_vec();
        full.extend_from_slice(args);
        let output = run(cmd[0], &full).map_err(|e| PlatformError::FirewallError(e.to_string()))?;
        if !output.status.success() {
            return Err(PlatformError::FirewallError(format!(
                "{} {}: {}",
                cmd[0],
                full.join(" "),
                stderr_of(&output)
            )));
        }
        Ok(())
    }

    fn exec_until_fail(cmd: &[&str], args: &[&str]) -> Result<(), PlatformError> {
        while Self::exec(cmd, args)? {}
        Ok(())
    }

    fn run_both(&self, args: &[&str], skip_ipv6: bool) -> Result<(), PlatformError> {
        Self::exec_ok(&self.iptables, args)?;
        if !skip_ipv6 && self.has_ipv6 {
            Self::exec_ok(&self.ip6tables, args)?;
        }
        Ok(())
    }

    fn run_both_until_fail(&self, args: &[&str], skip_ipv6: bool) -> Result<(), PlatformError> {
        Self::exec_until_fail(&self.iptables, args)?;
        if !skip_ipv6 && self.has_ipv6 {
            Self::exec_until_fail(&self.ip6tables, args)?;
        }
        Ok(())
    }
}

fn with_verb<'a>(verb: &'a str, rule: &[&'a str]) -> Vec<&'a str> {
    let mut args = vec![verb];
    args.extend_from_slice(rule);
    args
}

/// Rule letting one address through, in one direction
fn allowed_ip_rule(verb: &str, direction: &str, ip: Ipv4Addr) -> Vec<String> {
    vec![
        verb.to_string(),
        CHAIN.to_string(),
        direction.to_string(),
        ip.to_string(),
        "-j".to_string(),
        "ACCEPT".to_string(),
    ]
}

impl Firewall for LinuxFirewall {
    fn setup(&self) -> Result<(), PlatformError> {
        for cmd in self.commands() {
            if !Self::exec(cmd, &["-F", CHAIN])? {
                Self::exec_ok(cmd, &["-N", CHAIN])?;
            }
            for hooked in HOOKED_CHAINS {
                Self::exec_until_fail(cmd, &["-D", hooked, "-j", CHAIN])?;
                Self::exec_ok(cmd, &["-I", hooked, "-j", CHAIN])?;
            }
            for rule in [
                ["-i", "lo+", "-j", "ACCEPT"],
                ["-o", "lo+", "-j", "ACCEPT"],
                ["-i", "tun+", "-j", "ACCEPT"],
                ["-o", "tun+", "-j", "ACCEPT"],
            ] {
                let mut args = vec!["-A", CHAIN];
                args.extend_from_slice(&rule);
                Self::exec_ok(cmd, &args)?;
            }
        }
        *lock(&self.state) = FirewallState::default();
        debug!("Firewall chain {} ready", CHAIN);
        Ok(())
    }

    fn set_allowed_ip(&self, ip: Option<Ipv4Addr>) -> Result<(), PlatformError> {
        let old = {
            let mut state = lock(&self.state);
            let old = state.allowed_ip;
            state.allowed_ip = ip;
            old
        };
        if old == ip {
            return Ok(());
        }

        for direction in ["-s", "-d"] {
            if let Some(old) = old {
                let args = allowed_ip_rule("-D", direction, old);
                let args: Vec<&str> = args.iter().map(String::as_str).collect();
                Self::exec_until_fail(&self.iptables, &args)?;
            }
            if let Some(ip) = ip {
                let args = allowed_ip_rule("-I", direction, ip);
                let args: Vec<&str> = args.iter().map(String::as_str).collect();
                Self::exec_ok(&self.iptables, &args)?;
            }
        }
        Ok(())
    }

    fn block_local_network(&self) -> Result<(), PlatformError> {
        lock(&self.state).block_traffic = true;
        self.run_both(&with_verb("-A", &BLOCK_TRAFFIC_RULE), false)
    }

    fn unblock_local_network(&self) -> Result<(), PlatformError> {
        let keep_ipv6_block = {
            let mut state = lock(&self.state);
            state.block_traffic = false;
            state.block_ipv6
        };
        self.run_both_until_fail(&with_verb("-D", &BLOCK_TRAFFIC_RULE), keep_ipv6_block)
    }

    fn block_incoming_udp(&self) -> Result<(), PlatformError> {
        self.run_both(&with_verb("-A", &BLOCK_INCOMING_UDP_RULE), false)
    }

    fn unblock_incoming_udp(&self) -> Result<(), PlatformError> {
        self.run_both_until_fail(&with_verb("-D", &BLOCK_INCOMING_UDP_RULE), false)
    }

    fn block_ipv6(&self) -> Result<(), PlatformError> {
        lock(&self.state).block_ipv6 = true;
        if self.has_ipv6 {
            Self::exec_ok(&self.ip6tables, &with_verb("-A", &BLOCK_TRAFFIC_RULE))?;
        }
        Ok(())
    }

    fn unblock_ipv6(&self) -> Result<(), PlatformError> {
        let blocking_traffic = {
            let mut state = lock(&self.state);
            state.block_ipv6 = false;
            state.block_traffic
        };
        if self.has_ipv6 && !blocking_traffic {
            Self::exec_until_fail(&self.ip6tables, &with_verb("-D", &BLOCK_TRAFFIC_RULE))?;
        }
        Ok(())
    }
}

fn kernel_has_ipv6(if_inet6: &Path, disable_ipv6: &Path) -> bool {
    if let Ok(content) = fs::read_to_string(if_inet6) {
        if !content.trim().is_empty() {
            return true;
        }
    }
    matches!(fs::read_to_string(disable_ipv6), Ok(content) if content.contains('0'))
}

// -w exists from iptables 1.4.20
fn supports_wait_flag() -> bool {
    run("iptables", &["-w", "-L", "-n"])
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// DNS through `/etc/resolv.conf`
///
/// The original file (or symlink) is moved aside the first time servers
/// are set and moved back on restore.
pub struct LinuxDnsConfig {
    resolv_conf: PathBuf,
    saved: PathBuf,
}

impl LinuxDnsConfig {
    pub fn new() -> Self {
        Self::with_paths(PathBuf::from(RESOLV_CONF), PathBuf::from(SAVED_RESOLV_CONF))
    }

    pub fn with_paths(resolv_conf: PathBuf, saved: PathBuf) -> Self {
        Self { resolv_conf, saved }
    }

    fn is_saved(&self) -> bool {
        self.saved.symlink_metadata().is_ok()
    }
}

impl Default for LinuxDnsConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl DnsConfig for LinuxDnsConfig {
    fn save(&self) -> Result<(), PlatformError> {
        if self.is_saved() || self.resolv_conf.symlink_metadata().is_err() {
            return Ok(());
        }
        debug!("Saving {}", self.resolv_conf.display());
        fs::rename(&self.resolv_conf, &self.saved)
            .and_then(|()| fs::copy(&self.saved, &self.resolv_conf).map(|_| ()))
            .map_err(|e| PlatformError::DnsError(e.to_string()))
    }

    fn restore(&self) -> Result<(), PlatformError> {
        if self.is_saved() {
            debug!("Restoring DNS settings");
            fs::rename(&self.saved, &self.resolv_conf)
                .map_err(|e| PlatformError::DnsError(e.to_string()))?;
        }
        Ok(())
    }

    fn set(&self, servers: &[String]) -> Result<(), PlatformError> {
        debug!("Setting DNS servers to {:?}", servers);
        if !self.is_saved() {
            fs::rename(&self.resolv_conf, &self.saved)
                .map_err(|e| PlatformError::DnsError(e.to_string()))?;
        } else if self.resolv_conf.symlink_metadata().is_ok() {
            // Drop whatever is there; it is ours
            fs::remove_file(&self.resolv_conf).map_err(|e| PlatformError::DnsError(e.to_string()))?;
        }
        let content: String = servers.iter().map(|s| format!("nameserver {}\n", s)).collect();
        fs::write(&self.resolv_conf, content).map_err(|e| PlatformError::DnsError(e.to_string()))
    }
}

/// Interfaces as listed in sysfs
pub struct LinuxInterfaces {
    root: PathBuf,
}

impl LinuxInterfaces {
    pub fn new() -> Self {
        Self::with_root(PathBuf::from(SYS_NET))
    }

    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }
}

impl Default for LinuxInterfaces {
    fn default() -> Self {
        Self::new()
    }
}

impl InterfaceEnumerator for LinuxInterfaces {
    fn interfaces(&self, prefix: &str) -> Result<Vec<String>, PlatformError> {
        let entries =
            fs::read_dir(&self.root).map_err(|e| PlatformError::InterfaceError(e.to_string()))?;
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.starts_with(prefix))
            .collect();
        names.sort();
        Ok(names)
    }
}
