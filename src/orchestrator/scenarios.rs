//! End-to-end runs of the control loop against in-memory capabilities

use super::*;
use crate::master::{CertError, CertTool, MasterApi, MasterConnector, MasterError};
use crate::platform::{
    DnsConfig, InterfaceEnumerator, PlatformError, RouteManager, RouteTarget, TargetOs,
};
use crate::privilege::{self, PrivilegeClient, memory_pipe};
use crate::server::Protocol;
use crate::state::{DnsFallback, ServerCache};
use crate::tunnel::{TunnelBackend, TunnelError};
use std::collections::{HashSet, VecDeque};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::net::SocketAddrV4;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tempfile::TempDir;

const HOME_GATEWAY: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);
const HOME_DNS: &str = "192.168.1.1";
const TUNNEL_DNS: &str = "10.9.0.1";
const INIT_LINE: &str = "Tue Oct 19 10:00:05 2026 Initialization Sequence Completed";

fn server_list() -> Vec<ServerDescriptor> {
    [
        "185.65.132.10 1194 udp se1.example.net se aes256",
        "185.65.132.11 443 tcp se2.example.net se aes256",
        "185.65.135.20 443 tcp de1.example.net de aes256",
    ]
    .iter()
    .map(|line| line.parse().unwrap())
    .collect()
}

fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[derive(Default)]
struct FakeFirewall {
    allowed: Mutex<Option<Ipv4Addr>>,
    udp_blocked: AtomicBool,
    ipv6_blocked: AtomicBool,
}

impl Firewall for FakeFirewall {
    fn setup(&self) -> Result<(), PlatformError> {
        Ok(())
    }
    fn set_allowed_ip(&self, ip: Option<Ipv4Addr>) -> Result<(), PlatformError> {
        *self.allowed.lock().unwrap() = ip;
        Ok(())
    }
    fn block_local_network(&self) -> Result<(), PlatformError> {
        Ok(())
    }
    fn unblock_local_network(&self) -> Result<(), PlatformError> {
        Ok(())
    }
    fn block_incoming_udp(&self) -> Result<(), PlatformError> {
        self.udp_blocked.store(true, Ordering::SeqCst);
        Ok(())
    }
    fn unblock_incoming_udp(&self) -> Result<(), PlatformError> {
        self.udp_blocked.store(false, Ordering::SeqCst);
        Ok(())
    }
    fn block_ipv6(&self) -> Result<(), PlatformError> {
        self.ipv6_blocked.store(true, Ordering::SeqCst);
        Ok(())
    }
    fn unblock_ipv6(&self) -> Result<(), PlatformError> {
        self.ipv6_blocked.store(false, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeRoutes {
    table: Mutex<HashSet<(Ipv4Addr, Ipv4Addr, RouteTarget)>>,
    gateway: Mutex<Option<Ipv4Addr>>,
    removed: Mutex<Option<Ipv4Addr>>,
}

impl FakeRoutes {
    fn new() -> Self {
        Self {
            table: Mutex::new(HashSet::new()),
            gateway: Mutex::new(Some(HOME_GATEWAY)),
            removed: Mutex::new(None),
        }
    }

    fn rejects(&self) -> usize {
        self.table
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, _, target)| *target == RouteTarget::Reject)
            .count()
    }

    fn gateway(&self) -> Option<Ipv4Addr> {
        *self.gateway.lock().unwrap()
    }
}

impl RouteManager for FakeRoutes {
    fn route_add(
        &self,
        net: Ipv4Addr,
        mask: Ipv4Addr,
        target: RouteTarget,
    ) -> Result<(), PlatformError> {
        self.table.lock().unwrap().insert((net, mask, target));
        Ok(())
    }
    fn route_del(
        &self,
        net: Ipv4Addr,
        mask: Ipv4Addr,
        target: RouteTarget,
    ) -> Result<(), PlatformError> {
        self.table.lock().unwrap().remove(&(net, mask, target));
        Ok(())
    }
    fn default_gateway(&self) -> Result<Option<Ipv4Addr>, PlatformError> {
        Ok(self.gateway())
    }
    fn delete_default_gateway(&self) -> Result<(), PlatformError> {
        if let Some(gw) = self.gateway.lock().unwrap().take() {
            *self.removed.lock().unwrap() = Some(gw);
        }
        Ok(())
    }
    fn restore_default_gateway(&self) -> Result<(), PlatformError> {
        let mut gateway = self.gateway.lock().unwrap();
        if gateway.is_none() {
            *gateway = self.removed.lock().unwrap().take();
        }
        Ok(())
    }
    fn restore_saved_default_gateway(&self) -> Result<(), PlatformError> {
        self.restore_default_gateway()
    }
    fn block_ipv6(&self) -> Result<(), PlatformError> {
        Ok(())
    }
    fn unblock_ipv6(&self) -> Result<(), PlatformError> {
        Ok(())
    }
}

struct FakeDns {
    current: Mutex<Vec<String>>,
    saved: Mutex<Option<Vec<String>>>,
}

impl FakeDns {
    fn new() -> Self {
        Self {
            current: Mutex::new(vec![HOME_DNS.to_string()]),
            saved: Mutex::new(None),
        }
    }

    fn current(&self) -> Vec<String> {
        self.current.lock().unwrap().clone()
    }
}

impl DnsConfig for FakeDns {
    fn save(&self) -> Result<(), PlatformError> {
        let mut saved = self.saved.lock().unwrap();
        if saved.is_none() {
            *saved = Some(self.current());
        }
        Ok(())
    }
    fn restore(&self) -> Result<(), PlatformError> {
        match self.saved.lock().unwrap().take() {
            Some(servers) => {
                *self.current.lock().unwrap() = servers;
                Ok(())
            }
            None => Err(PlatformError::DnsError("nothing saved".to_string())),
        }
    }
    fn set(&self, servers: &[String]) -> Result<(), PlatformError> {
        *self.current.lock().unwrap() = servers.to_vec();
        Ok(())
    }
}

struct FakeInterfaces;

impl InterfaceEnumerator for FakeInterfaces {
    fn interfaces(&self, prefix: &str) -> Result<Vec<String>, PlatformError> {
        Ok(vec![format!("{prefix}0")])
    }
}

/// What the tunnel writes to its log when started, and whether it stays up
struct Script {
    lines: Vec<&'static str>,
    survives: bool,
}

#[derive(Default)]
struct TunnelInner {
    alive: AtomicBool,
    obfsproxy: AtomicBool,
    scripts: Mutex<VecDeque<Script>>,
    starts: Mutex<Vec<Vec<String>>>,
    /// Starts that fail before the process is spawned
    failing_starts: AtomicUsize,
}

#[derive(Default)]
struct FakeTunnel {
    inner: Arc<TunnelInner>,
}

impl FakeTunnel {
    fn queue(&self, lines: Vec<&'static str>, survives: bool) {
        self.inner
            .scripts
            .lock()
            .unwrap()
            .push_back(Script { lines, survives });
    }

    fn starts(&self) -> Vec<Vec<String>> {
        self.inner.starts.lock().unwrap().clone()
    }

    fn die(&self) {
        self.inner.alive.store(false, Ordering::SeqCst);
    }
}

fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    let i = args.iter().position(|a| a == flag)?;
    args.get(i + 1).map(String::as_str)
}

impl TunnelBackend for FakeTunnel {
    fn version(&self) -> Result<(u32, u32), TunnelError> {
        Ok((2, 3))
    }

    fn start(&self, args: &[String]) -> Result<(), TunnelError> {
        self.inner.starts.lock().unwrap().push(args.to_vec());
        let failing = &self.inner.failing_starts;
        if failing.load(Ordering::SeqCst) > 0 {
            failing.fetch_sub(1, Ordering::SeqCst);
            return Err(TunnelError::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "permission denied",
            )));
        }
        let script = self.inner.scripts.lock().unwrap().pop_front().unwrap_or(Script {
            lines: vec![INIT_LINE],
            survives: true,
        });
        let log = value_after(args, "--log").expect("log path");
        let mut file = OpenOptions::new().append(true).open(log)?;
        for line in script.lines {
            writeln!(file, "{line}")?;
        }
        self.inner.alive.store(script.survives, Ordering::SeqCst);
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst)
    }

    fn kill_stale(&self) {
        self.die();
    }

    fn management(&self) -> Result<Box<dyn TunnelManagement>, TunnelError> {
        if !self.is_alive() {
            return Err(TunnelError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection refused",
            )));
        }
        Ok(Box::new(FakeManagement {
            inner: Arc::clone(&self.inner),
        }))
    }

    fn start_obfsproxy(&self) -> Result<u16, TunnelError> {
        if self.inner.obfsproxy.swap(true, Ordering::SeqCst) {
            return Err(TunnelError::AlreadyRunning("obfsproxy"));
        }
        Ok(10194)
    }

    fn stop_obfsproxy(&self) {
        self.inner.obfsproxy.store(false, Ordering::SeqCst);
    }
}

struct FakeManagement {
    inner: Arc<TunnelInner>,
}

impl TunnelManagement for FakeManagement {
    fn status(&mut self) -> Result<String, TunnelError> {
        if self.inner.alive.load(Ordering::SeqCst) {
            Ok("CONNECTED".to_string())
        } else {
            Err(TunnelError::Management("connection closed".to_string()))
        }
    }

    fn force_kill(&mut self) -> Result<bool, TunnelError> {
        self.inner.alive.store(false, Ordering::SeqCst);
        Ok(true)
    }

    fn close(&mut self) {}
}

#[derive(Clone)]
struct Account {
    reachable: bool,
    time_left: i64,
    connections: (u32, u32),
}

struct FakeMaster {
    account: Account,
    connects: AtomicUsize,
}

impl FakeMaster {
    fn new(account: Account) -> Self {
        Self {
            account,
            connects: AtomicUsize::new(0),
        }
    }
}

impl MasterConnector for FakeMaster {
    fn connect(&self, _addr: SocketAddrV4) -> Result<Box<dyn MasterApi>, MasterError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if !self.account.reachable {
            return Err(MasterError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "timed out",
            )));
        }
        Ok(Box::new(FakeMasterSession(self.account.clone())))
    }
}

struct FakeMasterSession(Account);

impl MasterApi for FakeMasterSession {
    fn version(&mut self) -> Result<String, MasterError> {
        Ok("1.1".to_string())
    }
    fn get_certificate(&mut self) -> Result<Vec<u8>, MasterError> {
        Ok(b"GOOD master".to_vec())
    }
    fn sign_certificate(&mut self, _csr: &[u8]) -> Result<Vec<u8>, MasterError> {
        Ok(b"GOOD client".to_vec())
    }
    fn get_vpn_servers(&mut self) -> Result<Vec<ServerDescriptor>, MasterError> {
        Ok(server_list())
    }
    fn subscription_time_left(&mut self, _account_id: u64) -> Result<i64, MasterError> {
        Ok(self.0.time_left)
    }
    fn connection_count(&mut self, _account_id: u64) -> Result<(u32, u32), MasterError> {
        Ok(self.0.connections)
    }
    fn dns_server(&mut self) -> Result<String, MasterError> {
        Ok(TUNNEL_DNS.to_string())
    }
    fn exit_address(&mut self) -> Result<String, MasterError> {
        Ok("185.65.132.10".to_string())
    }
    fn latest_version(&mut self) -> Result<String, MasterError> {
        Ok("1.0".to_string())
    }
    fn ports(&mut self, _account_id: u64) -> Result<Vec<u16>, MasterError> {
        Ok(Vec::new())
    }
    fn new_port(&mut self, _account_id: u64) -> Result<Vec<u16>, MasterError> {
        Ok(Vec::new())
    }
    fn remove_port(&mut self, _account_id: u64, _port: u16) -> Result<Vec<u16>, MasterError> {
        Ok(Vec::new())
    }
    fn max_ports(&mut self) -> Result<u32, MasterError> {
        Ok(0)
    }
    fn quit(&mut self) -> Result<(), MasterError> {
        Ok(())
    }
}

/// Accepts certificates that start with `GOOD`
struct FakeCerts;

impl CertTool for FakeCerts {
    fn verify_cert(&self, cert_pem: &[u8], _ca: &Path) -> Result<bool, CertError> {
        Ok(cert_pem.starts_with(b"GOOD"))
    }
    fn modulus_matches(&self, _cert: &Path, _key: &Path) -> Result<bool, CertError> {
        Ok(true)
    }
    fn generate_key(&self, key: &Path, csr: &Path, common_name: &str) -> Result<(), CertError> {
        fs::write(key, b"key")?;
        fs::write(csr, common_name)?;
        Ok(())
    }
    fn recover_signed(&self, signature: &[u8], _cert: &Path) -> Result<Option<Vec<u8>>, CertError> {
        Ok(Some(signature.to_vec()))
    }
}

struct InsideTunnel;

impl RouteProbe for InsideTunnel {
    fn probe(&self) -> io::Result<ProbeOutcome> {
        Ok(ProbeOutcome::Timeout)
    }
}

fn fast_timing() -> Timing {
    Timing {
        idle: Duration::from_millis(10),
        retry_backoff: Duration::from_millis(20),
        timeout_tick: Duration::from_millis(10),
        kill_wait: Duration::from_millis(50),
        kill_poll: Duration::from_millis(5),
    }
}

struct Fixture {
    _dir: TempDir,
    paths: Paths,
    firewall: Arc<FakeFirewall>,
    routes: Arc<FakeRoutes>,
    dns: Arc<FakeDns>,
    tunnel: Arc<FakeTunnel>,
    master: Arc<FakeMaster>,
    with_firewall: bool,
    events: Arc<Mutex<Vec<Event>>>,
}

impl Fixture {
    fn new(account: Account) -> Self {
        let dir = TempDir::new().unwrap();
        let paths = Paths::new(
            dir.path().join("conf"),
            dir.path().join("logs"),
            dir.path().join("install"),
        );
        paths.ensure_dirs().unwrap();
        fs::create_dir_all(paths.installed_ssl_dir()).unwrap();
        fs::write(paths.installed_ssl_dir().join("ca.crt"), b"GOOD ca").unwrap();
        fs::write(paths.installed_ssl_dir().join("master.crt"), b"GOOD master").unwrap();
        ServerCache::new(paths.backup_servers_file())
            .save(&server_list())
            .unwrap();

        Self {
            _dir: dir,
            paths,
            firewall: Arc::new(FakeFirewall::default()),
            routes: Arc::new(FakeRoutes::new()),
            dns: Arc::new(FakeDns::new()),
            tunnel: Arc::new(FakeTunnel::default()),
            master: Arc::new(FakeMaster::new(account)),
            with_firewall: true,
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn paying() -> Self {
        Self::new(Account {
            reachable: true,
            time_left: 3600,
            connections: (0, 3),
        })
    }

    fn start(&self, settings: Settings) -> Orchestrator {
        let firewall: Option<Arc<dyn Firewall>> = if self.with_firewall {
            let firewall: Arc<dyn Firewall> = self.firewall.clone();
            Some(firewall)
        } else {
            None
        };
        let services = Services {
            os: TargetOs::Linux,
            firewall,
            routes: self.routes.clone(),
            dns: self.dns.clone(),
            interfaces: Arc::new(FakeInterfaces),
            tunnel: self.tunnel.clone(),
            master: self.master.clone(),
            certs: Arc::new(FakeCerts),
            is_privileged: || true,
        };
        let orchestrator = Orchestrator::with_options(
            services,
            self.paths.clone(),
            Arc::new(SettingsStore::in_memory(settings)),
            OrchestratorOptions {
                timing: fast_timing(),
                probe: Arc::new(InsideTunnel),
            },
        );
        let events = Arc::clone(&self.events);
        orchestrator.subscribe(Arc::new(move |event: &Event| {
            events.lock().unwrap().push(event.clone());
        }));
        orchestrator
    }

    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn errors(&self) -> Vec<ErrorReport> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Error(report) => Some(report),
                _ => None,
            })
            .collect()
    }

    fn count_state(&self, state: ConnectionState) -> usize {
        self.events()
            .iter()
            .filter(|e| **e == Event::Connection(state))
            .count()
    }
}

fn account_settings() -> Settings {
    Settings {
        account_id: Some(1234567),
        ..Settings::default()
    }
}

#[test]
fn test_connect_locks_traffic_into_tunnel() {
    let fx = Fixture::paying();
    let orchestrator = fx.start(account_settings());
    orchestrator.connect();
    assert!(wait_until(|| orchestrator.connection_state() == ConnectionState::Connected));

    let server = orchestrator.server_info().unwrap();
    assert_eq!(server.location, "se");
    assert_eq!(server.protocol, Protocol::Udp);
    assert_eq!(server.address, Ipv4Addr::new(185, 65, 132, 10));

    let starts = fx.tunnel.starts();
    assert_eq!(starts.len(), 1);
    assert_eq!(value_after(&starts[0], "--remote"), Some("185.65.132.10"));
    assert_eq!(value_after(&starts[0], "--proto"), Some("udp"));
    assert!(!starts[0].iter().any(|a| a == "--socks-proxy"));

    assert_eq!(*fx.firewall.allowed.lock().unwrap(), Some(server.address));
    assert!(fx.firewall.udp_blocked.load(Ordering::SeqCst));
    assert!(fx.firewall.ipv6_blocked.load(Ordering::SeqCst));
    assert_eq!(fx.dns.current(), vec![TUNNEL_DNS.to_string()]);
    assert_eq!(
        DnsFallback::new(fx.paths.dns_fallback_file()).load().unwrap(),
        Some(TUNNEL_DNS.to_string())
    );
    assert_eq!(fx.routes.rejects(), 0);
    assert_eq!(fx.routes.gateway(), None);
    assert!(fx.paths.ssl_dir().join("1234567.crt").exists());

    let left = orchestrator.time_left().unwrap();
    assert!(left > 3500 && left <= 3600);

    let connecting = fx
        .events()
        .iter()
        .position(|e| *e == Event::Connection(ConnectionState::Connecting));
    let connected = fx
        .events()
        .iter()
        .position(|e| *e == Event::Connection(ConnectionState::Connected));
    assert!(connecting.unwrap() < connected.unwrap());
    assert!(fx.errors().is_empty());

    orchestrator.disconnect();
    assert!(wait_until(|| orchestrator.connection_state() == ConnectionState::Disconnected));
    assert!(orchestrator.server_info().is_none());
    assert_eq!(*fx.firewall.allowed.lock().unwrap(), None);
    assert!(!fx.firewall.udp_blocked.load(Ordering::SeqCst));
    assert_eq!(fx.dns.current(), vec![HOME_DNS.to_string()]);
    assert_eq!(fx.routes.gateway(), Some(HOME_GATEWAY));
    assert!(!fx.tunnel.is_alive());

    assert!(orchestrator.destroy());
    assert_eq!(orchestrator.connection_state(), ConnectionState::Off);
}

#[test]
fn test_expired_subscription_is_unrecoverable() {
    let fx = Fixture::new(Account {
        reachable: true,
        time_left: 0,
        connections: (0, 3),
    });
    let orchestrator = fx.start(account_settings());
    orchestrator.connect();
    assert!(wait_until(|| orchestrator.connection_state() == ConnectionState::Unrecoverable));

    assert!(fx.tunnel.starts().is_empty());
    assert_eq!(
        fx.errors(),
        vec![ErrorReport {
            severity: Severity::Unrecoverable,
            message: "Your subscription has expired.".to_string(),
        }]
    );
    assert_eq!(orchestrator.time_left(), Some(0));
    assert_eq!(fx.routes.rejects(), 0);
}

#[test]
fn test_repeated_unrecoverable_error_is_reported_once() {
    let fx = Fixture::paying();
    let orchestrator = fx.start(Settings::default());
    orchestrator.connect();
    assert!(wait_until(|| fx.count_state(ConnectionState::Unrecoverable) == 1));

    // Retrying leaves Unrecoverable, fails the same way
    orchestrator.connect();
    assert!(wait_until(|| fx.count_state(ConnectionState::Unrecoverable) == 2));

    let errors = fx.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].message, "No account number configured.");
    assert_eq!(fx.master.connects.load(Ordering::SeqCst), 0);
}

#[test]
fn test_missing_firewall_is_unrecoverable() {
    let mut fx = Fixture::paying();
    fx.with_firewall = false;
    let orchestrator = fx.start(account_settings());
    orchestrator.connect();
    assert!(wait_until(|| orchestrator.connection_state() == ConnectionState::Unrecoverable));
    assert_eq!(
        fx.errors()[0].message,
        "Cannot block incoming UDP without a firewall."
    );
    assert!(fx.tunnel.starts().is_empty());
}

#[test]
fn test_unreachable_master_without_credentials() {
    let fx = Fixture::new(Account {
        reachable: false,
        time_left: 3600,
        connections: (0, 3),
    });
    let orchestrator = fx.start(account_settings());
    orchestrator.connect();
    assert!(wait_until(|| !fx.errors().is_empty()));

    let report = fx.errors()[0].clone();
    assert_eq!(report.severity, Severity::Recoverable);
    assert_eq!(report.message, "Unable to fetch account credentials.");
    assert!(fx.tunnel.starts().is_empty());
    // Matching servers, the master itself and other servers were all tried
    assert!(fx.master.connects.load(Ordering::SeqCst) >= 3);
    assert_ne!(orchestrator.connection_state(), ConnectionState::Unrecoverable);

    // Keeps retrying
    assert!(wait_until(|| fx.errors().len() >= 2));
    orchestrator.shut_down();
    assert!(orchestrator.destroy());
    assert_eq!(fx.routes.rejects(), 0);
    assert_eq!(fx.routes.gateway(), Some(HOME_GATEWAY));
}

#[test]
fn test_unreachable_master_with_credentials_uses_cache() {
    let fx = Fixture::new(Account {
        reachable: false,
        time_left: 3600,
        connections: (0, 3),
    });
    let ssl = fx.paths.ssl_dir();
    fs::write(ssl.join("1234567.crt"), b"GOOD client").unwrap();
    fs::write(ssl.join("1234567.key"), b"key").unwrap();

    let orchestrator = fx.start(account_settings());
    orchestrator.connect();
    assert!(wait_until(|| orchestrator.connection_state() == ConnectionState::Connected));
    assert_eq!(
        orchestrator.server_info().map(|s| s.address),
        Some(Ipv4Addr::new(185, 65, 132, 10))
    );
    // No master and no fallback: the default resolver inside the tunnel
    assert_eq!(fx.dns.current(), vec![connect::DEFAULT_TUNNEL_DNS.to_string()]);
    assert_eq!(orchestrator.time_left(), None);
}

#[test]
fn test_too_many_connections_is_retried() {
    let fx = Fixture::new(Account {
        reachable: true,
        time_left: 3600,
        connections: (3, 3),
    });
    let orchestrator = fx.start(account_settings());
    orchestrator.connect();
    assert!(wait_until(|| !fx.errors().is_empty()));

    let report = fx.errors()[0].clone();
    assert_eq!(report.severity, Severity::Recoverable);
    assert_eq!(
        report.message,
        "Too many simultaneous connections: this would be number 4."
    );
    assert!(fx.tunnel.starts().is_empty());
}

#[test]
fn test_dpi_switches_to_obfuscation() {
    let fx = Fixture::paying();
    fx.tunnel.queue(
        vec![
            "Tue Oct 19 10:00:01 2026 UDPv4 link remote: [AF_INET]185.65.132.10:1194",
            "Tue Oct 19 10:00:02 2026 Connection reset, restarting [0]",
        ],
        false,
    );
    let orchestrator = fx.start(account_settings());
    orchestrator.connect();
    assert!(wait_until(|| orchestrator.connection_state() == ConnectionState::Connected));

    let starts = fx.tunnel.starts();
    assert_eq!(starts.len(), 2);
    assert_eq!(value_after(&starts[0], "--proto"), Some("udp"));
    assert_eq!(value_after(&starts[1], "--proto"), Some("tcp"));
    assert_eq!(value_after(&starts[1], "--remote"), Some("185.65.132.11"));
    assert_eq!(value_after(&starts[1], "--socks-proxy"), Some("127.0.0.1"));
    assert!(fx.tunnel.inner.obfsproxy.load(Ordering::SeqCst));

    let server = orchestrator.server_info().unwrap();
    assert_eq!(server.protocol, Protocol::Obfs2);
    assert_eq!(server.location, "se");
    assert_eq!(fx.count_state(ConnectionState::Disconnected), 1);

    orchestrator.disconnect();
    assert!(wait_until(|| orchestrator.connection_state() == ConnectionState::Disconnected));
    assert!(!fx.tunnel.inner.obfsproxy.load(Ordering::SeqCst));
}

#[test]
fn test_tunnel_exit_before_init_narrows_to_tcp() {
    let fx = Fixture::paying();
    fx.tunnel.queue(vec!["Tue Oct 19 10:00:01 2026 Exiting due to fatal error"], false);
    let settings = Settings {
        obfsproxy: crate::config::ObfsproxyMode::No,
        ..account_settings()
    };
    let orchestrator = fx.start(settings);
    orchestrator.connect();
    assert!(wait_until(|| orchestrator.connection_state() == ConnectionState::Connected));

    let starts = fx.tunnel.starts();
    assert_eq!(starts.len(), 2);
    assert_eq!(value_after(&starts[0], "--proto"), Some("udp"));
    assert_eq!(value_after(&starts[1], "--proto"), Some("tcp"));
    assert!(!starts[1].iter().any(|a| a == "--socks-proxy"));
}

#[test]
fn test_failed_tunnel_start_stops_obfsproxy() {
    let fx = Fixture::paying();
    fx.tunnel.inner.failing_starts.store(1, Ordering::SeqCst);
    let settings = Settings {
        obfsproxy: crate::config::ObfsproxyMode::Yes,
        ..account_settings()
    };
    let orchestrator = fx.start(settings);
    orchestrator.connect();
    assert!(wait_until(|| orchestrator.connection_state() == ConnectionState::Connected));

    let starts = fx.tunnel.starts();
    assert_eq!(starts.len(), 2);
    assert_eq!(value_after(&starts[1], "--socks-proxy"), Some("127.0.0.1"));
    assert!(fx.tunnel.inner.obfsproxy.load(Ordering::SeqCst));

    let errors = fx.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].severity, Severity::Recoverable);
    assert_eq!(
        orchestrator.server_info().map(|s| s.protocol),
        Some(Protocol::Obfs2)
    );
}

#[test]
fn test_connect_timeout_retries() {
    let fx = Fixture::paying();
    // Stays up without ever finishing initialization
    fx.tunnel.queue(vec![], true);
    let settings = Settings {
        timeout: 3,
        ..account_settings()
    };
    let orchestrator = fx.start(settings);
    orchestrator.connect();
    assert!(wait_until(|| orchestrator.connection_state() == ConnectionState::Connected));

    assert_eq!(fx.tunnel.starts().len(), 2);
    assert_eq!(fx.count_state(ConnectionState::Disconnected), 1);
    let connecting = fx.count_state(ConnectionState::Connecting);
    assert!(connecting >= 2, "connecting entered {connecting} times");
    assert!(fx.errors().is_empty());
}

#[test]
fn test_disconnect_during_attempt_restores_network() {
    let fx = Fixture::paying();
    fx.tunnel.queue(vec![], true);
    let settings = Settings {
        timeout: 100_000,
        ..account_settings()
    };
    let orchestrator = fx.start(settings);
    orchestrator.connect();
    assert!(wait_until(|| fx.tunnel.starts().len() == 1));
    assert!(fx.tunnel.is_alive());

    orchestrator.disconnect();
    assert!(wait_until(|| orchestrator.connection_state() == ConnectionState::Disconnected
        && !fx.tunnel.is_alive()
        && fx.routes.rejects() == 0
        && fx.routes.gateway() == Some(HOME_GATEWAY)
        && fx.firewall.allowed.lock().unwrap().is_none()
        && fx.dns.current() == vec![HOME_DNS.to_string()]));

    // Nothing is retried after the request
    thread::sleep(Duration::from_millis(100));
    assert_eq!(fx.tunnel.starts().len(), 1);
    assert_eq!(fx.count_state(ConnectionState::Connected), 0);
    assert_eq!(orchestrator.desired_connection_state(), DesiredState::Disconnected);
    assert!(orchestrator.destroy());
}

#[test]
fn test_dead_tunnel_is_reconnected() {
    let fx = Fixture::paying();
    let orchestrator = fx.start(account_settings());
    orchestrator.connect();
    assert!(wait_until(|| orchestrator.connection_state() == ConnectionState::Connected));

    fx.tunnel.die();
    assert!(wait_until(|| fx.tunnel.starts().len() == 2
        && orchestrator.connection_state() == ConnectionState::Connected));
    assert!(fx.count_state(ConnectionState::Disconnected) >= 1);
    assert_eq!(orchestrator.desired_connection_state(), DesiredState::Connected);
}

#[test]
fn test_shut_down_while_connected() {
    let fx = Fixture::paying();
    let orchestrator = fx.start(account_settings());
    orchestrator.connect();
    assert!(wait_until(|| orchestrator.connection_state() == ConnectionState::Connected));

    orchestrator.shut_down();
    assert!(wait_until(|| orchestrator.connection_state() == ConnectionState::Off));
    assert_eq!(orchestrator.desired_connection_state(), DesiredState::Off);
    assert_eq!(fx.routes.gateway(), Some(HOME_GATEWAY));
    assert_eq!(fx.dns.current(), vec![HOME_DNS.to_string()]);
    assert!(orchestrator.destroy());
}

#[test]
fn test_saved_gateway_restored_on_start() {
    let fx = Fixture::paying();
    fx.routes.delete_default_gateway().unwrap();
    assert_eq!(fx.routes.gateway(), None);

    let orchestrator = fx.start(account_settings());
    assert_eq!(fx.routes.gateway(), Some(HOME_GATEWAY));
    assert_eq!(orchestrator.connection_state(), ConnectionState::Disconnected);
}

#[test]
fn test_remote_control_over_memory_pipes() {
    let fx = Fixture::paying();
    let orchestrator: Arc<dyn Controller> = Arc::new(fx.start(account_settings()));

    let (request_writer, request_reader) = memory_pipe();
    let (reply_writer, reply_reader) = memory_pipe();
    let (update_writer, update_reader) = memory_pipe();

    let served = Arc::clone(&orchestrator);
    let worker = thread::spawn(move || {
        privilege::serve(served, request_reader, reply_writer, update_writer)
    });

    let client = PrivilegeClient::new(request_writer, reply_reader, update_reader);
    let updates = Arc::new(Mutex::new(Vec::new()));
    {
        let updates = Arc::clone(&updates);
        client.subscribe(move |event| updates.lock().unwrap().push(event.clone()));
    }

    client.connect().unwrap();
    assert_eq!(client.desired_connection_state().unwrap(), DesiredState::Connected);
    assert!(wait_until(|| client.connection_state().unwrap() == ConnectionState::Connected));
    assert!(wait_until(|| updates
        .lock()
        .unwrap()
        .contains(&Event::Connection(ConnectionState::Connected))));

    let server = client.server_info().unwrap().unwrap();
    assert_eq!(server.location, "se");
    assert!(client.time_left().unwrap().is_some());

    client.disconnect().unwrap();
    assert!(wait_until(|| client.connection_state().unwrap() == ConnectionState::Disconnected));

    assert!(client.destroy().unwrap());
    worker.join().unwrap().unwrap();
    assert_eq!(orchestrator.connection_state(), ConnectionState::Off);
}
