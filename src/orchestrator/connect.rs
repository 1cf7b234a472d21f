//! Connect and disconnect sequences
//!
//! Everything here runs on the control thread. A connection attempt takes
//! the system from "open" to "everything goes through the tunnel" in a
//! fixed order: firewall, DNS backup, reject routes, master, server choice,
//! firewall exception, tunnel. Teardown undoes it step by step and never
//! stops at the first failure.

use super::events::{ErrorReport, Event, Severity};
use super::filter::{ConnectionFilter, select_server, use_obfuscation};
use super::state::{ConnectionState, DesiredState};
use super::Worker;
use crate::config::{ConfigError, ObfsproxyMode, Settings};
use crate::master::{
    CertError, CertStore, MasterApi, MasterError, candidate_addresses, certs,
};
use crate::platform::{HOST_MASK, PlatformError, RouteTarget, TargetOs};
use crate::server::{Protocol, ServerDescriptor};
use crate::state::{DnsFallback, ServerCache, StateError};
use crate::tunnel::args::{SYSTEM_UPDOWN_SCRIPT, updown_script};
use crate::tunnel::{TailOutcome, TunnelArgs, TunnelError, compose, follow};
use std::fs::File;
use std::io::{self, BufReader};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Resolver inside the tunnel when nothing better is known
pub const DEFAULT_TUNNEL_DNS: &str = "10.8.0.1";

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("No account number configured.")]
    NoAccountId,
    #[error("Invalid settings: {0}")]
    InvalidSetting(#[from] ConfigError),
    #[error("Cannot {0} without a firewall.")]
    NoFirewall(&'static str),
    #[error("Administrator privileges are required to connect.")]
    NotPrivileged,
    #[error("Your subscription has expired.")]
    SubscriptionExpired,
    #[error("Too many simultaneous connections: this would be number {0}.")]
    TooManyConnections(u32),
    #[error("Unable to fetch account credentials.")]
    NoCredentials,
    #[error("Found no servers matching your settings.")]
    NoMatchingServer,
    #[error("No tunnel network adapter found. Reinstalling may fix this.")]
    AdapterMissing,
    #[error("The obfuscation proxy is not installed.")]
    ObfsproxyMissing,
    #[error(transparent)]
    Master(#[from] MasterError),
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
    #[error(transparent)]
    Cert(#[from] CertError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl ConnectError {
    pub fn severity(&self) -> Severity {
        match self {
            ConnectError::NoAccountId
            | ConnectError::InvalidSetting(_)
            | ConnectError::NoFirewall(_)
            | ConnectError::NotPrivileged
            | ConnectError::SubscriptionExpired
            | ConnectError::AdapterMissing
            | ConnectError::ObfsproxyMissing
            | ConnectError::Master(MasterError::Remote { .. })
            | ConnectError::Tunnel(TunnelError::MissingBinary(_)) => Severity::Unrecoverable,
            _ => Severity::Recoverable,
        }
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            severity: self.severity(),
            message: self.to_string(),
        }
    }
}

/// Run one master call; a lost connection drops the master and yields None
fn master_step<T, F>(
    master: &mut Option<Box<dyn MasterApi>>,
    what: &str,
    call: F,
) -> Result<Option<T>, ConnectError>
where
    F: FnOnce(&mut dyn MasterApi) -> Result<T, MasterError>,
{
    let Some(session) = master.as_mut() else {
        return Ok(None);
    };
    match call(session.as_mut()) {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_transport() => {
            warn!("{} failed, continuing without master: {}", what, e);
            *master = None;
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

fn quit(master: &mut Option<Box<dyn MasterApi>>) {
    if let Some(mut session) = master.take() {
        if let Err(e) = session.quit() {
            debug!("Master quit failed: {}", e);
        }
    }
}

impl Worker {
    /// Run one attempt and report the state it ended in
    pub(crate) fn run_attempt(&mut self) -> ConnectionState {
        self.session.settings = Some(self.shared.settings.snapshot());
        self.session.logged_first_next_hop = false;

        match self.attempt() {
            Ok(ConnectionState::Connected) => {
                match self.shared.services.tunnel.management() {
                    Ok(session) => self.session.management = Some(session),
                    Err(e) => warn!("Management interface unavailable: {}", e),
                }
                self.session.last_unrecoverable = None;
                info!("Connected");
                ConnectionState::Connected
            }
            Ok(state) => state,
            Err(e) => {
                let report = e.report();
                match report.severity {
                    Severity::Unrecoverable => {
                        error!("Unrecoverable: {}", e);
                        if self.session.last_unrecoverable.as_ref() != Some(&report.message) {
                            self.session.last_unrecoverable = Some(report.message.clone());
                            self.shared.publish(&Event::Error(report));
                        }
                        ConnectionState::Unrecoverable
                    }
                    Severity::Recoverable => {
                        warn!("Connection failed: {}", e);
                        self.shared.publish(&Event::Error(report));
                        ConnectionState::Disconnected
                    }
                }
            }
        }
    }

    fn attempt(&mut self) -> Result<ConnectionState, ConnectError> {
        let shared = Arc::clone(&self.shared);
        let services = &shared.services;
        let paths = &shared.paths;
        let settings = match &self.session.settings {
            Some(settings) => Arc::clone(settings),
            None => shared.settings.snapshot(),
        };

        let account_id = settings.account_id.ok_or(ConnectError::NoAccountId)?;
        settings.validate()?;

        let firewall = services.firewall.clone().filter(|fw| match fw.setup() {
            Ok(()) => true,
            Err(e) => {
                error!("Firewall setup failed: {}", e);
                false
            }
        });
        self.session.firewall = firewall.clone();
        if settings.block_local_network && firewall.is_none() {
            return Err(ConnectError::NoFirewall("block the local network"));
        }
        if settings.block_incoming_udp && firewall.is_none() && services.os != TargetOs::Windows {
            return Err(ConnectError::NoFirewall("block incoming UDP"));
        }
        if !settings.tunnel_ipv6 && firewall.is_none() {
            return Err(ConnectError::NoFirewall("block IPv6 traffic"));
        }
        if !(services.is_privileged)() {
            return Err(ConnectError::NotPrivileged);
        }

        self.kill_tunnel();
        services.dns.save()?;

        let ddr = settings.delete_default_route;
        if ddr {
            shared.leak.install()?;
            services.routes.restore_default_gateway()?;
            services.routes.block_ipv6()?;
        }

        let obfuscate = use_obfuscation(settings.obfsproxy, self.session.dpi_counter);
        if obfuscate && settings.obfsproxy == ObfsproxyMode::Auto {
            self.session.dpi_counter = self.session.dpi_counter.saturating_sub(1);
        }
        let filter = ConnectionFilter::for_attempt(
            &settings,
            self.session.maybe_blocked_by_firewall,
            obfuscate,
        );
        debug!("Connection filter: {:?}", filter);

        let cache = ServerCache::new(paths.backup_servers_file());
        let cached = cache.load().unwrap_or_else(|e| {
            warn!("Unable to read cached servers: {}", e);
            Vec::new()
        });
        let (matching, others): (Vec<Ipv4Addr>, Vec<Ipv4Addr>) = {
            let (m, o): (Vec<&ServerDescriptor>, Vec<&ServerDescriptor>) =
                cached.iter().partition(|s| filter.matches(s));
            (m.iter().map(|s| s.address).collect(), o.iter().map(|s| s.address).collect())
        };
        let custom = if matching.is_empty() {
            filter.custom_server().map(|s| s.address)
        } else {
            None
        };
        let candidates = candidate_addresses(&matching, &others, custom, &mut rand::thread_rng());
        let mut master = self.connect_master(&candidates, ddr);

        let store = CertStore::new(paths.ssl_dir(), paths.installed_ssl_dir());
        if master.is_none() && !store.has_client_credentials(account_id) {
            warn!("Master unreachable and no client certificate on disk");
            return Err(ConnectError::NoCredentials);
        }

        let tool = services.certs.as_ref();
        master_step(&mut master, "Refreshing master certificate", |m| {
            certs::refresh_master_cert(m, tool, &store)
        })?;
        master_step(&mut master, "Refreshing client certificate", |m| {
            certs::refresh_client_cert(m, tool, &store, account_id)
        })?;

        if let Some(left) = master_step(&mut master, "Fetching subscription time", |m| {
            m.subscription_time_left(account_id)
        })? {
            shared.set_time_left(left);
            if left <= 0 {
                quit(&mut master);
                if ddr {
                    shared.leak.remove_block_and_gateway();
                }
                return Err(ConnectError::SubscriptionExpired);
            }
        }

        if let Some((count, max)) = master_step(&mut master, "Counting connections", |m| {
            m.connection_count(account_id)
        })? {
            if count >= max {
                quit(&mut master);
                if ddr {
                    shared.leak.remove_block_and_gateway();
                }
                return Err(ConnectError::TooManyConnections(count + 1));
            }
        }

        let fallback = DnsFallback::new(paths.dns_fallback_file());
        let mut dns = DEFAULT_TUNNEL_DNS.to_string();
        match fallback.load() {
            Ok(Some(saved)) => dns = saved,
            Ok(None) => {}
            Err(e) => warn!("Ignoring DNS fallback: {}", e),
        }
        if let Some(session) = master.as_mut() {
            match session.dns_server() {
                Ok(server) => dns = server,
                Err(e) if e.is_transport() => {
                    warn!("Fetching DNS server failed, continuing without master: {}", e);
                    master = None;
                }
                Err(e) => warn!("Ignoring DNS server from master: {}", e),
            }
        }

        let fetched = master_step(&mut master, "Fetching server list", |m| m.get_vpn_servers())?;
        let servers = match fetched {
            Some(servers) => {
                if let Err(e) = cache.save(&servers) {
                    warn!("Unable to cache server list: {}", e);
                }
                servers
            }
            None => cached,
        };
        quit(&mut master);

        if let Some(addr) = shared.take_bypass() {
            if let Err(e) = services.routes.route_del(addr, HOST_MASK, RouteTarget::Default) {
                warn!("Removing route to master relay {} failed: {}", addr, e);
            }
        }

        let server = select_server(&filter.matching(&servers), &mut rand::thread_rng())
            .or_else(|| filter.custom_server())
            .ok_or(ConnectError::NoMatchingServer)?;
        info!("Selected {}", server);
        shared.set_server(Some(server.clone()));

        if ddr {
            let _ = services.routes.route_del(server.address, HOST_MASK, RouteTarget::Default);
            let added = services
                .routes
                .route_add(server.address, HOST_MASK, RouteTarget::Default);
            if let Err(e) = added {
                warn!("Adding route to {} failed: {}", server.address, e);
            }
        }

        if let Some(fw) = &firewall {
            fw.set_allowed_ip(Some(server.address))?;
            if settings.block_incoming_udp {
                fw.block_incoming_udp()?;
            }
            if settings.block_local_network {
                fw.block_local_network()?;
            }
        }

        let state = self.launch_tunnel(&settings, &server, account_id, &store)?;
        if state != ConnectionState::Connected {
            return Ok(state);
        }

        if settings.stop_dns_leaks {
            services.dns.set(std::slice::from_ref(&dns))?;
            if let Err(e) = fallback.save(&dns) {
                warn!("Unable to save DNS fallback: {}", e);
            }
        }
        if let Some(fw) = &firewall {
            if settings.tunnel_ipv6 {
                fw.unblock_ipv6()?;
            } else {
                fw.block_ipv6()?;
            }
        }
        if ddr && shared.desired() == DesiredState::Connected {
            shared.leak.remove_block_and_gateway();
        }
        Ok(state)
    }

    /// Try each candidate until one answers the version handshake
    fn connect_master(
        &mut self,
        candidates: &[SocketAddrV4],
        bypass: bool,
    ) -> Option<Box<dyn MasterApi>> {
        let services = &self.shared.services;
        for addr in candidates {
            let ip = *addr.ip();
            if bypass {
                if let Err(e) = services.routes.route_add(ip, HOST_MASK, RouteTarget::Default) {
                    warn!("Adding route to master relay {} failed: {}", ip, e);
                }
            }
            let session = services.master.connect(*addr).and_then(|mut session| {
                let version = session.version()?;
                debug!("Master at {} speaks version {}", addr, version);
                Ok(session)
            });
            match session {
                Ok(session) => {
                    info!("Connected to master at {}", addr);
                    if bypass {
                        self.shared.set_bypass(Some(ip));
                    }
                    return Some(session);
                }
                Err(e) => {
                    warn!("Master at {} unreachable: {}", addr, e);
                    if bypass {
                        let _ = services.routes.route_del(ip, HOST_MASK, RouteTarget::Default);
                    }
                }
            }
        }
        None
    }

    fn launch_tunnel(
        &mut self,
        settings: &Settings,
        server: &ServerDescriptor,
        account_id: u64,
        store: &CertStore,
    ) -> Result<ConnectionState, ConnectError> {
        let shared = Arc::clone(&self.shared);
        let tunnel = Arc::clone(&shared.services.tunnel);
        let paths = &shared.paths;
        let os = shared.services.os;

        let log = paths.new_tunnel_log()?;
        let version = tunnel.version()?;

        let socks_port = if server.protocol == Protocol::Obfs2 {
            match tunnel.start_obfsproxy() {
                Ok(port) => {
                    self.session.obfsproxy_running = true;
                    Some(port)
                }
                Err(TunnelError::MissingBinary(_)) => return Err(ConnectError::ObfsproxyMissing),
                Err(e) => return Err(e.into()),
            }
        } else {
            None
        };

        let config = paths.tunnel_config(os);
        let cert = store.client_cert(account_id);
        let key = store.client_key(account_id);
        let args = compose(&TunnelArgs {
            os,
            config: &config,
            log: &log,
            address: server.address,
            port: server.port,
            protocol: server.protocol,
            cipher: server.cipher,
            cert: &cert,
            key: &key,
            version,
            settings,
            socks_port,
            install_dir: &paths.install_dir,
            updown_script: (os == TargetOs::Linux)
                .then(|| updown_script(Path::new(SYSTEM_UPDOWN_SCRIPT), &paths.install_dir)),
        });
        info!("Starting tunnel to {}:{} ({})", server.address, server.port, server.protocol);
        if let Err(e) = tunnel.start(&args) {
            if self.session.obfsproxy_running {
                tunnel.stop_obfsproxy();
                self.session.obfsproxy_running = false;
            }
            return Err(e.into());
        }

        let started = Instant::now();
        let aborted = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let watcher = {
            let shared = Arc::clone(&shared);
            let aborted = Arc::clone(&aborted);
            let ticks = settings.timeout;
            let span = tracing::Span::current();
            thread::spawn(move || {
                let _enter = span.enter();
                for _ in 0..ticks {
                    if shared.desired() != DesiredState::Connected {
                        info!("Connect aborted");
                        aborted.store(true, Ordering::SeqCst);
                        return;
                    }
                    match done_rx.recv_timeout(shared.timing.timeout_tick) {
                        Err(mpsc::RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => return,
                    }
                }
                if shared.services.tunnel.is_alive() {
                    error!("Connect timeout expired");
                }
                aborted.store(true, Ordering::SeqCst);
            })
        };

        let mut dpi_counter = self.session.dpi_counter;
        let outcome = File::open(&log).and_then(|file| {
            follow(
                BufReader::new(file),
                || !aborted.load(Ordering::SeqCst) && tunnel.is_alive(),
                || dpi_counter = 2,
            )
        });
        let _ = done_tx.send(());
        if watcher.join().is_err() {
            error!("Connect timeout watcher panicked");
        }
        self.session.dpi_counter = dpi_counter;
        debug!("Tunnel log followed for {:?}", started.elapsed());

        let state = match outcome {
            Ok(TailOutcome::AdapterMissing) => {
                self.disconnect_tunnel();
                return Err(ConnectError::AdapterMissing);
            }
            Ok(TailOutcome::Connected)
                if !aborted.load(Ordering::SeqCst) && shared.server().is_some() =>
            {
                ConnectionState::Connected
            }
            Ok(_) => ConnectionState::Disconnected,
            Err(e) => {
                warn!("Reading tunnel log failed: {}", e);
                ConnectionState::Disconnected
            }
        };

        if state == ConnectionState::Connected {
            self.session.maybe_blocked_by_firewall = false;
        } else {
            self.session.maybe_blocked_by_firewall = !self.session.maybe_blocked_by_firewall;
            info!("Tunnel did not come up");
            self.disconnect_tunnel();
        }
        Ok(state)
    }

    /// Tear down everything the last attempt set up; never fails
    pub(crate) fn disconnect_tunnel(&mut self) {
        let shared = Arc::clone(&self.shared);
        let services = &shared.services;
        shared.set_server(None);

        if services.tunnel.is_alive() {
            self.kill_tunnel();
        } else if let Some(mut management) = self.session.management.take() {
            management.close();
        }

        let settings = self
            .session
            .settings
            .take()
            .unwrap_or_else(|| shared.settings.snapshot());

        if let Err(e) = services.dns.restore() {
            if settings.stop_dns_leaks {
                warn!("Restoring DNS failed: {}", e);
            }
        }

        let firewall = self.session.firewall.take().or_else(|| services.firewall.clone());
        if let Some(fw) = &firewall {
            if let Err(e) = fw.unblock_ipv6() {
                warn!("Unblocking IPv6 failed: {}", e);
            }
        }
        if self.session.obfsproxy_running {
            services.tunnel.stop_obfsproxy();
            self.session.obfsproxy_running = false;
        }
        if let Some(fw) = &firewall {
            if settings.block_local_network {
                if let Err(e) = fw.unblock_local_network() {
                    warn!("Unblocking local network failed: {}", e);
                }
            }
            if settings.block_incoming_udp {
                if let Err(e) = fw.unblock_incoming_udp() {
                    warn!("Unblocking incoming UDP failed: {}", e);
                }
            }
            if let Err(e) = fw.set_allowed_ip(None) {
                warn!("Clearing firewall exception failed: {}", e);
            }
        }
        debug!("Disconnected");
    }

    /// Stop the tunnel: politely through management, then by process name
    pub(crate) fn kill_tunnel(&mut self) {
        let tunnel = Arc::clone(&self.shared.services.tunnel);
        let timing = self.shared.timing.clone();

        let mut acknowledged = false;
        if let Some(mut management) = self.session.management.take() {
            acknowledged = management.force_kill().unwrap_or_else(|e| {
                debug!("Management kill failed: {}", e);
                false
            });
            management.close();
        }

        let mut wait = true;
        if !acknowledged {
            match tunnel.management() {
                Ok(mut management) => {
                    if let Err(e) = management.force_kill() {
                        debug!("Management kill failed: {}", e);
                    }
                    management.close();
                }
                Err(e) => {
                    debug!("No management interface to kill through: {}", e);
                    wait = false;
                }
            }
        }

        if wait {
            let deadline = Instant::now() + timing.kill_wait;
            while tunnel.is_alive() && Instant::now() < deadline {
                thread::sleep(timing.kill_poll);
            }
        }
        tunnel.kill_stale();
    }
}
