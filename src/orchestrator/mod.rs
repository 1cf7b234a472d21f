//! Connection orchestrator
//!
//! A control thread reconciles the actual [`ConnectionState`] toward the
//! [`DesiredState`] set by callers. Requests only flip the desired state and
//! return; connecting, monitoring and tearing down all happen on the
//! control thread.

pub mod connect;
pub mod events;
pub mod filter;
pub mod leak;
pub mod probe;
pub mod schedule;
pub mod state;

#[cfg(test)]
mod scenarios;

pub use connect::ConnectError;
pub use events::{ErrorReport, Event, EventBus, Listener, Severity, SubscriptionId};
pub use filter::{ConnectionFilter, select_server};
pub use leak::LeakGuard;
pub use probe::{IcmpProbe, ProbeOutcome, RouteProbe};
pub use schedule::Schedule;
pub use state::{ConnectionState, DesiredState};

use crate::config::{Settings, SettingsStore};
use crate::paths::Paths;
use crate::platform::{Firewall, Services};
use crate::server::ServerDescriptor;
use crate::tunnel::TunnelManagement;
use std::net::Ipv4Addr;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const ROUTE_CHECK_FIRST: u64 = 15;
const GATEWAY_CHECK_FIRST: u64 = 30;
const CHECK_PERIOD: u64 = 30;

/// The orchestrator's public surface
///
/// Implemented by [`Orchestrator`]. The privilege channel serves any
/// implementation; its client end offers the same calls, each fallible.
pub trait Controller: Send + Sync {
    fn connect(&self);
    fn disconnect(&self);
    fn shut_down(&self);
    /// Stop the control thread and wait for it
    fn destroy(&self) -> bool;
    fn connection_state(&self) -> ConnectionState;
    fn desired_connection_state(&self) -> DesiredState;
    /// Server in use, only while connected
    fn server_info(&self) -> Option<ServerDescriptor>;
    /// Seconds of subscription left, as last reported by the master
    fn time_left(&self) -> Option<i64>;
    fn subscribe(&self, listener: Listener) -> SubscriptionId;
    fn unsubscribe(&self, id: SubscriptionId) -> bool;
}

/// Delays of the control loop
#[derive(Debug, Clone)]
pub struct Timing {
    /// Loop period when there is nothing to do
    pub idle: Duration,
    /// Pause after a failed attempt
    pub retry_backoff: Duration,
    /// Length of one unit of the `timeout` setting
    pub timeout_tick: Duration,
    /// How long a killed tunnel gets to exit
    pub kill_wait: Duration,
    pub kill_poll: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(1),
            retry_backoff: Duration::from_secs(5),
            timeout_tick: Duration::from_secs(1),
            kill_wait: Duration::from_millis(1500),
            kill_poll: Duration::from_millis(150),
        }
    }
}

pub struct OrchestratorOptions {
    pub timing: Timing,
    pub probe: Arc<dyn RouteProbe>,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            timing: Timing::default(),
            probe: Arc::new(IcmpProbe),
        }
    }
}

struct Status {
    state: ConnectionState,
    desired: DesiredState,
    server: Option<ServerDescriptor>,
    time_left: Option<(i64, Instant)>,
    /// Host route letting the master connection past the reject routes
    bypass: Option<Ipv4Addr>,
}

/// State visible to both the control thread and request callers
pub(crate) struct Shared {
    pub(crate) services: Services,
    pub(crate) paths: Paths,
    pub(crate) settings: Arc<SettingsStore>,
    pub(crate) probe: Arc<dyn RouteProbe>,
    pub(crate) timing: Timing,
    pub(crate) leak: LeakGuard,
    bus: EventBus,
    status: Mutex<Status>,
    changed: Condvar,
}

impl Shared {
    fn status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.status().state
    }

    pub(crate) fn desired(&self) -> DesiredState {
        self.status().desired
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        let changed = {
            let mut status = self.status();
            let changed = status.state != state;
            status.state = state;
            changed
        };
        if changed {
            debug!("Connection state: {}", state);
            self.bus.publish(&Event::Connection(state));
        }
    }

    fn set_desired(&self, desired: DesiredState) {
        self.status().desired = desired;
        self.changed.notify_all();
    }

    pub(crate) fn server(&self) -> Option<ServerDescriptor> {
        self.status().server.clone()
    }

    pub(crate) fn set_server(&self, server: Option<ServerDescriptor>) {
        self.status().server = server.clone();
        self.bus.publish(&Event::Server(server));
    }

    pub(crate) fn set_time_left(&self, seconds: i64) {
        self.status().time_left = Some((seconds, Instant::now()));
    }

    pub(crate) fn set_bypass(&self, addr: Option<Ipv4Addr>) {
        self.status().bypass = addr;
    }

    pub(crate) fn take_bypass(&self) -> Option<Ipv4Addr> {
        self.status().bypass.take()
    }

    pub(crate) fn publish(&self, event: &Event) {
        self.bus.publish(event);
    }

    /// Sleep up to `duration`, waking early if the desired state changes
    pub(crate) fn pause(&self, duration: Duration) {
        let status = self.status();
        let desired = status.desired;
        let _unused = self
            .changed
            .wait_timeout_while(status, duration, |s| s.desired == desired)
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// Remove every route change immediately, from the caller's thread
    fn clean_up_routes(&self) {
        if !self.settings.snapshot().delete_default_route {
            return;
        }
        let bypass = self.take_bypass();
        self.leak.cleanup(bypass);
    }
}

/// Attempt-scoped state, owned by the control thread
pub(crate) struct Session {
    /// Settings locked for the current connection
    pub(crate) settings: Option<Arc<Settings>>,
    pub(crate) firewall: Option<Arc<dyn Firewall>>,
    pub(crate) management: Option<Box<dyn TunnelManagement>>,
    pub(crate) obfsproxy_running: bool,
    /// Remaining attempts that should use obfuscation
    pub(crate) dpi_counter: u32,
    pub(crate) maybe_blocked_by_firewall: bool,
    pub(crate) last_unrecoverable: Option<String>,
    pub(crate) logged_first_next_hop: bool,
    pub(crate) route_check: Schedule,
    pub(crate) gateway_check: Schedule,
}

impl Session {
    fn new(now: u64) -> Self {
        Self {
            settings: None,
            firewall: None,
            management: None,
            obfsproxy_running: false,
            dpi_counter: 0,
            maybe_blocked_by_firewall: false,
            last_unrecoverable: None,
            logged_first_next_hop: false,
            route_check: Schedule::new(now, ROUTE_CHECK_FIRST, CHECK_PERIOD),
            gateway_check: Schedule::new(now, GATEWAY_CHECK_FIRST, CHECK_PERIOD),
        }
    }
}

/// The control thread
pub(crate) struct Worker {
    pub(crate) shared: Arc<Shared>,
    pub(crate) session: Session,
}

impl Worker {
    fn run(mut self) {
        loop {
            let (state, desired) = {
                let status = self.shared.status();
                (status.state, status.desired)
            };
            match state {
                ConnectionState::Connected => {
                    if !self.monitor() {
                        self.disconnect_tunnel();
                        self.shared.set_state(ConnectionState::Disconnected);
                    } else if desired == DesiredState::Connected {
                        self.check_gateway();
                        self.shared.pause(self.shared.timing.idle);
                    } else {
                        self.disconnect_tunnel();
                        self.shared.clean_up_routes();
                        self.shared.set_state(match desired {
                            DesiredState::Off => ConnectionState::Off,
                            _ => ConnectionState::Disconnected,
                        });
                    }
                }
                ConnectionState::Disconnected | ConnectionState::Connecting => match desired {
                    DesiredState::Connected => {
                        self.shared.set_state(ConnectionState::Connecting);
                        let outcome = self.run_attempt();
                        if outcome == ConnectionState::Disconnected {
                            self.shared.pause(self.shared.timing.retry_backoff);
                        }
                        // A disconnect request may have cleaned up before this
                        // attempt installed its routes
                        if outcome != ConnectionState::Connected
                            && self.shared.desired() != DesiredState::Connected
                        {
                            self.shared.clean_up_routes();
                        }
                        self.shared.set_state(outcome);
                    }
                    DesiredState::Off => {
                        self.disconnect_tunnel();
                        self.shared.set_state(ConnectionState::Off);
                    }
                    DesiredState::Disconnected => {
                        self.shared.set_state(ConnectionState::Disconnected);
                        self.shared.pause(self.shared.timing.idle);
                    }
                },
                ConnectionState::Unrecoverable => {
                    if desired == DesiredState::Off {
                        self.shared.set_state(ConnectionState::Off);
                    } else {
                        self.shared.pause(self.shared.timing.idle);
                    }
                }
                ConnectionState::Off => break,
            }
        }
        info!("Control loop stopped");
    }

    /// Is the connection still healthy?
    fn monitor(&mut self) -> bool {
        if self.session.management.is_none() {
            match self.shared.services.tunnel.management() {
                Ok(session) => self.session.management = Some(session),
                Err(e) => {
                    warn!("Management interface unavailable: {}", e);
                    return false;
                }
            }
        }
        let status = match self.session.management.as_mut().map(|m| m.status()) {
            Some(Ok(status)) => status,
            Some(Err(e)) => {
                warn!("Tunnel status query failed: {}", e);
                return false;
            }
            None => return false,
        };
        if status != "CONNECTED" {
            warn!("Tunnel state is {}", status);
            return false;
        }

        let now = schedule::unix_now();
        if self.session.route_check.is_due(now) {
            self.session.route_check.reschedule_aligned(now);
            return self.check_route();
        }
        true
    }

    fn check_route(&mut self) -> bool {
        match self.shared.probe.probe() {
            Ok(outcome) if outcome.inside_tunnel() => {
                if !self.session.logged_first_next_hop {
                    info!("Success, packet went through the tunnel");
                    self.session.logged_first_next_hop = true;
                }
                true
            }
            Ok(outcome) => {
                error!("Route leak detected: {:?}", outcome);
                false
            }
            Err(e) => {
                debug!("Route probe failed: {}", e);
                true
            }
        }
    }

    /// Keep the physical default route away while connected
    fn check_gateway(&mut self) {
        let now = schedule::unix_now();
        if !self.session.gateway_check.is_due(now) {
            return;
        }
        self.session.gateway_check.reschedule(now);
        let delete_default_route = self
            .session
            .settings
            .as_ref()
            .is_some_and(|s| s.delete_default_route);
        if delete_default_route {
            if let Err(e) = self.shared.services.routes.delete_default_gateway() {
                warn!("Deleting default gateway failed: {}", e);
            }
        }
    }
}

/// Handle to a running control loop
pub struct Orchestrator {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(services: Services, paths: Paths, settings: Arc<SettingsStore>) -> Self {
        Self::with_options(services, paths, settings, OrchestratorOptions::default())
    }

    pub fn with_options(
        services: Services,
        paths: Paths,
        settings: Arc<SettingsStore>,
        options: OrchestratorOptions,
    ) -> Self {
        match services.routes.default_gateway() {
            Ok(None) => {
                info!("No default gateway, restoring the saved one");
                if let Err(e) = services.routes.restore_saved_default_gateway() {
                    warn!("Restoring saved default gateway failed: {}", e);
                }
            }
            Ok(Some(_)) => {}
            Err(e) => warn!("Unable to read default gateway: {}", e),
        }

        let leak = LeakGuard::new(Arc::clone(&services.routes));
        let shared = Arc::new(Shared {
            services,
            paths,
            settings,
            probe: options.probe,
            timing: options.timing,
            leak,
            bus: EventBus::new(),
            status: Mutex::new(Status {
                state: ConnectionState::Disconnected,
                desired: DesiredState::Disconnected,
                server: None,
                time_left: None,
                bypass: None,
            }),
            changed: Condvar::new(),
        });

        let worker = Worker {
            shared: Arc::clone(&shared),
            session: Session::new(schedule::unix_now()),
        };
        let span = tracing::info_span!("orchestrator");
        let thread = thread::spawn(move || {
            let _enter = span.enter();
            worker.run();
        });

        Self {
            shared,
            thread: Mutex::new(Some(thread)),
        }
    }
}

impl Controller for Orchestrator {
    fn connect(&self) {
        info!("Connect requested");
        self.shared.set_desired(DesiredState::Connected);
        let mut status = self.shared.status();
        if status.state == ConnectionState::Unrecoverable {
            status.state = ConnectionState::Disconnected;
            drop(status);
            self.shared.publish(&Event::Connection(ConnectionState::Disconnected));
        }
    }

    fn disconnect(&self) {
        info!("Disconnect requested");
        self.shared.set_desired(DesiredState::Disconnected);
        self.shared.clean_up_routes();
    }

    fn shut_down(&self) {
        info!("Shutdown requested");
        self.shared.set_desired(DesiredState::Off);
        self.shared.clean_up_routes();
    }

    fn destroy(&self) -> bool {
        self.shared.set_desired(DesiredState::Off);
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Control loop panicked");
            }
        }
        true
    }

    fn connection_state(&self) -> ConnectionState {
        self.shared.state()
    }

    fn desired_connection_state(&self) -> DesiredState {
        self.shared.desired()
    }

    fn server_info(&self) -> Option<ServerDescriptor> {
        let status = self.shared.status();
        if status.state == ConnectionState::Connected {
            status.server.clone()
        } else {
            None
        }
    }

    fn time_left(&self) -> Option<i64> {
        self.shared
            .status()
            .time_left
            .map(|(seconds, at)| seconds - at.elapsed().as_secs() as i64)
    }

    fn subscribe(&self, listener: Listener) -> SubscriptionId {
        self.shared.bus.subscribe(move |event| listener(event))
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.bus.unsubscribe(id)
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.destroy();
    }
}
