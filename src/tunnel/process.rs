//! Tunnel binary as a child process

use super::management::{MANAGEMENT_ADDR, ManagementSession, TunnelManagement};
use super::obfsproxy::Obfsproxy;
use super::{TunnelBackend, TunnelError, args};
use crate::platform::TargetOs;
use std::io;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessesToUpdate, Signal, System};
use tracing::{debug, info, warn};

const KILL_TIMEOUT: Duration = Duration::from_secs(3);
const KILL_POLL: Duration = Duration::from_millis(100);

/// Pid of a running child, cleared by its monitor thread on exit
#[derive(Clone, Default)]
pub struct ChildSlot {
    inner: Arc<(Mutex<Option<u32>>, Condvar)>,
}

impl ChildSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<u32>> {
        self.inner.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Hand the child to a monitor thread that waits for it to exit
    pub fn watch(&self, mut child: Child, name: &'static str) {
        let pid = child.id();
        *self.lock() = Some(pid);
        let slot = self.clone();
        let span = tracing::Span::current();
        thread::spawn(move || {
            let _enter = span.enter();
            debug!("Monitoring {} (pid {}) in separate thread", name, pid);
            match child.wait() {
                Ok(status) => info!("{} process has died ({})", name, status),
                Err(e) => warn!("Lost track of {}: {}", name, e),
            }
            let mut current = slot.lock();
            if *current == Some(pid) {
                *current = None;
            }
            slot.inner.1.notify_all();
        });
    }

    pub fn pid(&self) -> Option<u32> {
        *self.lock()
    }

    pub fn is_alive(&self) -> bool {
        self.pid().is_some()
    }

    /// Block until the slot is empty; false on timeout
    pub fn wait_exit(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut current = self.lock();
        while current.is_some() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            current = match self.inner.1.wait_timeout(current, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}

fn matches_name(process_name: &str, name: &str) -> bool {
    process_name == name
        || process_name
            .strip_suffix(".exe")
            .is_some_and(|stem| stem == name)
}

/// Terminate every process called `name` except ourselves
///
/// Processes still around after `timeout` are killed outright. Returns how
/// many were found.
pub fn kill_by_name(name: &str, timeout: Duration) -> usize {
    let own = Pid::from_u32(std::process::id());
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);

    let pids: Vec<Pid> = system
        .processes()
        .iter()
        .filter(|(pid, process)| {
            **pid != own && matches_name(&process.name().to_string_lossy(), name)
        })
        .map(|(pid, _)| *pid)
        .collect();
    if pids.is_empty() {
        return 0;
    }

    info!("{} process alive, terminating {:?}", name, pids);
    for pid in &pids {
        if let Some(process) = system.process(*pid) {
            if process.kill_with(Signal::Term).is_none() {
                process.kill();
            }
        }
    }

    let deadline = Instant::now() + timeout;
    loop {
        system.refresh_processes(ProcessesToUpdate::Some(&pids), true);
        let left: Vec<Pid> = pids
            .iter()
            .copied()
            .filter(|pid| system.process(*pid).is_some())
            .collect();
        if left.is_empty() {
            break;
        }
        if Instant::now() >= deadline {
            for pid in left {
                if let Some(process) = system.process(pid) {
                    debug!("Killing {} (pid {})", name, pid);
                    process.kill();
                }
            }
            break;
        }
        thread::sleep(KILL_POLL);
    }
    pids.len()
}

/// Ask a process to terminate
pub fn terminate(pid: u32) {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    if let Some(process) = system.process(pid) {
        if process.kill_with(Signal::Term).is_none() {
            process.kill();
        }
    }
}

/// Spawn a program with all standard streams detached
pub(crate) fn spawn_detached(program: &PathBuf, args: &[String]) -> Result<Child, TunnelError> {
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => TunnelError::MissingBinary(program.display().to_string()),
            _ => TunnelError::Io(e),
        })
}

/// Tunnel binary driven through `std::process`
pub struct ProcessBackend {
    os: TargetOs,
    binary: PathBuf,
    tunnel: ChildSlot,
    obfsproxy: Obfsproxy,
}

impl ProcessBackend {
    pub fn new(os: TargetOs) -> Self {
        Self::with_binaries(os, PathBuf::from("openvpn"), PathBuf::from("obfsproxy"))
    }

    pub fn with_binaries(os: TargetOs, binary: PathBuf, obfsproxy: PathBuf) -> Self {
        Self {
            os,
            binary,
            tunnel: ChildSlot::new(),
            obfsproxy: Obfsproxy::new(obfsproxy),
        }
    }

    fn process_name(&self) -> String {
        self.binary
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "openvpn".to_string())
    }
}

impl TunnelBackend for ProcessBackend {
    fn version(&self) -> Result<(u32, u32), TunnelError> {
        let output = Command::new(&self.binary)
            .arg("--version")
            .output()
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => {
                    TunnelError::MissingBinary(self.binary.display().to_string())
                }
                _ => TunnelError::Io(e),
            })?;
        // `--version` exits non-zero on some builds, only stdout matters
        let stdout = String::from_utf8_lossy(&output.stdout);
        args::parse_version(&stdout).ok_or_else(|| {
            TunnelError::Version(stdout.lines().next().unwrap_or_default().to_string())
        })
    }

    fn start(&self, args: &[String]) -> Result<(), TunnelError> {
        if self.tunnel.is_alive() {
            return Err(TunnelError::AlreadyRunning("tunnel"));
        }
        debug!("Starting {:?} on {:?}", self.binary, self.os);
        let child = spawn_detached(&self.binary, args)?;
        self.tunnel.watch(child, "Tunnel");
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.tunnel.is_alive()
    }

    fn kill_stale(&self) {
        kill_by_name(&self.process_name(), KILL_TIMEOUT);
    }

    fn management(&self) -> Result<Box<dyn TunnelManagement>, TunnelError> {
        Ok(Box::new(ManagementSession::connect(MANAGEMENT_ADDR)?))
    }

    fn start_obfsproxy(&self) -> Result<u16, TunnelError> {
        self.obfsproxy.start()
    }

    fn stop_obfsproxy(&self) {
        self.obfsproxy.stop()
    }
}
