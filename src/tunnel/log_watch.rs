//! Tunnel log follower
//!
//! The tunnel reports progress only through its log file. [`follow`] reads
//! it like `tail -f` until the tunnel either finishes initialization or
//! dies, feeding every line to a [`LogWatcher`].

use std::io::{self, BufRead};
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

const INIT_COMPLETED: &str = "Initialization Sequence Completed";
const INIT_WITH_ERRORS: &str = "With Errors";
const NO_ADAPTER: &str = "There are no TAP-Windows adapters on this system";
const LINK_REMOTE: &str = " link remote: ";
const TLS_INITIAL_PACKET: &str = "TLS: Initial packet from ";
const CONNECTION_RESET: &str = "Connection reset";
const MANAGEMENT_CLIENT: &str = "MANAGEMENT: Client connected from";

const EOF_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogEvent {
    Connected,
    AdapterMissing,
    /// Handshake attempt was cut off, likely by deep packet inspection
    DpiSuspected,
}

/// Line classifier; remembers whether the previous line opened a handshake
#[derive(Debug, Default)]
pub struct LogWatcher {
    look_for_filtering: bool,
}

impl LogWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, line: &str) -> Option<LogEvent> {
        if line.contains(INIT_COMPLETED) && !line.contains(INIT_WITH_ERRORS) {
            return Some(LogEvent::Connected);
        }
        if line.contains(NO_ADAPTER) {
            return Some(LogEvent::AdapterMissing);
        }

        let mut event = None;
        if self.look_for_filtering && !line.is_empty() {
            self.look_for_filtering = false;
            if line.contains(CONNECTION_RESET) || line.contains(MANAGEMENT_CLIENT) {
                event = Some(LogEvent::DpiSuspected);
            }
        }
        if line.contains(LINK_REMOTE) || line.contains(TLS_INITIAL_PACKET) {
            self.look_for_filtering = true;
        }
        event
    }
}

/// How following the log ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailOutcome {
    Connected,
    AdapterMissing,
    /// The tunnel died (or was stopped) before initialization completed
    Exited,
}

/// Follow `reader` until a terminal event, or until EOF with `alive` false
///
/// `on_dpi` runs for every DPI suspicion; following continues after it.
pub fn follow<R, A, D>(mut reader: R, alive: A, mut on_dpi: D) -> io::Result<TailOutcome>
where
    R: BufRead,
    A: Fn() -> bool,
    D: FnMut(),
{
    let mut watcher = LogWatcher::new();
    let mut pending: Vec<u8> = Vec::new();

    loop {
        let n = reader.read_until(b'\n', &mut pending)?;
        let complete = pending.ends_with(b"\n");
        if n == 0 || !complete {
            // A partial line stays pending until the writer finishes it
            if !alive() {
                if pending.is_empty() {
                    return Ok(TailOutcome::Exited);
                }
            } else {
                thread::sleep(EOF_POLL);
                continue;
            }
        }

        let line = String::from_utf8_lossy(&pending).trim_end().to_string();
        pending.clear();
        debug!(target: "tunnel", "{}", line);

        match watcher.feed(&line) {
            Some(LogEvent::Connected) => {
                debug!("{}", INIT_COMPLETED);
                return Ok(TailOutcome::Connected);
            }
            Some(LogEvent::AdapterMissing) => return Ok(TailOutcome::AdapterMissing),
            Some(LogEvent::DpiSuspected) => {
                info!("Deep packet inspection filtering detected");
                on_dpi();
            }
            None => {}
        }
    }
}
