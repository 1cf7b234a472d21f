//! Byte pipes for the channel
//!
//! Between processes the channel runs over three named FIFOs in a shared
//! directory. Within one process (tests, embedding) [`memory_pipe`] gives
//! the same one-way byte stream on top of a channel.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, Sender, channel};
use tracing::debug;

const REQUEST_PIPE: &str = "request_pipe";
const REPLY_PIPE: &str = "reply_pipe";
const UPDATE_PIPE: &str = "update_pipe";

/// Locations of the three FIFOs
#[derive(Debug, Clone)]
pub struct PipePaths {
    pub request: PathBuf,
    pub reply: PathBuf,
    pub update: PathBuf,
}

impl PipePaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            request: dir.join(REQUEST_PIPE),
            reply: dir.join(REPLY_PIPE),
            update: dir.join(UPDATE_PIPE),
        }
    }

    /// Create any FIFO that does not exist yet
    #[cfg(unix)]
    pub fn create(&self) -> io::Result<()> {
        use nix::sys::stat::Mode;
        use nix::unistd::mkfifo;

        for path in [&self.request, &self.reply, &self.update] {
            if path.exists() {
                continue;
            }
            debug!("Creating pipe {}", path.display());
            mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(io::Error::from)?;
        }
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn create(&self) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "named pipes are not available"))
    }

    /// Privileged end: (requests in, replies out, updates out)
    ///
    /// Opening a FIFO blocks until the other end opens it too. Both ends
    /// open in the same order so neither waits forever.
    pub fn open_worker(&self) -> io::Result<(File, File, File)> {
        let requests = File::open(&self.request)?;
        let replies = OpenOptions::new().write(true).open(&self.reply)?;
        let updates = OpenOptions::new().write(true).open(&self.update)?;
        Ok((requests, replies, updates))
    }

    /// Unprivileged end: (requests out, replies in, updates in)
    pub fn open_ui(&self) -> io::Result<(File, File, File)> {
        let requests = OpenOptions::new().write(true).open(&self.request)?;
        let replies = File::open(&self.reply)?;
        let updates = File::open(&self.update)?;
        Ok((requests, replies, updates))
    }
}

/// Writing half of an in-memory pipe; dropping it ends the stream
pub struct PipeWriter {
    tx: Sender<Vec<u8>>,
}

/// Reading half of an in-memory pipe
pub struct PipeReader {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    offset: usize,
}

pub fn memory_pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = channel();
    (
        PipeWriter { tx },
        PipeReader {
            rx,
            pending: Vec::new(),
            offset: 0,
        },
    )
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "reader dropped"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.offset >= self.pending.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.pending = chunk;
                    self.offset = 0;
                }
                // Writer gone: end of stream
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len() - self.offset);
        buf[..n].copy_from_slice(&self.pending[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }
}
