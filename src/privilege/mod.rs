//! Privilege separation channel
//!
//! The orchestrator needs root; the UI must not run as root. The privileged
//! worker serves the orchestrator over three one-way pipes (requests,
//! replies, updates) and the unprivileged side drives it through a
//! [`PrivilegeClient`] with the same surface.

pub mod client;
pub mod pipe;
pub mod protocol;
pub mod server;

pub use client::PrivilegeClient;
pub use pipe::{PipePaths, memory_pipe};
pub use protocol::{Envelope, RemoteError, Request, Response};
pub use server::serve;

use crate::wire::NetstringError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Pipe error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Framing error: {0}")]
    Framing(#[from] NetstringError),
    #[error("Malformed envelope: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Remote error: {0}")]
    Remote(RemoteError),
    #[error("Expected a reply to {expected}, got {got}")]
    UnexpectedReply { expected: &'static str, got: String },
    #[error("Privilege channel closed")]
    Closed,
}
