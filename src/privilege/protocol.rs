//! Envelopes exchanged over the privilege channel
//!
//! Every message is one JSON document inside a netstring.

use super::ChannelError;
use crate::orchestrator::{ConnectionState, DesiredState, Event};
use crate::server::ServerDescriptor;
use crate::wire::{NetstringError, read_netstring, write_netstring};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Write};

/// A call on the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Request {
    Connect,
    Disconnect,
    ShutDown,
    Destroy,
    ConnectionState,
    DesiredConnectionState,
    ServerInfo,
    TimeLeft,
}

impl Request {
    pub fn method(&self) -> &'static str {
        match self {
            Request::Connect => "connect",
            Request::Disconnect => "disconnect",
            Request::ShutDown => "shut_down",
            Request::Destroy => "destroy",
            Request::ConnectionState => "connection_state",
            Request::DesiredConnectionState => "desired_connection_state",
            Request::ServerInfo => "server_info",
            Request::TimeLeft => "time_left",
        }
    }
}

/// Result of a call, one variant per request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "result", rename_all = "snake_case")]
pub enum Response {
    Connect,
    Disconnect,
    ShutDown,
    Destroy(bool),
    ConnectionState(ConnectionState),
    DesiredConnectionState(DesiredState),
    ServerInfo(Option<ServerDescriptor>),
    TimeLeft(Option<i64>),
}

impl Response {
    pub fn method(&self) -> &'static str {
        match self {
            Response::Connect => "connect",
            Response::Disconnect => "disconnect",
            Response::ShutDown => "shut_down",
            Response::Destroy(_) => "destroy",
            Response::ConnectionState(_) => "connection_state",
            Response::DesiredConnectionState(_) => "desired_connection_state",
            Response::ServerInfo(_) => "server_info",
            Response::TimeLeft(_) => "time_left",
        }
    }
}

/// A failure on the privileged side, carried back as data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub message: String,
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Envelope {
    Request(RequestBody),
    Reply(ReplyBody),
    Update(UpdateBody),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestBody {
    pub call: Request,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyBody {
    pub method: String,
    pub outcome: Result<Response, RemoteError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateBody {
    pub event: Event,
}

impl Envelope {
    pub fn request(call: Request) -> Self {
        Envelope::Request(RequestBody { call })
    }

    pub fn reply(method: &str, outcome: Result<Response, RemoteError>) -> Self {
        Envelope::Reply(ReplyBody {
            method: method.to_string(),
            outcome,
        })
    }

    pub fn update(event: Event) -> Self {
        Envelope::Update(UpdateBody { event })
    }
}

pub fn send<W: Write>(writer: &mut W, envelope: &Envelope) -> Result<(), ChannelError> {
    let payload = serde_json::to_vec(envelope)?;
    write_netstring(writer, &payload)?;
    Ok(())
}

/// Next envelope, or None once the peer has closed the stream
pub fn receive<R: Read>(reader: &mut R) -> Result<Option<Envelope>, ChannelError> {
    match read_netstring(reader) {
        Ok(payload) => Ok(Some(serde_json::from_slice(&payload)?)),
        Err(NetstringError::Short) => Ok(None),
        Err(e) => Err(e.into()),
    }
}
