//! Unprivileged end of the channel

use super::ChannelError;
use super::protocol::{self, Envelope, Request, Response};
use crate::orchestrator::{ConnectionState, DesiredState, Event, EventBus, SubscriptionId};
use crate::server::ServerDescriptor;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

struct Call<W, R> {
    requests: W,
    replies: R,
}

/// Drives a remote orchestrator; one call in flight at a time
pub struct PrivilegeClient<W, R> {
    call: Mutex<Call<W, R>>,
    bus: Arc<EventBus>,
    updates: Mutex<Option<JoinHandle<()>>>,
}

impl<W: Write, R: Read> PrivilegeClient<W, R> {
    /// Start the update loop on `updates` and return the client
    pub fn new<U>(requests: W, replies: R, updates: U) -> Self
    where
        U: Read + Send + 'static,
    {
        let bus = Arc::new(EventBus::new());
        let handle = {
            let bus = Arc::clone(&bus);
            let span = tracing::info_span!("privilege_client");
            thread::spawn(move || {
                let _enter = span.enter();
                receive_updates(updates, &bus);
            })
        };
        Self {
            call: Mutex::new(Call { requests, replies }),
            bus,
            updates: Mutex::new(Some(handle)),
        }
    }

    /// Send one request and wait for its reply
    pub fn call(&self, request: Request) -> Result<Response, ChannelError> {
        let mut call = self.call.lock().unwrap_or_else(PoisonError::into_inner);
        protocol::send(&mut call.requests, &Envelope::request(request))?;
        loop {
            let Some(envelope) = protocol::receive(&mut call.replies)? else {
                return Err(ChannelError::Closed);
            };
            match envelope {
                Envelope::Reply(reply) if reply.method == request.method() => {
                    return reply.outcome.map_err(ChannelError::Remote);
                }
                Envelope::Reply(reply) => {
                    warn!(
                        "Discarding reply to {} while waiting for {}",
                        reply.method,
                        request.method()
                    );
                }
                other => warn!("Unexpected envelope on reply pipe: {:?}", other),
            }
        }
    }

    fn unexpected(request: Request, response: Response) -> ChannelError {
        ChannelError::UnexpectedReply {
            expected: request.method(),
            got: response.method().to_string(),
        }
    }

    fn call_unit(&self, request: Request) -> Result<(), ChannelError> {
        match self.call(request)? {
            Response::Connect | Response::Disconnect | Response::ShutDown => Ok(()),
            other => Err(Self::unexpected(request, other)),
        }
    }

    pub fn connect(&self) -> Result<(), ChannelError> {
        self.call_unit(Request::Connect)
    }

    pub fn disconnect(&self) -> Result<(), ChannelError> {
        self.call_unit(Request::Disconnect)
    }

    pub fn shut_down(&self) -> Result<(), ChannelError> {
        self.call_unit(Request::ShutDown)
    }

    /// Stop the remote orchestrator; on success the update loop ends too
    pub fn destroy(&self) -> Result<bool, ChannelError> {
        let destroyed = match self.call(Request::Destroy)? {
            Response::Destroy(destroyed) => destroyed,
            other => return Err(Self::unexpected(Request::Destroy, other)),
        };
        if destroyed {
            let handle = self.updates.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    warn!("Update loop panicked");
                }
            }
        }
        Ok(destroyed)
    }

    pub fn connection_state(&self) -> Result<ConnectionState, ChannelError> {
        match self.call(Request::ConnectionState)? {
            Response::ConnectionState(state) => Ok(state),
            other => Err(Self::unexpected(Request::ConnectionState, other)),
        }
    }

    pub fn desired_connection_state(&self) -> Result<DesiredState, ChannelError> {
        match self.call(Request::DesiredConnectionState)? {
            Response::DesiredConnectionState(state) => Ok(state),
            other => Err(Self::unexpected(Request::DesiredConnectionState, other)),
        }
    }

    pub fn server_info(&self) -> Result<Option<ServerDescriptor>, ChannelError> {
        match self.call(Request::ServerInfo)? {
            Response::ServerInfo(server) => Ok(server),
            other => Err(Self::unexpected(Request::ServerInfo, other)),
        }
    }

    pub fn time_left(&self) -> Result<Option<i64>, ChannelError> {
        match self.call(Request::TimeLeft)? {
            Response::TimeLeft(left) => Ok(left),
            other => Err(Self::unexpected(Request::TimeLeft, other)),
        }
    }

    /// Listen to events pushed by the worker
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.bus.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }
}

fn receive_updates<U: Read>(mut updates: U, bus: &EventBus) {
    loop {
        match protocol::receive(&mut updates) {
            Ok(Some(Envelope::Update(update))) => bus.publish(&update.event),
            Ok(Some(other)) => warn!("Unexpected envelope on update pipe: {:?}", other),
            Ok(None) => {
                debug!("Update pipe closed");
                return;
            }
            Err(e) => {
                warn!("Update pipe failed: {}", e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::privilege::pipe::memory_pipe;
    use crate::privilege::protocol::RemoteError;

    #[test]
    fn test_reply_mismatch_is_skipped() {
        let (requests, _request_reader) = memory_pipe();
        let (mut reply_writer, replies) = memory_pipe();
        let (_update_writer, updates) = memory_pipe();

        protocol::send(
            &mut reply_writer,
            &Envelope::reply("server_info", Ok(Response::ServerInfo(None))),
        )
        .unwrap();
        protocol::send(
            &mut reply_writer,
            &Envelope::reply("time_left", Ok(Response::TimeLeft(Some(3600)))),
        )
        .unwrap();

        let client = PrivilegeClient::new(requests, replies, updates);
        assert_eq!(client.time_left().unwrap(), Some(3600));
    }

    #[test]
    fn test_remote_error_is_raised() {
        let (requests, _request_reader) = memory_pipe();
        let (mut reply_writer, replies) = memory_pipe();
        let (_update_writer, updates) = memory_pipe();

        protocol::send(
            &mut reply_writer,
            &Envelope::reply(
                "connect",
                Err(RemoteError {
                    message: "boom".to_string(),
                }),
            ),
        )
        .unwrap();

        let client = PrivilegeClient::new(requests, replies, updates);
        match client.connect() {
            Err(ChannelError::Remote(e)) => assert_eq!(e.message, "boom"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_closed_reply_pipe() {
        let (requests, _request_reader) = memory_pipe();
        let (reply_writer, replies) = memory_pipe();
        let (_update_writer, updates) = memory_pipe();
        drop(reply_writer);

        let client = PrivilegeClient::new(requests, replies, updates);
        assert!(matches!(client.connection_state(), Err(ChannelError::Closed)));
    }
}
