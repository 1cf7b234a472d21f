//! Privileged end of the channel

use super::ChannelError;
use super::protocol::{self, Envelope, RemoteError, Request, Response};
use crate::orchestrator::{Controller, Event};
use std::any::Any;
use std::io::{Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Serve `controller` until the request pipe closes or a destroy succeeds
///
/// Every orchestrator event is pushed on `updates` while serving. The
/// update stream is closed on return.
pub fn serve<R, W, U>(
    controller: Arc<dyn Controller>,
    mut requests: R,
    mut replies: W,
    updates: U,
) -> Result<(), ChannelError>
where
    R: Read,
    W: Write,
    U: Write + Send + 'static,
{
    let updates = Arc::new(Mutex::new(Some(updates)));
    let sink = Arc::clone(&updates);
    let subscription = controller.subscribe(Arc::new(move |event: &Event| {
        let mut sink = sink.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(writer) = sink.as_mut() {
            if let Err(e) = protocol::send(writer, &Envelope::update(event.clone())) {
                warn!("Pushing update failed: {}", e);
            }
        }
    }));

    let result = request_loop(controller.as_ref(), &mut requests, &mut replies);

    controller.unsubscribe(subscription);
    drop(updates.lock().unwrap_or_else(PoisonError::into_inner).take());
    info!("Privilege channel closed");
    result
}

fn request_loop<R: Read, W: Write>(
    controller: &dyn Controller,
    requests: &mut R,
    replies: &mut W,
) -> Result<(), ChannelError> {
    loop {
        let call = match protocol::receive(requests) {
            Ok(Some(Envelope::Request(body))) => body.call,
            Ok(Some(other)) => {
                warn!("Unexpected envelope on request pipe: {:?}", other);
                continue;
            }
            Ok(None) => {
                debug!("Request pipe closed");
                return Ok(());
            }
            Err(ChannelError::Json(e)) => {
                warn!("Dropping undecodable request: {}", e);
                continue;
            }
            Err(e) => return Err(e),
        };

        debug!("Handling {}", call.method());
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| dispatch(controller, call)))
            .map_err(|payload| RemoteError {
                message: panic_message(payload.as_ref()),
            });
        if let Err(e) = &outcome {
            warn!("{} failed: {}", call.method(), e);
        }

        let stop = matches!(outcome, Ok(Response::Destroy(true)));
        protocol::send(replies, &Envelope::reply(call.method(), outcome))?;
        if stop {
            return Ok(());
        }
    }
}

fn dispatch(controller: &dyn Controller, call: Request) -> Response {
    match call {
        Request::Connect => {
            controller.connect();
            Response::Connect
        }
        Request::Disconnect => {
            controller.disconnect();
            Response::Disconnect
        }
        Request::ShutDown => {
            controller.shut_down();
            Response::ShutDown
        }
        Request::Destroy => Response::Destroy(controller.destroy()),
        Request::ConnectionState => Response::ConnectionState(controller.connection_state()),
        Request::DesiredConnectionState => {
            Response::DesiredConnectionState(controller.desired_connection_state())
        }
        Request::ServerInfo => Response::ServerInfo(controller.server_info()),
        Request::TimeLeft => Response::TimeLeft(controller.time_left()),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "request handler panicked".to_string()
    }
}
