//! Inbound message loop.
//!
//! One dispatcher task per session reads frames in order and routes them.
//! Value and sync commands are answered before the next frame is read; async
//! commands are spawned so the loop keeps reading while they run (and their
//! callbacks to the peer can be answered).

use std::panic::{catch_unwind, AssertUnwindSafe};

use serde_json::Value;
use tracing::{debug, trace};

use super::{BoxedReader, Session};
use crate::codec::{FrameReader, Message, RequestId};
use crate::error::{RemoteError, RpcError, PANIC_ERROR};
use crate::registry::{Args, Command, HandlerResult};

pub(super) async fn run(session: Session, mut reader: FrameReader<BoxedReader>) {
    let exit = loop {
        if session.is_closed() {
            break RpcError::SessionClosed;
        }
        match reader.next_message().await {
            Ok(message) => handle(&session, message).await,
            Err(e) => break e,
        }
    };

    match exit {
        RpcError::Io(e) => {
            debug!("Read from {} failed: {}", session.peer_label(), e);
            let (kind, text) = (e.kind(), e.to_string());
            session
                .teardown(|| RpcError::Io(std::io::Error::new(kind, text.clone())))
                .await;
        }
        RpcError::ConnectionClosed => {
            debug!("{} closed the connection", session.peer_label());
            session.teardown(|| RpcError::ConnectionClosed).await;
        }
        _ => session.teardown(|| RpcError::SessionClosed).await,
    }
}

async fn handle(session: &Session, message: Message) {
    match message {
        Message::Call {
            rid,
            name,
            args,
            kargs,
        } => {
            let args = Args {
                positional: args,
                named: kargs,
            };
            dispatch_call(session, rid, &name, args).await;
        }
        Message::Response { rid, res } => session.resolve(rid, Ok(res)),
        Message::Error { rid, cls, args } => {
            session.resolve(rid, Err(RemoteError::with_args(cls, args).into()))
        }
        Message::Heartbeat => trace!("Heartbeat from {}", session.peer_label()),
        other => trace!("Ignoring '{}' message", other.kind()),
    }
}

async fn dispatch_call(session: &Session, rid: RequestId, name: &str, args: Args) {
    let command = session.registry().get(name).cloned();
    match command {
        None => {
            debug!("Call to unknown command '{}'", name);
            reply(session, rid, Err(RemoteError::name_error())).await;
        }
        Some(Command::Value(value)) => reply(session, rid, Ok(value)).await,
        Some(Command::Sync(handler)) => {
            let result = catch_unwind(AssertUnwindSafe(|| handler(args)))
                .unwrap_or_else(|panic| Err(panic_error(name, panic.as_ref())));
            reply(session, rid, result).await;
        }
        Some(Command::Async(handler)) => {
            let session = session.clone();
            let name = name.to_string();
            tokio::spawn(async move {
                // The handler itself runs in the inner task so a panic while
                // building its future is caught the same way as one inside it.
                let caller = session.clone();
                let invocation = tokio::spawn(async move { handler(caller, args).await });
                let result = match invocation.await {
                    Ok(result) => result,
                    Err(e) if e.is_panic() => Err(panic_error(&name, e.into_panic().as_ref())),
                    // Cancelled by runtime shutdown; nobody is left to answer.
                    Err(_) => return,
                };
                reply(&session, rid, result).await;
            });
        }
    }
}

/// Send the outcome of an inbound call back to the peer.
async fn reply(session: &Session, rid: RequestId, result: HandlerResult) {
    let message = match result {
        Ok(res) => Message::Response { rid, res },
        Err(err) => {
            debug!("Request {} failed: {}", rid, err);
            Message::Error {
                rid,
                cls: err.class,
                args: err.args,
            }
        }
    };
    if let Err(e) = session.send(&message).await {
        debug!("Could not answer request {}: {}", rid, e);
    }
}

fn panic_error(name: &str, panic: &(dyn std::any::Any + Send)) -> RemoteError {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_string());
    RemoteError::with_args(
        PANIC_ERROR,
        vec![Value::String(format!("'{}' panicked: {}", name, detail))],
    )
}
