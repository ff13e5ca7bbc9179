//! One established RPC connection and its state.
//!
//! A [`Session`] is a cheap clonable handle. Every clone refers to the same
//! connection: the dispatcher task, the heartbeat task and every spawned
//! handler hold one, and an async handler receives the session its call
//! arrived on so it can call back into the peer.
//!
//! # Lifecycle
//!
//! ```text
//!  connect / accept
//!        │
//!        ▼
//!  ┌───────────┐  dispatcher exits (EOF, I/O error)  ┌──────────┐
//!  │   Open    │ ───────────────────────────────────▶│  Closed  │
//!  └───────────┘        or close() is called         └──────────┘
//! ```
//!
//! Teardown fails every pending call, cancels the heartbeat and shuts the
//! write half down. A closed session never reopens.
//!
//! # Concurrency
//!
//! Sessions run on the multi-threaded or current-thread tokio runtime alike.
//! The write half sits behind an async mutex held for exactly one frame, so
//! heartbeats, replies and outbound calls never interleave partial lines.
//! The pending table is a plain mutex that is never held across an `.await`.

mod dispatch;
mod heartbeat;

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::codec::{self, FrameReader, Message, RequestId};
use crate::error::{RemoteError, RpcError};
use crate::registry::{Args, Registry};

/// Type-erased write half of the transport.
pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Type-erased read half of the transport.
pub(crate) type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// How long teardown waits for an in-flight frame before giving up on a
/// graceful shutdown of the write half.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

type Outcome = Result<Value, RpcError>;

/// Outstanding outbound calls.
#[derive(Default)]
struct PendingTable {
    waiters: HashMap<RequestId, oneshot::Sender<Outcome>>,
    /// Set once by teardown; later registrations are refused.
    closed: bool,
}

#[derive(Default)]
struct Tasks {
    dispatcher: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
}

struct Inner {
    registry: Arc<Registry>,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    pending: Mutex<PendingTable>,
    tasks: Mutex<Tasks>,
    next_rid: AtomicU64,
    open: AtomicBool,
    closed_tx: watch::Sender<bool>,
    peer: Option<SocketAddr>,
}

/// Handle to an RPC session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Session {
    /// Create an open session around the write half of a stream.
    ///
    /// The caller starts the dispatcher (and optionally the heartbeat)
    /// afterwards; see [`crate::net`].
    pub(crate) fn new(
        writer: BoxedWriter,
        registry: Arc<Registry>,
        peer: Option<SocketAddr>,
    ) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                registry,
                writer: tokio::sync::Mutex::new(Some(writer)),
                pending: Mutex::new(PendingTable::default()),
                tasks: Mutex::new(Tasks::default()),
                next_rid: AtomicU64::new(1),
                open: AtomicBool::new(true),
                closed_tx,
                peer,
            }),
        }
    }

    /// Spawn the dispatcher task reading from `reader`.
    pub(crate) fn start_dispatcher(&self, reader: FrameReader<BoxedReader>) {
        let handle = tokio::spawn(dispatch::run(self.clone(), reader));
        lock(&self.inner.tasks).dispatcher = Some(handle);
    }

    /// Spawn the heartbeat task. `None` or a zero interval disables it.
    pub(crate) fn start_heartbeat(&self, interval: Option<Duration>) {
        let Some(interval) = interval.filter(|i| !i.is_zero()) else {
            return;
        };
        let handle = tokio::spawn(heartbeat::run(self.clone(), interval));
        lock(&self.inner.tasks).heartbeat = Some(handle);
    }

    /// Commands this session answers to.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    /// Remote address, when the transport has one.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer
    }

    pub fn is_closed(&self) -> bool {
        !self.inner.open.load(Ordering::SeqCst)
    }

    /// Wait until the session has been torn down.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed_tx.subscribe();
        // The sender lives as long as `self`, so this only returns once closed.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Call a command on the peer and wait for its result.
    ///
    /// # Arguments
    ///
    /// * `name` - Command name registered on the peer
    /// * `args` - Positional and named arguments
    ///
    /// # Errors
    ///
    /// - [`RpcError::SessionClosed`] if the session is closed, or closes
    ///   while the call is outstanding
    /// - [`RpcError::ConnectionClosed`] / [`RpcError::Io`] if the link drops
    ///   while the call is outstanding or the call cannot be written
    /// - [`RpcError::Remote`] if the peer answered with an error
    ///
    /// # Example
    ///
    /// ```ignore
    /// let six = session.call("inc", Args::new().arg(5)).await?;
    /// ```
    pub async fn call(&self, name: &str, args: Args) -> Result<Value, RpcError> {
        let (rid, rx) = self.register_pending()?;
        // Drops the table entry if this future is cancelled or the write fails.
        let _entry = PendingEntry {
            inner: &self.inner,
            rid,
        };

        let message = Message::Call {
            rid,
            name: name.to_string(),
            args: args.positional,
            kargs: args.named,
        };
        self.send(&message).await?;

        rx.await.unwrap_or(Err(RpcError::SessionClosed))
    }

    /// Like [`Session::call`], converting the result to `T`.
    ///
    /// A result of the wrong shape is reported as a local `TypeError`
    /// remote error.
    pub async fn call_as<T: DeserializeOwned>(&self, name: &str, args: Args) -> Result<T, RpcError> {
        let value = self.call(name, args).await?;
        serde_json::from_value(value).map_err(|e| {
            RpcError::Remote(RemoteError::type_error(format!(
                "unexpected result from '{}': {}",
                name, e
            )))
        })
    }

    /// Close the session.
    ///
    /// Cancels the dispatcher and the heartbeat, fails every pending call with
    /// [`RpcError::SessionClosed`], and shuts the stream down. Errors while
    /// closing the stream are ignored since the link may already be broken.
    /// Calling `close` more than once is harmless.
    pub async fn close(&self) {
        let was_open = self.inner.open.swap(false, Ordering::SeqCst);
        let (dispatcher, heartbeat) = {
            let mut tasks = lock(&self.inner.tasks);
            (tasks.dispatcher.take(), tasks.heartbeat.take())
        };

        // Handlers never run on the dispatcher task, so it is always safe
        // to abort and await it here.
        if let Some(handle) = dispatcher {
            handle.abort();
            let _ = handle.await;
        }
        if let Some(handle) = heartbeat {
            handle.abort();
            let _ = handle.await;
        }

        self.teardown(|| RpcError::SessionClosed).await;
        if was_open {
            info!("Session with {} closed", self.peer_label());
        }
    }

    /// Write one message as a single frame.
    pub(crate) async fn send(&self, message: &Message) -> Result<(), RpcError> {
        let mut writer = self.inner.writer.lock().await;
        let writer = writer.as_mut().ok_or(RpcError::SessionClosed)?;
        codec::write_message(writer, message).await
    }

    fn register_pending(&self) -> Result<(RequestId, oneshot::Receiver<Outcome>), RpcError> {
        if self.is_closed() {
            return Err(RpcError::SessionClosed);
        }
        let mut table = lock(&self.inner.pending);
        if table.closed {
            return Err(RpcError::SessionClosed);
        }
        let rid = loop {
            let rid = self.inner.next_rid.fetch_add(1, Ordering::Relaxed);
            if !table.waiters.contains_key(&rid) {
                break rid;
            }
        };
        let (tx, rx) = oneshot::channel();
        table.waiters.insert(rid, tx);
        Ok((rid, rx))
    }

    /// Deliver the outcome of an outbound call. Unknown ids are ignored.
    pub(crate) fn resolve(&self, rid: RequestId, outcome: Outcome) {
        let waiter = lock(&self.inner.pending).waiters.remove(&rid);
        match waiter {
            Some(tx) => {
                // The caller may have given up already.
                let _ = tx.send(outcome);
            }
            None => debug!("Ignoring result for unknown request {}", rid),
        }
    }

    /// Release every pending call with an error built by `reason`.
    fn fail_pending(&self, reason: impl Fn() -> RpcError) {
        let waiters = {
            let mut table = lock(&self.inner.pending);
            table.closed = true;
            std::mem::take(&mut table.waiters)
        };
        if !waiters.is_empty() {
            debug!("Failing {} pending request(s)", waiters.len());
        }
        for (_, tx) in waiters {
            let _ = tx.send(Err(reason()));
        }
    }

    /// Shared end of both close paths. Idempotent.
    pub(crate) async fn teardown(&self, reason: impl Fn() -> RpcError) {
        self.inner.open.store(false, Ordering::SeqCst);
        if let Some(handle) = lock(&self.inner.tasks).heartbeat.take() {
            handle.abort();
        }
        self.fail_pending(reason);

        match timeout(CLOSE_TIMEOUT, self.inner.writer.lock()).await {
            Ok(mut guard) => {
                if let Some(mut writer) = guard.take() {
                    if let Err(e) = writer.shutdown().await {
                        debug!("Ignoring error while closing stream: {}", e);
                    }
                }
            }
            Err(_) => debug!("Writer still busy after {:?}, not shutting it down", CLOSE_TIMEOUT),
        }

        self.inner.closed_tx.send_replace(true);
    }

    pub(crate) fn peer_label(&self) -> String {
        self.inner
            .peer
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "peer".to_string())
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        lock(&self.inner.pending).waiters.len()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.inner.peer)
            .field("closed", &self.is_closed())
            .field("commands", &self.inner.registry.len())
            .finish()
    }
}

/// Removes a pending entry when the call finishes or is abandoned.
struct PendingEntry<'a> {
    inner: &'a Inner,
    rid: RequestId,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        lock(&self.inner.pending).waiters.remove(&self.rid);
    }
}
