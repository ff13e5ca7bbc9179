//! Establishing sessions: the dialing side and the listening side.
//!
//! Both sides run the same [`Session`] engine once the stream is up. The
//! only asymmetry is the handshake: a client sends a single `login` frame
//! without waiting for an answer, and a server that requires a password
//! reads exactly one frame and drops the connection silently unless it is a
//! matching `login`.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use arpc::net::{connect, ConnectOptions, Server, ServerOptions};
//!
//! let server = Server::bind("127.0.0.1:8267", Arc::new(registry), ServerOptions::default()).await?;
//! tokio::spawn(server.run());
//!
//! let session = connect("127.0.0.1:8267", ConnectOptions::default()).await?;
//! let six = session.call("inc", Args::new().arg(5)).await?;
//! ```

use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::io::{split, AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::codec::{FrameReader, Message};
use crate::error::RpcError;
use crate::registry::Registry;
use crate::session::{BoxedReader, BoxedWriter, Session};

/// Default heartbeat interval for both sides.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);

/// Pause after a failed `accept` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(150);

/// Settings for the dialing side.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Commands the server may call back
    pub registry: Arc<Registry>,
    /// Sent in a `login` frame right after connecting
    pub password: Option<String>,
    /// `None` disables heartbeats
    pub heartbeat: Option<Duration>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            password: None,
            heartbeat: Some(DEFAULT_HEARTBEAT),
        }
    }
}

impl ConnectOptions {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            ..Self::default()
        }
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn heartbeat(mut self, interval: Option<Duration>) -> Self {
        self.heartbeat = interval;
        self
    }
}

/// Settings for the listening side.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Required `login` password; `None` accepts every client
    pub password: Option<String>,
    /// `None` disables heartbeats
    pub heartbeat: Option<Duration>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            password: None,
            heartbeat: Some(DEFAULT_HEARTBEAT),
        }
    }
}

impl ServerOptions {
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn heartbeat(mut self, interval: Option<Duration>) -> Self {
        self.heartbeat = interval;
        self
    }
}

/// Connect to a server over TCP and start a session.
///
/// # Errors
///
/// Returns [`RpcError::ConnectionFailed`] if the connection cannot be
/// opened, or an I/O error if the `login` frame cannot be written.
pub async fn connect(addr: &str, options: ConnectOptions) -> Result<Session, RpcError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|source| RpcError::ConnectionFailed {
            addr: addr.to_string(),
            source,
        })?;
    // Frames are small and latency sensitive
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not disable Nagle on {}: {}", addr, e);
    }
    let peer = stream.peer_addr().ok();
    let session = start_client(stream, peer, options).await?;
    info!("Connected to {}", addr);
    Ok(session)
}

/// Start a client session over an already established stream.
pub async fn connect_stream<S>(stream: S, options: ConnectOptions) -> Result<Session, RpcError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    start_client(stream, None, options).await
}

async fn start_client<S>(
    stream: S,
    peer: Option<SocketAddr>,
    options: ConnectOptions,
) -> Result<Session, RpcError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = split(stream);
    let reader: BoxedReader = Box::new(reader);
    let writer: BoxedWriter = Box::new(writer);

    let session = Session::new(writer, options.registry, peer);
    if let Some(password) = options.password {
        session.send(&Message::Login { password }).await?;
    }
    session.start_heartbeat(options.heartbeat);
    session.start_dispatcher(FrameReader::new(reader));
    Ok(session)
}

/// TCP listener serving one session per accepted connection.
#[derive(Debug)]
pub struct Server {
    listener: TcpListener,
    registry: Arc<Registry>,
    options: ServerOptions,
}

impl Server {
    /// Bind the listening socket.
    pub async fn bind(
        addr: impl ToSocketAddrs,
        registry: Arc<Registry>,
        options: ServerOptions,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            registry,
            options,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections forever.
    ///
    /// Each connection is served by its own task. Accept failures (for
    /// example running out of file descriptors) are logged and retried after
    /// a short pause; they never stop the server.
    pub async fn run(self) {
        // Each distinct accept error kind is logged at warn once
        let mut seen_errors = HashSet::new();
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Could not disable Nagle for {}: {}", peer, e);
                    }
                    info!("Accepted connection from {}", peer);
                    let registry = Arc::clone(&self.registry);
                    let options = self.options.clone();
                    tokio::spawn(async move {
                        serve(stream, Some(peer), registry, &options).await;
                    });
                }
                Err(e) => {
                    if seen_errors.insert(e.kind()) {
                        warn!("Accept failed: {}", e);
                    } else {
                        debug!("Accept failed: {}", e);
                    }
                    sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }
}

/// Serve one accepted stream until its session closes.
///
/// If `options` requires a password, the first frame must be a matching
/// `login`. Anything else drops the connection without a reply.
pub async fn serve_stream<S>(stream: S, registry: Arc<Registry>, options: &ServerOptions)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    serve(stream, None, registry, options).await
}

async fn serve<S>(stream: S, peer: Option<SocketAddr>, registry: Arc<Registry>, options: &ServerOptions)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let label = peer.map(|p| p.to_string()).unwrap_or_else(|| "peer".to_string());
    let (reader, writer) = split(stream);
    let reader: BoxedReader = Box::new(reader);
    let mut writer: BoxedWriter = Box::new(writer);
    let mut frames = FrameReader::new(reader);

    if let Some(expected) = &options.password {
        // Judge the first JSON object as-is: a login of the wrong shape is a
        // rejection, not noise to skip over.
        match frames.next_object().await {
            Ok(first) => match check_login(&first, expected) {
                Ok(()) => debug!("{} logged in", label),
                Err(reason) => {
                    warn!("Rejected {}: {}", label, reason);
                    return drop_connection(&mut writer).await;
                }
            },
            Err(e) => {
                debug!("{} went away before logging in: {}", label, e);
                return;
            }
        }
    }

    let session = Session::new(writer, registry, peer);
    session.start_heartbeat(options.heartbeat);
    session.start_dispatcher(frames);
    session.closed().await;
    info!("Connection from {} finished", label);
}

/// Accept only `{"act":"login","password":<expected>}`.
fn check_login(first: &Map<String, Value>, expected: &str) -> Result<(), String> {
    match first.get("act").and_then(Value::as_str) {
        Some("login") => match first.get("password").and_then(Value::as_str) {
            Some(password) if password == expected => Ok(()),
            Some(_) => Err("wrong password".to_string()),
            None => Err("login without a password".to_string()),
        },
        Some(act) => Err(format!("expected login, got '{}'", act)),
        None => Err("expected login, got an untagged object".to_string()),
    }
}

async fn drop_connection(writer: &mut BoxedWriter) {
    use tokio::io::AsyncWriteExt;

    if let Err(e) = writer.shutdown().await {
        debug!("Ignoring error while dropping connection: {}", e);
    }
}
