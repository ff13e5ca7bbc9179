//! Error types for arpc sessions.
//!
//! Two layers of failure exist on an RPC link:
//!
//! - [`RpcError`] is what a local caller sees: transport failures, a closed
//!   session, encoding problems, or a [`RemoteError`] reported by the peer.
//! - [`RemoteError`] is the tagged value that travels on the wire inside an
//!   `err` message. It carries the remote error class name and its arguments.
//!
//! Handler failures are always contained at the protocol boundary and turned
//! into [`RemoteError`]s; only transport failures terminate a session.

use std::fmt;

use serde_json::Value;
use thiserror::Error;

/// Remote error class used when a call names an unregistered command.
pub const NAME_ERROR: &str = "NameError";

/// Remote error class used when call arguments have the wrong shape.
pub const TYPE_ERROR: &str = "TypeError";

/// Remote error class used when call arguments have an unacceptable value.
pub const VALUE_ERROR: &str = "ValueError";

/// Remote error class reported when a handler panics.
pub const PANIC_ERROR: &str = "PanicError";

/// Remote error class reported when a handler result cannot be encoded.
pub const ENCODE_ERROR: &str = "EncodeError";

/// Errors surfaced to local callers of the session API.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Failed to open a connection to the peer.
    #[error("Connection to {addr} failed: {source}")]
    ConnectionFailed {
        /// Address that was dialed
        addr: String,
        /// Underlying socket error
        #[source]
        source: std::io::Error,
    },

    /// The peer closed the stream (EOF, possibly mid-line).
    #[error("Connection is closed")]
    ConnectionClosed,

    /// I/O error on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The session was closed before or while the call was outstanding.
    #[error("Session is closed")]
    SessionClosed,

    /// A message could not be serialized.
    #[error("Failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    /// The peer answered the call with an error.
    #[error("Remote error: {0}")]
    Remote(RemoteError),
}

impl RpcError {
    /// Returns the remote error if this failure was reported by the peer.
    pub fn as_remote(&self) -> Option<&RemoteError> {
        match self {
            RpcError::Remote(err) => Some(err),
            _ => None,
        }
    }

    /// True for failures caused by the link going away.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            RpcError::ConnectionClosed | RpcError::Io(_) | RpcError::SessionClosed
        )
    }
}

impl From<RemoteError> for RpcError {
    fn from(err: RemoteError) -> Self {
        RpcError::Remote(err)
    }
}

/// An error raised on one side of the link and reported to the other.
///
/// `class` is a free-form tag (conventionally an exception class name such as
/// `NameError` or `ValueError`) and `args` are the error arguments, usually a
/// single human-readable message.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteError {
    /// Remote error class name
    pub class: String,
    /// Error arguments as sent by the peer
    pub args: Vec<Value>,
}

impl RemoteError {
    /// Create a remote error with a single message argument.
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            args: vec![Value::String(message.into())],
        }
    }

    /// Create a remote error carrying arbitrary arguments.
    pub fn with_args(class: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            class: class.into(),
            args,
        }
    }

    /// The error sent back for an unregistered command name.
    pub fn name_error() -> Self {
        Self::new(NAME_ERROR, "No such command")
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(TYPE_ERROR, message)
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new(VALUE_ERROR, message)
    }

    /// First argument, when it is a string.
    pub fn message(&self) -> Option<&str> {
        self.args.first().and_then(Value::as_str)
    }

    /// True if this error carries the given class tag.
    pub fn is(&self, class: &str) -> bool {
        self.class == class
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.message(), self.args.len()) {
            (Some(message), 1) => write!(f, "{}: {}", self.class, message),
            (_, 0) => write!(f, "{}", self.class),
            _ => write!(f, "{}: {}", self.class, Value::Array(self.args.clone())),
        }
    }
}

impl std::error::Error for RemoteError {}
