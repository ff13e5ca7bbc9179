//! Command registry: the names a session answers to.
//!
//! A [`Registry`] is built once before serving and then shared read-only by
//! every session. Each entry is fixed at registration time to one of three
//! kinds, and dispatch is decided by that kind alone:
//!
//! - [`Command::Value`] answers immediately with a stored datum
//! - [`Command::Sync`] runs to completion inside the dispatcher; it must
//!   return quickly and cannot call back into the peer
//! - [`Command::Async`] is invoked with the owning [`Session`] and its future
//!   is spawned as an independent task, so it may sleep and issue calls of
//!   its own
//!
//! # Example
//!
//! ```ignore
//! let mut registry = Registry::new();
//! registry.insert_value("version", json!({"major": 1, "minor": 0}));
//! registry.register_sync("inc", |args| Ok(args.get::<i64>(0)? + 1));
//! registry.register_async("dec", |session, args| async move {
//!     let u: i64 = args.get(0)?;
//!     session.call("prn", Args::new().arg("working")).await.ok();
//!     Ok::<_, RemoteError>(u - 1)
//! });
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{RemoteError, ENCODE_ERROR};
use crate::session::Session;

/// Outcome of a handler invocation, already converted to wire form.
pub type HandlerResult = Result<Value, RemoteError>;

/// Boxed future returned by an async handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send + 'static>>;

/// Handler run inline by the dispatcher.
pub type SyncHandler = Arc<dyn Fn(Args) -> HandlerResult + Send + Sync>;

/// Handler whose future is spawned as its own task.
pub type AsyncHandler = Arc<dyn Fn(Session, Args) -> HandlerFuture + Send + Sync>;

/// One registry entry.
#[derive(Clone)]
pub enum Command {
    /// Plain datum returned as-is
    Value(Value),
    /// Synchronous handler
    Sync(SyncHandler),
    /// Suspendable handler
    Async(AsyncHandler),
}

impl Command {
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Value(_) => "value",
            Command::Sync(_) => "sync",
            Command::Async(_) => "async",
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Command::Sync(_) => f.write_str("Sync(..)"),
            Command::Async(_) => f.write_str("Async(..)"),
        }
    }
}

/// Mapping from command name to [`Command`].
#[derive(Clone, Debug, Default)]
pub struct Registry {
    commands: HashMap<String, Command>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plain value. Replaces any previous entry of that name.
    pub fn insert_value(&mut self, name: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.commands.insert(name.into(), Command::Value(value.into()));
        self
    }

    /// Register a synchronous handler.
    ///
    /// The handler runs on the dispatcher task. It must not block, and it
    /// cannot issue calls to the peer (the dispatcher would be waiting on
    /// itself).
    pub fn register_sync<F, R>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Args) -> Result<R, RemoteError> + Send + Sync + 'static,
        R: Serialize,
    {
        let handler: SyncHandler = Arc::new(move |args| handler(args).and_then(to_wire));
        self.commands.insert(name.into(), Command::Sync(handler));
        self
    }

    /// Register a suspendable handler.
    ///
    /// Each invocation receives the [`Session`] it arrived on, which it may
    /// use to call back into the peer before returning.
    pub fn register_async<F, Fut, R>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Session, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, RemoteError>> + Send + 'static,
        R: Serialize,
    {
        let handler: AsyncHandler = Arc::new(move |session, args| -> HandlerFuture {
            let fut = handler(session, args);
            Box::pin(async move { fut.await.and_then(to_wire) })
        });
        self.commands.insert(name.into(), Command::Async(handler));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Command> {
        self.commands.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    /// Registered command names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.commands.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

fn to_wire<R: Serialize>(result: R) -> HandlerResult {
    serde_json::to_value(result).map_err(|e| RemoteError::new(ENCODE_ERROR, e.to_string()))
}

/// Positional and named arguments of a call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    /// Ordered arguments
    pub positional: Vec<Value>,
    /// Keyword arguments
    pub named: Map<String, Value>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Set a named argument.
    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.named.insert(key.into(), value.into());
        self
    }

    /// Positional argument `index` converted to `T`.
    ///
    /// # Errors
    ///
    /// Returns a `TypeError` remote error if the argument is missing or has
    /// the wrong type, so handlers can simply use `?`.
    pub fn get<T: DeserializeOwned>(&self, index: usize) -> Result<T, RemoteError> {
        let value = self.positional.get(index).ok_or_else(|| {
            RemoteError::type_error(format!(
                "missing positional argument {} (got {})",
                index,
                self.positional.len()
            ))
        })?;
        serde_json::from_value(value.clone())
            .map_err(|e| RemoteError::type_error(format!("argument {}: {}", index, e)))
    }

    /// Named argument `key` converted to `T`, or `None` when absent.
    pub fn get_named<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, RemoteError> {
        match self.named.get(key) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| RemoteError::type_error(format!("argument '{}': {}", key, e))),
        }
    }

    pub fn len(&self) -> usize {
        self.positional.len() + self.named.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.named.is_empty()
    }
}

impl From<Vec<Value>> for Args {
    fn from(positional: Vec<Value>) -> Self {
        Self {
            positional,
            named: Map::new(),
        }
    }
}
