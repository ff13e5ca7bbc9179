//! arpc - bidirectional asynchronous RPC over a single byte stream.
//!
//! Two cooperating processes (say a control host and a small device) hold one
//! duplex stream between them and either side may call commands registered
//! on the other. Frames are line-delimited JSON.
//!
//! - `codec` - wire messages and line framing
//! - `registry` - commands a session answers to
//! - `session` - the connection engine: correlation, dispatch, heartbeat, teardown
//! - `net` - TCP connector and listener
//! - `config` - host, port, password and heartbeat settings
//! - `error` - local and remote error types
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use arpc::{connect, Args, ConnectOptions, Registry};
//!
//! let mut registry = Registry::new();
//! registry.register_sync("prn", |args| {
//!     println!("{}", args.get::<String>(0)?);
//!     Ok(())
//! });
//!
//! let session = connect("192.168.4.1:8267", ConnectOptions::new(Arc::new(registry)).password("rrr")).await?;
//! let six: i64 = session.call_as("inc", Args::new().arg(5)).await?;
//! session.close().await;
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod net;
pub mod registry;
pub mod session;

pub use config::Config;
pub use error::{RemoteError, RpcError};
pub use net::{connect, connect_stream, serve_stream, ConnectOptions, Server, ServerOptions};
pub use registry::{Args, Command, Registry};
pub use session::Session;
