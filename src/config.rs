//! Connection settings shared by the client and server entry points.
//!
//! Resolution order, lowest to highest precedence:
//! 1. Built-in defaults (`0.0.0.0:8267`, no password, 30s heartbeat)
//! 2. JSON config file (`$ARPC_CONFIG`, else `<config dir>/arpc/config.json`)
//! 3. Environment overrides (`ARPC_HOST`, `ARPC_PORT`, `ARPC_PASSWORD`,
//!    `ARPC_HEARTBEAT`)
//!
//! ```json
//! {"host": "192.168.4.1", "port": 8267, "password": "rrr", "heartbeat_secs": 30}
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::net::{ConnectOptions, ServerOptions};
use crate::registry::Registry;

/// Default TCP port.
pub const DEFAULT_PORT: u16 = 8267;

/// Default heartbeat interval in seconds.
pub const DEFAULT_HEARTBEAT_SECS: u64 = 30;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid value for {var}: {value:?}")]
    Env { var: &'static str, value: String },
}

/// Connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address to bind (server) or dial (client)
    pub host: String,
    pub port: u16,
    /// Login password; `None` disables authentication
    pub password: Option<String>,
    /// Heartbeat interval; 0 disables heartbeats
    pub heartbeat_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            password: None,
            heartbeat_secs: DEFAULT_HEARTBEAT_SECS,
        }
    }
}

/// Resolve the default config file path.
///
/// `$ARPC_CONFIG` wins when set; otherwise the platform config directory
/// (`~/.config` on Linux, `~/Library/Application Support` on macOS).
pub fn default_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("ARPC_CONFIG") {
        return Some(PathBuf::from(path));
    }
    dirs::config_dir().map(|dir| dir.join("arpc").join("config.json"))
}

impl Config {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Defaults, then the config file, then environment overrides.
    ///
    /// An explicit `path` must exist. The default path is optional.
    pub fn resolve(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => match default_config_path() {
                Some(path) if path.exists() => Self::load(&path)?,
                Some(path) => {
                    debug!("No config file at {}, using defaults", path.display());
                    Self::default()
                }
                None => Self::default(),
            },
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    /// Apply `ARPC_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("ARPC_HOST") {
            self.host = host;
        }
        if let Some(value) = lookup("ARPC_PORT") {
            self.port = value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Env { var: "ARPC_PORT", value })?;
        }
        if let Some(password) = lookup("ARPC_PASSWORD") {
            self.password = (!password.is_empty()).then_some(password);
        }
        if let Some(value) = lookup("ARPC_HEARTBEAT") {
            self.heartbeat_secs = value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Env { var: "ARPC_HEARTBEAT", value })?;
        }
        Ok(())
    }

    /// Heartbeat interval, `None` when disabled.
    pub fn heartbeat(&self) -> Option<Duration> {
        (self.heartbeat_secs > 0).then(|| Duration::from_secs(self.heartbeat_secs))
    }

    /// `host:port`, suitable for dialing or binding.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_options(&self, registry: Arc<Registry>) -> ConnectOptions {
        ConnectOptions {
            registry,
            password: self.password.clone(),
            heartbeat: self.heartbeat(),
        }
    }

    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            password: self.password.clone(),
            heartbeat: self.heartbeat(),
        }
    }
}
