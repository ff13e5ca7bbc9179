//! arpc - demo server and one-shot client.
//!
//! `arpc serve` exposes a small set of example commands; `arpc call` connects
//! to a server, performs one call and prints the result. Both read defaults
//! from the config file and `ARPC_*` environment variables; command-line
//! flags win over both.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use arpc::{connect, Args, Config, RemoteError, Registry, Server};

#[derive(Parser, Debug)]
#[command(name = "arpc", version, about = "Bidirectional RPC over line-delimited JSON")]
struct Cli {
    /// Config file (defaults to $ARPC_CONFIG or the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the example commands
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// Require this login password
        #[arg(long)]
        password: Option<String>,
        /// Heartbeat interval in seconds (0 disables)
        #[arg(long)]
        heartbeat: Option<u64>,
    },
    /// Call one command and print its result
    Call {
        /// Command name
        name: String,
        /// Positional arguments as JSON (bare words are sent as strings)
        args: Vec<String>,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        password: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "arpc=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();
    let mut config = Config::resolve(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Serve {
            host,
            port,
            password,
            heartbeat,
        } => {
            override_config(&mut config, host, port, password);
            if let Some(secs) = heartbeat {
                config.heartbeat_secs = secs;
            }
            serve(&config).await
        }
        Commands::Call {
            name,
            args,
            host,
            port,
            password,
        } => {
            override_config(&mut config, host, port, password);
            call(&config, &name, &args).await
        }
    }
}

fn override_config(config: &mut Config, host: Option<String>, port: Option<u16>, password: Option<String>) {
    if let Some(host) = host {
        config.host = host;
    }
    if let Some(port) = port {
        config.port = port;
    }
    if password.is_some() {
        config.password = password;
    }
}

/// The example command set.
fn demo_registry() -> Registry {
    let mut registry = Registry::new();
    registry
        .insert_value("version", json!({"major": 1, "minor": 0}))
        .register_sync("inc", |args| Ok(args.get::<i64>(0)? + 1))
        .register_async("dec", |session, args| async move {
            let u: i64 = args.get(0)?;
            for step in ["decrementing", "almost done"] {
                if let Err(e) = session.call("prn", Args::new().arg(step)).await {
                    tracing::debug!("prn callback failed: {}", e);
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Ok::<_, RemoteError>(u - 1)
        });

    let names = {
        let mut names = registry.names();
        names.push("list".to_string());
        names.sort();
        names
    };
    registry.insert_value("list", names);
    registry
}

async fn serve(config: &Config) -> Result<()> {
    let address = config.address();
    let server = Server::bind(&address, Arc::new(demo_registry()), config.server_options())
        .await
        .with_context(|| format!("Failed to bind {}", address))?;
    tracing::info!(
        "arpc v{} listening on {}",
        env!("CARGO_PKG_VERSION"),
        server.local_addr()?
    );

    tokio::select! {
        _ = server.run() => {}
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl-C")?;
            tracing::info!("Shutting down");
        }
    }
    Ok(())
}

async fn call(config: &Config, name: &str, raw_args: &[String]) -> Result<()> {
    let mut registry = Registry::new();
    registry.register_sync("prn", |args| {
        let text = args
            .positional
            .iter()
            .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
            .collect::<Vec<_>>()
            .join(" ");
        eprintln!("{}", text);
        Ok(Value::Null)
    });

    // Dialing 0.0.0.0 reaches the local host
    let host = if config.host == "0.0.0.0" { "127.0.0.1" } else { config.host.as_str() };
    let address = format!("{}:{}", host, config.port);
    let session = connect(&address, config.connect_options(Arc::new(registry)))
        .await
        .with_context(|| format!("Failed to connect to {}", address))?;

    let result = session.call(name, call_args(raw_args)).await;
    session.close().await;

    let value = result.with_context(|| format!("Call to '{}' failed", name))?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn call_args(raw_args: &[String]) -> Args {
    Args::from(raw_args.iter().map(String::as_str).map(parse_arg).collect::<Vec<_>>())
}

/// JSON when it parses, otherwise the raw text as a string.
fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
