//! wsrelay-server: WebSocket pub/sub and RPC relay.
//!
//! `serve` runs the relay as one process with local WebSocket listeners.
//! `backend` and `sweep` are one-shot invocations against the configured
//! routing store, the way a serverless runtime would run them.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use wsrelay_server::config::{Overrides, ServerConfig};
use wsrelay_server::delivery::HttpDelivery;
use wsrelay_server::handler::{status_code, BackendHandler, FanoutPolicy, GatewayResponse};
use wsrelay_server::server::RelayServer;
use wsrelay_server::store::{self, RoutingStore, StoreBackend};

/// wsrelay-server — WebSocket pub/sub and RPC relay
#[derive(Parser, Debug)]
#[command(name = "wsrelay-server", version, about = "WebSocket pub/sub and RPC relay")]
struct Cli {
    /// Config file path
    #[arg(long, global = true, default_value = "~/.wsrelay/config.toml")]
    config: String,

    /// Routing store backend (memory, dir)
    #[arg(long, global = true)]
    store: Option<StoreBackend>,

    /// Directory for the `dir` store backend
    #[arg(long, global = true)]
    store_path: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run client and backend WebSocket listeners
    Serve {
        /// Client listen port
        #[arg(short, long)]
        port: Option<u16>,

        /// Backend ingress listen port
        #[arg(long)]
        backend_port: Option<u16>,

        /// Base URL business functions are invoked under
        #[arg(long)]
        invoke_url: Option<String>,

        /// Publish fan-out policy (abort, continue)
        #[arg(long)]
        fanout: Option<FanoutPolicy>,

        /// Seconds between consistency sweeps (0 = off)
        #[arg(long)]
        sweep_interval: Option<u64>,
    },

    /// Handle one backend Response/Publish message and print the status
    Backend {
        /// Message JSON, or `-` to read stdin
        message: String,

        /// Publish fan-out policy (abort, continue)
        #[arg(long)]
        fanout: Option<FanoutPolicy>,
    },

    /// Remove half-written subscriptions and corrupt records
    Sweep,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut overrides = Overrides {
        store_backend: cli.store,
        store_path: cli.store_path.clone(),
        ..Overrides::default()
    };
    match &cli.command {
        Command::Serve {
            port,
            backend_port,
            invoke_url,
            fanout,
            sweep_interval,
        } => {
            overrides.port = *port;
            overrides.backend_port = *backend_port;
            overrides.invoke_url = invoke_url.clone();
            overrides.fanout = *fanout;
            overrides.sweep_interval = *sweep_interval;
        }
        Command::Backend { fanout, .. } => overrides.fanout = *fanout,
        Command::Sweep => {}
    }

    let config = match ServerConfig::load(Some(&PathBuf::from(&cli.config)), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Command::Serve { .. } => run_serve(config).await,
        Command::Backend { message, .. } => run_backend(config, &message).await,
        Command::Sweep => run_sweep(config).await,
    };

    if let Err(e) = result {
        error!(error = %format!("{e:#}"), "wsrelay-server failed");
        std::process::exit(1);
    }
}

async fn run_serve(config: ServerConfig) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.port,
        backend_port = config.backend_port,
        "starting wsrelay-server"
    );

    let kv = store::open(config.store_backend, &config.store_path)
        .context("failed to open routing store")?;
    let listening = RelayServer::new(config, kv)
        .start()
        .await
        .context("failed to start listeners")?;

    shutdown_signal().await;
    info!("received shutdown signal");
    listening.shutdown();
    info!("wsrelay-server stopped");
    Ok(())
}

async fn run_backend(config: ServerConfig, message: &str) -> Result<()> {
    let body = if message == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read message from stdin")?;
        buf
    } else {
        message.to_string()
    };

    let store = open_store(&config)?;
    let delivery = Arc::new(HttpDelivery::new(
        config.endpoint_scheme.clone(),
        config.auth_token.clone(),
        config.delivery_timeout_secs,
    ));
    let handler = BackendHandler::new(store, delivery)
        .with_fanout_policy(config.fanout)
        .with_stale_pruning(config.prune_stale);

    let result = handler.handle_bytes(body.as_bytes()).await;
    let response = GatewayResponse {
        status_code: status_code(&result),
    };
    println!("{}", serde_json::to_string(&response)?);

    result.map(|_| ()).context("backend message failed")
}

async fn run_sweep(config: ServerConfig) -> Result<()> {
    let store = open_store(&config)?;
    let report = store.sweep().await.context("sweep failed")?;
    println!(
        "forward orphans: {}\nreverse orphans: {}\ncorrupt records: {}",
        report.forward_orphans, report.reverse_orphans, report.corrupt
    );
    Ok(())
}

fn open_store(config: &ServerConfig) -> Result<RoutingStore> {
    if config.store_backend == StoreBackend::Memory {
        info!("memory store starts empty for a one-shot command; use --store dir");
    }
    let kv = store::open(config.store_backend, &config.store_path)
        .context("failed to open routing store")?;
    Ok(RoutingStore::new(kv))
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(_) => {
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
