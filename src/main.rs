//! editor-bridge daemon
//!
//! Runs the host cooperative thread with the built-in command set and exposes
//! it over the framed TCP listener and, when a hub URL is configured, the
//! WebSocket client. Stops cleanly on Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use editor_bridge::config::BridgeConfig;
use editor_bridge::dispatcher::CommandQueue;
use editor_bridge::heartbeat::HeartbeatEmitter;
use editor_bridge::host::HostRuntime;
use editor_bridge::ports::PortRegistry;
use editor_bridge::registry::BuiltinCommands;
use editor_bridge::transport::{BridgeTransport, TcpBridgeServer, WsBridgeClient};

#[derive(Parser, Debug)]
#[command(name = "editor-bridge")]
#[command(about = "Loopback RPC bridge between an external controller and an editor host")]
struct Args {
    /// Project directory the host has open
    #[arg(long)]
    project: Option<PathBuf>,

    /// Listen on this port instead of the persisted one
    #[arg(long)]
    port: Option<u16>,

    /// Hub WebSocket URL; enables the hub client
    #[arg(long)]
    ws_url: Option<String>,

    /// Bearer token for the hub
    #[arg(long)]
    ws_token: Option<String>,

    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Disable the TCP listener
    #[arg(long)]
    no_tcp: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config =
        BridgeConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(project) = args.project {
        config.project.path = project;
    }
    if args.port.is_some() {
        config.tcp.port = args.port;
    }
    if args.ws_url.is_some() {
        config.websocket.url = args.ws_url;
    }
    if args.ws_token.is_some() {
        config.websocket.token = args.ws_token;
    }

    if args.no_tcp && config.websocket.url.is_none() {
        anyhow::bail!("Nothing to run: TCP listener disabled and no hub URL configured");
    }

    let project = config.project_identity();
    let state_dir = config.resolved_state_dir()?;
    info!(
        project = %project.path.display(),
        hash = %project.hash(),
        state_dir = %state_dir.display(),
        "Loaded configuration"
    );

    let host = HostRuntime::spawn(config.host.tick_interval())?;
    let handler = Arc::new(BuiltinCommands::new(project.clone()));
    let queue = CommandQueue::new(handler, config.tcp.command_timeout());
    queue
        .attach(&host.handle())
        .context("Failed to attach command queue to host")?;

    let mut transports: Vec<Box<dyn BridgeTransport>> = Vec::new();

    if !args.no_tcp {
        let heartbeat = Arc::new(HeartbeatEmitter::new(&state_dir, project.clone()));
        let ports = Arc::new(PortRegistry::new(
            &state_dir,
            &project,
            config.tcp.default_port,
        ));
        transports.push(Box::new(TcpBridgeServer::new(
            config.tcp.clone(),
            config.heartbeat.interval(),
            queue.clone(),
            host.handle(),
            heartbeat,
            ports,
        )));
    }

    if config.websocket.url.is_some() {
        let client = WsBridgeClient::new(
            config.websocket.clone(),
            project.clone(),
            queue.clone(),
            host.handle(),
        )
        .with_state_dir(&state_dir)
        .with_marshal_timeout(config.host.marshal_timeout());
        transports.push(Box::new(client));
    }

    let mut started = 0;
    for transport in &transports {
        match transport.start().await {
            Ok(()) => started += 1,
            Err(e) => {
                warn!(transport = transport.name(), error = %format!("{e:#}"), "Transport failed to start");
            }
        }
    }

    if started == 0 {
        for transport in &transports {
            transport.stop().await;
        }
        host.shutdown();
        anyhow::bail!("No transport could be started");
    }

    info!("Bridge running; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Shutting down");
    for transport in &transports {
        transport.stop().await;
    }
    host.shutdown();

    Ok(())
}
