//! linewire - sample time server and client
//!
//! `linewire serve` pushes the current epoch milliseconds to every client
//! once per heartbeat. `linewire connect` greets a server and prints what it
//! receives.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use linewire::{
    config::{Config, ConfigManager},
    demo::{PrintingClientInitializer, TimeServerInitializer},
    transport::{DEFAULT_SHUTDOWN_GRACE, QUIET_PERIOD},
    AcceptorBuilder, ConnectorBuilder, ShutdownCoordinator, TransportBuilder,
};

/// Connect timeout of the sample client, in seconds
const CLIENT_CONNECT_TIMEOUT_SECS: u64 = 20;

/// CLI arguments for linewire
#[derive(Parser, Debug)]
#[command(name = "linewire")]
#[command(about = "linewire - line-oriented TCP time server and client")]
#[command(version)]
#[command(long_about = "
linewire - line-oriented TCP time server and client

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  LINEWIRE_BIND_ADDR                - Server bind address (e.g., 0.0.0.0:9000)
  LINEWIRE_HOST / LINEWIRE_PORT     - Client target
  LINEWIRE_CONNECT_TIMEOUT          - Connect timeout (e.g., 1s, 500ms)
  LINEWIRE_USE_WORKER_THREAD_GROUP  - Run I/O on dedicated threads (true/false)
  LINEWIRE_LINGER                   - SO_LINGER (e.g., 0s, or 'disabled')
  LINEWIRE_LOG_LEVEL                - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(
        short,
        long,
        default_value = "linewire.toml",
        help = "Path to configuration file"
    )]
    pub config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", help = "Log level")]
    pub log_level: String,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Run I/O on the main runtime instead of dedicated thread groups
    #[arg(long, global = true, help = "Disable dedicated thread groups")]
    pub inline: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the time server
    Serve {
        /// Port to listen on (overrides config file)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Connect to a time server and print what it sends
    Connect {
        /// Server host (overrides config file)
        #[arg(long)]
        host: Option<String>,

        /// Server port (overrides config file)
        #[arg(short, long)]
        port: Option<u16>,

        /// Connect timeout in seconds
        #[arg(long)]
        connect_timeout: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    init_tracing(&args)?;

    info!("Starting linewire v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration with priority: CLI args > config file > environment > defaults
    let mut config = if args.config.exists() {
        ConfigManager::load_from_file(&args.config)?
    } else {
        info!("Config file not found, checking environment variables");
        ConfigManager::load_from_env()?
    };

    match &args.command {
        Some(Command::Serve { port }) => {
            config.merge_with_cli_args(None, *port, None, args.inline);
        }
        Some(Command::Connect {
            host,
            port,
            connect_timeout,
        }) => {
            let timeout = connect_timeout.unwrap_or(CLIENT_CONNECT_TIMEOUT_SECS);
            config.merge_with_cli_args(host.as_deref(), *port, Some(timeout), args.inline);
        }
        None => config.merge_with_cli_args(None, None, None, args.inline),
    }

    config
        .validate()
        .context("Final configuration validation failed")?;

    if args.validate_config {
        info!("Configuration is valid");
        info!("Server bind address: {}", config.server.bind_addr);
        info!("Client target: {}:{}", config.client.host, config.client.port);
        for line in config.transport.to_string().lines() {
            info!("  {}", line);
        }
        return Ok(());
    }

    match args.command {
        Some(Command::Connect { .. }) => run_client(config).await,
        Some(Command::Serve { .. }) | None => run_server(config).await,
    }
}

async fn run_server(config: Config) -> Result<()> {
    let initializer =
        TimeServerInitializer::new(config.server.heartbeat_interval, config.server.writer_idle);
    let transport = config.transport.clone().with_pipeline_initializer(initializer);
    let builder = Arc::new(
        AcceptorBuilder::with_config(transport).with_shutdown_grace(config.server.shutdown_timeout),
    );

    let acceptor = builder.build()?;
    let listener = acceptor
        .bind(config.server.bind_addr)
        .await
        .with_context(|| format!("Failed to start server on {}", config.server.bind_addr))?;

    let coordinator = ShutdownCoordinator::new();
    {
        let builder = Arc::clone(&builder);
        coordinator.on_shutdown("acceptor", move || builder.shutdown_gracefully());
    }

    info!("Time server listening on {}", listener.local_addr());
    info!("Press Ctrl+C or send SIGTERM/SIGINT to shutdown gracefully");

    tokio::select! {
        result = coordinator.listen_for_signals() => {
            if let Err(e) = result {
                error!("Error setting up signal handlers: {}", e);
            }
        }
        _ = listener.closed() => {
            info!("Listener closed");
        }
    }

    listener.close();
    coordinator.trigger();
    let bound = config.server.shutdown_timeout + QUIET_PERIOD;
    if !builder.await_termination(bound).await {
        warn!("Acceptor thread groups still running after {:?}", bound);
    }
    info!("Server shutdown complete");
    Ok(())
}

async fn run_client(config: Config) -> Result<()> {
    let transport = config
        .transport
        .clone()
        .with_pipeline_initializer(PrintingClientInitializer::new());
    let builder = Arc::new(ConnectorBuilder::with_config(transport));

    let coordinator = ShutdownCoordinator::new();
    {
        let builder = Arc::clone(&builder);
        coordinator.on_shutdown("connector", move || builder.shutdown_gracefully());
    }

    let connector = builder.build()?;
    let connection = match connector.connect(&config.client.host, config.client.port).await {
        Ok(connection) => connection,
        Err(e) => {
            coordinator.trigger();
            return Err(e);
        }
    };

    tokio::select! {
        result = coordinator.listen_for_signals() => {
            if let Err(e) = result {
                error!("Error setting up signal handlers: {}", e);
            }
        }
        _ = connection.closed() => {
            info!("Server closed the connection");
        }
    }

    connection.close();
    coordinator.trigger();
    let bound = DEFAULT_SHUTDOWN_GRACE + QUIET_PERIOD;
    if !builder.await_termination(bound).await {
        warn!("Connector thread group still running after {:?}", bound);
    }
    info!("Client shutdown complete");
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(args: &CliArgs) -> Result<()> {
    let log_level = if args.verbose {
        "debug"
    } else {
        &args.log_level
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .with(env_filter)
        .init();

    Ok(())
}
