//! MeshFlux CLI - inspect and control a running packet tunnel
//!
//! Talks to the tunnel process over its local command socket.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use meshflux_proto::{PlatformProfile, StorageLayout};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("MESHFLUX_GIT_HASH"),
    " ",
    env!("MESHFLUX_BUILD_TIME"),
    ")"
);

/// MeshFlux - control the packet tunnel from the command line
#[derive(Parser, Debug)]
#[command(name = "meshflux")]
#[command(about = "MeshFlux - control the packet tunnel from the command line")]
#[command(version = VERSION)]
struct Cli {
    /// Command socket of the tunnel process (defaults to the shared container)
    #[arg(long, global = true, env = "MESHFLUX_SOCKET")]
    socket: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "MESHFLUX_LOG", default_value = "warn")]
    log_level: String,

    /// Print raw JSON responses
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check that the tunnel's command server is alive
    Ping,

    /// Show service status and the applied network settings
    Status,

    /// Rebuild the configuration and reload the running service
    Reload,

    /// Stop the engine service without tearing the tunnel down
    StopService,

    /// Show or change the system HTTP proxy
    Proxy {
        #[arg(value_enum)]
        state: Option<ProxyState>,
    },

    /// Print the resolved storage layout
    Paths,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum ProxyState {
    On,
    Off,
}

fn setup_logging(log_level: &str) {
    // RUST_LOG wins over --log-level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_writer(std::io::stderr),
        )
        .with(filter)
        .init();
}

fn resolve_layout() -> Result<StorageLayout> {
    StorageLayout::resolve(&PlatformProfile::current())
        .context("Neither the shared container nor application support is available")
}

fn print_paths(layout: &StorageLayout) {
    println!("Source:          {:?}", layout.source);
    println!("Base:            {}", layout.base_dir.display());
    println!("Working:         {}", layout.working_dir.display());
    println!("Cache:           {}", layout.cache_dir.display());
    println!("Temp:            {}", layout.temp_dir.display());
    println!("Shared data:     {}", layout.shared_data_dir.display());
    println!("Command socket:  {}", layout.command_socket().display());
    println!("Preferences:     {}", layout.preferences_file().display());
    println!("Config override: {}", layout.config_override().display());
    println!("Stderr log:      {}", layout.stderr_log().display());
}

#[cfg(unix)]
async fn run(cli: Cli) -> Result<()> {
    use meshflux_proto::ipc::format_status;
    use meshflux_proto::{IpcClient, IpcRequest, IpcResponse};

    let request = match cli.command {
        Commands::Paths => {
            print_paths(&resolve_layout()?);
            return Ok(());
        }
        Commands::Ping => IpcRequest::Ping,
        Commands::Status => IpcRequest::Status,
        Commands::Reload => IpcRequest::Reload,
        Commands::StopService => IpcRequest::StopService,
        Commands::Proxy { state: None } => IpcRequest::GetSystemProxy,
        Commands::Proxy { state: Some(state) } => IpcRequest::SetSystemProxy {
            enabled: state == ProxyState::On,
        },
    };

    let socket = match cli.socket {
        Some(socket) => socket,
        None => resolve_layout()?.command_socket(),
    };
    debug!("Connecting to {:?}", socket);

    let mut client = IpcClient::connect_to(&socket)
        .await
        .with_context(|| format!("Is the tunnel running? ({})", socket.display()))?;
    let response = client.request(&request).await?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }

    match response {
        IpcResponse::Pong => println!("pong"),
        IpcResponse::Status(status) => println!("{}", format_status(&status)),
        IpcResponse::SystemProxy { available, enabled } => {
            if !available {
                println!("System proxy: not configured");
            } else if enabled {
                println!("System proxy: enabled");
            } else {
                println!("System proxy: disabled");
            }
        }
        IpcResponse::Ok { message } => println!("{}", message.as_deref().unwrap_or("ok")),
        IpcResponse::Error { message } => anyhow::bail!("{}", message),
    }

    Ok(())
}

#[cfg(not(unix))]
async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Paths => {
            print_paths(&resolve_layout()?);
            Ok(())
        }
        _ => anyhow::bail!("The command socket is only available on Unix"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level);
    run(cli).await
}
