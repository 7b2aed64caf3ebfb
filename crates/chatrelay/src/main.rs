//! chatrelay daemon

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use chatrelay::config::Config;
use chatrelay::error::Result;
use chatrelay::server::RelayServer;

/// chatrelay - authenticated relay in front of Zhipu and Coze chat APIs
#[derive(Parser)]
#[command(name = "chatrelay")]
#[command(about = "An authenticated HTTP front-end that relays chat completions")]
#[command(version)]
pub struct Cli {
    /// Path to config file
    #[arg(long, short = 'c', global = true, env = "CHATRELAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override the configured listen address
    #[arg(long, short = 'l', global = true)]
    pub listen: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the relay server (default command)
    #[command(name = "serve")]
    Serve,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => serve(cli.config, cli.listen).await,
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,chatrelay=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn serve(config_path: Option<PathBuf>, listen: Option<String>) -> Result<()> {
    tracing::info!("Starting chatrelay");

    let mut config = Config::load(config_path.as_deref())?;
    if let Some(addr) = listen {
        config.server.listen_addr = addr;
    }
    config.validate()?;
    tracing::debug!(routes = config.routes.len(), "Config validated");

    let server = RelayServer::new(&config)?;
    server.serve().await?;

    tracing::info!("chatrelay stopped");
    Ok(())
}
