use std::path::PathBuf;

use chatrelay_cli::commands::{AskCommand, CheckCommand, RoutesCommand};
use chatrelay_cli::error::CliResult;
use chatrelay_cli::output::OutputFormat;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "chatrelay-cli")]
#[command(about = "chatrelay CLI - query a relay and inspect its configuration")]
#[command(version)]
pub struct Cli {
    #[clap(long, short, global = true, help = "Output in JSON format")]
    pub json: bool,

    #[clap(long, short = 'c', global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    #[clap(about = "Send a query to a running relay")]
    Ask(AskCommand),

    #[clap(about = "Validate the config and every file it references")]
    Check(CheckCommand),

    #[clap(about = "List configured routes")]
    Routes(RoutesCommand),
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> CliResult<()> {
    let cli = Cli::parse();

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Table
    };

    match &cli.command {
        Command::Ask(cmd) => cmd.execute(format).await,
        Command::Check(cmd) => cmd.execute(cli.config.as_deref(), format).await,
        Command::Routes(cmd) => cmd.execute(cli.config.as_deref(), format).await,
    }
}
