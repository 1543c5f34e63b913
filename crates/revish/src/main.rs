//! revish CLI
//!
//! Single binary for every revish role:
//! - Server (rendezvous point clients dial and operators jump through)
//! - Client (dials home from a machine without inbound connectivity)
//! - Directory listing

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use revish::commands::{self, ClientArgs, ServerArgs};
use revish::output::print_error;

#[derive(Parser)]
#[command(name = "revish")]
#[command(author, version, about = "Reverse shell tunnels over SSH")]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the rendezvous server that clients dial home to
    Server(ServerArgs),

    /// Dial home and offer this machine's shell through a reverse tunnel
    Client(ClientArgs),

    /// List reachable sessions published by a running server
    List {
        /// Directory file to read (defaults to the server's)
        #[arg(short, long)]
        directory: Option<PathBuf>,

        /// Server name operators jump through
        #[arg(short = 'J', long, default_value = "<server>")]
        jump_host: String,

        /// Print raw JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        (false, _) => "trace",
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    if let Err(e) = run(cli).await {
        print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Server(args) => commands::run_server(args, config_path).await,
        Commands::Client(args) => commands::run_client(args, config_path).await,
        Commands::List {
            directory,
            jump_host,
            json,
        } => commands::list_command(directory, config_path, &jump_host, json),
    }
}
