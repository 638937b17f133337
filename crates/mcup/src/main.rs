//! mcup - call tools on JSON-RPC tool servers from the command line.
//!
//! Connects to a server (a spawned process or a WebSocket), runs one command
//! against it, and shuts the connection down.

mod commands;
mod target;

use clap::{Parser, Subcommand};
use commands::*;
use mcup_client::{AnyConnection, StderrSink};
use std::path::PathBuf;
use target::TargetArgs;

#[derive(Parser)]
#[command(name = "mcup")]
#[command(author, version, about = "Call tools on JSON-RPC tool servers", long_about = None)]
struct Cli {
    /// Config file (defaults to mcup/config.json in the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Ask for confirmation before calling mutating tools
    #[arg(long, global = true)]
    approve: bool,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Subcommand
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the server's tools
    Tools {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Call a tool
    Call {
        /// Tool name
        tool: String,
        /// Tool arguments as a JSON object
        arguments: Option<String>,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// List the server's resources
    Resources {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Read a resource
    Read {
        /// Resource URI
        uri: String,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// List servers in the config file
    Servers,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.log_file.as_deref())?;

    let config = load_config(cli.config.as_deref()).await?;
    let mut options = config.client_options();
    if cli.approve {
        options.approval.enabled = true;
    }

    let (target, action) = match cli.command {
        Commands::Servers => {
            list_servers(&config);
            return Ok(());
        }
        Commands::Tools { target } => (target, Action::ListTools),
        Commands::Call {
            tool,
            arguments,
            target,
        } => (target, Action::CallTool { tool, arguments }),
        Commands::Resources { target } => (target, Action::ListResources),
        Commands::Read { uri, target } => (target, Action::ReadResource { uri }),
    };

    let entry = target.resolve(&config)?;
    let stderr = if cli.verbose {
        StderrSink::Log
    } else {
        StderrSink::Inherit
    };
    let mut connection = AnyConnection::connect(&entry, stderr, &options).await?;

    let result = run_action(&connection, action).await;
    if let Err(e) = connection.close().await {
        tracing::warn!(error = %e, "Failed to close connection");
    }
    result
}
