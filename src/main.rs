//! tlsgate - SNI-routed TLS terminating reverse proxy
//!
//! This is the main entry point for the tlsgate CLI application.

use clap::Parser;
use std::process;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tlsgate::cli::{self, CliArgs, Commands};

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();

    // Initialize logging
    init_logging(args.verbose, args.log_json);

    // Execute subcommand
    let result = match args.command {
        Commands::Serve(cmd) => cli::commands::serve::execute(cmd).await,
        Commands::Check(cmd) => cli::commands::check::execute(cmd).await,
        Commands::Sample(cmd) => cli::commands::sample::execute(cmd).await,
        Commands::Version => cli::commands::version::execute().await,
    };

    // Error handling
    if let Err(e) = result {
        error!("Command execution failed: {}", e);
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

/// Initialize the logging system
fn init_logging(verbose: bool, json: bool) {
    let default_level = if verbose { "tlsgate=debug" } else { "tlsgate=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }

    info!("tlsgate {} starting up", tlsgate::VERSION);
}
