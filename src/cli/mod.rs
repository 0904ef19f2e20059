// tlsgateのCLIモジュール
//
// コマンドライン引数の解析とコマンド実行機能を提供

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

pub mod commands;

#[derive(Parser)]
#[command(
    name = "tlsgate",
    about = "SNI-routed TLS terminating reverse proxy",
    version = env!("CARGO_PKG_VERSION"),
    long_about = "tlsgate accepts TLS connections, selects a certificate from the client's SNI hostname, and forwards the decrypted stream to the backend configured for that hostname."
)]
pub struct CliArgs {
    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the proxy
    Serve(ServeArgs),

    /// Validate configuration and certificates, then print the routes
    Check(CheckArgs),

    /// Generate sample configuration
    Sample(SampleArgs),

    /// Show version information
    Version,
}

/// Where certificates and routes come from
#[derive(Args, Debug, Clone, Default)]
pub struct SourceArgs {
    /// Configuration file path (TOML, or JSON with a .json extension)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Certificate root: one directory per hostname
    #[arg(short, long, value_name = "DIR")]
    pub root: Option<PathBuf>,

    /// Backend port for hostnames without a backend file
    #[arg(short, long, value_name = "PORT")]
    pub out_port: Option<u16>,
}

#[derive(Parser, Debug, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    /// Listening port (repeat for several ports, default 443)
    #[arg(short, long = "port", value_name = "PORT")]
    pub ports: Vec<u16>,

    /// Listening host
    #[arg(short, long, value_name = "HOST")]
    pub bind: Option<String>,

    /// TLS handshake timeout in seconds
    #[arg(long, value_name = "SECS")]
    pub handshake_timeout: Option<u64>,

    /// Relay idle timeout in seconds
    #[arg(long, value_name = "SECS")]
    pub idle_timeout: Option<u64>,
}

#[derive(Parser, Debug, Clone)]
pub struct CheckArgs {
    #[command(flatten)]
    pub source: SourceArgs,
}

#[derive(Parser, Debug, Clone)]
pub struct SampleArgs {
    /// Output file path
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,
}
