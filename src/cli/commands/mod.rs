//! CLI command implementations
//!
//! This module contains the implementation of all CLI commands.

pub mod check;
pub mod sample;
pub mod serve;
pub mod version;

use crate::cli::SourceArgs;
use crate::common::config::ProxyConfig;
use crate::common::error::Result;
use tracing::debug;

/// Common result type for all command operations
pub type CommandResult = Result<()>;

/// Resolve the configuration: explicit file, then the default path, then the
/// legacy JSON path, then built-in defaults; CLI flags are applied on top.
pub fn resolve_config(source: &SourceArgs) -> Result<ProxyConfig> {
    let path = source
        .config
        .clone()
        .or_else(|| ProxyConfig::default_path().filter(|path| path.exists()))
        .or_else(|| ProxyConfig::legacy_path().filter(|path| path.exists()));

    let mut config = match path {
        Some(path) => {
            debug!("Loading configuration from {}", path.display());
            ProxyConfig::from_file(&path)?
        }
        None => ProxyConfig::default(),
    };

    if let Some(root) = &source.root {
        config.cert_root = Some(root.clone());
    }
    if let Some(out_port) = source.out_port {
        config.out_port = Some(out_port);
    }

    Ok(config)
}
