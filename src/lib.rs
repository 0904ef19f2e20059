//! tlsgate - SNI-routed TLS terminating reverse proxy
//!
//! This library provides the core functionality of tlsgate: the certificate
//! store, the routing table, the accepting router and the byte relay.

pub mod cli;
pub mod common;
pub mod router;
pub mod security;

pub use common::{
    config::ProxyConfig,
    error::{Error, Result},
    loader::ConfigLoader,
};
pub use router::{ProxyTables, Router, RouterConfig, RoutingTable, SharedTables};
pub use security::CertificateStore;

/// tlsgate library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// tlsgate library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// tlsgate library description
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
