//! Builds certificate stores and routing tables from configuration.
//!
//! Two sources are supported and may be combined:
//! - `[[domains]]` entries in the configuration file;
//! - a certificate root directory where each subdirectory is a hostname
//!   holding `fullchain.pem`, `privkey.pem` and optionally a `backend` file
//!   (one `host:port` line) or a `ports` file (`listenPort:backendPort`
//!   lines).
//!
//! Everything goes through a single builder pair, so a hostname defined by
//! both sources is rejected instead of silently shadowed.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::common::config::{parse_port, DomainConfig, ProxyConfig};
use crate::common::error::{Error, Result};
use crate::router::{ProxyTables, RouteEntry, RoutingTable, RoutingTableBuilder};
use crate::security::{load_certified_key, CertificateStore, CertificateStoreBuilder};

/// Certificate chain file inside a hostname directory.
pub const CERT_FILE: &str = "fullchain.pem";
/// Private key file inside a hostname directory.
pub const KEY_FILE: &str = "privkey.pem";
/// Single default backend address.
pub const BACKEND_FILE: &str = "backend";
/// `listenPort:backendPort` rules.
pub const PORTS_FILE: &str = "ports";

/// Loads [`ProxyTables`] from a [`ProxyConfig`].
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    config: ProxyConfig,
}

impl ConfigLoader {
    pub fn new(config: ProxyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Load certificates and routes and assemble a table generation.
    pub fn load(&self) -> Result<ProxyTables> {
        let (certificates, routes) = self.load_parts()?;
        Ok(ProxyTables::new(certificates, routes))
    }

    /// Load certificates and routes without building the TLS configuration.
    pub fn load_parts(&self) -> Result<(CertificateStore, RoutingTable)> {
        self.config.validate()?;

        let mut certificates = CertificateStore::builder();
        let mut routes = RoutingTable::builder();

        for domain in &self.config.domains {
            self.add_domain(domain, &mut certificates, &mut routes)?;
        }

        if let Some(root) = &self.config.cert_root {
            self.scan_cert_root(root, &mut certificates, &mut routes)?;
        }

        let certificates = certificates.build();
        let routes = routes.build();

        if certificates.is_empty() {
            return Err(Error::config("No certificates loaded"));
        }

        Ok((certificates, routes))
    }

    fn add_domain(
        &self,
        domain: &DomainConfig,
        certificates: &mut CertificateStoreBuilder,
        routes: &mut RoutingTableBuilder,
    ) -> Result<()> {
        let key = load_certified_key(&domain.full_chain, &domain.private_key)?;
        certificates.insert(domain.domain.clone(), key)?;

        let mut has_route = false;
        if let Some(backend) = &domain.backend {
            routes.insert(RouteEntry::default_route(&domain.domain, backend))?;
            info!(hostname = %domain.domain, backend = %backend, "Added route");
            has_route = true;
        }

        for (port, backend) in &domain.ports {
            let port = parse_port(port).map_err(|e| {
                Error::config(format!(
                    "Invalid listen port '{}' for {}: {}",
                    port, domain.domain, e
                ))
            })?;
            routes.insert(RouteEntry::port_route(&domain.domain, port, backend))?;
            info!(hostname = %domain.domain, port, backend = %backend, "Added route");
            has_route = true;
        }

        if !has_route {
            self.add_fallback_route(&domain.domain, routes)?;
        }

        Ok(())
    }

    fn scan_cert_root(
        &self,
        root: &Path,
        certificates: &mut CertificateStoreBuilder,
        routes: &mut RoutingTableBuilder,
    ) -> Result<()> {
        let entries = fs::read_dir(root).map_err(|e| {
            Error::config(format!(
                "Failed to read certificate root '{}': {}",
                root.display(),
                e
            ))
        })?;

        let mut dirs: Vec<PathBuf> = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                dirs.push(path);
            }
        }
        dirs.sort();

        for dir in dirs {
            let hostname = dir
                .file_name()
                .and_then(|name| name.to_str())
                .ok_or_else(|| {
                    Error::config(format!("Invalid hostname directory: {}", dir.display()))
                })?
                .to_string();

            let key = load_certified_key(&dir.join(CERT_FILE), &dir.join(KEY_FILE))?;
            certificates.insert(hostname.clone(), key)?;

            let mut has_route = false;

            let backend_file = dir.join(BACKEND_FILE);
            if backend_file.is_file() {
                let backend = read_trimmed(&backend_file)?;
                routes.insert(RouteEntry::default_route(&hostname, &backend))?;
                info!(hostname = %hostname, backend = %backend, "Added route");
                has_route = true;
            }

            let ports_file = dir.join(PORTS_FILE);
            if ports_file.is_file() {
                let content = read_trimmed(&ports_file)?;
                for (listen_port, backend_port) in parse_port_rules(&content)
                    .map_err(|e| Error::config(format!("{}: {}", ports_file.display(), e)))?
                {
                    let backend = format!("{}:{}", self.config.backend_host, backend_port);
                    routes.insert(RouteEntry::port_route(&hostname, listen_port, &backend))?;
                    info!(hostname = %hostname, port = listen_port, backend = %backend, "Added route");
                    has_route = true;
                }
            }

            if !has_route {
                self.add_fallback_route(&hostname, routes)?;
            }
        }

        Ok(())
    }

    /// Route `hostname` to itself on the configured output port.
    fn add_fallback_route(&self, hostname: &str, routes: &mut RoutingTableBuilder) -> Result<()> {
        let out_port = self.config.out_port.ok_or_else(|| {
            Error::config(format!(
                "No backend configured for {} and no output port set",
                hostname
            ))
        })?;

        let backend = format!("{}:{}", hostname, out_port);
        routes.insert(RouteEntry::default_route(hostname, &backend))?;
        info!(hostname = %hostname, backend = %backend, "Added route");
        Ok(())
    }
}

/// Parse `listenPort:backendPort` lines. Blank lines and `#` comments are
/// skipped.
pub fn parse_port_rules(content: &str) -> std::result::Result<Vec<(u16, u16)>, String> {
    let mut rules = Vec::new();

    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (listen, backend) = line
            .split_once(':')
            .ok_or_else(|| format!("line {}: expected listenPort:backendPort", index + 1))?;
        let listen = parse_port(listen).map_err(|e| format!("line {}: {}", index + 1, e))?;
        let backend = parse_port(backend).map_err(|e| format!("line {}: {}", index + 1, e))?;
        rules.push((listen, backend));
    }

    Ok(rules)
}

fn read_trimmed(path: &Path) -> Result<String> {
    let content = fs::read_to_string(path)
        .map_err(|e| Error::config(format!("Failed to read '{}': {}", path.display(), e)))?;
    Ok(content.trim().to_string())
}
