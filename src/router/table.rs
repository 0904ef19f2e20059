//! Hostname routing table.
//!
//! Maps a negotiated hostname, optionally scoped to the local listening port
//! that accepted the connection, to a backend `host:port` address. Lookups
//! prefer the port-scoped entry and fall back to the hostname default.

use std::collections::HashMap;

use crate::common::error::Error;

/// Errors raised while building a [`RoutingTable`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("Duplicate default route for '{hostname}'")]
    DuplicateDefault { hostname: String },

    #[error("Duplicate route for '{hostname}' on listen port {port}")]
    DuplicatePort { hostname: String, port: u16 },

    #[error("Invalid backend address '{address}' for '{hostname}': {reason}")]
    InvalidBackend {
        hostname: String,
        address: String,
        reason: String,
    },
}

impl From<RouteError> for Error {
    fn from(err: RouteError) -> Self {
        Error::Config(err.to_string())
    }
}

/// One configured route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub hostname: String,
    pub backend: String,
    /// Local listening port this entry is scoped to; `None` for the
    /// hostname's default backend.
    pub listen_port: Option<u16>,
}

impl RouteEntry {
    pub fn default_route(hostname: impl Into<String>, backend: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            backend: backend.into(),
            listen_port: None,
        }
    }

    pub fn port_route(
        hostname: impl Into<String>,
        listen_port: u16,
        backend: impl Into<String>,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            backend: backend.into(),
            listen_port: Some(listen_port),
        }
    }
}

#[derive(Debug, Default, Clone)]
struct HostRoutes {
    default: Option<String>,
    by_port: HashMap<u16, String>,
}

/// Immutable routing table.
#[derive(Debug, Default, Clone)]
pub struct RoutingTable {
    hosts: HashMap<String, HostRoutes>,
}

impl RoutingTable {
    pub fn builder() -> RoutingTableBuilder {
        RoutingTableBuilder::default()
    }

    /// Resolve the backend for `hostname` accepted on `listen_port`.
    ///
    /// Order: exact (hostname, port) entry, then the hostname default.
    pub fn resolve(&self, hostname: &str, listen_port: Option<u16>) -> Option<&str> {
        let routes = self.hosts.get(hostname)?;

        listen_port
            .and_then(|port| routes.by_port.get(&port))
            .or(routes.default.as_ref())
            .map(String::as_str)
    }

    /// All entries, sorted by hostname then port (default first).
    pub fn entries(&self) -> Vec<RouteEntry> {
        let mut entries = Vec::new();
        for (hostname, routes) in &self.hosts {
            if let Some(backend) = &routes.default {
                entries.push(RouteEntry::default_route(hostname.clone(), backend.clone()));
            }
            for (port, backend) in &routes.by_port {
                entries.push(RouteEntry::port_route(hostname.clone(), *port, backend.clone()));
            }
        }
        entries.sort_by(|a, b| {
            a.hostname
                .cmp(&b.hostname)
                .then(a.listen_port.cmp(&b.listen_port))
        });
        entries
    }

    /// Number of configured hostnames.
    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

/// Collects route entries, rejecting conflicts at build time.
#[derive(Debug, Default)]
pub struct RoutingTableBuilder {
    hosts: HashMap<String, HostRoutes>,
}

impl RoutingTableBuilder {
    /// Add a route. The hostname is stored in ASCII lowercase to match the
    /// name negotiated during the handshake.
    pub fn insert(&mut self, mut entry: RouteEntry) -> Result<(), RouteError> {
        entry.hostname.make_ascii_lowercase();
        validate_backend(&entry.hostname, &entry.backend)?;

        let routes = self.hosts.entry(entry.hostname.clone()).or_default();
        match entry.listen_port {
            None => {
                if routes.default.is_some() {
                    return Err(RouteError::DuplicateDefault {
                        hostname: entry.hostname,
                    });
                }
                routes.default = Some(entry.backend);
            }
            Some(port) => {
                if routes.by_port.contains_key(&port) {
                    return Err(RouteError::DuplicatePort {
                        hostname: entry.hostname,
                        port,
                    });
                }
                routes.by_port.insert(port, entry.backend);
            }
        }
        Ok(())
    }

    pub fn build(self) -> RoutingTable {
        RoutingTable { hosts: self.hosts }
    }
}

/// Check that `address` looks like `host:port`.
///
/// IPv6 literals must be bracketed (`[::1]:8080`). Name resolution is left to
/// dial time.
pub fn validate_backend(hostname: &str, address: &str) -> Result<(), RouteError> {
    let invalid = |reason: &str| RouteError::InvalidBackend {
        hostname: hostname.to_string(),
        address: address.to_string(),
        reason: reason.to_string(),
    };

    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| invalid("expected host:port"))?;

    if host.is_empty() {
        return Err(invalid("empty host"));
    }
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        return Err(invalid("IPv6 hosts must be bracketed"));
    }
    if host.chars().any(char::is_whitespace) {
        return Err(invalid("host contains whitespace"));
    }

    match port.parse::<u16>() {
        Ok(0) => Err(invalid("port must not be 0")),
        Ok(_) => Ok(()),
        Err(_) => Err(invalid("invalid port")),
    }
}
