//! Hostname → certificate store.
//!
//! Built once by the configuration loader and read-only afterwards. The
//! store doubles as the rustls certificate resolver: lookups happen inside
//! the handshake, so [`CertificateStore::resolve`] never blocks or performs
//! I/O.

use std::collections::HashMap;
use std::sync::Arc;

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tracing::debug;

use super::tls::{TlsError, TlsResult};

/// Immutable mapping from hostname to certificate chain and signing key.
pub struct CertificateStore {
    entries: HashMap<String, Arc<CertifiedKey>>,
}

impl std::fmt::Debug for CertificateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateStore")
            .field("hostnames", &self.hostnames())
            .finish()
    }
}

impl CertificateStore {
    /// Start building a new store.
    pub fn builder() -> CertificateStoreBuilder {
        CertificateStoreBuilder::default()
    }

    /// Exact-match lookup. No wildcard or suffix matching is performed.
    pub fn resolve(&self, hostname: &str) -> Option<Arc<CertifiedKey>> {
        self.entries.get(hostname).cloned()
    }

    /// Whether a certificate exists for `hostname`.
    pub fn contains(&self, hostname: &str) -> bool {
        self.entries.contains_key(hostname)
    }

    /// Configured hostnames, sorted.
    pub fn hostnames(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ResolvesServerCert for CertificateStore {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        // SNIなしのクライアントは空文字列として扱い、必ず失敗させる
        let hostname = client_hello.server_name().unwrap_or_default();
        let resolved = CertificateStore::resolve(self, hostname);
        if resolved.is_none() {
            debug!(hostname = %hostname, "No certificate for requested hostname");
        }
        resolved
    }
}

/// Accumulates certificate entries and rejects duplicate hostnames.
#[derive(Default)]
pub struct CertificateStoreBuilder {
    entries: HashMap<String, Arc<CertifiedKey>>,
}

impl CertificateStoreBuilder {
    /// Add a certificate for `hostname`.
    ///
    /// Hostnames are stored in ASCII lowercase, the form rustls hands to
    /// the resolver.
    pub fn insert(&mut self, hostname: impl Into<String>, key: CertifiedKey) -> TlsResult<()> {
        let hostname = hostname.into().to_ascii_lowercase();
        if self.entries.contains_key(&hostname) {
            return Err(TlsError::Duplicate { hostname });
        }
        self.entries.insert(hostname, Arc::new(key));
        Ok(())
    }

    pub fn build(self) -> CertificateStore {
        CertificateStore {
            entries: self.entries,
        }
    }
}
