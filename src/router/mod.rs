// Router module for tlsgate
//
// This module implements the accepting side: it owns the listening sockets,
// terminates TLS per connection and forwards the plaintext to the backend
// selected by the routing table.

pub mod connection;
pub mod relay;
pub mod table;

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use rustls::ServerConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};

use crate::common::error::{Error, Result};
use crate::security::{server_config, CertificateStore};

pub use connection::{Connection, ConnectionError};
pub use relay::{relay, RelayStats};
pub use table::{RouteEntry, RouteError, RoutingTable, RoutingTableBuilder};

/// Pause after a transient accept failure.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// How long shutdown waits for in-flight connections by default.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// One consistent generation of certificates and routes.
pub struct ProxyTables {
    certificates: Arc<CertificateStore>,
    routes: Arc<RoutingTable>,
    tls: Arc<ServerConfig>,
}

impl std::fmt::Debug for ProxyTables {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyTables")
            .field("certificates", &self.certificates)
            .field("routes", &self.routes)
            .finish_non_exhaustive()
    }
}

impl ProxyTables {
    pub fn new(certificates: CertificateStore, routes: RoutingTable) -> Self {
        let certificates = Arc::new(certificates);
        let tls = server_config(Arc::clone(&certificates));

        Self {
            certificates,
            routes: Arc::new(routes),
            tls,
        }
    }

    pub fn certificates(&self) -> &CertificateStore {
        &self.certificates
    }

    pub fn routes(&self) -> &RoutingTable {
        &self.routes
    }

    /// Server configuration whose certificate resolver is this generation's
    /// store.
    pub fn tls_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.tls)
    }
}

/// Current [`ProxyTables`], replaced wholesale on reload.
#[derive(Clone)]
pub struct SharedTables {
    current: Arc<ArcSwap<ProxyTables>>,
}

impl SharedTables {
    pub fn new(tables: ProxyTables) -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(tables)),
        }
    }

    /// Snapshot used for the whole lifetime of one connection.
    pub fn snapshot(&self) -> Arc<ProxyTables> {
        self.current.load_full()
    }

    /// Atomically install a new generation. Connections already running
    /// keep the snapshot they started with.
    pub fn replace(&self, tables: ProxyTables) {
        self.current.store(Arc::new(tables));
    }
}

/// Router configuration
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Deadline for the TLS handshake; `None` waits indefinitely
    pub handshake_timeout: Option<Duration>,
    /// Per-direction relay idle deadline; `None` waits indefinitely
    pub idle_timeout: Option<Duration>,
    /// Upper bound on waiting for in-flight connections at shutdown
    pub drain_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: None,
            idle_timeout: None,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

/// Count of connection tasks still running.
#[derive(Debug, Default)]
struct ActiveConnections {
    count: AtomicUsize,
    idle: Notify,
}

impl ActiveConnections {
    fn track(self: &Arc<Self>) -> ConnectionGuard {
        self.count.fetch_add(1, Ordering::AcqRel);
        ConnectionGuard(Arc::clone(self))
    }

    fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.len() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Wait until every tracked connection has finished or `limit` elapses.
    async fn drain(&self, limit: Duration) {
        let active = self.len();
        if active == 0 {
            return;
        }

        info!(active, "Waiting for in-flight connections");
        if tokio::time::timeout(limit, self.wait_idle()).await.is_err() {
            warn!(remaining = self.len(), "Drain timeout elapsed, abandoning connections");
        }
    }
}

/// Held by a connection task for its whole lifetime.
struct ConnectionGuard(Arc<ActiveConnections>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// tlsgate router server
pub struct Router {
    listeners: Vec<TcpListener>,
    tables: SharedTables,
    config: Arc<RouterConfig>,
    connections: Arc<ActiveConnections>,
}

impl Router {
    /// Bind every address in `addrs`.
    pub async fn bind(
        addrs: &[SocketAddr],
        tables: SharedTables,
        config: RouterConfig,
    ) -> Result<Self> {
        if addrs.is_empty() {
            return Err(Error::config("No listen addresses configured"));
        }

        let mut listeners = Vec::with_capacity(addrs.len());
        for addr in addrs {
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|e| Error::listen(format!("Failed to bind {}: {}", addr, e)))?;
            listeners.push(listener);
        }

        Ok(Self::from_listeners(listeners, tables, config))
    }

    /// Build a router over already-bound listeners.
    pub fn from_listeners(
        listeners: Vec<TcpListener>,
        tables: SharedTables,
        config: RouterConfig,
    ) -> Self {
        Self {
            listeners,
            tables,
            config: Arc::new(config),
            connections: Arc::new(ActiveConnections::default()),
        }
    }

    pub fn local_addrs(&self) -> io::Result<Vec<SocketAddr>> {
        self.listeners.iter().map(TcpListener::local_addr).collect()
    }

    pub fn tables(&self) -> &SharedTables {
        &self.tables
    }

    /// Serve until a listener fails fatally.
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` resolves or a listener fails fatally.
    ///
    /// On shutdown the accept loops stop first; then connections already in
    /// flight get up to [`RouterConfig::drain_timeout`] to finish before this
    /// returns. A fatal listener error returns immediately.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut loops = JoinSet::new();
        for listener in self.listeners {
            let local_addr = listener.local_addr()?;
            info!(bind_addr = %local_addr, "Router listening");
            loops.spawn(accept_loop(
                listener,
                self.tables.clone(),
                Arc::clone(&self.config),
                Arc::clone(&self.connections),
            ));
        }

        tokio::pin!(shutdown);
        tokio::select! {
            _ = &mut shutdown => {
                info!("Stopping router");
                loops.abort_all();
                self.connections.drain(self.config.drain_timeout).await;
                Ok(())
            }
            Some(joined) = loops.join_next() => {
                loops.abort_all();
                match joined {
                    Ok(Err(e)) => Err(e),
                    Ok(Ok(())) => Ok(()),
                    Err(e) => Err(Error::generic(format!("Accept loop panicked: {}", e))),
                }
            }
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    tables: SharedTables,
    config: Arc<RouterConfig>,
    connections: Arc<ActiveConnections>,
) -> Result<()> {
    let local_addr = listener.local_addr()?;

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(peer = %peer, bind_addr = %local_addr, "Accepted connection");
                spawn_connection(stream, peer, &tables, &config, &connections);
            }
            Err(e) if is_fatal_accept_error(&e) => {
                error!(bind_addr = %local_addr, error = %e, "Listener failed");
                return Err(Error::listen(format!("Listener {} failed: {}", local_addr, e)));
            }
            Err(e) => {
                warn!(bind_addr = %local_addr, error = %e, "Accept error");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
}

fn spawn_connection(
    stream: TcpStream,
    peer: SocketAddr,
    tables: &SharedTables,
    config: &Arc<RouterConfig>,
    connections: &Arc<ActiveConnections>,
) {
    let listen_port = match stream.local_addr() {
        Ok(addr) => addr.port(),
        Err(e) => {
            warn!(peer = %peer, error = %e, "Dropping connection without local address");
            return;
        }
    };

    let snapshot = tables.snapshot();
    let config = Arc::clone(config);
    let guard = connections.track();
    let mut connection = Connection::new(peer, listen_port);
    let span = tracing::info_span!("connection", id = %connection.id(), peer = %peer, port = listen_port);

    tokio::spawn(
        async move {
            let _guard = guard;
            match connection.run(stream, snapshot, &config).await {
                Ok(stats) => info!(
                    bytes_to_backend = stats.client_to_backend,
                    bytes_from_backend = stats.backend_to_client,
                    "Connection closed"
                ),
                Err(e @ ConnectionError::Handshake(_)) => debug!(error = %e, "Connection closed"),
                Err(e) => warn!(error = %e, "Connection closed"),
            }
        }
        .instrument(span),
    );
}

/// Errors after which the listening socket itself is unusable.
fn is_fatal_accept_error(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::InvalidInput | io::ErrorKind::NotConnected | io::ErrorKind::Unsupported
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_tables() -> ProxyTables {
        ProxyTables::new(CertificateStore::builder().build(), RoutingTable::default())
    }

    #[test]
    fn test_shared_tables_swap() {
        let shared = SharedTables::new(empty_tables());
        let before = shared.snapshot();
        assert!(before.routes().is_empty());

        let mut builder = RoutingTable::builder();
        builder
            .insert(RouteEntry::default_route("a.example", "127.0.0.1:9001"))
            .unwrap();
        shared.replace(ProxyTables::new(
            CertificateStore::builder().build(),
            builder.build(),
        ));

        // 古いスナップショットは変化しない
        assert!(before.routes().is_empty());
        assert_eq!(
            shared.snapshot().routes().resolve("a.example", None),
            Some("127.0.0.1:9001")
        );
    }

    #[tokio::test]
    async fn test_bind_requires_addresses() {
        let result = Router::bind(&[], SharedTables::new(empty_tables()), RouterConfig::default()).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_bind_conflict_is_listen_error() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();

        let result = Router::bind(&[addr], SharedTables::new(empty_tables()), RouterConfig::default()).await;
        assert!(matches!(result, Err(Error::Listen(_))));
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let router = Router::bind(
            &["127.0.0.1:0".parse().unwrap()],
            SharedTables::new(empty_tables()),
            RouterConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(router.local_addrs().unwrap().len(), 1);

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            router.run_until(async {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }),
        )
        .await
        .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_drain_waits_for_tracked_connections() {
        let connections = Arc::new(ActiveConnections::default());
        connections.drain(Duration::from_millis(10)).await;

        let guard = connections.track();
        assert_eq!(connections.len(), 1);

        let waiter = {
            let connections = Arc::clone(&connections);
            tokio::spawn(async move { connections.drain(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(connections.len(), 0);
    }

    #[tokio::test]
    async fn test_drain_gives_up_after_limit() {
        let connections = Arc::new(ActiveConnections::default());
        let _guard = connections.track();

        tokio::time::timeout(
            Duration::from_secs(1),
            connections.drain(Duration::from_millis(20)),
        )
        .await
        .unwrap();
        assert_eq!(connections.len(), 1);
    }

    #[test]
    fn test_fatal_accept_errors() {
        assert!(is_fatal_accept_error(&io::Error::from(io::ErrorKind::InvalidInput)));
        assert!(!is_fatal_accept_error(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(!is_fatal_accept_error(&io::Error::from(io::ErrorKind::Other)));
    }
}
