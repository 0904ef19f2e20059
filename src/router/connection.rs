//! Per-connection lifecycle: handshake, routing, backend dial and relay.
//!
//! A connection moves through [`ConnectionState`] in order. Every failure
//! closes whatever sockets the connection opened and is reported as a
//! [`ConnectionError`]; nothing here can affect other connections.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::rustls::server::Acceptor;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, info, trace};

use super::relay::{relay, RelayStats};
use super::{ProxyTables, RouterConfig};
use crate::common::types::{ConnectionId, ConnectionState};

/// Why a connection ended before (or instead of) relaying.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("no certificate for hostname '{hostname}'")]
    CertificateNotFound { hostname: String },

    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] io::Error),

    #[error("TLS handshake timed out")]
    HandshakeTimeout,

    #[error("no route for hostname '{hostname}' on port {port}")]
    RouteNotFound { hostname: String, port: u16 },

    #[error("failed to connect to backend {backend}: {source}")]
    Dial {
        backend: String,
        #[source]
        source: io::Error,
    },
}

/// State of one accepted connection.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    listen_port: u16,
    state: ConnectionState,
}

impl Connection {
    pub fn new(peer: SocketAddr, listen_port: u16) -> Self {
        Self {
            id: ConnectionId::new(),
            peer,
            listen_port,
            state: ConnectionState::Accepted,
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn advance(&mut self, next: ConnectionState) {
        trace!(from = %self.state, to = %next, "Connection state change");
        self.state = next;
    }

    /// Drive the connection to completion.
    ///
    /// `tables` is the snapshot taken at accept time; the same snapshot is
    /// used for certificate selection and for routing.
    pub async fn run(
        &mut self,
        stream: TcpStream,
        tables: Arc<ProxyTables>,
        config: &RouterConfig,
    ) -> Result<RelayStats, ConnectionError> {
        let result = self.serve(stream, &tables, config).await;
        self.advance(ConnectionState::Closed);
        result
    }

    async fn serve(
        &mut self,
        stream: TcpStream,
        tables: &ProxyTables,
        config: &RouterConfig,
    ) -> Result<RelayStats, ConnectionError> {
        // Handshaking
        self.advance(ConnectionState::Handshaking);
        let handshake = handshake(stream, tables);
        let (mut client, hostname) = match with_deadline(config.handshake_timeout, handshake).await
        {
            Some(Ok(established)) => established,
            Some(Err(e)) => {
                self.advance(ConnectionState::Closing);
                return Err(e);
            }
            None => {
                self.advance(ConnectionState::Closing);
                return Err(ConnectionError::HandshakeTimeout);
            }
        };
        debug!(hostname = %hostname, "TLS handshake complete");

        // Routed
        let backend = match tables.routes().resolve(&hostname, Some(self.listen_port)) {
            Some(backend) => backend.to_string(),
            None => {
                self.advance(ConnectionState::Closing);
                close_quietly(&mut client).await;
                return Err(ConnectionError::RouteNotFound {
                    hostname,
                    port: self.listen_port,
                });
            }
        };
        self.advance(ConnectionState::Routed);

        let upstream = match TcpStream::connect(&backend).await {
            Ok(upstream) => upstream,
            Err(source) => {
                self.advance(ConnectionState::Closing);
                close_quietly(&mut client).await;
                return Err(ConnectionError::Dial { backend, source });
            }
        };
        if let Err(e) = upstream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY on backend socket");
        }

        // Relaying
        info!(hostname = %hostname, backend = %backend, "Forwarding connection");
        self.advance(ConnectionState::Relaying);
        let stats = relay(client, upstream, config.idle_timeout).await;

        self.advance(ConnectionState::Closing);
        Ok(stats)
    }
}

/// Run the TLS handshake, selecting the certificate from the client's SNI.
///
/// Returns the terminated stream and the negotiated hostname.
async fn handshake(
    stream: TcpStream,
    tables: &ProxyTables,
) -> Result<(tokio_rustls::server::TlsStream<TcpStream>, String), ConnectionError> {
    let start = LazyConfigAcceptor::new(Acceptor::default(), stream)
        .await
        .map_err(ConnectionError::Handshake)?;

    let offered = start
        .client_hello()
        .server_name()
        .map(str::to_string)
        .unwrap_or_default();

    // 証明書の選択はハンドシェイク中にストアのresolverで行われる
    let tls = match start.into_stream(tables.tls_config()).await {
        Ok(tls) => tls,
        Err(e) if !tables.certificates().contains(&offered) => {
            debug!(hostname = %offered, error = %e, "Handshake rejected");
            return Err(ConnectionError::CertificateNotFound { hostname: offered });
        }
        Err(e) => return Err(ConnectionError::Handshake(e)),
    };

    let hostname = tls
        .get_ref()
        .1
        .server_name()
        .map(str::to_string)
        .unwrap_or(offered);

    Ok((tls, hostname))
}

/// Await `future`, giving up after `deadline` when one is set.
async fn with_deadline<F: Future>(deadline: Option<Duration>, future: F) -> Option<F::Output> {
    match deadline {
        Some(limit) => tokio::time::timeout(limit, future).await.ok(),
        None => Some(future.await),
    }
}

async fn close_quietly<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S) {
    if let Err(e) = stream.shutdown().await {
        debug!(error = %e, "Error while closing client stream");
    }
}
