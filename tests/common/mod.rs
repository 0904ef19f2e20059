//! 統合テスト用ハーネス
//!
//! 自己署名証明書、証明書ルート、テスト用バックエンド、プロキシ本体、
//! TLSクライアントを用意する

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rustls::client::{ServerCertVerified, ServerCertVerifier};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use tlsgate::common::config::{DomainConfig, ProxyConfig};
use tlsgate::{ConfigLoader, ProxyTables, Router, RouterConfig, SharedTables};

/// Self-signed certificate for one hostname.
pub struct TestCert {
    pub hostname: String,
    pub cert_pem: String,
    pub key_pem: String,
    pub der: Vec<u8>,
}

impl TestCert {
    pub fn generate(hostname: &str) -> Self {
        let cert = rcgen::generate_simple_self_signed(vec![hostname.to_string()]).unwrap();
        let cert_pem = cert.serialize_pem().unwrap();
        let key_pem = cert.serialize_private_key_pem();

        // PEMと同じ署名のDERを信頼アンカーにする
        let der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .unwrap()
            .remove(0);

        Self {
            hostname: hostname.to_string(),
            cert_pem,
            key_pem,
            der,
        }
    }
}

/// Certificate root laid out as `<root>/<hostname>/{fullchain.pem,privkey.pem}`.
pub struct CertRoot {
    dir: TempDir,
}

impl CertRoot {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write the PEM pair and return `(fullchain, privkey)` paths.
    pub fn add(&self, cert: &TestCert) -> (PathBuf, PathBuf) {
        let host_dir = self.dir.path().join(&cert.hostname);
        fs::create_dir_all(&host_dir).unwrap();

        let chain = host_dir.join("fullchain.pem");
        let key = host_dir.join("privkey.pem");
        fs::write(&chain, &cert.cert_pem).unwrap();
        fs::write(&key, &cert.key_pem).unwrap();

        (chain, key)
    }

    pub fn write_backend(&self, hostname: &str, backend: &str) {
        fs::write(self.dir.path().join(hostname).join("backend"), backend).unwrap();
    }

    /// Domain entry for the configuration file, with the PEM files stored
    /// outside the scanned layout.
    pub fn domain(&self, cert: &TestCert, backend: Option<String>) -> DomainConfig {
        let chain = self.dir.path().join(format!("{}.crt", cert.hostname));
        let key = self.dir.path().join(format!("{}.key", cert.hostname));
        fs::write(&chain, &cert.cert_pem).unwrap();
        fs::write(&key, &cert.key_pem).unwrap();

        DomainConfig {
            domain: cert.hostname.clone(),
            backend,
            full_chain: chain,
            private_key: key,
            ports: BTreeMap::new(),
        }
    }
}

/// Load tables for the given domain entries.
pub fn tables_for(domains: Vec<DomainConfig>) -> ProxyTables {
    let config = ProxyConfig {
        domains,
        ..ProxyConfig::default()
    };
    ConfigLoader::new(config).load().unwrap()
}

/// Plain TCP backend that counts accepted connections.
pub struct TestBackend {
    pub addr: SocketAddr,
    connections: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TestBackend {
    pub async fn spawn<F, Fut>(handler: F) -> Self
    where
        F: Fn(TcpStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicU64::new(0));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let counter = Arc::clone(&connections);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            counter.fetch_add(1, Ordering::SeqCst);
                            tokio::spawn(handler(stream));
                        }
                        Err(_) => break,
                    },
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Self {
            addr,
            connections,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Read one request chunk, answer with `response`, then wait for EOF.
    pub async fn responder(response: &'static [u8]) -> Self {
        Self::spawn(move |mut stream| async move {
            let mut buf = [0u8; 1024];
            match stream.read(&mut buf).await {
                Ok(n) if n > 0 => {
                    if stream.write_all(response).await.is_err() {
                        return;
                    }
                }
                _ => return,
            }
            while let Ok(n) = stream.read(&mut buf).await {
                if n == 0 {
                    break;
                }
            }
        })
        .await
    }

    /// Echo every chunk back as it arrives.
    pub async fn echo() -> Self {
        Self::spawn(|mut stream| async move {
            let mut buf = [0u8; 1024];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        })
        .await
    }

    /// Read until EOF, then send everything back and close.
    pub async fn echo_after_eof() -> Self {
        Self::spawn(|mut stream| async move {
            let mut data = Vec::new();
            if stream.read_to_end(&mut data).await.is_err() {
                return;
            }
            let _ = stream.write_all(&data).await;
            let _ = stream.shutdown().await;
        })
        .await
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::SeqCst)
    }
}

impl Drop for TestBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// A running proxy bound to a loopback port.
pub struct TestProxy {
    pub addr: SocketAddr,
    pub tables: SharedTables,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<tlsgate::Result<()>>>,
}

impl TestProxy {
    pub async fn start(tables: ProxyTables) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self::start_on(listener, tables, RouterConfig::default())
    }

    pub fn start_on(listener: TcpListener, tables: ProxyTables, config: RouterConfig) -> Self {
        let addr = listener.local_addr().unwrap();
        let tables = SharedTables::new(tables);
        let router = Router::from_listeners(vec![listener], tables.clone(), config);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(router.run_until(async move {
            let _ = shutdown_rx.await;
        }));

        Self {
            addr,
            tables,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Stop accepting and return the router's result.
    pub async fn stop(mut self) -> tlsgate::Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        match self.handle.take() {
            Some(handle) => handle.await.unwrap(),
            None => Ok(()),
        }
    }
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// TLS client trusting only `trusted`, offering `hostname` as SNI.
pub async fn connect(
    addr: SocketAddr,
    hostname: &str,
    trusted: &TestCert,
) -> io::Result<TlsStream<TcpStream>> {
    let mut roots = rustls::RootCertStore::empty();
    roots
        .add(&rustls::Certificate(trusted.der.clone()))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

    let config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    handshake(addr, hostname, config).await
}

/// Accepts whatever certificate the server presents.
struct AcceptAnyCertificate;

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

/// TLS client that skips certificate verification, so a failed handshake
/// can only come from the server side.
pub async fn connect_unverified(
    addr: SocketAddr,
    hostname: &str,
) -> io::Result<TlsStream<TcpStream>> {
    let config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
        .with_no_client_auth();
    handshake(addr, hostname, config).await
}

async fn handshake(
    addr: SocketAddr,
    hostname: &str,
    config: rustls::ClientConfig,
) -> io::Result<TlsStream<TcpStream>> {
    let connector = TlsConnector::from(Arc::new(config));

    let server_name = rustls::ServerName::try_from(hostname)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
    let tcp = TcpStream::connect(addr).await?;

    tokio::time::timeout(Duration::from_secs(5), connector.connect(server_name, tcp))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "handshake timed out"))?
}

/// Read until EOF or error, bounded by a timeout.
pub async fn read_until_closed<S>(stream: &mut S) -> io::Result<Vec<u8>>
where
    S: tokio::io::AsyncRead + Unpin,
{
    let mut data = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut data))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read timed out"))??;
    Ok(data)
}
