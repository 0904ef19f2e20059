// 証明書・秘密鍵の読み込みとTLSサーバー設定
//
// PEMファイルから証明書チェーンと秘密鍵を読み込み、
// SNIで証明書を選択するrustlsサーバー設定を構築します。

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use rustls::sign::{self, CertifiedKey};
use rustls::{Certificate, PrivateKey, ServerConfig};
use rustls_pemfile::{certs, ec_private_keys, pkcs8_private_keys, rsa_private_keys};

use super::store::CertificateStore;
use crate::common::error::Error;

/// TLS関連のエラー
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("Certificate error: {message}")]
    Certificate { message: String },

    #[error("Private key error: {message}")]
    PrivateKey { message: String },

    #[error("Duplicate certificate for hostname '{hostname}'")]
    Duplicate { hostname: String },

    #[error("File I/O error: {message}")]
    FileOperation { message: String },
}

impl From<TlsError> for Error {
    fn from(err: TlsError) -> Self {
        Error::Certificate(err.to_string())
    }
}

/// TLSの結果型
pub type TlsResult<T> = Result<T, TlsError>;

/// 証明書チェーンと秘密鍵を読み込み、署名可能な鍵ペアを作成
pub fn load_certified_key(cert_file: &Path, key_file: &Path) -> TlsResult<CertifiedKey> {
    let chain = load_certificates(cert_file)?;
    let key = load_private_key(key_file)?;

    let signing_key = sign::any_supported_type(&key).map_err(|e| TlsError::PrivateKey {
        message: format!("Unsupported private key in '{}': {}", key_file.display(), e),
    })?;

    Ok(CertifiedKey::new(chain, signing_key))
}

/// 証明書ストアを使うサーバー設定を構築
///
/// The store is installed as the certificate resolver, so certificate
/// selection happens inside the handshake from the client's SNI.
pub fn server_config(store: Arc<CertificateStore>) -> Arc<ServerConfig> {
    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_cert_resolver(store);

    Arc::new(config)
}

/// 証明書ファイルを読み込み
pub fn load_certificates(cert_file: &Path) -> TlsResult<Vec<Certificate>> {
    let cert_data = std::fs::read(cert_file).map_err(|e| TlsError::FileOperation {
        message: format!(
            "Failed to read certificate file '{}': {}",
            cert_file.display(),
            e
        ),
    })?;

    let mut cursor = Cursor::new(cert_data);
    let certs = certs(&mut cursor).map_err(|e| TlsError::Certificate {
        message: format!("Failed to parse certificates: {}", e),
    })?;

    if certs.is_empty() {
        return Err(TlsError::Certificate {
            message: format!("No certificates found in '{}'", cert_file.display()),
        });
    }

    Ok(certs.into_iter().map(Certificate).collect())
}

/// 秘密鍵ファイルを読み込み
pub fn load_private_key(key_file: &Path) -> TlsResult<PrivateKey> {
    let key_data = std::fs::read(key_file).map_err(|e| TlsError::FileOperation {
        message: format!(
            "Failed to read private key file '{}': {}",
            key_file.display(),
            e
        ),
    })?;

    // PKCS8形式の秘密鍵を試行
    let mut cursor = Cursor::new(&key_data);
    if let Ok(mut keys) = pkcs8_private_keys(&mut cursor) {
        if !keys.is_empty() {
            return Ok(PrivateKey(keys.remove(0)));
        }
    }

    // RSA形式の秘密鍵を試行
    let mut cursor = Cursor::new(&key_data);
    if let Ok(mut keys) = rsa_private_keys(&mut cursor) {
        if !keys.is_empty() {
            return Ok(PrivateKey(keys.remove(0)));
        }
    }

    // SEC1形式のEC秘密鍵を試行
    let mut cursor = Cursor::new(&key_data);
    if let Ok(mut keys) = ec_private_keys(&mut cursor) {
        if !keys.is_empty() {
            return Ok(PrivateKey(keys.remove(0)));
        }
    }

    Err(TlsError::PrivateKey {
        message: format!("No valid private key found in '{}'", key_file.display()),
    })
}
