//! セキュリティモジュール
//!
//! tlsgateのTLS終端基盤を提供します：
//! - PEM証明書・秘密鍵の読み込み
//! - ホスト名ごとの証明書ストア（SNIによる証明書選択）

pub mod store;
pub mod tls;

pub use store::{CertificateStore, CertificateStoreBuilder};
pub use tls::{load_certified_key, server_config, TlsError, TlsResult};
