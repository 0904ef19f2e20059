// tlsgateの設定管理
//
// 複数のソースから設定を読み込み管理：
// CLI引数 > 設定ファイル > デフォルト値
// 設定ファイルはTOML（拡張子 .json の場合はJSON）

use crate::common::error::{Error, Result};
use crate::router::{RouterConfig, DEFAULT_DRAIN_TIMEOUT};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

// メイン設定構造体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    // 待ち受けホスト
    #[serde(default = "default_bind")]
    pub bind: String,
    // 待ち受けポート一覧（単一ポートや文字列 "443" も可）
    #[serde(
        default = "default_listen",
        alias = "Port",
        deserialize_with = "deserialize_listen"
    )]
    pub listen: Vec<u16>,
    // ホスト名ディレクトリを走査する証明書ルート
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_root: Option<PathBuf>,
    // バックエンド指定がないホストの転送先ポート（ホスト名をそのまま使う）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_port: Option<u16>,
    // portsファイルのルールで使うバックエンドホスト
    #[serde(default = "default_backend_host")]
    pub backend_host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handshake_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_secs: Option<u64>,
    // 停止時に処理中の接続を待つ上限
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drain_timeout_secs: Option<u64>,
    #[serde(default, alias = "Domains")]
    pub domains: Vec<DomainConfig>,
}

// ドメインごとの設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainConfig {
    #[serde(alias = "Domain")]
    pub domain: String,
    // デフォルトのバックエンドアドレス (host:port)
    #[serde(default, alias = "ToPort", skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(alias = "FullChain")]
    pub full_chain: PathBuf,
    #[serde(alias = "PrivateKey")]
    pub private_key: PathBuf,
    // 待ち受けポート → バックエンドアドレス
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ports: BTreeMap<String, String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            bind: default_bind(),
            listen: default_listen(),
            cert_root: None,
            out_port: None,
            backend_host: default_backend_host(),
            handshake_timeout_secs: None,
            idle_timeout_secs: None,
            drain_timeout_secs: None,
            domains: Vec::new(),
        }
    }
}

impl ProxyConfig {
    // ファイルから設定を読み込み
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;

        let config = if is_json(path) {
            Self::from_json(&content)
        } else {
            Self::from_toml(&content)
        }
        .map_err(|e| {
            Error::config(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;

        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    // 設定をファイルに保存
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let content = if is_json(path) {
            serde_json::to_string_pretty(self)?
        } else {
            toml::to_string_pretty(self)
                .map_err(|e| Error::config(format!("Failed to serialize config: {}", e)))?
        };

        std::fs::write(path, content)
            .map_err(|e| Error::config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    // 既定の設定ファイルパス (~/.config/tlsgate/config.toml)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("tlsgate").join("config.toml"))
    }

    // 旧来のJSON設定の場所 (~/.config/proxy/config.json)
    pub fn legacy_path() -> Option<PathBuf> {
        dirs::home_dir().map(|dir| dir.join(".config").join("proxy").join("config.json"))
    }

    // サンプル設定を生成
    pub fn sample() -> Self {
        let mut api_ports = BTreeMap::new();
        api_ports.insert("8443".to_string(), "127.0.0.1:9443".to_string());

        ProxyConfig {
            listen: vec![443, 8443],
            out_port: Some(8080),
            domains: vec![
                DomainConfig {
                    domain: "www.example.com".to_string(),
                    backend: Some("127.0.0.1:8080".to_string()),
                    full_chain: PathBuf::from("/etc/letsencrypt/live/www.example.com/fullchain.pem"),
                    private_key: PathBuf::from("/etc/letsencrypt/live/www.example.com/privkey.pem"),
                    ports: BTreeMap::new(),
                },
                DomainConfig {
                    domain: "api.example.com".to_string(),
                    backend: Some("127.0.0.1:9000".to_string()),
                    full_chain: PathBuf::from("/etc/letsencrypt/live/api.example.com/fullchain.pem"),
                    private_key: PathBuf::from("/etc/letsencrypt/live/api.example.com/privkey.pem"),
                    ports: api_ports,
                },
            ],
            ..ProxyConfig::default()
        }
    }

    // 設定の妥当性を検証
    pub fn validate(&self) -> Result<()> {
        if self.bind.is_empty() {
            return Err(Error::config("Bind host cannot be empty"));
        }

        if self.listen.is_empty() {
            return Err(Error::config("At least one listen port must be configured"));
        }

        let mut ports = HashSet::new();
        for port in &self.listen {
            if *port == 0 {
                return Err(Error::config("Listen port cannot be 0"));
            }
            if !ports.insert(port) {
                return Err(Error::config(format!("Duplicate listen port: {}", port)));
            }
        }

        if self.out_port == Some(0) {
            return Err(Error::config("Output port cannot be 0"));
        }

        if self.domains.is_empty() && self.cert_root.is_none() {
            return Err(Error::config(
                "No domains configured: add [[domains]] entries or set a certificate root",
            ));
        }

        for domain in &self.domains {
            if domain.domain.is_empty() {
                return Err(Error::config("Domain name cannot be empty"));
            }
            for port in domain.ports.keys() {
                parse_port(port).map_err(|_| {
                    Error::config(format!(
                        "Invalid listen port '{}' for domain {}",
                        port, domain.domain
                    ))
                })?;
            }
        }

        Ok(())
    }

    // 待ち受けアドレス一覧
    pub fn listen_addrs(&self) -> Result<Vec<SocketAddr>> {
        let ip: IpAddr = self
            .bind
            .parse()
            .map_err(|_| Error::config(format!("Invalid bind address: {}", self.bind)))?;

        Ok(self
            .listen
            .iter()
            .map(|port| SocketAddr::new(ip, *port))
            .collect())
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            handshake_timeout: self.handshake_timeout_secs.map(Duration::from_secs),
            idle_timeout: self.idle_timeout_secs.map(Duration::from_secs),
            drain_timeout: self
                .drain_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_DRAIN_TIMEOUT),
        }
    }
}

// ポート番号文字列を解析（0は不可）
pub(crate) fn parse_port(value: &str) -> std::result::Result<u16, String> {
    match value.trim().parse::<u16>() {
        Ok(0) => Err("port cannot be 0".to_string()),
        Ok(port) => Ok(port),
        Err(e) => Err(e.to_string()),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ListenPorts {
    Many(Vec<u16>),
    One(u16),
    Text(String),
}

fn deserialize_listen<'de, D>(deserializer: D) -> std::result::Result<Vec<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    match ListenPorts::deserialize(deserializer)? {
        ListenPorts::Many(ports) => Ok(ports),
        ListenPorts::One(port) => Ok(vec![port]),
        ListenPorts::Text(text) => parse_port(&text)
            .map(|port| vec![port])
            .map_err(serde::de::Error::custom),
    }
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_listen() -> Vec<u16> {
    vec![443]
}

fn default_backend_host() -> String {
    "127.0.0.1".to_string()
}
