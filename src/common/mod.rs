// アプリケーション全体で共有される共通機能
//
// tlsgate全体で使用される設定、エラー型、共有型を含む

pub mod config;
pub mod error;
pub mod loader;
pub mod types;

pub use error::{Error, Result};
