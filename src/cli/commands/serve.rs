// serveコマンドの実装
//
// 設定を読み込み、証明書とルーティングテーブルを構築してプロキシを起動

use crate::cli::commands::{resolve_config, CommandResult};
use crate::cli::ServeArgs;
use crate::common::config::ProxyConfig;
use crate::common::error::Result;
use crate::common::loader::ConfigLoader;
use crate::router::{Router, SharedTables};
#[cfg(unix)]
use crate::router::ProxyTables;
use tracing::{info, warn};
#[cfg(unix)]
use tracing::error;

pub async fn execute(args: ServeArgs) -> CommandResult {
    let config = build_config(&args)?;
    let loader = ConfigLoader::new(config);

    // 起動前に全テーブルを構築（失敗したら即終了）
    let tables = loader.load()?;
    info!(
        certificates = tables.certificates().len(),
        hostnames = tables.routes().len(),
        "Loaded certificates and routes"
    );

    let tables = SharedTables::new(tables);
    let addrs = loader.config().listen_addrs()?;
    let router = Router::bind(&addrs, tables.clone(), loader.config().router_config()).await?;

    #[cfg(unix)]
    let reloader = spawn_reload_on_hangup(args, tables)?;

    let result = router.run_until(shutdown_signal()).await;

    #[cfg(unix)]
    reloader.abort();

    result
}

// CLI引数を設定に反映
fn build_config(args: &ServeArgs) -> Result<ProxyConfig> {
    let mut config = resolve_config(&args.source)?;

    if !args.ports.is_empty() {
        config.listen = args.ports.clone();
    }
    if let Some(bind) = &args.bind {
        config.bind = bind.clone();
    }
    if let Some(secs) = args.handshake_timeout {
        config.handshake_timeout_secs = Some(secs);
    }
    if let Some(secs) = args.idle_timeout {
        config.idle_timeout_secs = Some(secs);
    }

    Ok(config)
}

#[cfg(unix)]
fn reload(args: &ServeArgs) -> Result<ProxyTables> {
    let config = build_config(args)?;
    ConfigLoader::new(config).load()
}

// SIGHUPで設定を再読み込みし、テーブルを丸ごと差し替える
#[cfg(unix)]
fn spawn_reload_on_hangup(
    args: ServeArgs,
    tables: SharedTables,
) -> Result<tokio::task::JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;

    Ok(tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            info!("SIGHUP received, reloading configuration");

            let args = args.clone();
            match tokio::task::spawn_blocking(move || reload(&args)).await {
                Ok(Ok(new_tables)) => {
                    info!(
                        certificates = new_tables.certificates().len(),
                        hostnames = new_tables.routes().len(),
                        "Configuration reloaded"
                    );
                    tables.replace(new_tables);
                }
                Ok(Err(e)) => error!(error = %e, "Reload failed, keeping previous configuration"),
                Err(e) => error!(error = %e, "Reload task failed"),
            }
        }
    }))
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => {
            warn!(error = %e, "Unable to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    }
}
