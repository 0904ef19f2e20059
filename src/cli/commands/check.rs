// checkコマンドの実装
//
// 設定と証明書を読み込んで検証し、ルーティングテーブルを表示

use crate::cli::commands::{resolve_config, CommandResult};
use crate::cli::CheckArgs;
use crate::common::loader::ConfigLoader;
use tracing::info;

pub async fn execute(args: CheckArgs) -> CommandResult {
    let config = resolve_config(&args.source)?;
    info!("Validating configuration");

    let loader = ConfigLoader::new(config);
    let (certificates, routes) = match loader.load_parts() {
        Ok(parts) => parts,
        Err(e) => {
            println!("❌ Configuration validation failed: {}", e);
            return Err(e);
        }
    };

    println!("✅ Configuration is valid");
    println!(
        "🔗 Listen: {} on port(s) {:?}",
        loader.config().bind,
        loader.config().listen
    );
    println!("🔑 {} certificate(s) loaded", certificates.len());

    for entry in routes.entries() {
        match entry.listen_port {
            Some(port) => println!("   - {} (:{}) -> {}", entry.hostname, port, entry.backend),
            None => println!("   - {} -> {}", entry.hostname, entry.backend),
        }
    }

    Ok(())
}
