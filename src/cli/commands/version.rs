// versionコマンドの実装

use crate::cli::commands::CommandResult;

pub async fn execute() -> CommandResult {
    println!("tlsgate {}", env!("CARGO_PKG_VERSION"));
    println!("Build date: {}", env!("VERGEN_BUILD_DATE"));
    println!("Target: {}", env!("VERGEN_CARGO_TARGET_TRIPLE"));
    println!("Rust version: {}", env!("VERGEN_RUSTC_SEMVER"));

    Ok(())
}
