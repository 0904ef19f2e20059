// sampleコマンドの実装

use crate::cli::commands::CommandResult;
use crate::cli::SampleArgs;
use crate::common::config::ProxyConfig;
use crate::common::error::Error;
use std::path::PathBuf;

pub async fn execute(args: SampleArgs) -> CommandResult {
    let output_path = args
        .output
        .unwrap_or_else(|| PathBuf::from("tlsgate-sample.toml"));

    if output_path.exists() {
        return Err(Error::config(format!(
            "Output file '{}' already exists",
            output_path.display()
        )));
    }

    let sample_config = ProxyConfig::sample();
    sample_config.to_file(&output_path)?;

    println!("✅ Sample configuration generated: {}", output_path.display());
    println!("📝 Edit the file to point at your certificates and backends");

    Ok(())
}
