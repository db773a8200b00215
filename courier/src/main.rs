use std::sync::Arc;

use courier_delivery::{DeliveryEngine, EngineConfig, LogSink};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    courier_common::logging::init();

    let config_path = find_config_file()?;
    let content = std::fs::read_to_string(&config_path).map_err(|e| {
        anyhow::anyhow!("Failed to read config from {}: {}", config_path.display(), e)
    })?;
    let config: EngineConfig = toml::from_str(&content)?;

    let sink = Arc::new(LogSink);
    let engine = Arc::new(DeliveryEngine::new(config, sink.clone(), sink)?);

    let runner = tokio::spawn(Arc::clone(&engine).run());

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested, draining workers");
    engine.shutdown();
    runner.await?;

    Ok(())
}

/// Find the configuration file using the following precedence:
/// 1. `COURIER_CONFIG` environment variable
/// 2. ./courier.toml (current working directory)
/// 3. /etc/courier/courier.toml (system-wide config)
fn find_config_file() -> anyhow::Result<std::path::PathBuf> {
    if let Ok(env_path) = std::env::var("COURIER_CONFIG") {
        let path = std::path::PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!(
            "COURIER_CONFIG points to non-existent file: {}",
            path.display()
        );
    }

    let default_paths = vec![
        std::path::PathBuf::from("./courier.toml"),
        std::path::PathBuf::from("/etc/courier/courier.toml"),
    ];

    for path in &default_paths {
        if path.exists() {
            return Ok(path.clone());
        }
    }

    let paths_tried = default_paths
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!(
        "No configuration file found. Tried:\n  - COURIER_CONFIG environment variable\n{paths_tried}"
    )
}
