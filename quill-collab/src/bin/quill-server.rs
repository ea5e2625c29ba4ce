//! Quill collaboration server.
//!
//! Environment:
//! - `QUILL_BIND`     listen address (default 127.0.0.1:9090)
//! - `QUILL_DATA_DIR` RocksDB checkpoint directory (default: in-memory)
//! - `QUILL_HISTORY`  rolling history length per document (default 1000)
//! - `RUST_LOG`       log filter (default info)

use std::path::PathBuf;

use log::info;
use quill_collab::{ServerConfig, SyncServer};

fn config_from_env() -> ServerConfig {
    let mut config = ServerConfig::default();
    if let Ok(bind) = std::env::var("QUILL_BIND") {
        config.bind_addr = bind;
    }
    if let Ok(dir) = std::env::var("QUILL_DATA_DIR") {
        config.storage_path = Some(PathBuf::from(dir));
    }
    if let Ok(history) = std::env::var("QUILL_HISTORY") {
        match history.parse() {
            Ok(limit) => config.session.history_limit = limit,
            Err(e) => log::warn!("Ignoring QUILL_HISTORY={history}: {e}"),
        }
    }
    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = config_from_env();
    match &config.storage_path {
        Some(path) => info!("Checkpoints stored in {}", path.display()),
        None => info!("No QUILL_DATA_DIR set, documents are kept in memory"),
    }

    let server = SyncServer::new(config)?;
    let listener = server.bind().await?;

    tokio::select! {
        result = server.serve(listener) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    server.registry().close_all().await;
    Ok(())
}
