//! Referencer sync server.
//!
//! Environment:
//! - `PORT` (default 5000)
//! - `BIND_HOST` (default 0.0.0.0)
//! - `DB_PATH` (default data/referencer)
//! - `RUST_LOG` for log filtering

use log::info;
use std::path::PathBuf;

use referencer_sync::{ServerConfig, StoreConfig, SyncServer};

const DEFAULT_PORT: u16 = 5000;
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_DB_PATH: &str = "data/referencer";

fn config_from_env() -> Result<ServerConfig, Box<dyn std::error::Error + Send + Sync>> {
    let port = match std::env::var("PORT") {
        Ok(raw) => raw
            .parse::<u16>()
            .map_err(|e| format!("invalid PORT {raw:?}: {e}"))?,
        Err(_) => DEFAULT_PORT,
    };
    let host = std::env::var("BIND_HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string());
    let db_path = std::env::var("DB_PATH").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string());

    Ok(ServerConfig {
        bind_addr: format!("{host}:{port}"),
        storage: StoreConfig {
            path: PathBuf::from(db_path),
            ..StoreConfig::default()
        },
        ..ServerConfig::default()
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let config = config_from_env()?;
    if let Some(parent) = config.storage.path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    info!(
        "Starting referencer sync server on {} (store: {})",
        config.bind_addr,
        config.storage.path.display()
    );

    let server = SyncServer::new(config)?;
    server.run().await
}
