//! Convoy Gateway - 会话网关服务器
//!
//! 客户端连接 `ws://<bind_addr>/ws/chat?session_id=<id>`，默认使用回显引擎。
//!
//! 运行方式：
//! ```bash
//! cargo run --bin convoy-gateway
//! CONVOY__GATEWAY__DATABASE_PATH=sessions.db cargo run --bin convoy-gateway
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;

use convoy::config::load_config;
use convoy::engine::EchoEngineFactory;
use convoy::gateway::{Hub, HubConfig};
use convoy::store::{MemoryRecordStore, RecordStore, SqliteRecordStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    convoy::observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("failed to load configuration")?;

    let store: Arc<dyn RecordStore> = match &cfg.gateway.database_path {
        Some(path) => {
            tracing::info!("Using SQLite store at {}", path.display());
            Arc::new(
                SqliteRecordStore::new(path)
                    .await
                    .with_context(|| format!("failed to open database {}", path.display()))?,
            )
        }
        None => {
            tracing::warn!("No database_path configured, sessions are kept in memory only");
            Arc::new(MemoryRecordStore::new())
        }
    };

    let hub = Hub::new(
        HubConfig::from_app_config(&cfg),
        store,
        Arc::new(EchoEngineFactory),
    );

    let addr = hub.start().await.map_err(anyhow::Error::msg)?;
    tracing::info!("Convoy gateway ready on ws://{}/ws/chat", addr);
    tracing::info!("Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down gateway...");
    hub.stop();

    Ok(())
}
