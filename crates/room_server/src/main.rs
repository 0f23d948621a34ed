//! Room server binary.
//!
//! Configuration comes from the environment:
//! - `PORT`: listen port (default 8080)
//! - `BIND_ADDRESS`: listen address (default 0.0.0.0)
//! - `DATA_DIR`: when set, snapshots persist to this directory instead
//!   of memory
//! - `RUST_LOG`: tracing filter (default `room_server=info`)

use room_server::{FileSnapshotStore, RoomServer, ServerConfig};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("room_server=info,room_storage=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = ServerConfig::default();
    if let Ok(port) = std::env::var("PORT") {
        config.port = port.parse()?;
    }
    if let Ok(addr) = std::env::var("BIND_ADDRESS") {
        config.bind_address = addr;
    }

    let server = match std::env::var("DATA_DIR") {
        Ok(dir) => {
            tracing::info!(%dir, "persisting snapshots to disk");
            RoomServer::with_store(config, Arc::new(FileSnapshotStore::new(dir)?))
        }
        Err(_) => RoomServer::new(config),
    };

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.shutdown();
        }
    });

    server.run().await?;
    Ok(())
}
