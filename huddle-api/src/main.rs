use std::sync::Arc;

use anyhow::Result;
use huddle_sfu::{logging, Config, RoomManager};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env().unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}");
        eprintln!("Using default configuration");
        Config::default()
    });

    // Initialize logging
    logging::init_logging(&config.logging)?;

    info!("huddle SFU server starting...");
    info!(
        room_capacity = config.sfu.room_capacity,
        ice_servers = ?config.sfu.ice_servers,
        static_dir = %config.server.static_dir,
        "configuration loaded"
    );

    let manager = Arc::new(RoomManager::new());
    let router = huddle_api::http::create_router(manager, Arc::new(config.clone()));

    let addr = config.http_address();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("listening on {addr}");
    axum::serve(listener, router).await?;

    Ok(())
}
