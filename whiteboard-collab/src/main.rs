//! whiteboard-server: real-time whiteboard over WebSocket.
//!
//! ```text
//! whiteboard-server          # serve clients (WHITEBOARD_BIND_ADDR)
//! whiteboard-server relay    # run the relay hub, which owns room storage (WHITEBOARD_RELAY_BIND_ADDR)
//! ```
//!
//! Log output is controlled with `RUST_LOG`.

use log::info;

use whiteboard_collab::{RelayHub, WhiteboardConfig, WhiteboardServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let config = WhiteboardConfig::from_env();

    match std::env::args().nth(1).as_deref() {
        Some("relay") => {
            info!(
                "Starting relay hub on {} (hot log {}, snapshots {})",
                config.relay.bind_addr,
                config.hot_log.path.display(),
                config.snapshots.root.display()
            );
            RelayHub::open(&config)?.run().await
        }
        Some(other) => Err(format!("unknown command: {other} (expected `relay` or nothing)").into()),
        None => {
            info!(
                "Starting whiteboard server on {} (hot log {}, snapshots {})",
                config.server.bind_addr,
                config.hot_log.path.display(),
                config.snapshots.root.display()
            );
            WhiteboardServer::open(&config).await?.run().await
        }
    }
}
