//! Quill relay: forwards document traffic between connected editors.
//!
//! Listens on `QUILL_RELAY_ADDR` (default `127.0.0.1:9090`). Set
//! `RUST_LOG=info` to see connections come and go.

use log::info;
use quill_collab::{RelayConfig, RelayServer};

const ADDR_VAR: &str = "QUILL_RELAY_ADDR";

#[tokio::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();

    let mut config = RelayConfig::default();
    if let Ok(addr) = std::env::var(ADDR_VAR) {
        config.bind_addr = addr;
    }

    info!("Starting Quill relay on {}...", config.bind_addr);
    let server = RelayServer::bind(config).await?;

    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down relay");
            Ok(())
        }
    }
}
