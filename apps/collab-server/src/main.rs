//! Collaborative beatmap editing server
//! One authoritative room per document, reached over WebSocket

mod config;
mod ws;

use clap::Parser;
use collaboration::{FileSnapshotStore, RoomManager, StaticAccessGate};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use crate::config::{Args, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("collab_server=debug,collaboration=debug")),
        )
        .init();

    let args = Args::parse();
    let config = ServerConfig::load(&args)?;
    info!(
        "Snapshots in {}, default access {}",
        config.snapshot_dir.display(),
        config.default_access
    );

    let gate = Arc::new(StaticAccessGate::new(config.default_access));
    let store = Arc::new(FileSnapshotStore::new(&config.snapshot_dir));
    let manager = Arc::new(RoomManager::new(gate, store, config.sync.clone()));

    // Rooms whose final save failed linger until a later sweep succeeds
    let sweeper = {
        let manager = manager.clone();
        let interval = config.sync.persist_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let removed = manager.sweep().await;
                if removed > 0 {
                    debug!("Swept {} idle rooms", removed);
                }
            }
        })
    };

    let listener = TcpListener::bind(config.listen).await?;
    info!("Collaboration server listening on: {}", config.listen);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    info!("New connection from: {}", addr);
                    tokio::spawn(ws::handle_connection(stream, addr, manager.clone()));
                }
                Err(e) => error!("Accept failed: {}", e),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    sweeper.abort();
    manager.shutdown().await;
    Ok(())
}
