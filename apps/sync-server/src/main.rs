//! Collaborative document sync and versioning server.
//!
//! Clients connect over a websocket, join a per-document room, and speak the
//! `collab` protocol: live change relay, snapshot saves, version history
//! reads and restores.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use collab::RoomRegistry;
use docstore::DocumentDb;
use tokio::net::TcpListener;
use tracing::info;

mod connection;
mod handlers;

use handlers::AppState;

#[derive(Parser)]
#[command(name = "sync-server")]
#[command(about = "Realtime collaborative document sync and versioning server")]
#[command(version)]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:8080")]
    addr: SocketAddr,

    /// SQLite database path (defaults under the local app data dir)
    #[arg(long)]
    db: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter("sync_server=debug,collab=debug,docstore=debug")
        .init();

    let cli = Cli::parse();

    let db_path = cli.db.unwrap_or_else(docstore::default_db_path);
    let db = DocumentDb::open(&db_path)?;
    info!("Database: {}", db_path.display());

    let state = AppState {
        registry: Arc::new(RoomRegistry::new()),
        db,
    };

    let listener = TcpListener::bind(cli.addr).await?;
    info!("Sync server listening on: {}", cli.addr);

    while let Ok((stream, addr)) = listener.accept().await {
        info!("New connection from: {}", addr);
        tokio::spawn(connection::handle_connection(stream, addr, state.clone()));
    }

    Ok(())
}
