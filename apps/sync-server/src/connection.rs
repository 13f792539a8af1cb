//! Per-connection websocket plumbing: handshake, outbound pump, read loop.

use std::net::SocketAddr;

use collab::ServerMessage;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info};

use crate::handlers::{self, AppState, ConnState};

pub async fn handle_connection(stream: TcpStream, addr: SocketAddr, state: AppState) {
    let ws_stream = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", addr, e);
            return;
        }
    };

    info!("WebSocket connection established: {}", addr);

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    // Outbound pump: typed messages become text frames in queue order
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(e) => {
                    error!("Failed to serialize message: {}", e);
                    continue;
                }
            };
            if let Err(e) = ws_sender.send(Message::Text(json)).await {
                error!("Failed to send message: {}", e);
                break;
            }
        }
    });

    let mut conn = ConnState::new(tx);
    let conn_id = conn.id;

    while let Some(msg) = ws_receiver.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                error!("Error receiving message: {}", e);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                handlers::dispatch(&state, &mut conn, &text).await;
            }
            Message::Ping(_) => {
                // tungstenite queues the pong reply itself
                debug!("Ping from {}", addr);
            }
            Message::Binary(data) => {
                debug!("Ignoring {} byte binary frame from {}", data.len(), addr);
            }
            Message::Close(_) => {
                info!("Client requested close");
                break;
            }
            _ => {}
        }
    }

    // Cleanup on disconnect; leave is idempotent and prunes empty rooms
    if let Some(document_id) = state.registry.leave(conn_id) {
        info!("Connection {} left document {}", conn_id, document_id);
    }

    send_task.abort();
    info!("Connection closed: {}", addr);
}
