use collaboration::{ClientMessage, CollaborationError, Joined, RoomManager, ServerMessage};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Outbound frames are built by this server, so only inbound ones are capped
const UNBOUNDED: u64 = u64::MAX;

fn frame(message: &ServerMessage) -> Option<Message> {
    match message.to_bytes(UNBOUNDED) {
        Ok(bytes) => Some(Message::Binary(bytes)),
        Err(e) => {
            error!("Failed to encode server message: {}", e);
            None
        }
    }
}

/// Serve one client for the lifetime of its socket.
///
/// The `user_id` in the client's `Join` is taken as-is. This server expects
/// to sit behind an upstream auth layer (a gateway or reverse proxy) that has
/// already authenticated the connection and pinned that id.
pub async fn handle_connection(stream: TcpStream, addr: SocketAddr, manager: Arc<RoomManager>) {
    let ws_stream = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", addr, e);
            return;
        }
    };
    info!("WebSocket connection established: {}", addr);

    let limit = manager.config().max_batch_bytes;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // The first binary frame must be a join
    let (document_id, user_id) = loop {
        let msg = match ws_receiver.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                warn!("Error receiving from {} before join: {}", addr, e);
                return;
            }
            None => return,
        };
        match msg {
            Message::Binary(bytes) => match ClientMessage::from_bytes(&bytes, limit) {
                Ok(ClientMessage::Join {
                    document_id,
                    user_id,
                }) => break (document_id, user_id),
                Ok(other) => {
                    warn!("{} sent {:?} before joining", addr, other);
                }
                Err(e) => {
                    warn!("Undecodable message from {}: {}", addr, e);
                }
            },
            Message::Ping(data) => {
                let _ = ws_sender.send(Message::Pong(data)).await;
            }
            Message::Close(_) => return,
            _ => {}
        }
    };

    let Joined {
        room,
        session_id,
        outbound: mut room_rx,
        ..
    } = match manager.join(document_id, user_id).await {
        Ok(joined) => joined,
        Err(e) => {
            warn!("Join of {} to {} failed: {}", user_id, document_id, e);
            let reply = ServerMessage::Error {
                message: e.to_string(),
            };
            if let Some(msg) = frame(&reply) {
                let _ = ws_sender.send(msg).await;
            }
            let _ = ws_sender.close().await;
            return;
        }
    };

    // Replies that do not go through the room (pong, errors)
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let (pong_tx, mut pong_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let mut send_task = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                message = room_rx.recv() => match message {
                    Some(message) => frame(&message),
                    // Room dropped this session (kicked or closed)
                    None => break,
                },
                Some(message) = reply_rx.recv() => frame(&message),
                Some(data) = pong_rx.recv() => Some(Message::Pong(data)),
            };
            if let Some(msg) = msg {
                if let Err(e) = ws_sender.send(msg).await {
                    error!("Failed to send message: {}", e);
                    return;
                }
            }
        }
        let _ = ws_sender.close().await;
    });

    loop {
        let msg = tokio::select! {
            msg = ws_receiver.next() => msg,
            _ = &mut send_task => {
                debug!("Outbound side of {} finished", addr);
                break;
            }
        };
        let msg = match msg {
            Some(Ok(m)) => m,
            Some(Err(e)) => {
                error!("Error receiving message: {}", e);
                break;
            }
            None => break,
        };

        match msg {
            Message::Binary(bytes) => match ClientMessage::from_bytes(&bytes, limit) {
                Ok(ClientMessage::Commands { payload }) => {
                    match room.handle_commands(session_id, &payload).await {
                        Ok(_) => {}
                        Err(CollaborationError::SessionNotFound(_)) => break,
                        Err(e) => {
                            let _ = reply_tx.send(ServerMessage::Error {
                                message: e.to_string(),
                            });
                        }
                    }
                }
                Ok(ClientMessage::SetPresence { presence }) => {
                    if let Err(CollaborationError::SessionNotFound(_)) =
                        room.set_presence(session_id, presence).await
                    {
                        break;
                    }
                }
                Ok(ClientMessage::KickUser { user_id, reason }) => {
                    match room.kick_user(session_id, user_id, reason).await {
                        Ok(_) => {}
                        Err(CollaborationError::SessionNotFound(_)) => break,
                        Err(e) => {
                            let _ = reply_tx.send(ServerMessage::Error {
                                message: e.to_string(),
                            });
                        }
                    }
                }
                Ok(ClientMessage::Ping) => {
                    let _ = reply_tx.send(ServerMessage::Pong);
                }
                Ok(ClientMessage::Join { .. }) => {
                    let _ = reply_tx.send(ServerMessage::Error {
                        message: "already joined".to_string(),
                    });
                }
                Err(e) => {
                    warn!("Dropping undecodable message from {}: {}", addr, e);
                }
            },
            Message::Ping(data) => {
                let _ = pong_tx.send(data);
            }
            Message::Close(_) => {
                info!("Client requested close");
                break;
            }
            _ => {}
        }
    }

    if let Err(e) = manager.leave(document_id, session_id).await {
        debug!("Leave after disconnect of {}: {}", addr, e);
    }
    send_task.abort();
    info!("Connection closed: {}", addr);
}
