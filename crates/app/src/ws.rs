use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::engine::{EngineError, EngineHandle};
use crate::hub::{ClientConnection, ConnectionId, Transport};
use crate::protocol::{ClientMessage, ServerEvent};
use crate::router::AppState;

/// Upgrade the HTTP connection into a timer control session.
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state.engine().clone(), socket))
}

async fn handle_socket(engine: EngineHandle, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let (connection, mut events) = ClientConnection::new(Transport::WebSocket);
    let id = connection.id;
    let (control_tx, mut control_rx) = mpsc::unbounded_channel::<Message>();

    // Hub events and control frames share the socket sink.
    let writer_task = tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                event = events.recv() => match event {
                    Some(event) => match encode(&event) {
                        Some(message) => message,
                        None => continue,
                    },
                    None => {
                        debug!(stage = "ws", %id, "hub released connection");
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                },
                control = control_rx.recv() => match control {
                    Some(message) => message,
                    None => break,
                },
            };
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    if let Err(err) = engine.register(connection).await {
        warn!(stage = "ws", %id, error = %err, "client not registered");
        finalize(writer_task, control_tx).await;
        return;
    }
    info!(stage = "ws", %id, "client connected");

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => match ClientMessage::from_json_str(&text) {
                Ok(command) => {
                    if let Err(err) = apply_command(&engine, id, command).await {
                        warn!(stage = "ws", %id, error = %err, "command not applied");
                        break;
                    }
                }
                Err(err) => {
                    warn!(stage = "ws", %id, error = %err, "failed to parse client message");
                }
            },
            Ok(Message::Ping(payload)) => {
                let _ = control_tx.send(Message::Pong(payload));
            }
            Ok(Message::Close(frame)) => {
                let _ = control_tx.send(Message::Close(frame));
                break;
            }
            Ok(Message::Binary(_)) => {
                debug!(stage = "ws", %id, "binary frame ignored");
            }
            Ok(Message::Pong(_)) => {}
            Err(err) => {
                warn!(stage = "ws", %id, error = %err, "websocket error");
                break;
            }
        }
    }

    engine.unregister(id);
    info!(stage = "ws", %id, "client disconnected");
    finalize(writer_task, control_tx).await;
}

/// Any connected client may issue control commands.
async fn apply_command(
    engine: &EngineHandle,
    id: ConnectionId,
    command: ClientMessage,
) -> Result<(), EngineError> {
    match command {
        ClientMessage::Pause => engine.pause().await,
        ClientMessage::Resume => engine.resume().await,
        ClientMessage::Query { id: request_id } => engine.query_for(id, request_id).await,
        ClientMessage::AddTime { amount } => {
            let applied = engine.add_time(amount).await?;
            debug!(stage = "ws", %id, amount, applied = ?applied.map(|delta| delta.applied), "manual time added");
            Ok(())
        }
    }
}

fn encode(event: &ServerEvent) -> Option<Message> {
    match event.to_json() {
        Ok(text) => Some(Message::Text(text)),
        Err(err) => {
            warn!(stage = "ws", event = event.name(), error = %err, "failed to encode event");
            None
        }
    }
}

async fn finalize(writer_task: JoinHandle<()>, control_tx: mpsc::UnboundedSender<Message>) {
    drop(control_tx);
    let _ = writer_task.await;
}
