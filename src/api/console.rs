use super::{AppState, TicketUser};
use crate::connector::Connector;
use crate::error::AppError;
use crate::process::ServerProcess;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

/// Subprotocol selecting the JSON console protocol; anything else gets raw text.
pub const CONSOLE_V2_PROTOCOL: &str = "console-v2";
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);
const CONTROL_QUEUE_DEPTH: usize = 16;

#[derive(Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientMessage {
    Input {
        data: String,
    },
    Ping {
        #[serde(default)]
        id: Value,
    },
}

fn parse_client_message(text: &str) -> Result<ClientMessage, String> {
    serde_json::from_str(text).map_err(|e| format!("Invalid message: {}", e))
}

fn error_message(message: &str) -> Message {
    Message::Text(json!({ "type": "error", "message": message }).to_string())
}

pub async fn upgrade(
    State(state): State<AppState>,
    TicketUser(user): TicketUser,
    Path(name): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    let process = state.connector.process_or_not_found(&name)?;
    let connector = state.connector.clone();
    let idle_timeout = state.console_idle_timeout;
    Ok(ws.protocols([CONSOLE_V2_PROTOCOL]).on_upgrade(move |socket| {
        let v2 = socket
            .protocol()
            .is_some_and(|p| p.as_bytes() == CONSOLE_V2_PROTOCOL.as_bytes());
        serve_console(socket, connector, process, user.username, v2, idle_timeout)
    }))
}

async fn serve_console(
    socket: WebSocket,
    connector: Arc<Connector>,
    process: Arc<ServerProcess>,
    user: String,
    v2: bool,
    idle_timeout: Duration,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    if v2 && ws_tx.send(Message::Text(json!({ "type": "settings" }).to_string())).await.is_err() {
        return;
    }

    let subscription = process.console().subscribe(Some(user.clone()));
    let viewer_id = subscription.id;
    info!(server = %process.name(), user = %user, v2, "Console viewer connected");

    let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE_DEPTH);
    let mut writer = tokio::spawn(write_console(
        ws_tx,
        subscription.receiver,
        control_rx,
        connector.clone(),
        user.clone(),
        v2,
    ));

    let mut deadline = Instant::now() + idle_timeout;
    let mut writer_done = false;
    loop {
        let frame = tokio::select! {
            frame = next_frame(&mut ws_rx, v2.then_some(deadline)) => frame,
            _ = &mut writer => {
                writer_done = true;
                break;
            }
        };
        let Some(message) = frame else {
            break;
        };
        if !connector.auth().user_exists(&user) {
            debug!(user = %user, "Console viewer's account is gone");
            break;
        }
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        if !v2 {
            if let Err(e) = forward_input(&connector, &process, &user, &text).await {
                debug!(server = %process.name(), error = %e, "Dropped console input");
            }
            continue;
        }
        match parse_client_message(&text) {
            Ok(ClientMessage::Input { data }) => {
                deadline = Instant::now() + idle_timeout;
                if let Err(e) = forward_input(&connector, &process, &user, &data).await {
                    let _ = control_tx.send(error_message(&e.public_message())).await;
                }
            }
            Ok(ClientMessage::Ping { id }) => {
                deadline = Instant::now() + idle_timeout;
                let pong = Message::Text(json!({ "type": "pong", "id": id }).to_string());
                let _ = control_tx.send(pong).await;
            }
            Err(reason) => {
                let _ = control_tx.send(error_message(&reason)).await;
            }
        }
    }

    process.console().unsubscribe(viewer_id);
    drop(control_tx);
    if !writer_done {
        let _ = writer.await;
    }
    info!(server = %process.name(), user = %user, "Console viewer disconnected");
}

/// Next frame from the client, or `None` on close, error or idle timeout.
async fn next_frame(ws_rx: &mut SplitStream<WebSocket>, deadline: Option<Instant>) -> Option<Message> {
    let next = match deadline {
        Some(deadline) => match tokio::time::timeout_at(deadline, ws_rx.next()).await {
            Ok(next) => next,
            Err(_) => {
                debug!("Console viewer idle for too long");
                return None;
            }
        },
        None => ws_rx.next().await,
    };
    match next {
        Some(Ok(message)) => Some(message),
        Some(Err(e)) => {
            debug!(error = %e, "Console socket error");
            None
        }
        None => None,
    }
}

async fn forward_input(connector: &Connector, process: &ServerProcess, user: &str, data: &str) -> Result<(), AppError> {
    process.send_input(data).await?;
    connector
        .log_action(user, "console.input", &format!("{}: {}", process.name(), data.trim_end()))
        .await;
    Ok(())
}

/// Sole owner of the socket's send half: console output and control replies
/// are serialized through here.
async fn write_console(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut output: mpsc::Receiver<String>,
    mut control: mpsc::Receiver<Message>,
    connector: Arc<Connector>,
    user: String,
    v2: bool,
) {
    loop {
        let message = tokio::select! {
            biased;
            Some(message) = control.recv() => message,
            chunk = output.recv() => {
                // Closed by the hub: unsubscribed, revoked or too slow.
                let Some(chunk) = chunk else {
                    break;
                };
                if !connector.auth().user_exists(&user) {
                    break;
                }
                if v2 {
                    Message::Text(json!({ "type": "output", "data": chunk }).to_string())
                } else {
                    Message::Text(chunk)
                }
            }
        };
        match tokio::time::timeout(WRITE_TIMEOUT, ws_tx.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(error = %e, "Console write failed");
                break;
            }
            Err(_) => {
                debug!("Console write timed out");
                break;
            }
        }
    }
    let _ = ws_tx.close().await;
}
