//! Local control channel: newline-delimited JSON requests over a Unix domain
//! socket. Anyone able to open the socket is trusted as `@local`.

use crate::auth::RequestOrigin;
use crate::connector::{Connector, ControlAction};
use crate::error::AppError;
use anyhow::{Context, Result};
use axum::http::HeaderMap;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, error, info, warn};

const MAX_REQUEST_BYTES: usize = 1024 * 1024;

/// Length-limited request lines from one client.
struct RequestLines {
    frames: FramedRead<OwnedReadHalf, LinesCodec>,
    errored: bool,
}

impl RequestLines {
    fn new(reader: OwnedReadHalf) -> Self {
        Self {
            frames: FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_REQUEST_BYTES)),
            errored: false,
        }
    }

    /// `FramedRead` yields a single `None` after a decode error and then reads
    /// on, so that pause is not treated as end of stream.
    async fn next(&mut self) -> Option<Result<String, LinesCodecError>> {
        loop {
            match self.frames.next().await {
                None if std::mem::take(&mut self.errored) => continue,
                None => return None,
                Some(Err(e)) => {
                    self.errored = true;
                    return Some(Err(e));
                }
                Some(Ok(line)) => {
                    self.errored = false;
                    return Some(Ok(line));
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
enum LocalRequest {
    Servers,
    Start { server: String },
    Stop { server: String },
    Kill { server: String },
    Term { server: String },
    Input { server: String, data: String },
    Reload,
    Accounts {
        command: AccountCommand,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
    },
    /// Turns the connection into a raw console stream.
    Console { server: String },
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum AccountCommand {
    List,
    Create,
    Passwd,
    Delete,
}

/// Binds the socket, replacing a stale one left by a previous run.
pub fn bind(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path).with_context(|| format!("Failed to remove stale socket {}", path.display()))?;
    }
    let listener =
        UnixListener::bind(path).with_context(|| format!("Failed to bind local socket {}", path.display()))?;
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("Failed to set socket permissions: {}", path.display()))?;
    }
    Ok(listener)
}

pub async fn serve(connector: Arc<Connector>, listener: UnixListener) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let connector = connector.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(connector, stream).await {
                        debug!(error = %e, "Local client connection ended with error");
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "Failed to accept local connection");
            }
        }
    }
}

async fn write_json(writer: &mut OwnedWriteHalf, value: &Value) -> Result<()> {
    let mut line = value.to_string();
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

fn failure(message: impl Into<String>) -> Value {
    json!({ "success": false, "error": message.into() })
}

async fn handle_client(connector: Arc<Connector>, stream: UnixStream) -> Result<()> {
    let user = connector
        .auth()
        .validate_request(&HeaderMap::new(), RequestOrigin::Local)
        .await?;
    let (reader, mut writer) = stream.into_split();
    let mut lines = RequestLines::new(reader);

    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            // The codec skips the rest of the oversized line.
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                write_json(&mut writer, &failure("Request too large")).await?;
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        if line.trim().is_empty() {
            continue;
        }
        let request = match serde_json::from_str::<LocalRequest>(&line) {
            Ok(request) => request,
            Err(e) => {
                write_json(&mut writer, &failure(format!("Invalid request: {}", e))).await?;
                continue;
            }
        };
        if let LocalRequest::Console { server } = request {
            return stream_console(&connector, &server, lines, writer).await;
        }
        let response = match handle_request(&connector, &user, request).await {
            Ok(value) => value,
            Err(e) => failure(e.public_message()),
        };
        write_json(&mut writer, &response).await?;
    }
    Ok(())
}

async fn handle_request(connector: &Arc<Connector>, user: &str, request: LocalRequest) -> Result<Value, AppError> {
    let (server, action) = match request {
        LocalRequest::Servers => return Ok(json!({ "success": true, "servers": connector.server_statuses() })),
        LocalRequest::Reload => {
            let summary = connector.reload().await?;
            connector.log_action(user, "config.reload", "").await;
            return Ok(json!({ "success": true, "changes": summary }));
        }
        LocalRequest::Input { server, data } => {
            connector.process_or_not_found(&server)?.send_input(&data).await?;
            connector
                .log_action(user, "console.input", &format!("{}: {}", server, data.trim_end()))
                .await;
            return Ok(json!({ "success": true }));
        }
        LocalRequest::Accounts {
            command,
            username,
            password,
        } => return handle_accounts(connector, user, command, username, password).await,
        LocalRequest::Console { .. } => {
            return Err(AppError::BadRequest("Console requests take over the connection".to_string()))
        }
        LocalRequest::Start { server } => (server, ControlAction::Start),
        LocalRequest::Stop { server } | LocalRequest::Kill { server } => (server, ControlAction::Kill),
        LocalRequest::Term { server } => (server, ControlAction::Term),
    };
    let success = connector.control(&server, action)?;
    if success {
        connector
            .log_action(user, &format!("server.{}", action.as_str()), &server)
            .await;
    }
    Ok(json!({ "success": success }))
}

async fn handle_accounts(
    connector: &Arc<Connector>,
    user: &str,
    command: AccountCommand,
    username: Option<String>,
    password: Option<String>,
) -> Result<Value, AppError> {
    if let AccountCommand::List = command {
        let mut names: Vec<String> = connector.users().snapshot().keys().cloned().collect();
        names.sort();
        return Ok(json!({ "success": true, "accounts": names }));
    }
    let username = username.ok_or_else(|| AppError::BadRequest("username is required".to_string()))?;
    let users = connector.users().clone();
    let target = username.clone();
    let action = tokio::task::spawn_blocking(move || match command {
        AccountCommand::Create => {
            let password = password.ok_or_else(|| AppError::BadRequest("password is required".to_string()))?;
            users.create_user(&target, &password).map(|_| "account.create")
        }
        AccountCommand::Passwd => {
            let password = password.ok_or_else(|| AppError::BadRequest("password is required".to_string()))?;
            users.set_password(&target, &password).map(|_| "account.password")
        }
        AccountCommand::Delete => users.delete_user(&target).map(|_| "account.delete"),
        AccountCommand::List => Ok("account.list"),
    })
    .await
    .map_err(|e| AppError::Internal(format!("Account task failed: {}", e)))??;
    if let AccountCommand::Delete = command {
        connector.revoke_consoles(&username);
    }
    connector.log_action(user, action, &username).await;
    Ok(json!({ "success": true }))
}

/// Raw console: replay and live output are written as-is, every line read is
/// sent to the server's stdin.
async fn stream_console(
    connector: &Arc<Connector>,
    server: &str,
    mut lines: RequestLines,
    mut writer: OwnedWriteHalf,
) -> Result<()> {
    let Some(process) = connector.process(server) else {
        write_json(&mut writer, &failure("This server does not exist!")).await?;
        return Ok(());
    };
    let mut subscription = process.console().subscribe(None);
    info!(server = %server, "Local console attached");

    let result: Result<()> = async {
        loop {
            tokio::select! {
                chunk = subscription.receiver.recv() => {
                    let Some(chunk) = chunk else {
                        break;
                    };
                    writer.write_all(chunk.as_bytes()).await?;
                    writer.flush().await?;
                }
                line = lines.next() => {
                    let line = match line {
                        None => break,
                        Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                            warn!(server = %server, "Local console input line too long, dropped");
                            continue;
                        }
                        Some(line) => line?,
                    };
                    if let Err(e) = process.send_input(&line).await {
                        warn!(server = %server, error = %e, "Local console input dropped");
                    }
                }
            }
        }
        Ok(())
    }
    .await;

    process.console().unsubscribe(subscription.id);
    info!(server = %server, "Local console detached");
    result
}
