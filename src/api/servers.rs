use super::{AppState, AuthUser};
use crate::connector::ControlAction;
use crate::error::AppError;
use crate::process::supervisor::ProcessInfo;
use axum::extract::{Path, State};
use axum::Json;
use serde_json::{json, Value};

pub async fn list(State(state): State<AppState>, _user: AuthUser) -> Json<Value> {
    Json(json!({ "servers": state.connector.server_statuses() }))
}

pub async fn info(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(name): Path<String>,
) -> Result<Json<ProcessInfo>, AppError> {
    let process = state.connector.process_or_not_found(&name)?;
    Ok(Json(process.info()))
}

/// Body is one of `START`, `STOP`, `KILL`, `TERM`.
pub async fn control(
    State(state): State<AppState>,
    user: AuthUser,
    Path(name): Path<String>,
    body: String,
) -> Result<Json<Value>, AppError> {
    let action = ControlAction::parse(&body)?;
    let success = state.connector.control(&name, action)?;
    if success {
        state
            .connector
            .log_action(&user.username, &format!("server.{}", action.as_str()), &name)
            .await;
    }
    Ok(Json(json!({ "success": success })))
}

pub async fn reload_config(State(state): State<AppState>, user: AuthUser) -> Result<Json<Value>, AppError> {
    let summary = state.connector.reload().await?;
    state.connector.log_action(&user.username, "config.reload", "").await;
    Ok(Json(json!({ "success": true, "changes": summary })))
}
