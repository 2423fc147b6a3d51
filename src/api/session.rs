use super::{AppState, AuthUser};
use crate::auth::{token_from_headers, AUTH_COOKIE};
use crate::error::AppError;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

const COOKIE_MAX_AGE_SECS: u64 = 60 * 60 * 24 * 90;

#[derive(Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct LoginQuery {
    /// Deliver the token as an HttpOnly cookie instead of in the body.
    #[serde(default)]
    cookie: bool,
}

pub async fn login(
    State(state): State<AppState>,
    Query(query): Query<LoginQuery>,
    Json(credentials): Json<Credentials>,
) -> Result<Response, AppError> {
    let token = state
        .connector
        .auth()
        .login(&credentials.username, &credentials.password)
        .await?;
    let Some(token) = token else {
        warn!(user = %credentials.username, "Failed login attempt");
        return Err(AppError::Unauthenticated);
    };
    state.connector.log_action(&credentials.username, "login", "").await;

    if query.cookie {
        let cookie = format!(
            "{}={}; HttpOnly; SameSite=Strict; Path=/; Max-Age={}",
            AUTH_COOKIE, token, COOKIE_MAX_AGE_SECS
        );
        return Ok(([(header::SET_COOKIE, cookie)], Json(json!({ "success": true }))).into_response());
    }
    Ok(Json(json!({ "token": token })).into_response())
}

pub async fn logout(State(state): State<AppState>, user: AuthUser, headers: HeaderMap) -> Result<Response, AppError> {
    let token = token_from_headers(&headers).ok_or(AppError::Unauthenticated)?;
    let success = state.connector.auth().logout(&token).await?;
    state.connector.log_action(&user.username, "logout", "").await;
    let cleared = format!("{}=; HttpOnly; SameSite=Strict; Path=/; Max-Age=0", AUTH_COOKIE);
    Ok(([(header::SET_COOKIE, cleared)], Json(json!({ "success": success }))).into_response())
}

/// Issues a one-time ticket bound to the caller's address and session.
pub async fn ott(
    State(state): State<AppState>,
    user: AuthUser,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    let token = token_from_headers(&headers).ok_or(AppError::Unauthenticated)?;
    let ticket = state.connector.tickets().issue(&user.username, &token, user.ip);
    Ok(Json(json!({ "ticket": ticket })))
}
