pub mod accounts;
pub mod console;
pub mod files;
pub mod servers;
pub mod session;

use crate::auth::RequestOrigin;
use crate::connector::Connector;
use crate::error::AppError;
use async_trait::async_trait;
use axum::extract::{ConnectInfo, DefaultBodyLimit, FromRequestParts, Query};
use axum::http::request::Parts;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::debug;

/// Largest accepted request body (uploads).
const MAX_BODY_BYTES: usize = 1024 * 1024 * 1024;

/// Shared state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub connector: Arc<Connector>,
    /// How long a v2 console may stay silent before it is closed.
    pub console_idle_timeout: Duration,
}

/// Build the complete axum router.
pub fn build_router(connector: Arc<Connector>) -> Router {
    router_with_console_timeout(connector, console::IDLE_TIMEOUT)
}

fn router_with_console_timeout(connector: Arc<Connector>, console_idle_timeout: Duration) -> Router {
    let state = AppState {
        connector,
        console_idle_timeout,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(root))
        .route("/login", post(session::login))
        .route("/logout", get(session::logout).post(session::logout))
        .route("/ott", get(session::ott))
        .route(
            "/accounts",
            get(accounts::list)
                .post(accounts::create)
                .patch(accounts::change_password)
                .delete(accounts::delete),
        )
        .route("/config/reload", get(servers::reload_config))
        .route("/servers", get(servers::list))
        .route("/server/:name", get(servers::info).post(servers::control))
        .route("/server/:name/console", get(console::upgrade))
        .route("/server/:name/files", get(files::list))
        .route(
            "/server/:name/file",
            get(files::download)
                .post(files::upload)
                .patch(files::transfer)
                .delete(files::delete),
        )
        .route("/server/:name/folder", post(files::create_folder))
        .route("/server/:name/compress", post(files::compress))
        .route("/server/:name/decompress", post(files::decompress))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "version": env!("CARGO_PKG_VERSION") }))
}

fn client_ip(parts: &Parts) -> Result<IpAddr, AppError> {
    parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .ok_or_else(|| AppError::Internal("Peer address missing from request".to_string()))
}

/// A caller that presented a valid token.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub username: String,
    pub ip: IpAddr,
}

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let ip = client_ip(parts)?;
        let username = state
            .connector
            .auth()
            .validate_request(&parts.headers, RequestOrigin::Remote(ip))
            .await?;
        Ok(AuthUser { username, ip })
    }
}

#[derive(Deserialize)]
struct TicketQuery {
    ticket: Option<String>,
}

/// Like [`AuthUser`], but a `?ticket=` one-time ticket may stand in for the
/// token. Used where browsers cannot set headers (downloads, WebSockets).
#[derive(Debug, Clone)]
pub struct TicketUser(pub AuthUser);

#[async_trait]
impl FromRequestParts<AppState> for TicketUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let ticket_id = Query::<TicketQuery>::try_from_uri(&parts.uri)
            .ok()
            .and_then(|Query(query)| query.ticket);
        let Some(ticket_id) = ticket_id else {
            return AuthUser::from_request_parts(parts, state).await.map(TicketUser);
        };

        let ip = client_ip(parts)?;
        let ticket = state
            .connector
            .tickets()
            .consume(&ticket_id, ip)
            .ok_or(AppError::Unauthenticated)?;
        // The delegating session must still be alive.
        match state.connector.auth().validate_token(&ticket.token).await? {
            Some(username) if username == ticket.user => Ok(TicketUser(AuthUser { username, ip })),
            _ => {
                debug!(user = %ticket.user, "Ticket outlived its session");
                Err(AppError::Unauthenticated)
            }
        }
    }
}
