pub mod password;
pub mod store;
pub mod tickets;
pub mod users;

use crate::error::AppError;
use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use parking_lot::RwLock;
use rand::RngCore;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, error, info};

use self::password::{burn_verification, verify_password};
use self::store::{MemoryTokenStore, RedisTokenStore, TokenStore};
use self::users::{UserMap, UserStore};

/// Identity given to requests arriving over the local control socket.
pub const LOCAL_USER: &str = "@local";
/// Cookie carrying the token for browser and WebSocket clients.
pub const AUTH_COOKIE: &str = "X-Authentication";

const TOKEN_BYTES: usize = 96;
const TOKEN_LEN: usize = 128;

/// Where a request came from. Local requests bypass token checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOrigin {
    Local,
    Remote(IpAddr),
}

pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    BASE64_STANDARD.encode(bytes)
}

/// Cheap shape check done before any store lookup.
pub fn is_well_formed_token(token: &str) -> bool {
    token.len() == TOKEN_LEN && BASE64_STANDARD.decode(token).is_ok()
}

/// Pulls the token from the `Authorization` header, falling back to the
/// `X-Authentication` cookie.
pub fn token_from_headers(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        let value = value.trim();
        let token = value.strip_prefix("Bearer ").unwrap_or(value);
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == AUTH_COOKIE)
        .map(|(_, value)| value.to_string())
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Current snapshot of known accounts.
    fn users(&self) -> Arc<UserMap>;
    /// Resolves a token to its username. Unknown, malformed, or orphaned tokens yield `None`.
    async fn validate_token(&self, token: &str) -> Result<Option<String>, AppError>;
    /// Returns a fresh token, or `None` for a bad username/password pair.
    async fn login(&self, username: &str, password: &str) -> Result<Option<String>, AppError>;
    async fn logout(&self, token: &str) -> Result<bool, AppError>;
    async fn close(&self) -> Result<(), AppError>;
    fn describe(&self) -> String;
}

/// Token authenticator over any [`TokenStore`].
pub struct TokenAuthenticator<S: TokenStore> {
    users: Arc<UserStore>,
    store: S,
    name: String,
}

pub type LocalAuthenticator = TokenAuthenticator<MemoryTokenStore>;
pub type SharedAuthenticator = TokenAuthenticator<RedisTokenStore>;

impl<S: TokenStore> TokenAuthenticator<S> {
    pub fn with_store(users: Arc<UserStore>, store: S, name: impl Into<String>) -> Self {
        Self {
            users,
            store,
            name: name.into(),
        }
    }
}

impl LocalAuthenticator {
    pub fn new(users: Arc<UserStore>) -> Self {
        Self::with_store(users, MemoryTokenStore::new(), "local")
    }
}

impl SharedAuthenticator {
    pub async fn connect(users: Arc<UserStore>, url: &str) -> Result<Self, AppError> {
        let store = RedisTokenStore::connect(url).await?;
        Ok(Self::with_store(users, store, format!("redis({})", url)))
    }
}

#[async_trait]
impl<S: TokenStore> Authenticator for TokenAuthenticator<S> {
    fn users(&self) -> Arc<UserMap> {
        self.users.snapshot()
    }

    async fn validate_token(&self, token: &str) -> Result<Option<String>, AppError> {
        if !is_well_formed_token(token) {
            return Ok(None);
        }
        let Some(username) = self.store.get(token).await? else {
            return Ok(None);
        };
        if !self.users.contains(&username) {
            debug!(user = %username, "Token belongs to a deleted account");
            return Ok(None);
        }
        Ok(Some(username))
    }

    async fn login(&self, username: &str, password: &str) -> Result<Option<String>, AppError> {
        let stored_hash = self.users.password_hash(username);
        let password = password.to_string();
        let verified = tokio::task::spawn_blocking(move || match stored_hash {
            Some(hash) => verify_password(&password, &hash),
            None => {
                burn_verification(&password);
                false
            }
        })
        .await
        .map_err(|e| AppError::Internal(format!("Password verification task failed: {}", e)))?;
        if !verified {
            return Ok(None);
        }

        let token = generate_token();
        self.store.insert(&token, username).await?;
        Ok(Some(token))
    }

    async fn logout(&self, token: &str) -> Result<bool, AppError> {
        if !is_well_formed_token(token) {
            return Ok(false);
        }
        self.store.remove(token).await
    }

    async fn close(&self) -> Result<(), AppError> {
        self.store.close().await
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

/// Hot-swappable holder for the active [`Authenticator`]. Calls clone the
/// current backend under a shared lock and run against it after releasing the
/// lock, so a swap only contends with that clone and an in-flight call always
/// finishes on the backend it started with.
pub struct AuthenticatorHandle {
    inner: RwLock<Arc<dyn Authenticator>>,
}

impl AuthenticatorHandle {
    pub fn new(initial: Arc<dyn Authenticator>) -> Self {
        Self {
            inner: RwLock::new(initial),
        }
    }

    pub fn current(&self) -> Arc<dyn Authenticator> {
        self.inner.read().clone()
    }

    /// Installs a new backend and closes the old one.
    pub async fn replace(&self, next: Arc<dyn Authenticator>) {
        let previous = std::mem::replace(&mut *self.inner.write(), next);
        info!(from = %previous.describe(), to = %self.current().describe(), "Swapped authenticator");
        if let Err(e) = previous.close().await {
            error!(error = %e, "Failed to close previous authenticator");
        }
    }

    pub fn users(&self) -> Arc<UserMap> {
        self.current().users()
    }

    pub fn user_exists(&self, username: &str) -> bool {
        username == LOCAL_USER || self.users().contains_key(username)
    }

    pub async fn validate_token(&self, token: &str) -> Result<Option<String>, AppError> {
        self.current().validate_token(token).await
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<Option<String>, AppError> {
        self.current().login(username, password).await
    }

    pub async fn logout(&self, token: &str) -> Result<bool, AppError> {
        self.current().logout(token).await
    }

    pub async fn close(&self) -> Result<(), AppError> {
        self.current().close().await
    }

    /// Authenticates a request: local origin is always trusted, everyone else
    /// needs a valid token in the headers.
    pub async fn validate_request(&self, headers: &HeaderMap, origin: RequestOrigin) -> Result<String, AppError> {
        if origin == RequestOrigin::Local {
            return Ok(LOCAL_USER.to_string());
        }
        let token = token_from_headers(headers).ok_or(AppError::Unauthenticated)?;
        self.validate_token(&token).await?.ok_or(AppError::Unauthenticated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    fn user_store(users: &[(&str, &str)]) -> (TempDir, Arc<UserStore>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        let map: UserMap = users
            .iter()
            .map(|(u, p)| (u.to_string(), password::hash_password(p).unwrap()))
            .collect();
        std::fs::write(&path, serde_json::to_string(&map).unwrap()).unwrap();
        let store = UserStore::load_or_init(&path).unwrap();
        (dir, store)
    }

    #[derive(Default)]
    struct CountingStore {
        inner: MemoryTokenStore,
        lookups: AtomicUsize,
    }

    #[async_trait]
    impl TokenStore for CountingStore {
        async fn get(&self, token: &str) -> Result<Option<String>, AppError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.inner.get(token).await
        }
        async fn insert(&self, token: &str, username: &str) -> Result<(), AppError> {
            self.inner.insert(token, username).await
        }
        async fn remove(&self, token: &str) -> Result<bool, AppError> {
            self.inner.remove(token).await
        }
        async fn close(&self) -> Result<(), AppError> {
            Ok(())
        }
    }

    /// Answers every lookup with `alice`, but only once released.
    struct GatedStore {
        entered: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl TokenStore for GatedStore {
        async fn get(&self, _token: &str) -> Result<Option<String>, AppError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(Some("alice".to_string()))
        }
        async fn insert(&self, _token: &str, _username: &str) -> Result<(), AppError> {
            Ok(())
        }
        async fn remove(&self, _token: &str) -> Result<bool, AppError> {
            Ok(false)
        }
        async fn close(&self) -> Result<(), AppError> {
            Ok(())
        }
    }

    #[test]
    fn generated_tokens_are_well_formed() {
        let token = generate_token();
        assert_eq!(token.len(), 128);
        assert!(is_well_formed_token(&token));
        assert_ne!(token, generate_token());
    }

    #[tokio::test]
    async fn login_validate_logout() {
        let (_dir, users) = user_store(&[("alice", "pw")]);
        let auth = LocalAuthenticator::new(users);

        let token = auth.login("alice", "pw").await.unwrap().expect("login succeeds");
        assert_eq!(auth.validate_token(&token).await.unwrap().as_deref(), Some("alice"));
        assert!(auth.logout(&token).await.unwrap());
        assert_eq!(auth.validate_token(&token).await.unwrap(), None);
        assert!(!auth.logout(&token).await.unwrap());
    }

    #[tokio::test]
    async fn bad_credentials_are_rejected() {
        let (_dir, users) = user_store(&[("alice", "pw")]);
        let auth = LocalAuthenticator::new(users);
        assert_eq!(auth.login("alice", "wrong").await.unwrap(), None);
        assert_eq!(auth.login("mallory", "pw").await.unwrap(), None);
    }

    #[tokio::test]
    async fn malformed_tokens_skip_store_lookup() {
        let (_dir, users) = user_store(&[("alice", "pw")]);
        let auth = TokenAuthenticator::with_store(users, CountingStore::default(), "counting");

        assert_eq!(auth.validate_token("short").await.unwrap(), None);
        assert_eq!(auth.validate_token(&"!".repeat(128)).await.unwrap(), None);
        assert_eq!(auth.validate_token(&format!("{}A", generate_token())).await.unwrap(), None);
        assert_eq!(auth.store.lookups.load(Ordering::SeqCst), 0);

        assert_eq!(auth.validate_token(&generate_token()).await.unwrap(), None);
        assert_eq!(auth.store.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn token_of_deleted_user_is_invalid() {
        let (_dir, users) = user_store(&[("alice", "pw")]);
        let auth = LocalAuthenticator::new(users.clone());
        let token = auth.login("alice", "pw").await.unwrap().unwrap();
        users.delete_user("alice").unwrap();
        assert_eq!(auth.validate_token(&token).await.unwrap(), None);
    }

    #[tokio::test]
    async fn local_origin_bypasses_tokens() {
        let (_dir, users) = user_store(&[]);
        let handle = AuthenticatorHandle::new(Arc::new(LocalAuthenticator::new(users)));
        let user = handle.validate_request(&HeaderMap::new(), RequestOrigin::Local).await.unwrap();
        assert_eq!(user, LOCAL_USER);

        let remote = RequestOrigin::Remote("127.0.0.1".parse().unwrap());
        assert!(matches!(
            handle.validate_request(&HeaderMap::new(), remote).await,
            Err(AppError::Unauthenticated)
        ));
    }

    #[tokio::test]
    async fn cookie_is_used_when_header_missing() {
        let (_dir, users) = user_store(&[("alice", "pw")]);
        let handle = AuthenticatorHandle::new(Arc::new(LocalAuthenticator::new(users)));
        let token = handle.login("alice", "pw").await.unwrap().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_str(&format!("theme=dark; X-Authentication={}", token)).unwrap());
        let remote = RequestOrigin::Remote("10.0.0.2".parse().unwrap());
        assert_eq!(handle.validate_request(&headers, remote).await.unwrap(), "alice");

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("nonsense"));
        assert!(handle.validate_request(&headers, remote).await.is_err());
    }

    #[tokio::test]
    async fn swap_during_inflight_validate_does_not_deadlock() {
        let (_dir, users) = user_store(&[("alice", "pw")]);
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let gated = TokenAuthenticator::with_store(
            users.clone(),
            GatedStore {
                entered: entered.clone(),
                release: release.clone(),
            },
            "gated",
        );
        let handle = Arc::new(AuthenticatorHandle::new(Arc::new(gated)));

        let token = generate_token();
        let inflight = {
            let handle = handle.clone();
            let token = token.clone();
            tokio::spawn(async move { handle.validate_token(&token).await })
        };
        entered.notified().await;

        tokio::time::timeout(
            Duration::from_secs(1),
            handle.replace(Arc::new(LocalAuthenticator::new(users))),
        )
        .await
        .expect("swap must not wait for in-flight calls");
        assert_eq!(handle.current().describe(), "local");

        release.notify_one();
        let result = inflight.await.unwrap().unwrap();
        // Completed against the pre-swap backend.
        assert_eq!(result.as_deref(), Some("alice"));
        // New calls see the post-swap backend, which never issued this token.
        assert_eq!(handle.validate_token(&token).await.unwrap(), None);
    }
}
