use crate::error::AppError;
use async_trait::async_trait;
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use tracing::info;

/// Backing table of issued tokens (`token -> username`).
#[async_trait]
pub trait TokenStore: Send + Sync + 'static {
    async fn get(&self, token: &str) -> Result<Option<String>, AppError>;
    async fn insert(&self, token: &str, username: &str) -> Result<(), AppError>;
    /// Removes a token, reporting whether it was present.
    async fn remove(&self, token: &str) -> Result<bool, AppError>;
    async fn close(&self) -> Result<(), AppError>;
}

#[derive(Default)]
pub struct MemoryTokenStore {
    tokens: RwLock<HashMap<String, String>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn get(&self, token: &str) -> Result<Option<String>, AppError> {
        Ok(self.tokens.read().get(token).cloned())
    }

    async fn insert(&self, token: &str, username: &str) -> Result<(), AppError> {
        self.tokens.write().insert(token.to_string(), username.to_string());
        Ok(())
    }

    async fn remove(&self, token: &str) -> Result<bool, AppError> {
        Ok(self.tokens.write().remove(token).is_some())
    }

    async fn close(&self) -> Result<(), AppError> {
        self.tokens.write().clear();
        Ok(())
    }
}

const REDIS_KEY_PREFIX: &str = "procwarden-token:";
/// Tokens in the shared store expire after 90 days.
const REDIS_TOKEN_TTL_SECS: u64 = 60 * 60 * 24 * 90;

/// Token table kept in Redis so several daemons can share sessions. Keys
/// expire on their own; an evicted key is an invalid token.
pub struct RedisTokenStore {
    conn: ConnectionManager,
}

impl RedisTokenStore {
    pub async fn connect(url: &str) -> Result<Self, AppError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!(url = %url, "Connected to shared token store");
        Ok(Self { conn })
    }

    fn key(token: &str) -> String {
        format!("{}{}", REDIS_KEY_PREFIX, token)
    }
}

#[async_trait]
impl TokenStore for RedisTokenStore {
    async fn get(&self, token: &str) -> Result<Option<String>, AppError> {
        let mut conn = self.conn.clone();
        let username: Option<String> = conn.get(Self::key(token)).await?;
        Ok(username)
    }

    async fn insert(&self, token: &str, username: &str) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(Self::key(token), username, REDIS_TOKEN_TTL_SECS as _).await?;
        Ok(())
    }

    async fn remove(&self, token: &str) -> Result<bool, AppError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(Self::key(token)).await?;
        Ok(removed > 0)
    }

    async fn close(&self) -> Result<(), AppError> {
        info!("Closing shared token store connection");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_insert_get_remove() {
        let store = MemoryTokenStore::new();
        store.insert("t1", "alice").await.unwrap();
        assert_eq!(store.get("t1").await.unwrap().as_deref(), Some("alice"));
        assert!(store.remove("t1").await.unwrap());
        assert!(!store.remove("t1").await.unwrap());
        assert_eq!(store.get("t1").await.unwrap(), None);
    }

    #[test]
    fn redis_keys_are_prefixed() {
        assert_eq!(RedisTokenStore::key("abc"), "procwarden-token:abc");
    }
}
