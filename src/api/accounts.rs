use super::session::Credentials;
use super::{AppState, AuthUser};
use crate::auth::users::UserStore;
use crate::error::AppError;
use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Deserialize)]
pub struct UsernameQuery {
    username: String,
}

pub async fn list(State(state): State<AppState>, _user: AuthUser) -> Json<Vec<String>> {
    let mut names: Vec<String> = state.connector.auth().users().keys().cloned().collect();
    names.sort();
    Json(names)
}

/// Runs an account file change off the async runtime (hashing and file writes block).
async fn with_users<F>(users: &Arc<UserStore>, change: F) -> Result<(), AppError>
where
    F: FnOnce(&UserStore) -> Result<(), AppError> + Send + 'static,
{
    let users = users.clone();
    tokio::task::spawn_blocking(move || change(users.as_ref()))
        .await
        .map_err(|e| AppError::Internal(format!("Account task failed: {}", e)))?
}

pub async fn create(
    State(state): State<AppState>,
    user: AuthUser,
    Json(credentials): Json<Credentials>,
) -> Result<Json<Value>, AppError> {
    let username = credentials.username.clone();
    with_users(state.connector.users(), move |users| {
        users.create_user(&credentials.username, &credentials.password)
    })
    .await?;
    state.connector.log_action(&user.username, "account.create", &username).await;
    Ok(Json(json!({ "success": true })))
}

pub async fn change_password(
    State(state): State<AppState>,
    user: AuthUser,
    Json(credentials): Json<Credentials>,
) -> Result<Json<Value>, AppError> {
    let username = credentials.username.clone();
    with_users(state.connector.users(), move |users| {
        users.set_password(&credentials.username, &credentials.password)
    })
    .await?;
    state.connector.log_action(&user.username, "account.password", &username).await;
    Ok(Json(json!({ "success": true })))
}

pub async fn delete(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<UsernameQuery>,
) -> Result<Json<Value>, AppError> {
    let username = query.username.clone();
    with_users(state.connector.users(), move |users| users.delete_user(&query.username)).await?;
    state.connector.revoke_consoles(&username);
    state.connector.log_action(&user.username, "account.delete", &username).await;
    Ok(Json(json!({ "success": true })))
}

#[cfg(test)]
mod tests {
    use crate::api::test_support::spawn;
    use serde_json::json;

    #[tokio::test]
    async fn account_management_round() {
        let server = spawn().await;
        let token = server.login("alice", "secret").await;

        let created = server
            .client
            .post(server.url("/accounts"))
            .bearer_auth(&token)
            .json(&json!({ "username": "bob", "password": "pw" }))
            .send()
            .await
            .unwrap();
        assert_eq!(created.status(), 200);

        let duplicate = server
            .client
            .post(server.url("/accounts"))
            .bearer_auth(&token)
            .json(&json!({ "username": "bob", "password": "pw" }))
            .send()
            .await
            .unwrap();
        assert_eq!(duplicate.status(), 409);

        let names: Vec<String> = server
            .client
            .get(server.url("/accounts"))
            .bearer_auth(&token)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(names, ["alice", "bob"]);

        let patched = server
            .client
            .patch(server.url("/accounts"))
            .bearer_auth(&token)
            .json(&json!({ "username": "bob", "password": "new" }))
            .send()
            .await
            .unwrap();
        assert_eq!(patched.status(), 200);
        let bob = server.login("bob", "new").await;

        let deleted = server
            .client
            .delete(server.url("/accounts?username=bob"))
            .bearer_auth(&token)
            .send()
            .await
            .unwrap();
        assert_eq!(deleted.status(), 200);

        // Tokens of a deleted account stop working immediately.
        let after = server.client.get(server.url("/servers")).bearer_auth(&bob).send().await.unwrap();
        assert_eq!(after.status(), 401);
    }
}
