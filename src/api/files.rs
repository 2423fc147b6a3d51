use super::{AppState, AuthUser, TicketUser};
use crate::error::AppError;
use crate::utils::fs_ops::{self, TransferOp};
use crate::utils::{archive, path_utils};
use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use tokio::io::AsyncReadExt;
use tracing::debug;

const DOWNLOAD_CHUNK: usize = 64 * 1024;

#[derive(Deserialize)]
pub struct PathQuery {
    #[serde(default = "default_path")]
    path: String,
}

fn default_path() -> String {
    "/".to_string()
}

async fn blocking<T, F>(work: F) -> Result<T, AppError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, AppError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| AppError::Internal(format!("File task failed: {}", e)))?
}

fn server_root(state: &AppState, name: &str) -> Result<PathBuf, AppError> {
    Ok(state.connector.process_or_not_found(name)?.directory())
}

/// Paths are taken relative to the server directory even with a leading slash.
fn relative(user_path: &str) -> &str {
    user_path.trim_start_matches('/')
}

pub async fn list(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(name): Path<String>,
    Query(query): Query<PathQuery>,
) -> Result<Json<Value>, AppError> {
    let root = server_root(&state, &name)?;
    let entries = blocking(move || fs_ops::list_directory(&root, relative(&query.path))).await?;
    Ok(Json(json!({ "contents": entries })))
}

pub async fn download(
    State(state): State<AppState>,
    TicketUser(user): TicketUser,
    Path(name): Path<String>,
    Query(query): Query<PathQuery>,
) -> Result<Response, AppError> {
    let root = server_root(&state, &name)?;
    let path = path_utils::resolve(&root, relative(&query.path))?;
    let metadata = tokio::fs::metadata(&path).await?;
    if metadata.is_dir() {
        return Err(AppError::BadRequest("This is a folder, not a file!".to_string()));
    }
    let file = tokio::fs::File::open(&path).await?;
    debug!(server = %name, user = %user.username, path = %path.display(), "Serving download");

    let stream = futures::stream::try_unfold(file, |mut file| async move {
        let mut chunk = vec![0u8; DOWNLOAD_CHUNK];
        let read = file.read(&mut chunk).await?;
        if read == 0 {
            return Ok::<_, std::io::Error>(None);
        }
        chunk.truncate(read);
        Ok(Some((chunk, file)))
    });

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().replace('"', ""))
        .unwrap_or_default();
    let mime = mime_guess::from_path(&path).first_or_octet_stream();
    Ok((
        [
            (header::CONTENT_TYPE, mime.to_string()),
            (header::CONTENT_LENGTH, metadata.len().to_string()),
            (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{}\"", file_name)),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}

/// Writes the raw request body to `path`, replacing any existing file.
pub async fn upload(
    State(state): State<AppState>,
    user: AuthUser,
    Path(name): Path<String>,
    Query(query): Query<PathQuery>,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let root = server_root(&state, &name)?;
    let path = path_utils::resolve_below_root(&root, relative(&query.path))?;
    if tokio::fs::metadata(&path).await.is_ok_and(|m| m.is_dir()) {
        return Err(AppError::Conflict("A folder exists at this path!".to_string()));
    }
    tokio::fs::write(&path, &body).await?;
    state
        .connector
        .log_action(&user.username, "file.upload", &format!("{}: {} ({} bytes)", name, query.path, body.len()))
        .await;
    Ok(Json(json!({ "success": true })))
}

/// Body: `mv` or `cp`, then source and destination, one per line.
pub async fn transfer(
    State(state): State<AppState>,
    user: AuthUser,
    Path(name): Path<String>,
    body: String,
) -> Result<Json<Value>, AppError> {
    let mut lines = body.lines();
    let (Some(op), Some(src), Some(dst)) = (lines.next(), lines.next(), lines.next()) else {
        return Err(AppError::BadRequest("Expected operation, source and destination lines".to_string()));
    };
    let op = TransferOp::parse(op.trim())?;
    let (src, dst) = (src.to_string(), dst.to_string());
    let root = server_root(&state, &name)?;
    let details = format!("{}: {} -> {}", name, src, dst);
    blocking(move || fs_ops::transfer(&root, relative(&src), relative(&dst), op)).await?;
    let action = match op {
        TransferOp::Move => "file.move",
        TransferOp::Copy => "file.copy",
    };
    state.connector.log_action(&user.username, action, &details).await;
    Ok(Json(json!({ "success": true })))
}

pub async fn delete(
    State(state): State<AppState>,
    user: AuthUser,
    Path(name): Path<String>,
    Query(query): Query<PathQuery>,
) -> Result<Json<Value>, AppError> {
    let root = server_root(&state, &name)?;
    let target = query.path.clone();
    blocking(move || fs_ops::delete_path(&root, relative(&target))).await?;
    state
        .connector
        .log_action(&user.username, "file.delete", &format!("{}: {}", name, query.path))
        .await;
    Ok(Json(json!({ "success": true })))
}

pub async fn create_folder(
    State(state): State<AppState>,
    user: AuthUser,
    Path(name): Path<String>,
    Query(query): Query<PathQuery>,
) -> Result<Json<Value>, AppError> {
    let root = server_root(&state, &name)?;
    let target = query.path.clone();
    blocking(move || fs_ops::create_folder(&root, relative(&target))).await?;
    state
        .connector
        .log_action(&user.username, "folder.create", &format!("{}: {}", name, query.path))
        .await;
    Ok(Json(json!({ "success": true })))
}

/// `path` is the archive to create; the body lists the paths to pack.
pub async fn compress(
    State(state): State<AppState>,
    user: AuthUser,
    Path(name): Path<String>,
    Query(query): Query<PathQuery>,
    Json(paths): Json<Vec<String>>,
) -> Result<Json<Value>, AppError> {
    if paths.is_empty() {
        return Err(AppError::BadRequest("No files to compress!".to_string()));
    }
    let root = server_root(&state, &name)?;
    let archive_name = query.path.clone();
    let count = paths.len();
    let written = blocking(move || {
        let archive_path = path_utils::resolve_below_root(&root, relative(&archive_name))?;
        let sources = paths
            .iter()
            .map(|p| path_utils::resolve_below_root(&root, relative(p)))
            .collect::<Result<Vec<_>, _>>()?;
        let base = path_utils::clean_path(&root);
        archive::zip_paths(&base, &archive_path, &sources)
    })
    .await?;
    state
        .connector
        .log_action(&user.username, "file.compress", &format!("{}: {} ({} paths)", name, query.path, count))
        .await;
    Ok(Json(json!({ "success": true, "entries": written })))
}

/// `path` is the archive; the body is the destination folder.
pub async fn decompress(
    State(state): State<AppState>,
    user: AuthUser,
    Path(name): Path<String>,
    Query(query): Query<PathQuery>,
    body: String,
) -> Result<Json<Value>, AppError> {
    let root = server_root(&state, &name)?;
    let archive_name = query.path.clone();
    let destination_name = body.trim().to_string();
    let details = format!("{}: {} -> {}", name, archive_name, destination_name);
    let extracted = blocking(move || {
        let archive_path = path_utils::resolve(&root, relative(&archive_name))?;
        let destination = path_utils::resolve(&root, relative(&destination_name))?;
        if !destination.exists() {
            std::fs::create_dir_all(&destination)?;
        } else if !destination.is_dir() {
            return Err(AppError::Conflict("Destination is not a folder!".to_string()));
        }
        archive::unzip(&archive_path, &destination)
    })
    .await?;
    state.connector.log_action(&user.username, "file.decompress", &details).await;
    Ok(Json(json!({ "success": true, "entries": extracted })))
}

#[cfg(test)]
mod tests {
    use crate::api::test_support::spawn;
    use serde_json::{json, Value};

    #[tokio::test]
    async fn file_lifecycle() {
        let server = spawn().await;
        let token = server.login("alice", "secret").await;
        let root = server.server_dir();

        let made = server
            .client
            .post(server.url("/server/lobby/folder?path=/world"))
            .bearer_auth(&token)
            .send()
            .await
            .unwrap();
        assert_eq!(made.status(), 200);
        assert!(root.join("world").is_dir());

        let uploaded = server
            .client
            .post(server.url("/server/lobby/file?path=world/level.dat"))
            .bearer_auth(&token)
            .body("level-data")
            .send()
            .await
            .unwrap();
        assert_eq!(uploaded.status(), 200);

        let listing: Value = server
            .client
            .get(server.url("/server/lobby/files?path=world"))
            .bearer_auth(&token)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(listing["contents"][0]["name"], "level.dat");

        let copied = server
            .client
            .patch(server.url("/server/lobby/file"))
            .bearer_auth(&token)
            .body("cp\nworld/level.dat\nlevel.bak")
            .send()
            .await
            .unwrap();
        assert_eq!(copied.status(), 200);
        assert_eq!(std::fs::read_to_string(root.join("level.bak")).unwrap(), "level-data");

        let compressed = server
            .client
            .post(server.url("/server/lobby/compress?path=backup.zip"))
            .bearer_auth(&token)
            .json(&json!(["world", "level.bak"]))
            .send()
            .await
            .unwrap();
        assert_eq!(compressed.status(), 200);

        let extracted: Value = server
            .client
            .post(server.url("/server/lobby/decompress?path=backup.zip"))
            .bearer_auth(&token)
            .body("restored")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(extracted["success"], true);
        assert_eq!(
            std::fs::read_to_string(root.join("restored/world/level.dat")).unwrap(),
            "level-data"
        );

        let deleted = server
            .client
            .delete(server.url("/server/lobby/file?path=level.bak"))
            .bearer_auth(&token)
            .send()
            .await
            .unwrap();
        assert_eq!(deleted.status(), 200);
        assert!(!root.join("level.bak").exists());
    }

    #[tokio::test]
    async fn traversal_is_forbidden() {
        let server = spawn().await;
        let token = server.login("alice", "secret").await;
        for path in ["../../etc/passwd", "world/../../../etc/passwd"] {
            let response = server
                .client
                .get(server.url(&format!("/server/lobby/file?path={}", path)))
                .bearer_auth(&token)
                .send()
                .await
                .unwrap();
            assert_eq!(response.status(), 403, "{}", path);
        }
        let moved = server
            .client
            .patch(server.url("/server/lobby/file"))
            .bearer_auth(&token)
            .body("mv\nsomething\n../escape")
            .send()
            .await
            .unwrap();
        assert_eq!(moved.status(), 403);
    }
}
