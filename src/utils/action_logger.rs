use anyhow::Result;
use chrono::Utc;
use std::path::PathBuf;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex as TokioMutex;
use tracing::{error, info};

/// Appends one line per user action (`timestamp | user | action | details`)
/// to a size-rotated log file. Disabled loggers still emit a tracing event.
pub struct ActionLogger {
    log_file_path: Option<PathBuf>,
    max_size_bytes: u64,
    write_lock: TokioMutex<()>,
}

impl ActionLogger {
    pub fn new(log_file_path: Option<PathBuf>, max_size_bytes: u64) -> Self {
        if let Some(parent_dir) = log_file_path.as_ref().and_then(|p| p.parent()) {
            if !parent_dir.as_os_str().is_empty() && !parent_dir.exists() {
                if let Err(e) = std::fs::create_dir_all(parent_dir) {
                    error!(path = %parent_dir.display(), error = %e, "Failed to create action log directory");
                }
            }
        }
        Self {
            log_file_path,
            max_size_bytes,
            write_lock: TokioMutex::new(()),
        }
    }

    pub fn disabled() -> Self {
        Self::new(None, 0)
    }

    async fn rotate_log_if_needed(&self, path: &PathBuf) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }

        let metadata = fs::metadata(path).await?;
        if metadata.len() >= self.max_size_bytes {
            let timestamp = Utc::now().format("%Y-%m-%d_%H-%M-%S").to_string();
            let file_stem = path.file_stem().unwrap_or_default().to_string_lossy();
            let extension = path.extension().unwrap_or_default().to_string_lossy();

            let backup_file_name = format!("{}_{}.{}", file_stem, timestamp, extension);
            fs::rename(path, path.with_file_name(backup_file_name)).await?;
        }
        Ok(())
    }

    pub async fn log(&self, user: &str, action: &str, details: &str) {
        info!(user = %user, action = %action, details = %details, "Action");
        let Some(path) = self.log_file_path.as_ref() else {
            return;
        };
        if let Err(e) = self.try_log(path, user, action, details).await {
            error!(action = %action, error = %e, "Failed to write action log");
        }
    }

    async fn try_log(&self, path: &PathBuf, user: &str, action: &str, details: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.rotate_log_if_needed(path).await?;

        let timestamp = Utc::now().to_rfc3339();
        let details = details.replace('\n', " ");
        let log_entry = format!("{} | {:<16} | {:<20} | {}\n", timestamp, user, action, details);

        let mut file = OpenOptions::new().create(true).append(true).open(path).await?;
        file.write_all(log_entry.as_bytes()).await?;
        Ok(())
    }
}
