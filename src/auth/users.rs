use crate::auth::password::hash_password;
use crate::error::AppError;
use parking_lot::{Mutex, RwLock};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};

/// `username -> password hash`
pub type UserMap = HashMap<String, String>;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Read cache over the account file. The file stays the source of truth: it is
/// polled for outside edits and every local change is written back through a
/// temp file + rename.
pub struct UserStore {
    path: PathBuf,
    users: RwLock<Arc<UserMap>>,
    last_modified: Mutex<Option<SystemTime>>,
    write_lock: Mutex<()>,
}

impl UserStore {
    /// Loads the account file, creating it with a random `admin` password if it does not exist.
    pub fn load_or_init(path: &Path) -> Result<Arc<Self>, AppError> {
        if !path.exists() {
            let password: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(16)
                .map(char::from)
                .collect();
            let mut users = UserMap::new();
            users.insert("admin".to_string(), hash_password(&password)?);
            write_users_atomic(path, &users)?;
            warn!(path = %path.display(), username = "admin", password = %password, "Created account file with a generated admin password; change it after logging in");
        }
        let store = Arc::new(Self {
            path: path.to_path_buf(),
            users: RwLock::new(Arc::new(UserMap::new())),
            last_modified: Mutex::new(None),
            write_lock: Mutex::new(()),
        });
        store.reload()?;
        Ok(store)
    }

    pub fn snapshot(&self) -> Arc<UserMap> {
        self.users.read().clone()
    }

    pub fn contains(&self, username: &str) -> bool {
        self.users.read().contains_key(username)
    }

    pub fn password_hash(&self, username: &str) -> Option<String> {
        self.users.read().get(username).cloned()
    }

    fn reload(&self) -> Result<(), AppError> {
        let modified = std::fs::metadata(&self.path)?.modified().ok();
        let content = std::fs::read_to_string(&self.path)?;
        let users: UserMap = serde_json::from_str(&content)?;
        debug!(path = %self.path.display(), count = users.len(), "Loaded accounts");
        *self.users.write() = Arc::new(users);
        *self.last_modified.lock() = modified;
        Ok(())
    }

    /// Re-reads the account file if its modification time moved. Returns whether it did.
    pub fn refresh_if_changed(&self) -> Result<bool, AppError> {
        let modified = std::fs::metadata(&self.path)?.modified().ok();
        if modified.is_some() && modified == *self.last_modified.lock() {
            return Ok(false);
        }
        self.reload()?;
        Ok(true)
    }

    /// Polls the account file once per second until the store is dropped.
    pub fn spawn_poller(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(POLL_INTERVAL);
            loop {
                interval.tick().await;
                let Some(store) = weak.upgrade() else {
                    break;
                };
                match store.refresh_if_changed() {
                    Ok(true) => info!(path = %store.path.display(), "Account file changed, reloaded accounts"),
                    Ok(false) => {}
                    Err(e) => error!(path = %store.path.display(), error = %e, "Failed to reload account file"),
                }
            }
        })
    }

    fn mutate<F>(&self, change: F) -> Result<(), AppError>
    where
        F: FnOnce(&mut UserMap) -> Result<(), AppError>,
    {
        let _guard = self.write_lock.lock();
        // Pick up outside edits before writing over them.
        self.refresh_if_changed()?;
        let mut users = (*self.snapshot()).clone();
        change(&mut users)?;
        write_users_atomic(&self.path, &users)?;
        self.reload()
    }

    pub fn create_user(&self, username: &str, password: &str) -> Result<(), AppError> {
        validate_username(username)?;
        validate_password(password)?;
        let hash = hash_password(password)?;
        self.mutate(|users| {
            if users.contains_key(username) {
                return Err(AppError::Conflict(format!("User {} already exists", username)));
            }
            users.insert(username.to_string(), hash);
            Ok(())
        })
    }

    pub fn set_password(&self, username: &str, password: &str) -> Result<(), AppError> {
        validate_password(password)?;
        let hash = hash_password(password)?;
        self.mutate(|users| match users.get_mut(username) {
            Some(entry) => {
                *entry = hash;
                Ok(())
            }
            None => Err(AppError::NotFound(format!("User {} does not exist", username))),
        })
    }

    pub fn delete_user(&self, username: &str) -> Result<(), AppError> {
        self.mutate(|users| match users.remove(username) {
            Some(_) => Ok(()),
            None => Err(AppError::NotFound(format!("User {} does not exist", username))),
        })
    }
}

fn validate_username(username: &str) -> Result<(), AppError> {
    if username.is_empty() || username.contains(char::is_whitespace) || username.contains('@') {
        return Err(AppError::BadRequest("Invalid username!".to_string()));
    }
    Ok(())
}

fn validate_password(password: &str) -> Result<(), AppError> {
    if password.is_empty() {
        return Err(AppError::BadRequest("Password must not be empty!".to_string()));
    }
    Ok(())
}

/// Write the account file atomically (temp file + rename).
fn write_users_atomic(path: &Path, users: &UserMap) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let sorted: std::collections::BTreeMap<_, _> = users.iter().collect();
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, serde_json::to_string_pretty(&sorted)?)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))?;
    }

    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::password::verify_password;
    use tempfile::tempdir;

    #[test]
    fn first_run_creates_admin() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("users.json");
        let store = UserStore::load_or_init(&path).unwrap();
        assert!(path.exists());
        assert!(store.contains("admin"));
        assert!(store.password_hash("admin").unwrap().starts_with("$argon2id$"));
    }

    #[test]
    fn account_lifecycle_is_persisted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("users.json");
        std::fs::write(&path, "{}").unwrap();
        let store = UserStore::load_or_init(&path).unwrap();

        store.create_user("alice", "pw1").unwrap();
        assert!(matches!(store.create_user("alice", "pw2"), Err(AppError::Conflict(_))));
        store.set_password("alice", "pw3").unwrap();
        assert!(verify_password("pw3", &store.password_hash("alice").unwrap()));

        let on_disk: UserMap = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(on_disk.contains_key("alice"));
        assert!(!dir.path().join("users.json.tmp").exists());

        store.delete_user("alice").unwrap();
        assert!(!store.contains("alice"));
        assert!(matches!(store.delete_user("alice"), Err(AppError::NotFound(_))));
    }

    #[test]
    fn rejects_reserved_usernames() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("users.json");
        std::fs::write(&path, "{}").unwrap();
        let store = UserStore::load_or_init(&path).unwrap();
        assert!(matches!(store.create_user("@local", "pw"), Err(AppError::BadRequest(_))));
        assert!(matches!(store.create_user("a b", "pw"), Err(AppError::BadRequest(_))));
    }

    #[test]
    fn picks_up_external_edits() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("users.json");
        std::fs::write(&path, r#"{"alice":"x"}"#).unwrap();
        let store = UserStore::load_or_init(&path).unwrap();
        assert!(store.contains("alice"));

        std::fs::write(&path, r#"{"bob":"y"}"#).unwrap();
        // Force a different mtime in case the filesystem clock is coarse.
        *store.last_modified.lock() = None;
        assert!(store.refresh_if_changed().unwrap());
        assert!(!store.contains("alice"));
        assert!(store.contains("bob"));
    }
}
