use crate::auth::tickets::TicketStore;
use crate::auth::users::UserStore;
use crate::auth::{Authenticator, AuthenticatorHandle, LocalAuthenticator, SharedAuthenticator};
use crate::config::{Config, FileConfig, LoggingConfig, RedisConfig};
use crate::error::AppError;
use crate::process::{ProcessProbe, ProcessStatus, ServerProcess};
use crate::utils::action_logger::ActionLogger;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Control verbs accepted for a server, case-insensitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Start,
    /// `STOP` or `KILL`
    Kill,
    /// `TERM`
    Term,
}

impl ControlAction {
    pub fn parse(action: &str) -> Result<Self, AppError> {
        match action.trim().to_ascii_uppercase().as_str() {
            "START" => Ok(ControlAction::Start),
            "STOP" | "KILL" => Ok(ControlAction::Kill),
            "TERM" => Ok(ControlAction::Term),
            other => Err(AppError::BadRequest(format!("Invalid operation: {}", other))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ControlAction::Start => "start",
            ControlAction::Kill => "kill",
            ControlAction::Term => "term",
        }
    }
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReloadSummary {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
    pub authenticator_swapped: bool,
}

/// Top-level owner of everything the daemon serves: the process table, the
/// swappable authenticator, one-time tickets and the action log.
pub struct Connector {
    config: RwLock<Config>,
    processes: RwLock<HashMap<String, Arc<ServerProcess>>>,
    auth: AuthenticatorHandle,
    users: Arc<UserStore>,
    tickets: TicketStore,
    actions: RwLock<Arc<ActionLogger>>,
    probe: Arc<ProcessProbe>,
}

impl Connector {
    pub async fn new(config: Config) -> Result<Arc<Self>, AppError> {
        let users = UserStore::load_or_init(&config.users_path)?;
        let authenticator = build_authenticator(&config.file.redis, users.clone()).await?;
        info!(authenticator = %authenticator.describe(), "Authenticator ready");
        let probe = Arc::new(ProcessProbe::new());
        let processes = config
            .file
            .servers
            .iter()
            .map(|(name, server)| (name.clone(), ServerProcess::new(name.clone(), server.clone(), probe.clone())))
            .collect();

        Ok(Arc::new(Self {
            actions: RwLock::new(Arc::new(action_logger_for(&config.file.logging))),
            config: RwLock::new(config),
            processes: RwLock::new(processes),
            auth: AuthenticatorHandle::new(authenticator),
            users,
            tickets: TicketStore::new(),
            probe,
        }))
    }

    /// Starts the account file poller.
    pub fn spawn_background_tasks(&self) -> JoinHandle<()> {
        self.users.spawn_poller()
    }

    pub fn auth(&self) -> &AuthenticatorHandle {
        &self.auth
    }

    pub fn users(&self) -> &Arc<UserStore> {
        &self.users
    }

    pub fn tickets(&self) -> &TicketStore {
        &self.tickets
    }

    pub fn file_config(&self) -> FileConfig {
        self.config.read().file.clone()
    }

    pub fn process(&self, name: &str) -> Option<Arc<ServerProcess>> {
        self.processes.read().get(name).cloned()
    }

    pub fn process_or_not_found(&self, name: &str) -> Result<Arc<ServerProcess>, AppError> {
        self.process(name)
            .ok_or_else(|| AppError::NotFound("This server does not exist!".to_string()))
    }

    /// `name -> status code` for every server in the table.
    pub fn server_statuses(&self) -> BTreeMap<String, u8> {
        self.processes
            .read()
            .iter()
            .map(|(name, process)| (name.clone(), process.status().code()))
            .collect()
    }

    pub async fn log_action(&self, user: &str, action: &str, details: &str) {
        let logger = self.actions.read().clone();
        logger.log(user, action, details).await;
    }

    /// Starts every enabled server. Returns how many came up.
    pub fn start_enabled(&self) -> usize {
        let processes: Vec<_> = self.processes.read().values().cloned().collect();
        let mut started = 0;
        for process in processes {
            if !process.config().enabled {
                continue;
            }
            match process.start() {
                Ok(()) => started += 1,
                Err(e) => error!(server = %process.name(), error = %e, "Failed to auto-start server"),
            }
        }
        started
    }

    /// Applies a control verb. `Ok(false)` means nothing happened (already
    /// running on start, not running on stop).
    #[instrument(skip(self))]
    pub fn control(&self, name: &str, action: ControlAction) -> Result<bool, AppError> {
        let process = self.process_or_not_found(name)?;
        match action {
            ControlAction::Start => {
                if process.is_marked_for_deletion() {
                    return Ok(false);
                }
                match process.start() {
                    Ok(()) => Ok(true),
                    Err(AppError::Conflict(_)) => Ok(false),
                    Err(e) => Err(e),
                }
            }
            ControlAction::Kill => Ok(process.stop(false)),
            ControlAction::Term => Ok(process.stop(true)),
        }
    }

    /// Drops open console connections of `username` across all servers.
    pub fn revoke_consoles(&self, username: &str) -> usize {
        self.processes
            .read()
            .values()
            .map(|process| process.console().disconnect_user(username))
            .sum()
    }

    /// Re-reads the config file and reconciles the process table against it.
    #[instrument(skip(self))]
    pub async fn reload(self: &Arc<Self>) -> Result<ReloadSummary, AppError> {
        let current = self.config.read().clone();
        let next = current.reload_file()?;
        let mut summary = ReloadSummary::default();
        let mut to_start = Vec::new();
        let mut to_remove = Vec::new();

        {
            let mut table = self.processes.write();
            for (name, server) in &next.servers {
                match table.get(name) {
                    Some(existing) => {
                        if existing.config() != *server {
                            existing.update_config(server.clone());
                            summary.updated.push(name.clone());
                        }
                        existing.unmark_for_deletion();
                    }
                    None => {
                        let process = ServerProcess::new(name.clone(), server.clone(), self.probe.clone());
                        if server.enabled {
                            to_start.push(process.clone());
                        }
                        table.insert(name.clone(), process);
                        summary.added.push(name.clone());
                    }
                }
            }
            for (name, process) in table.iter() {
                if !next.servers.contains_key(name) {
                    process.mark_for_deletion();
                    to_remove.push(process.clone());
                    summary.removed.push(name.clone());
                }
            }
        }

        for process in to_remove {
            if process.status() == ProcessStatus::Online {
                process.stop(true);
            }
            if process.pid().is_none() {
                self.drop_if_marked(&process);
            } else {
                let connector = self.clone();
                tokio::spawn(async move {
                    process.wait_for_exit().await;
                    connector.drop_if_marked(&process);
                });
            }
        }
        for process in to_start {
            if let Err(e) = process.start() {
                error!(server = %process.name(), error = %e, "Failed to start newly added server");
            }
        }

        if next.redis != current.file.redis {
            match build_authenticator(&next.redis, self.users.clone()).await {
                Ok(authenticator) => {
                    self.auth.replace(authenticator).await;
                    summary.authenticator_swapped = true;
                }
                Err(e) => error!(error = %e, "Failed to build new authenticator, keeping the current one"),
            }
        }
        if next.logging != current.file.logging {
            *self.actions.write() = Arc::new(action_logger_for(&next.logging));
        }
        if next.host != current.file.host || next.port != current.file.port || next.unix_socket != current.file.unix_socket {
            warn!("Listener settings changed, restart the daemon to apply them");
        }

        self.config.write().file = next;
        info!(added = ?summary.added, updated = ?summary.updated, removed = ?summary.removed, "Reloaded config");
        Ok(summary)
    }

    fn drop_if_marked(&self, process: &Arc<ServerProcess>) {
        let mut table = self.processes.write();
        let still_ours = table
            .get(process.name())
            .is_some_and(|current| Arc::ptr_eq(current, process));
        if still_ours && process.is_marked_for_deletion() && process.pid().is_none() {
            table.remove(process.name());
            info!(server = %process.name(), "Removed server from the process table");
        }
    }

    /// Stops every server gracefully, waits a bounded time for them to exit,
    /// then closes the authenticator.
    pub async fn shutdown(&self) {
        let processes: Vec<_> = self.processes.read().values().cloned().collect();
        for process in &processes {
            process.stop(true);
        }
        let exited = tokio::time::timeout(SHUTDOWN_GRACE, async {
            for process in &processes {
                process.wait_for_exit().await;
            }
        })
        .await;
        if exited.is_err() {
            warn!("Some servers did not exit in time, killing them");
            for process in &processes {
                process.stop(false);
            }
        }
        if let Err(e) = self.auth.close().await {
            error!(error = %e, "Failed to close authenticator");
        }
        info!("Shutdown complete");
    }
}

async fn build_authenticator(redis: &RedisConfig, users: Arc<UserStore>) -> Result<Arc<dyn Authenticator>, AppError> {
    if redis.enabled {
        Ok(Arc::new(SharedAuthenticator::connect(users, &redis.url).await?))
    } else {
        Ok(Arc::new(LocalAuthenticator::new(users)))
    }
}

fn action_logger_for(logging: &LoggingConfig) -> ActionLogger {
    if logging.enabled {
        ActionLogger::new(Some(logging.path.clone()), logging.max_size_bytes())
    } else {
        ActionLogger::disabled()
    }
}
