use crate::config::ServerConfig;
use crate::error::AppError;
use crate::process::console::ConsoleHub;
use crate::process::stats::ProcessProbe;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Crashes tolerated before a server is left in `CrashedOrFailed`.
pub const MAX_AUTO_RESTARTS: u32 = 3;
const INPUT_QUEUE_DEPTH: usize = 64;
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
const NOTICE_PREFIX: &str = "[procwarden]";
/// Output without a newline is split into lines of at most this many bytes.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ProcessStatus {
    #[default]
    Offline,
    Online,
    CrashedOrFailed,
}

impl ProcessStatus {
    /// Wire code used by the server list: 0 offline, 1 online, 2 crashed.
    pub fn code(self) -> u8 {
        match self {
            ProcessStatus::Offline => 0,
            ProcessStatus::Online => 1,
            ProcessStatus::CrashedOrFailed => 2,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    pub status: u8,
    /// Milliseconds since the current run started, 0 when not running.
    pub uptime: u64,
    pub crash_count: u32,
    pub pid: Option<u32>,
    pub cpu_usage: f32,
    pub memory_usage: u64,
    pub to_delete: bool,
}

#[derive(Default)]
struct RuntimeState {
    status: ProcessStatus,
    uptime_start_nanos: i64,
    crash_count: u32,
    pid: Option<u32>,
    /// Bumped on every spawn so a stale exit monitor can tell it was superseded.
    generation: u64,
    kill_tx: Option<oneshot::Sender<()>>,
    input_tx: Option<mpsc::Sender<String>>,
    marked_for_deletion: bool,
}

/// One supervised server: its configuration, the runtime state of its child
/// process and the console its output feeds.
pub struct ServerProcess {
    name: String,
    config: RwLock<ServerConfig>,
    state: Mutex<RuntimeState>,
    status_tx: watch::Sender<ProcessStatus>,
    probe: Arc<ProcessProbe>,
    console: ConsoleHub,
}

impl ServerProcess {
    pub fn new(name: impl Into<String>, config: ServerConfig, probe: Arc<ProcessProbe>) -> Arc<Self> {
        let (status_tx, _) = watch::channel(ProcessStatus::Offline);
        Arc::new(Self {
            name: name.into(),
            config: RwLock::new(config),
            state: Mutex::new(RuntimeState::default()),
            status_tx,
            probe,
            console: ConsoleHub::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> ServerConfig {
        self.config.read().clone()
    }

    pub fn directory(&self) -> PathBuf {
        self.config.read().directory.clone()
    }

    /// New values apply from the next start.
    pub fn update_config(&self, config: ServerConfig) {
        *self.config.write() = config;
    }

    pub fn console(&self) -> &ConsoleHub {
        &self.console
    }

    pub fn status(&self) -> ProcessStatus {
        self.state.lock().status
    }

    #[cfg(test)]
    pub fn crash_count(&self) -> u32 {
        self.state.lock().crash_count
    }

    pub fn pid(&self) -> Option<u32> {
        self.state.lock().pid
    }

    pub fn watch_status(&self) -> watch::Receiver<ProcessStatus> {
        self.status_tx.subscribe()
    }

    /// Resolves once no child process is running for this server.
    pub async fn wait_for_exit(&self) {
        let mut status = self.watch_status();
        while self.pid().is_some() {
            if status.changed().await.is_err() {
                break;
            }
        }
    }

    pub fn mark_for_deletion(&self) {
        self.state.lock().marked_for_deletion = true;
    }

    pub fn unmark_for_deletion(&self) {
        self.state.lock().marked_for_deletion = false;
    }

    pub fn is_marked_for_deletion(&self) -> bool {
        self.state.lock().marked_for_deletion
    }

    pub fn uptime_millis(&self) -> u64 {
        let start = self.state.lock().uptime_start_nanos;
        if start == 0 {
            return 0;
        }
        (now_nanos().saturating_sub(start) / 1_000_000).max(0) as u64
    }

    pub fn info(&self) -> ProcessInfo {
        let (status, crash_count, pid, to_delete) = {
            let state = self.state.lock();
            (state.status, state.crash_count, state.pid, state.marked_for_deletion)
        };
        let usage = pid.and_then(|pid| self.probe.usage(pid)).unwrap_or_default();
        ProcessInfo {
            status: status.code(),
            uptime: self.uptime_millis(),
            crash_count,
            pid,
            cpu_usage: usage.cpu_usage,
            memory_usage: usage.memory_usage,
            to_delete,
        }
    }

    fn set_status(&self, state: &mut RuntimeState, status: ProcessStatus) {
        state.status = status;
        self.status_tx.send_replace(status);
    }

    fn notice(&self, message: &str) {
        self.console.publish(&format!("{} {}", NOTICE_PREFIX, message));
    }

    /// Spawns the configured command. Synchronous: the exit monitor calls this
    /// to restart after a crash.
    #[instrument(skip(self), fields(server = %self.name))]
    pub fn start(self: &Arc<Self>) -> Result<(), AppError> {
        let config = self.config();
        let mut state = self.state.lock();
        if state.status == ProcessStatus::Online {
            return Err(AppError::Conflict(format!("Server {} is already running", self.name)));
        }
        if state.pid.is_some() {
            return Err(AppError::Conflict(format!("Server {} is still shutting down", self.name)));
        }

        let mut child = match spawn_child(&config) {
            Ok(child) => child,
            Err(e) => {
                state.uptime_start_nanos = 0;
                self.set_status(&mut state, ProcessStatus::CrashedOrFailed);
                drop(state);
                error!(server = %self.name, command = %config.command, directory = %config.directory.display(), error = %e, "Failed to start server");
                self.notice(&format!("Failed to start server {}: {}", self.name, e));
                return Err(e);
            }
        };
        let (Some(stdin), Some(stdout), Some(stderr)) = (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            // kill_on_drop reaps the half-set-up child.
            self.set_status(&mut state, ProcessStatus::CrashedOrFailed);
            return Err(AppError::Internal("Child process pipes were not captured".to_string()));
        };

        let (kill_tx, kill_rx) = oneshot::channel();
        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE_DEPTH);
        state.generation += 1;
        let generation = state.generation;
        state.pid = child.id();
        state.uptime_start_nanos = now_nanos();
        state.kill_tx = Some(kill_tx);
        state.input_tx = Some(input_tx);
        self.set_status(&mut state, ProcessStatus::Online);
        let pid = state.pid;
        drop(state);

        info!(server = %self.name, pid = ?pid, command = %config.command, "Started server");
        self.notice(&format!("Started server {}", self.name));

        let pump = tokio::spawn(self.clone().pump_output(stdout, stderr));
        tokio::spawn(write_input(self.name.clone(), stdin, input_rx));
        let this = self.clone();
        tokio::spawn(async move {
            let name = this.name.clone();
            if let Err(panic) = AssertUnwindSafe(this.monitor(child, kill_rx, pump, generation))
                .catch_unwind()
                .await
            {
                error!(server = %name, panic = %panic_message(panic.as_ref()), "Exit monitor panicked");
            }
        });
        Ok(())
    }

    /// Stops a running server: SIGTERM when `graceful`, otherwise a kill.
    /// A forceful stop also kills a child still lingering after a graceful one.
    /// Returns false if there was nothing to stop.
    #[instrument(skip(self), fields(server = %self.name))]
    pub fn stop(&self, graceful: bool) -> bool {
        let mut state = self.state.lock();
        if state.status != ProcessStatus::Online {
            let lingering = if graceful { None } else { state.kill_tx.take() };
            let pid = state.pid;
            drop(state);
            return match lingering {
                Some(tx) => {
                    warn!(server = %self.name, pid = ?pid, "Killing server that ignored a graceful stop");
                    let _ = tx.send(());
                    true
                }
                None => false,
            };
        }
        self.set_status(&mut state, ProcessStatus::Offline);
        let pid = state.pid;
        let mut kill_tx = if graceful { None } else { state.kill_tx.take() };
        drop(state);

        if graceful && !pid.map(|pid| self.probe.terminate(pid)).unwrap_or(false) {
            warn!(server = %self.name, pid = ?pid, "Could not deliver SIGTERM, killing instead");
            kill_tx = self.state.lock().kill_tx.take();
        }
        if let Some(tx) = kill_tx {
            let _ = tx.send(());
        }

        info!(server = %self.name, pid = ?pid, graceful, "Stopping server");
        self.notice(&format!("Stopped server {}", self.name));
        true
    }

    /// Queues one line for the process's stdin. A trailing newline is added if missing.
    pub async fn send_input(&self, line: &str) -> Result<(), AppError> {
        let sender = self.state.lock().input_tx.clone();
        let sender = sender.ok_or_else(|| AppError::Conflict(format!("Server {} is not running", self.name)))?;
        let mut line = line.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }
        sender
            .send(line)
            .await
            .map_err(|_| AppError::Conflict(format!("Server {} is not accepting input", self.name)))
    }

    async fn pump_output(self: Arc<Self>, stdout: ChildStdout, stderr: ChildStderr) {
        let mut out = BufReader::new(stdout);
        let mut err = BufReader::new(stderr);
        let mut out_buf = Vec::new();
        let mut err_buf = Vec::new();
        let (mut out_done, mut err_done) = (false, false);

        while !(out_done && err_done) {
            tokio::select! {
                read = read_line_capped(&mut out, &mut out_buf), if !out_done => {
                    out_done = self.emit_line(read, &mut out_buf);
                }
                read = read_line_capped(&mut err, &mut err_buf), if !err_done => {
                    err_done = self.emit_line(read, &mut err_buf);
                }
            }
        }
        debug!(server = %self.name, "Output pump finished");
    }

    /// Publishes a complete line from `buf`. Returns true once the stream is exhausted.
    fn emit_line(&self, read: std::io::Result<usize>, buf: &mut Vec<u8>) -> bool {
        match read {
            Ok(0) => {
                if !buf.is_empty() {
                    self.console.publish(&decode_line(buf));
                    buf.clear();
                }
                true
            }
            Ok(_) => {
                if buf.ends_with(b"\n") || buf.len() >= MAX_LINE_BYTES {
                    self.console.publish(&decode_line(buf));
                    buf.clear();
                }
                false
            }
            Err(e) => {
                debug!(server = %self.name, error = %e, "Output stream error");
                true
            }
        }
    }

    async fn monitor(
        self: Arc<Self>,
        mut child: Child,
        mut kill_rx: oneshot::Receiver<()>,
        pump: JoinHandle<()>,
        generation: u64,
    ) {
        let waited = tokio::select! {
            status = child.wait() => Some(status),
            Ok(()) = &mut kill_rx => None,
        };
        let exit = match waited {
            Some(status) => status,
            None => {
                if let Err(e) = child.start_kill() {
                    warn!(server = %self.name, error = %e, "Failed to send kill signal");
                }
                child.wait().await
            }
        };

        if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, pump).await.is_err() {
            debug!(server = %self.name, "Output still open after exit, not waiting for it");
        }
        self.handle_exit(generation, exit);
    }

    fn handle_exit(self: &Arc<Self>, generation: u64, exit: std::io::Result<ExitStatus>) {
        let clean = matches!(&exit, Ok(status) if status.success());
        let mut state = self.state.lock();
        if state.generation != generation {
            debug!(server = %self.name, generation, "Ignoring exit of a superseded run");
            return;
        }
        state.pid = None;
        state.kill_tx = None;
        state.input_tx = None;
        state.uptime_start_nanos = 0;

        if clean || state.status == ProcessStatus::Offline {
            state.crash_count = 0;
            self.set_status(&mut state, ProcessStatus::Offline);
            drop(state);
            info!(server = %self.name, exit = ?exit.ok().and_then(|s| s.code()), "Server stopped");
            return;
        }

        state.crash_count += 1;
        let crash_count = state.crash_count;
        let marked = state.marked_for_deletion;
        self.set_status(&mut state, ProcessStatus::CrashedOrFailed);
        drop(state);

        match &exit {
            Ok(status) => warn!(server = %self.name, code = ?status.code(), crash_count, "Server crashed"),
            Err(e) => error!(server = %self.name, error = %e, crash_count, "Lost track of server process"),
        }
        self.notice(&format!("Server {} has crashed!", self.name));

        if marked {
            return;
        }
        if crash_count <= MAX_AUTO_RESTARTS {
            self.notice(&format!(
                "Restarting server {} after crash ({}/{})",
                self.name, crash_count, MAX_AUTO_RESTARTS
            ));
            if let Err(e) = self.start() {
                error!(server = %self.name, error = %e, "Automatic restart failed");
            }
        } else {
            warn!(server = %self.name, crash_count, "Server crashed too many times, leaving it stopped");
        }
    }
}

fn spawn_child(config: &ServerConfig) -> Result<Child, AppError> {
    let mut parts = config.command.split_whitespace();
    let program = parts
        .next()
        .ok_or_else(|| AppError::ProcessError("Empty command".to_string()))?;
    let mut cmd = Command::new(program);
    cmd.args(parts)
        .current_dir(&config.directory)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd.spawn()
        .map_err(|e| AppError::ProcessError(format!("Failed to spawn '{}': {}", config.command, e)))
}

/// `read_until(b'\n')` that also returns once `buf` holds [`MAX_LINE_BYTES`].
/// Bytes taken from the reader are always in `buf`, so it can be dropped
/// mid-read inside `select!` without losing output.
async fn read_line_capped<R: AsyncBufRead + Unpin>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<usize> {
    let mut read = 0;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(read);
        }
        let room = MAX_LINE_BYTES.saturating_sub(buf.len());
        let window = &available[..available.len().min(room)];
        let (used, done) = match window.iter().position(|&b| b == b'\n') {
            Some(i) => (i + 1, true),
            None => (window.len(), buf.len() + window.len() >= MAX_LINE_BYTES),
        };
        buf.extend_from_slice(&available[..used]);
        reader.consume(used);
        read += used;
        if done {
            return Ok(read);
        }
    }
}

async fn write_input(server: String, mut stdin: ChildStdin, mut input_rx: mpsc::Receiver<String>) {
    while let Some(line) = input_rx.recv().await {
        let written: std::io::Result<()> = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        }
        .await;
        if let Err(e) = written {
            debug!(server = %server, error = %e, "Stdin closed");
            break;
        }
    }
}

fn decode_line(buf: &[u8]) -> String {
    let mut end = buf.len();
    while end > 0 && matches!(buf[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

fn now_nanos() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(1)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
