//! PTY session.
//!
//! A [`Session`] owns one shell running on a pseudo-terminal. Output is read
//! on a dedicated thread and pumped to attached clients by an async task;
//! input and resizes can come from any client at any time. A session is
//! closed exactly once, either on request or when the shell goes away.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use portable_pty::{Child, ChildKiller, MasterPty, PtySize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::multiplexer::{ClientId, ClientStats, SessionOutputBroadcaster, DEFAULT_CLIENT_CAPACITY};
use super::spawn::{force_kill, spawn_pty, SpawnOptions, SpawnedPty};

/// Unique identifier for a session.
pub type SessionId = String;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session is closing or closed.
    #[error("session already closed: {0}")]
    AlreadyClosed(SessionId),

    /// Failed to start the shell on a PTY.
    #[error("failed to spawn PTY: {0}")]
    Spawn(String),

    /// Failed to write to the PTY.
    #[error("failed to write to PTY: {0}")]
    Write(String),

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    Resize(String),

    /// A client with this id is already attached.
    #[error("client already attached: {0}")]
    DuplicateClient(ClientId),

    /// The registry is at its session limit.
    #[error("session limit reached ({0})")]
    LimitReached(usize),
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// The shell is running and the session accepts I/O.
    Running,
    /// Teardown is in progress.
    Closing,
    /// All resources have been released.
    Closed,
}

/// Why a session was closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by an explicit request or daemon shutdown.
    Requested,
    /// The shell exited. Carries the exit code when it was collected.
    ShellExited(Option<u32>),
    /// The PTY reported end of output.
    PtyClosed,
    /// Reading from the PTY failed.
    ReadFailed(String),
}

/// Time allowed for a hung-up shell to exit before it is force-killed.
const KILL_GRACE: Duration = Duration::from_millis(500);

/// Upper bound on waiting for the shell to be reaped during close.
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// Time given to the reader to drain output after the shell has exited.
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(200);

/// Chunks buffered between the reader thread and the output pump.
const READ_CHANNEL_CAPACITY: usize = 64;

/// Default size of a single PTY read.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 32 * 1024;

/// Options for starting a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// How to start the shell.
    pub spawn: SpawnOptions,
    /// Size of a single PTY read.
    pub read_buffer_size: usize,
    /// Chunks queued per client before it is disconnected.
    pub client_capacity: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            spawn: SpawnOptions::default(),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            client_capacity: DEFAULT_CLIENT_CAPACITY,
        }
    }
}

impl SessionOptions {
    /// Sets the shell program.
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.spawn.shell = Some(shell.into());
        self
    }

    /// Sets the initial window size.
    pub fn with_size(mut self, rows: u16, cols: u16) -> Self {
        self.spawn.rows = rows;
        self.spawn.cols = cols;
        self
    }

    /// Adds an environment variable for the shell.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.spawn.env.push((key.into(), value.into()));
        self
    }

    /// Sets the per-client queue capacity.
    pub fn with_client_capacity(mut self, capacity: usize) -> Self {
        self.client_capacity = capacity;
        self
    }
}

/// Point-in-time description of a session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: SessionId,
    pub shell: String,
    pub pid: Option<u32>,
    pub rows: u16,
    pub cols: u16,
    pub clients: usize,
    pub created_at: u64,
    pub state: SessionState,
}

impl From<SessionInfo> for protocol::SessionSummary {
    fn from(info: SessionInfo) -> Self {
        protocol::SessionSummary {
            session_id: info.id,
            shell: info.shell,
            pid: info.pid,
            rows: info.rows,
            cols: info.cols,
            clients: info.clients,
            created_at: info.created_at,
        }
    }
}

enum ReadEvent {
    Data(Bytes),
    Eof,
    Failed(std::io::Error),
}

type SharedWriter = Arc<Mutex<Option<Box<dyn Write + Send>>>>;

/// A running shell on a PTY, shared by any number of clients.
pub struct Session {
    id: SessionId,
    shell: String,
    pid: Option<u32>,
    created_at: u64,
    master: Arc<Mutex<Option<Box<dyn MasterPty + Send>>>>,
    writer: SharedWriter,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    clients: SessionOutputBroadcaster,
    client_capacity: usize,
    state: watch::Sender<SessionState>,
    close_reason: OnceLock<CloseReason>,
    exit_code: Arc<OnceLock<u32>>,
    /// Stops the output pump.
    shutdown: CancellationToken,
    /// Cancelled once the shell has been reaped.
    exited: CancellationToken,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("shell", &self.shell)
            .field("pid", &self.pid)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Spawns a shell and starts pumping its output.
    ///
    /// Must be called from within a Tokio runtime. On error no process is
    /// left running.
    pub fn start(id: SessionId, options: SessionOptions) -> Result<Arc<Self>, SessionError> {
        // The waiter thread exists before the shell does so that a thread
        // spawn failure can never orphan a child.
        let exit_code = Arc::new(OnceLock::new());
        let exited = CancellationToken::new();
        let (child_tx, child_rx) = std::sync::mpsc::channel::<Box<dyn Child + Send + Sync>>();
        start_waiter_thread(&id, child_rx, Arc::clone(&exit_code), exited.clone())
            .map_err(|e| SessionError::Spawn(format!("failed to start waiter thread: {e}")))?;

        let SpawnedPty {
            shell,
            master,
            reader,
            writer,
            child,
            mut killer,
            pid,
        } = spawn_pty(&options.spawn)?;

        if let Err(std::sync::mpsc::SendError(mut child)) = child_tx.send(child) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(SessionError::Spawn("shell waiter exited early".to_string()));
        }

        let (chunk_tx, chunk_rx) = mpsc::channel(READ_CHANNEL_CAPACITY);
        if let Err(e) = start_reader_thread(&id, reader, options.read_buffer_size, chunk_tx) {
            // The waiter reaps the child once it dies.
            let _ = killer.kill();
            if let Some(pid) = pid {
                force_kill(pid);
            }
            return Err(SessionError::Spawn(format!("failed to start reader thread: {e}")));
        }

        let (state, _) = watch::channel(SessionState::Running);
        let session = Arc::new(Session {
            clients: SessionOutputBroadcaster::new(id.clone()),
            id,
            shell,
            pid,
            created_at: now_millis(),
            master: Arc::new(Mutex::new(Some(master))),
            writer: Arc::new(Mutex::new(Some(writer))),
            killer: Mutex::new(killer),
            client_capacity: options.client_capacity,
            state,
            close_reason: OnceLock::new(),
            exit_code,
            shutdown: CancellationToken::new(),
            exited,
        });

        tokio::spawn(run_output_pump(Arc::clone(&session), chunk_rx));

        tracing::info!(
            session_id = %session.id,
            shell = %session.shell,
            pid = ?session.pid,
            "Session started"
        );

        Ok(session)
    }

    /// Returns the session ID.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns the shell program.
    pub fn shell(&self) -> &str {
        &self.shell
    }

    /// Returns the process ID of the shell, if available.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns the creation time (Unix epoch milliseconds).
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Returns whether the session accepts I/O.
    pub fn is_running(&self) -> bool {
        self.state() == SessionState::Running
    }

    /// Returns why the session closed, once closing has begun.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get().cloned()
    }

    /// Returns the shell's exit code once it has been reaped.
    pub fn exit_code(&self) -> Option<u32> {
        self.exit_code.get().copied()
    }

    /// Attaches a client. The returned receiver yields output chunks in PTY
    /// order and ends when the client is detached or the session closes.
    pub async fn add_client(
        &self,
        client_id: ClientId,
    ) -> Result<mpsc::Receiver<Bytes>, SessionError> {
        if !self.is_running() {
            return Err(SessionError::AlreadyClosed(self.id.clone()));
        }
        self.clients.add_client(client_id, self.client_capacity).await
    }

    /// Detaches a client. Has no effect if the id is not attached.
    pub async fn remove_client(&self, client_id: &str) -> Option<ClientStats> {
        self.clients.remove_client(client_id).await
    }

    /// Returns the number of attached clients.
    pub async fn client_count(&self) -> usize {
        self.clients.client_count().await
    }

    /// Writes input to the shell.
    ///
    /// Writes are serialized, so bytes from one call are never interleaved
    /// with bytes from another.
    pub async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        if !self.is_running() {
            return Err(SessionError::AlreadyClosed(self.id.clone()));
        }
        if data.is_empty() {
            return Ok(());
        }

        let writer = Arc::clone(&self.writer);
        let id = self.id.clone();
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut guard = writer.lock().unwrap_or_else(PoisonError::into_inner);
            let writer = guard.as_mut().ok_or(SessionError::AlreadyClosed(id))?;
            writer
                .write_all(&data)
                .and_then(|()| writer.flush())
                .map_err(|e| SessionError::Write(e.to_string()))
        })
        .await
        .map_err(|e| SessionError::Write(e.to_string()))?
    }

    /// Changes the window size. Zero dimensions are rejected.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), SessionError> {
        if !self.is_running() {
            return Err(SessionError::AlreadyClosed(self.id.clone()));
        }
        if rows == 0 || cols == 0 {
            return Err(SessionError::Resize(format!(
                "invalid window size {rows}x{cols}"
            )));
        }

        let guard = self.master.lock().unwrap_or_else(PoisonError::into_inner);
        let master = guard
            .as_ref()
            .ok_or_else(|| SessionError::AlreadyClosed(self.id.clone()))?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::Resize(e.to_string()))?;

        tracing::debug!(session_id = %self.id, rows, cols, "Resized PTY");
        Ok(())
    }

    /// Returns the current window size as `(rows, cols)`.
    pub fn window_size(&self) -> Result<(u16, u16), SessionError> {
        let guard = self.master.lock().unwrap_or_else(PoisonError::into_inner);
        let master = guard
            .as_ref()
            .ok_or_else(|| SessionError::AlreadyClosed(self.id.clone()))?;
        let size = master
            .get_size()
            .map_err(|e| SessionError::Resize(e.to_string()))?;
        Ok((size.rows, size.cols))
    }

    /// Returns a point-in-time description of the session.
    pub async fn info(&self) -> SessionInfo {
        let (rows, cols) = self.window_size().unwrap_or((0, 0));
        SessionInfo {
            id: self.id.clone(),
            shell: self.shell.clone(),
            pid: self.pid,
            rows,
            cols,
            clients: self.client_count().await,
            created_at: self.created_at,
            state: self.state(),
        }
    }

    /// Closes the session: kills the shell, releases the PTY and disconnects
    /// every client.
    ///
    /// Safe to call any number of times from any task. Only the first call
    /// starts the teardown; every call returns once the session is closed.
    /// Dropping the returned future does not interrupt the teardown.
    pub async fn close(self: &Arc<Self>) {
        self.begin_close(CloseReason::Requested);
        self.wait_closed().await;
    }

    /// Waits until the session has fully closed.
    pub async fn wait_closed(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|state| *state == SessionState::Closed).await;
    }

    /// Moves a running session to `Closing` and spawns its teardown.
    ///
    /// Returns `true` if this call started the teardown, `false` if the
    /// session was already closing or closed.
    pub(crate) fn begin_close(self: &Arc<Self>, reason: CloseReason) -> bool {
        let won = self.state.send_if_modified(|state| {
            if *state == SessionState::Running {
                *state = SessionState::Closing;
                true
            } else {
                false
            }
        });
        if !won {
            return false;
        }

        let _ = self.close_reason.set(reason.clone());
        tracing::info!(session_id = %self.id, reason = ?reason, "Closing session");
        tokio::spawn(Arc::clone(self).teardown());
        true
    }

    async fn teardown(self: Arc<Self>) {
        self.shutdown.cancel();
        self.terminate().await;
        self.release_pty().await;
        let dropped = self.clients.disconnect_all().await;

        self.state.send_replace(SessionState::Closed);
        tracing::info!(
            session_id = %self.id,
            exit_code = ?self.exit_code(),
            clients_disconnected = dropped,
            "Session closed"
        );
    }

    async fn terminate(&self) {
        if self.exited.is_cancelled() {
            return;
        }

        {
            let mut killer = self.killer.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = killer.kill() {
                tracing::debug!(session_id = %self.id, error = %e, "Hangup signal failed");
            }
        }

        if tokio::time::timeout(KILL_GRACE, self.exited.cancelled())
            .await
            .is_ok()
        {
            return;
        }

        if let Some(pid) = self.pid {
            tracing::debug!(session_id = %self.id, pid, "Shell ignored hangup, sending SIGKILL");
            force_kill(pid);
        }

        if tokio::time::timeout(REAP_TIMEOUT, self.exited.cancelled())
            .await
            .is_err()
        {
            tracing::warn!(session_id = %self.id, pid = ?self.pid, "Shell was not reaped in time");
        }
    }

    async fn release_pty(&self) {
        let writer = Arc::clone(&self.writer);
        let master = Arc::clone(&self.master);
        // A write blocked on a full PTY holds the writer lock until the
        // shell's death unblocks it, so drop the handles off the runtime.
        let released = tokio::task::spawn_blocking(move || {
            drop(writer.lock().unwrap_or_else(PoisonError::into_inner).take());
            drop(master.lock().unwrap_or_else(PoisonError::into_inner).take());
        })
        .await;
        if let Err(e) = released {
            tracing::warn!(session_id = %self.id, error = %e, "Failed to release PTY handles");
        }
    }
}

fn start_waiter_thread(
    id: &str,
    child_rx: std::sync::mpsc::Receiver<Box<dyn Child + Send + Sync>>,
    exit_code: Arc<OnceLock<u32>>,
    exited: CancellationToken,
) -> std::io::Result<()> {
    let session_id = id.to_string();
    std::thread::Builder::new()
        .name(format!("pty-wait-{}", short_id(id)))
        .spawn(move || {
            let Ok(mut child) = child_rx.recv() else {
                return;
            };
            match child.wait() {
                Ok(status) => {
                    let _ = exit_code.set(status.exit_code());
                    tracing::debug!(session_id = %session_id, exit_code = status.exit_code(), "Shell exited");
                }
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "Failed to wait for shell");
                }
            }
            exited.cancel();
        })?;
    Ok(())
}

fn start_reader_thread(
    id: &str,
    mut reader: Box<dyn Read + Send>,
    buffer_size: usize,
    tx: mpsc::Sender<ReadEvent>,
) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name(format!("pty-read-{}", short_id(id)))
        .spawn(move || {
            let mut buffer = vec![0u8; buffer_size.max(1)];
            loop {
                let event = match reader.read(&mut buffer) {
                    Ok(0) => ReadEvent::Eof,
                    Ok(n) => ReadEvent::Data(Bytes::copy_from_slice(&buffer[..n])),
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) if is_hangup(&e) => ReadEvent::Eof,
                    Err(e) => ReadEvent::Failed(e),
                };
                let last = !matches!(event, ReadEvent::Data(_));
                // A send error means the pump is gone and nobody wants output.
                if tx.blocking_send(event).is_err() || last {
                    break;
                }
            }
        })?;
    Ok(())
}

/// Linux reports EIO on the master once the slave side has no users left.
#[cfg(unix)]
fn is_hangup(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(nix::errno::Errno::EIO as i32)
}

#[cfg(not(unix))]
fn is_hangup(_err: &std::io::Error) -> bool {
    false
}

async fn run_output_pump(session: Arc<Session>, mut chunks: mpsc::Receiver<ReadEvent>) {
    let exited = session.exited.clone();
    let exit_drained = async move {
        exited.cancelled().await;
        tokio::time::sleep(EXIT_DRAIN_GRACE).await;
    };
    tokio::pin!(exit_drained);

    let reason = loop {
        tokio::select! {
            biased;
            _ = session.shutdown.cancelled() => break None,
            event = chunks.recv() => match event {
                Some(ReadEvent::Data(data)) => {
                    session.clients.broadcast(data).await;
                }
                Some(ReadEvent::Eof) | None => break Some(CloseReason::PtyClosed),
                Some(ReadEvent::Failed(e)) => {
                    tracing::warn!(session_id = %session.id, error = %e, "Error reading from PTY");
                    break Some(CloseReason::ReadFailed(e.to_string()));
                }
            },
            // Some child of the shell may still hold the PTY open.
            _ = &mut exit_drained => break Some(CloseReason::ShellExited(session.exit_code())),
        }
    };

    if let Some(reason) = reason {
        let reason = match reason {
            // End of output usually means the shell is gone; give the waiter
            // a moment to collect its status.
            CloseReason::PtyClosed => {
                let reaped = tokio::time::timeout(EXIT_DRAIN_GRACE, session.exited.cancelled())
                    .await
                    .is_ok();
                if reaped {
                    CloseReason::ShellExited(session.exit_code())
                } else {
                    CloseReason::PtyClosed
                }
            }
            other => other,
        };
        session.begin_close(reason);
    }
    tracing::trace!(session_id = %session.id, "Output pump stopped");
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
