//! IPC server for CLI connections over a Unix domain socket.
//!
//! [`IpcServer`] owns the listening socket; [`IpcServer::serve`] accepts
//! connections until shutdown and answers each request from the daemon's
//! live state through [`IpcContext`].

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use super::messages::{IpcRequest, IpcResponse};
use crate::session::SessionRegistry;

/// Errors that can occur during IPC communication.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A JSON serialization/deserialization error occurred.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Daemon state the IPC server answers from.
#[derive(Clone)]
pub struct IpcContext {
    pub registry: Arc<SessionRegistry>,
    /// Cancelled when a client asks the daemon to stop.
    pub shutdown: CancellationToken,
    pub started_at: Instant,
    pub listen_addr: SocketAddr,
}

impl IpcContext {
    /// Produces the response for one request.
    pub async fn handle(&self, request: IpcRequest) -> IpcResponse {
        match request {
            IpcRequest::Ping => IpcResponse::Pong,
            IpcRequest::Status => IpcResponse::Status {
                listen_addr: self.listen_addr.to_string(),
                uptime_secs: self.started_at.elapsed().as_secs(),
                session_count: self.registry.count(),
                client_count: self.registry.client_count().await,
            },
            IpcRequest::Stop => {
                tracing::info!("Stop requested over IPC");
                self.shutdown.cancel();
                IpcResponse::Stopping
            }
            IpcRequest::ListSessions => IpcResponse::Sessions {
                sessions: self
                    .registry
                    .list()
                    .await
                    .into_iter()
                    .map(Into::into)
                    .collect(),
            },
            IpcRequest::CloseSession { session_id } => {
                if self.registry.close_session(&session_id).await {
                    IpcResponse::SessionClosed { session_id }
                } else {
                    IpcResponse::Error {
                        message: format!("session not found: {session_id}"),
                    }
                }
            }
        }
    }
}

/// A server that listens for IPC connections on a Unix domain socket.
pub struct IpcServer {
    listener: UnixListener,
    path: PathBuf,
}

impl IpcServer {
    /// Binds to `path`, creating parent directories and replacing a stale
    /// socket file.
    pub async fn bind(path: &Path) -> Result<Self, io::Error> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
                restrict_to_owner(parent)?;
            }
        }

        if path.exists() {
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    /// Returns the socket path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Waits for the next client.
    pub async fn accept(&self) -> Result<IpcConnection, io::Error> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(IpcConnection::new(stream))
    }

    /// Accepts connections until `shutdown` fires, then removes the socket
    /// file. Each connection is served on its own task.
    pub async fn serve(self, ctx: IpcContext, shutdown: CancellationToken) {
        tracing::info!(path = %self.path.display(), "IPC server listening");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.accept() => match accepted {
                    Ok(conn) => {
                        tokio::spawn(serve_connection(conn, ctx.clone()));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept IPC connection");
                    }
                },
            }
        }

        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::debug!(path = %self.path.display(), error = %e, "Could not remove IPC socket");
        }
        tracing::debug!("IPC server stopped");
    }
}

async fn serve_connection(mut conn: IpcConnection, ctx: IpcContext) {
    loop {
        let response = match conn.read_request().await {
            Ok(Some(request)) => {
                tracing::debug!(request = ?request, "IPC request");
                ctx.handle(request).await
            }
            Ok(None) => break,
            Err(IpcError::Json(e)) => IpcResponse::Error {
                message: format!("invalid request: {e}"),
            },
            Err(IpcError::Io(e)) => {
                tracing::debug!(error = %e, "IPC connection read failed");
                break;
            }
        };
        if let Err(e) = conn.send_response(&response).await {
            tracing::debug!(error = %e, "IPC connection write failed");
            break;
        }
    }
}

#[cfg(unix)]
fn restrict_to_owner(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn restrict_to_owner(_dir: &Path) -> io::Result<()> {
    Ok(())
}

/// One CLI connection, speaking newline-delimited JSON.
pub struct IpcConnection {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl IpcConnection {
    fn new(stream: UnixStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            lines: BufReader::new(read_half).lines(),
            writer: write_half,
        }
    }

    /// Reads the next request. Returns `None` once the client hangs up.
    pub async fn read_request(&mut self) -> Result<Option<IpcRequest>, IpcError> {
        loop {
            let Some(line) = self.lines.next_line().await? else {
                return Ok(None);
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            return Ok(Some(serde_json::from_str(line)?));
        }
    }

    /// Writes one response line.
    pub async fn send_response(&mut self, response: &IpcResponse) -> Result<(), IpcError> {
        let mut json = serde_json::to_string(response)?;
        json.push('\n');
        self.writer.write_all(json.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }
}
