//! Daemon orchestrator for wiring together all components.
//!
//! The `DaemonOrchestrator` owns the session registry and runs the HTTP
//! server and the IPC server against it. Stopping the orchestrator stops
//! both servers and then closes every session.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::ipc::{resolve_socket_path, IpcContext, IpcServer};
use crate::server::{self, AppState};
use crate::session::SessionRegistry;

/// How long `stop` waits for each server task to wind down.
const SERVER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Starting up, binding listeners.
    Starting,
    /// Running and accepting connections.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// Orchestrator state changed.
    StateChanged(OrchestratorState),
    /// A server task ended with an error.
    Error { message: String },
}

/// Daemon orchestrator that manages all subsystems.
pub struct DaemonOrchestrator {
    config: Config,
    state: Arc<RwLock<OrchestratorState>>,
    registry: Arc<SessionRegistry>,
    socket_path: PathBuf,
    local_addr: Option<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
    /// Cancelled on stop, or when a CLI asks the daemon to stop.
    shutdown_token: CancellationToken,
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl DaemonOrchestrator {
    /// Creates a new daemon orchestrator from a validated configuration.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let registry = Arc::new(SessionRegistry::new(config.session.max_sessions));
        let socket_path = resolve_socket_path(config.daemon.socket_path.as_deref());
        let (event_tx, _) = broadcast::channel(64);

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            registry,
            socket_path,
            local_addr: None,
            tasks: Vec::new(),
            shutdown_token: CancellationToken::new(),
            event_tx,
        })
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Returns a receiver for orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Binds the HTTP listener and the IPC socket, then serves both in the
    /// background.
    pub async fn start(&mut self) -> Result<()> {
        self.transition_from(OrchestratorState::Stopped, OrchestratorState::Starting)
            .await?;

        info!("Starting daemon orchestrator...");

        let started = match self.spawn_servers().await {
            Ok(addr) => addr,
            Err(e) => {
                self.set_state(OrchestratorState::Stopped).await;
                return Err(e);
            }
        };
        self.local_addr = Some(started);

        self.set_state(OrchestratorState::Running).await;
        info!(addr = %started, socket = %self.socket_path.display(), "Daemon orchestrator started");
        Ok(())
    }

    async fn spawn_servers(&mut self) -> Result<SocketAddr> {
        let listener = TcpListener::bind(&self.config.server.bind)
            .await
            .with_context(|| format!("Failed to bind {}", self.config.server.bind))?;
        let local_addr = listener.local_addr()?;

        let ipc = IpcServer::bind(&self.socket_path).await.with_context(|| {
            format!("Failed to bind IPC socket: {}", self.socket_path.display())
        })?;

        let app_state = Arc::new(AppState {
            registry: Arc::clone(&self.registry),
            session_config: self.config.session.clone(),
            allowed_origins: self.config.server.allowed_origins.clone(),
            allow_missing_origin: self.config.server.allow_missing_origin,
        });
        let shutdown = self.shutdown_token.clone();
        let event_tx = self.event_tx.clone();
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = server::serve(listener, app_state, shutdown.clone()).await {
                error!(error = %e, "HTTP server failed");
                let _ = event_tx.send(OrchestratorEvent::Error {
                    message: format!("HTTP server failed: {e}"),
                });
                shutdown.cancel();
            }
        }));

        let ctx = IpcContext {
            registry: Arc::clone(&self.registry),
            shutdown: self.shutdown_token.clone(),
            started_at: Instant::now(),
            listen_addr: local_addr,
        };
        self.tasks
            .push(tokio::spawn(ipc.serve(ctx, self.shutdown_token.clone())));

        Ok(local_addr)
    }

    /// Stops the daemon orchestrator gracefully.
    ///
    /// Servers stop accepting first, then every session is closed, which
    /// kills its shell and disconnects its clients.
    pub async fn stop(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            match *state {
                OrchestratorState::Stopped => return Ok(()),
                OrchestratorState::ShuttingDown => {
                    anyhow::bail!("Orchestrator is already shutting down")
                }
                _ => *state = OrchestratorState::ShuttingDown,
            }
        }
        self.emit_event(OrchestratorEvent::StateChanged(
            OrchestratorState::ShuttingDown,
        ));

        info!("Stopping daemon orchestrator...");
        self.shutdown_token.cancel();

        for task in self.tasks.drain(..) {
            match tokio::time::timeout(SERVER_STOP_TIMEOUT, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Server task panicked"),
                Err(_) => warn!("Server task did not stop in time"),
            }
        }

        let sessions = self.registry.count();
        debug!(sessions, "Closing all sessions");
        self.registry.close_all().await;

        self.local_addr = None;
        self.set_state(OrchestratorState::Stopped).await;
        info!("Daemon orchestrator stopped");
        Ok(())
    }

    async fn transition_from(
        &self,
        expected: OrchestratorState,
        next: OrchestratorState,
    ) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != expected {
                anyhow::bail!("Orchestrator is not {:?} (currently {:?})", expected, *state);
            }
            *state = next;
        }
        self.emit_event(OrchestratorEvent::StateChanged(next));
        Ok(())
    }

    async fn set_state(&self, next: OrchestratorState) {
        *self.state.write().await = next;
        self.emit_event(OrchestratorEvent::StateChanged(next));
    }

    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Returns the session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Address the HTTP server is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Path of the IPC socket.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }
}
