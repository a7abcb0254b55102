//! ptyhub daemon and control CLI.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use daemon::config::Config;
use daemon::ipc::{resolve_socket_path, IpcClient, IpcResponse};
use daemon::orchestrator::{DaemonOrchestrator, OrchestratorEvent};
use protocol::SessionSummary;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Timeout for short CLI round trips to the daemon.
const IPC_TIMEOUT: Duration = Duration::from_secs(5);

/// ptyhub - share shell sessions with many WebSocket viewers.
#[derive(Parser, Debug)]
#[command(name = "ptyhub")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the daemon in the foreground
    Start,

    /// Stop the running daemon
    Stop {
        /// Timeout in seconds for graceful shutdown
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Show daemon status
    Status,

    /// Manage live sessions
    #[command(subcommand)]
    Sessions(SessionsCommands),
}

/// Subcommands for session management.
#[derive(Subcommand, Debug, Clone)]
pub enum SessionsCommands {
    /// List all live sessions
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Close a session, killing its shell and disconnecting its clients
    Close {
        /// Session ID to close
        session_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    config.apply_env_overrides();

    let _log_guard = init_tracing(&config, cli.verbose)?;
    if let Some(path) = &cli.config {
        tracing::debug!(path = %path.display(), "Using config file");
    }

    let socket_path = resolve_socket_path(config.daemon.socket_path.as_deref());

    match cli.command {
        Commands::Start => {
            if daemon_responds(&socket_path).await {
                eprintln!("Error: Daemon already running");
                eprintln!();
                eprintln!("To stop the existing daemon, run:");
                eprintln!("  ptyhub stop");
                std::process::exit(1);
            }

            let mut orchestrator = DaemonOrchestrator::new(config)?;
            run_daemon(&mut orchestrator).await?;
        }
        Commands::Stop { timeout } => match graceful_stop_daemon(&socket_path, timeout).await {
            Ok(()) => println!("Daemon stopped successfully"),
            Err(e) => {
                eprintln!("Failed to stop daemon: {e}");
                std::process::exit(1);
            }
        },
        Commands::Status => match query_daemon_status(&socket_path).await {
            Ok(status) => {
                println!("Daemon Status: running");
                println!("  Listening: {}", status.listen_addr);
                println!("  Uptime:    {}", format_duration(status.uptime_secs));
                println!("  Sessions:  {}", status.session_count);
                println!("  Clients:   {}", status.client_count);
            }
            Err(e) => {
                eprintln!("Daemon is not running: {e}");
                std::process::exit(1);
            }
        },
        Commands::Sessions(cmd) => match cmd {
            SessionsCommands::List { json } => match query_sessions_list(&socket_path).await {
                Ok(sessions) => {
                    if json {
                        println!("{}", serde_json::to_string_pretty(&sessions)?);
                    } else {
                        print_sessions_table(&sessions);
                    }
                }
                Err(e) => {
                    eprintln!("Failed to list sessions: {e}");
                    std::process::exit(1);
                }
            },
            SessionsCommands::Close { session_id } => {
                match close_session(&socket_path, &session_id).await {
                    Ok(()) => println!("Session {session_id} closed"),
                    Err(e) => {
                        eprintln!("Failed to close session {session_id}: {e}");
                        std::process::exit(1);
                    }
                }
            }
        },
    }

    Ok(())
}

/// Installs the global subscriber. `RUST_LOG` wins over `--verbose`, which
/// wins over the configured level.
///
/// The returned guard flushes the log file on drop.
fn init_tracing(config: &Config, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let default_level = if verbose {
        "debug"
    } else {
        config.daemon.log_level.as_str()
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let Some(log_file) = &config.daemon.log_file else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return Ok(None);
    };

    let dir = log_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = log_file
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("log_file has no file name: {}", log_file.display()))?;
    std::fs::create_dir_all(dir)?;

    let appender = tracing_appender::rolling::daily(dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(writer)
        .init();
    Ok(Some(guard))
}

/// Runs the daemon until a signal arrives or a CLI asks it to stop.
async fn run_daemon(orchestrator: &mut DaemonOrchestrator) -> anyhow::Result<()> {
    orchestrator.start().await?;

    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                OrchestratorEvent::StateChanged(state) => {
                    tracing::info!(?state, "Orchestrator state changed");
                }
                OrchestratorEvent::Error { message } => {
                    tracing::error!(%message, "Orchestrator error");
                }
            }
        }
    });

    if let Some(addr) = orchestrator.local_addr() {
        println!("ptyhub listening on http://{addr}");
    }

    let stop_requested = orchestrator.shutdown_token();
    tokio::select! {
        result = wait_for_shutdown_signal() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Failed to install signal handlers");
            }
        }
        _ = stop_requested.cancelled() => {
            tracing::info!("Shutdown requested");
        }
    }

    orchestrator.stop().await
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
        _ = sigint.recv() => tracing::info!("Received SIGINT"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    tracing::info!("Received Ctrl-C");
    Ok(())
}

async fn connect(socket_path: &Path) -> anyhow::Result<IpcClient> {
    IpcClient::connect_with_timeout(socket_path, IPC_TIMEOUT)
        .await
        .map_err(|_| anyhow::anyhow!("Daemon is not running (cannot connect to socket)"))
}

async fn daemon_responds(socket_path: &Path) -> bool {
    match connect(socket_path).await {
        Ok(mut client) => client.ping().await.unwrap_or(false),
        Err(_) => false,
    }
}

/// Status information returned from the daemon.
struct DaemonStatus {
    listen_addr: String,
    uptime_secs: u64,
    session_count: usize,
    client_count: usize,
}

async fn query_daemon_status(socket_path: &Path) -> anyhow::Result<DaemonStatus> {
    let mut client = connect(socket_path).await?;
    let response = client
        .status()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to query status: {e}"))?;

    match response {
        IpcResponse::Status {
            listen_addr,
            uptime_secs,
            session_count,
            client_count,
        } => Ok(DaemonStatus {
            listen_addr,
            uptime_secs,
            session_count,
            client_count,
        }),
        IpcResponse::Error { message } => anyhow::bail!("Daemon returned error: {message}"),
        _ => anyhow::bail!("Unexpected response from daemon"),
    }
}

async fn query_sessions_list(socket_path: &Path) -> anyhow::Result<Vec<SessionSummary>> {
    let mut client = connect(socket_path).await?;
    let response = client
        .list_sessions()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to query sessions: {e}"))?;

    match response {
        IpcResponse::Sessions { sessions } => Ok(sessions),
        IpcResponse::Error { message } => anyhow::bail!("Daemon returned error: {message}"),
        _ => anyhow::bail!("Unexpected response from daemon"),
    }
}

async fn close_session(socket_path: &Path, session_id: &str) -> anyhow::Result<()> {
    let mut client = connect(socket_path).await?;
    let response = client
        .close_session(session_id.to_string())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to send close request: {e}"))?;

    match response {
        IpcResponse::SessionClosed { session_id: closed } if closed == session_id => Ok(()),
        IpcResponse::SessionClosed { session_id: closed } => {
            anyhow::bail!("Unexpected session closed: {closed}")
        }
        IpcResponse::Error { message } => anyhow::bail!("{message}"),
        _ => anyhow::bail!("Unexpected response from daemon"),
    }
}

/// Asks the daemon to stop and waits for its socket to go away.
async fn graceful_stop_daemon(socket_path: &Path, timeout_secs: u64) -> anyhow::Result<()> {
    let mut client = connect(socket_path).await?;

    println!("Sending shutdown request...");
    match client
        .stop()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to send stop request: {e}"))?
    {
        IpcResponse::Stopping => println!("Shutdown acknowledged, waiting for daemon to exit..."),
        IpcResponse::Error { message } => anyhow::bail!("Daemon returned error: {message}"),
        _ => anyhow::bail!("Unexpected response from daemon"),
    }
    drop(client);

    let start = std::time::Instant::now();
    let timeout = Duration::from_secs(timeout_secs);
    while start.elapsed() < timeout {
        if !socket_path.exists() {
            return Ok(());
        }
        if IpcClient::connect_with_timeout(socket_path, Duration::from_millis(100))
            .await
            .is_err()
        {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    anyhow::bail!("Timeout waiting for daemon to exit ({timeout_secs}s)")
}

/// Print sessions in a formatted ASCII table.
fn print_sessions_table(sessions: &[SessionSummary]) {
    if sessions.is_empty() {
        println!("No active sessions.");
        return;
    }

    let id_width = sessions
        .iter()
        .map(|s| s.session_id.len())
        .max()
        .unwrap_or(8)
        .max(8);
    let shell_width = 16;

    println!(
        "{:<id_width$}  {:<shell_width$}  {:>8}  {:>9}  {:>7}  {:>10}",
        "ID", "SHELL", "PID", "SIZE", "CLIENTS", "CREATED"
    );
    println!("{}", "-".repeat(id_width + shell_width + 46));

    for session in sessions {
        let pid = session
            .pid
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        let size = format!("{}x{}", session.rows, session.cols);
        println!(
            "{:<id_width$}  {:<shell_width$}  {:>8}  {:>9}  {:>7}  {:>10}",
            session.session_id,
            truncate_str(&session.shell, shell_width),
            pid,
            size,
            session.clients,
            format_relative_time(session.created_at / 1000),
        );
    }

    println!();
    println!("Total: {} session(s)", sessions.len());
}

/// Format a Unix timestamp in seconds as relative time (e.g., "5m ago").
fn format_relative_time(timestamp: u64) -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let elapsed = now.saturating_sub(timestamp);

    if elapsed < 60 {
        format!("{}s ago", elapsed)
    } else if elapsed < 3600 {
        format!("{}m ago", elapsed / 60)
    } else if elapsed < 86400 {
        format!("{}h ago", elapsed / 3600)
    } else {
        format!("{}d ago", elapsed / 86400)
    }
}

/// Truncate a string to at most `max_len` characters, adding "..." if
/// truncated.
fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

/// Format a duration in seconds to human-readable format.
fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
