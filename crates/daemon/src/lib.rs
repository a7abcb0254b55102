//! # ptyhub Daemon Library
//!
//! Shares PTY-backed shell sessions with any number of WebSocket clients.
//!
//! ## Overview
//!
//! - **Sessions**: each session owns one shell running on a pseudo-terminal.
//!   Output is fanned out to every attached client in the order it was
//!   produced; input from any client goes to the same PTY.
//! - **Registry**: sessions are created, looked up and closed by identifier.
//!   A session whose shell exits removes itself.
//! - **HTTP/WebSocket server**: creates, attaches to, lists and closes
//!   sessions.
//! - **IPC**: a local Unix socket used by the `ptyhub` CLI.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                   Daemon Orchestrator                    │
//! ├──────────────────────────────────────────────────────────┤
//! │  ┌───────────────────────┐    ┌───────────────────────┐  │
//! │  │  HTTP / WebSocket     │    │     IPC server        │  │
//! │  │  server (axum)        │    │   (Unix socket)       │  │
//! │  └───────────┬───────────┘    └───────────┬───────────┘  │
//! │              └──────────┬─────────────────┘              │
//! │              ┌──────────▼──────────┐                     │
//! │              │  Session Registry   │                     │
//! │              └──────────┬──────────┘                     │
//! │     ┌───────────────────┼───────────────────┐            │
//! │  Session             Session             Session         │
//! │  (PTY + pump + clients)                                  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, DaemonOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let mut orchestrator = DaemonOrchestrator::new(config)?;
//!     orchestrator.start().await?;
//!
//!     // Serve until a CLI asks the daemon to stop.
//!     orchestrator.shutdown_token().cancelled().await;
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod ipc;
pub mod orchestrator;
pub mod server;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

pub use config::Config;

pub use session::{
    CloseReason, Session, SessionError, SessionId, SessionInfo, SessionOptions, SessionRegistry,
    SessionState,
};

pub use server::{router, AppState};

pub use orchestrator::{DaemonOrchestrator, OrchestratorEvent, OrchestratorState};
