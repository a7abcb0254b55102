//! IPC message types for CLI-daemon communication.
//!
//! Each message is one JSON value on its own line.

use protocol::SessionSummary;
use serde::{Deserialize, Serialize};

/// Requests that can be sent from the CLI to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcRequest {
    /// Check if the daemon is alive.
    Ping,
    /// Get the current status of the daemon.
    Status,
    /// Request the daemon to stop gracefully.
    Stop,
    /// List all live sessions.
    ListSessions,
    /// Close a session, killing its shell and disconnecting its clients.
    CloseSession {
        /// The session to close.
        session_id: String,
    },
}

/// Responses sent from the daemon to the CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcResponse {
    /// Response to a Ping request.
    Pong,
    /// Current daemon status.
    Status {
        /// Address the HTTP server is listening on.
        listen_addr: String,
        /// Uptime in seconds.
        uptime_secs: u64,
        /// Number of live sessions.
        session_count: usize,
        /// Number of attached clients across all sessions.
        client_count: usize,
    },
    /// Acknowledgment that the daemon is stopping.
    Stopping,
    /// Live sessions.
    Sessions {
        sessions: Vec<SessionSummary>,
    },
    /// Confirmation that a session was closed.
    SessionClosed {
        session_id: String,
    },
    /// An error occurred processing the request.
    Error {
        /// Human-readable error message.
        message: String,
    },
}
