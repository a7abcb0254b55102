//! Session management module.
//!
//! This module provides PTY spawning, per-session output fan-out and the
//! registry that owns session lifetime.

pub mod multiplexer;
pub mod pty;
pub mod registry;
pub mod spawn;

pub use multiplexer::{ClientId, ClientStats, SessionOutputBroadcaster, DEFAULT_CLIENT_CAPACITY};
pub use pty::{
    CloseReason, Session, SessionError, SessionId, SessionInfo, SessionOptions, SessionState,
    DEFAULT_READ_BUFFER_SIZE,
};
pub use registry::{SessionIdGenerator, SessionRegistry, DEFAULT_MAX_SESSIONS};
pub use spawn::{detect_shell, spawn_pty, SpawnOptions, SpawnedPty, DEFAULT_LANG, DEFAULT_TERM};
